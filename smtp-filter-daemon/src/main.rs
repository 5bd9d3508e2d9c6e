//! Daemon front-end: wires a `smol` accept loop and an `smtp_server::Config`
//! implementation onto the data-phase filter dispatcher.

use std::{
    borrow::Cow,
    convert::TryFrom,
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, StreamExt};
use structopt::StructOpt;
use tracing::{info, warn};

use smtp_filter_dispatch::{Dispatcher, FilterConfig, Host, SessionContext, Verdict};
use smtp_message::{EnhancedReplyCode, Hostname, MaybeUtf8, Reply, ReplyCode};
use smtp_server::{ConnectionMetadata, Decision, EscapedDataReader, MailMetadata};

const NUM_THREADS: usize = 4;

#[derive(StructOpt)]
#[structopt(
    name = "smtp-filter-daemon",
    about = "A transparent SMTP filtering proxy"
)]
struct Opt {
    /// Debug verbosity; repeat for more detail (overrides RUST_LOG)
    #[structopt(short, long, parse(from_occurrences))]
    debug: u8,

    /// Path to the filter configuration file
    #[structopt(short, long, parse(from_os_str), default_value = "/etc/proxsmtp.conf")]
    config_file: PathBuf,

    /// Path to the pidfile to maintain for the lifetime of the daemon
    #[structopt(short, long, parse(from_os_str))]
    pidfile: Option<PathBuf>,

    /// Address to listen for inbound SMTP connections on
    #[structopt(long, default_value = "0.0.0.0:2525")]
    listen: SocketAddr,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let default_level = match opt.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let filter_config = Arc::new(
        FilterConfig::load(&opt.config_file).context("loading the filter configuration")?,
    );

    let _pidfile = opt
        .pidfile
        .as_ref()
        .map(write_pidfile)
        .transpose()
        .context("writing the pidfile")?;

    let listener =
        std::net::TcpListener::bind(opt.listen).context("binding the listening socket")?;
    info!(addr = %opt.listen, "listening for inbound SMTP connections");

    let cfg = Arc::new(DaemonConfig {
        filter_config,
        hostname: "smtp-filter-daemon".into(),
    });

    let ex = &Arc::new(smol::Executor::new());
    let (_stop_signal, shutdown) = smol::channel::unbounded::<()>();

    let (_, res): (_, anyhow::Result<()>) = easy_parallel::Parallel::new()
        .each(0..NUM_THREADS, |_| {
            smol::block_on(ex.run(shutdown.recv())).ok();
            Ok(())
        })
        .finish(move || {
            smol::block_on(async move {
                let listener = smol::net::TcpListener::try_from(listener)
                    .context("making the listener async")?;
                let mut incoming = listener.incoming();
                while let Some(stream) = incoming.next().await {
                    let stream = stream.context("accepting an inbound connection")?;
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.ip())
                        .unwrap_or(IpAddr::from([0, 0, 0, 0]));
                    ex.spawn(smtp_server::interact(
                        stream,
                        smtp_server::IsAlreadyTls::No,
                        ConnInfo { peer },
                        cfg.clone(),
                    ))
                    .detach();
                }
                Ok(())
            })
        });

    res
}

fn write_pidfile(path: &PathBuf) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Per-connection metadata: just the peer address, published into the
/// `XCLIENT` line of the SMTP-filter backend.
struct ConnInfo {
    peer: IpAddr,
}

struct DaemonConfig {
    filter_config: Arc<FilterConfig>,
    hostname: Cow<'static, str>,
}

fn build_reply(status_line: &str) -> Reply<Cow<'static, str>> {
    let (code, text) = status_line
        .split_once(' ')
        .unwrap_or((status_line, "Rejected"));
    let code: u16 = code.parse().unwrap_or(550);
    Reply {
        code: ReplyCode::custom(code),
        ecode: Some(EnhancedReplyCode::PERMANENT_UNDEFINED.into()),
        text: vec![MaybeUtf8::Utf8(text.to_owned().into())],
    }
}

#[async_trait]
impl smtp_server::Config for DaemonConfig {
    type ConnectionUserMeta = ConnInfo;
    type MailUserMeta = ();

    fn hostname(&self) -> Cow<'static, str> {
        self.hostname.clone()
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<ConnInfo>) {}

    async fn tls_accept<IO>(
        &self,
        _io: IO,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> io::Result<
        duplexify::Duplex<
            std::pin::Pin<Box<dyn Send + AsyncRead>>,
            std::pin::Pin<Box<dyn Send + AsyncWrite>>,
        >,
    >
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS is not supported by this proxy",
        ))
    }

    fn can_do_tls(&self, _conn_meta: &ConnectionMetadata<ConnInfo>) -> bool {
        false
    }

    async fn filter_from(
        &self,
        _from: &mut Option<smtp_message::Email<&str>>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> Decision {
        Decision::Accept
    }

    async fn filter_to(
        &self,
        _to: &mut smtp_message::Email<&str>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> Decision {
        Decision::Accept
    }

    async fn filter_data(
        &self,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> Decision {
        if self.filter_config.filter_type == smtp_filter_dispatch::FilterType::Reject {
            info!(status = "REJECTED", "pre-data reject policy in effect");
            return Decision::Reject(build_reply(&self.filter_config.reject));
        }
        Decision::Accept
    }

    async fn handle_mail<'a, R>(
        &self,
        stream: &mut EscapedDataReader<'a, R>,
        meta: MailMetadata<()>,
        conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> Decision
    where
        R: Send + Unpin + AsyncRead,
    {
        let cache_in = match tempfile::NamedTempFile::new_in(&self.filter_config.directory) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to create an input cache file");
                return Decision::Reject(self.internal_server_error());
            }
        };
        let cache_out_path = cache_in.path().with_extension("out");

        if let Err(e) = drain_to_file(stream, cache_in.path()).await {
            warn!(error = %e, "failed to cache the message body");
            stream.complete();
            return Decision::Reject(self.internal_server_error());
        }
        stream.complete();

        let sender = meta.from.map(|e| email_to_string(&e));
        let recipients = meta.to.iter().map(email_to_string).collect();
        let helo = conn_meta
            .hello
            .as_ref()
            .map(|h| hostname_to_string(&h.hostname));

        let ctx = SessionContext {
            sender,
            recipients,
            helo,
            peername: conn_meta.user.peer.to_string(),
            cachename: cache_in.path().to_owned(),
        };

        let quit = Arc::new(AtomicBool::new(false));
        let filter_config = self.filter_config.clone();
        let cache_in_path = cache_in.path().to_owned();
        let cache_out_path2 = cache_out_path.clone();
        let ctx2 = ctx.clone();

        let outcome = smol::unblock(move || {
            let mut host = FilterHost::open(&cache_in_path, cache_out_path2, quit)?;
            let dispatcher = Dispatcher::new(&filter_config);
            dispatcher.data_hook(&ctx2, &mut host);
            Ok::<_, io::Error>(host.decision.take())
        })
        .await;

        let decision = match outcome {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!("filter dispatcher returned no decision");
                FilterDecision::Error
            }
            Err(e) => {
                warn!(error = %e, "failed to run the data-phase filter");
                FilterDecision::Error
            }
        };

        let _ = std::fs::remove_file(&cache_in.path());

        match decision {
            FilterDecision::Accept => {
                info!(status = "FILTERED", "message accepted");
                let _ = std::fs::remove_file(&cache_out_path);
                Decision::Accept
            }
            FilterDecision::Reject(reason) => {
                info!(status = %reason, "message rejected");
                Decision::Reject(build_reply(&reason))
            }
            FilterDecision::Error => {
                warn!(status = "FILTER-ERROR", "message filtering failed");
                Decision::Reject(self.internal_server_error())
            }
        }
    }
}

async fn drain_to_file<'a, R>(
    stream: &mut EscapedDataReader<'a, R>,
    path: &std::path::Path,
) -> io::Result<()>
where
    R: Send + Unpin + AsyncRead,
{
    let mut file = std::fs::File::create(path)?;
    let mut buf = vec![0u8; smtp_server::RDBUF_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        io::Write::write_all(&mut file, &buf[..n])?;
    }
}

fn email_to_string(email: &smtp_message::Email<String>) -> String {
    match &email.hostname {
        Some(host) => format!("{}@{}", email.localpart.raw(), host.raw()),
        None => email.localpart.raw().clone(),
    }
}

fn hostname_to_string(hostname: &Hostname) -> String {
    hostname.raw().clone()
}

/// What [`FilterHost`] decided, read back after the blocking dispatcher call
/// completes.
enum FilterDecision {
    Accept,
    Reject(String),
    Error,
}

/// The one and only [`Host`] implementation: bridges the dispatcher core
/// onto cache files already fully materialized on disk by `handle_mail`.
struct FilterHost {
    input: std::fs::File,
    output_path: PathBuf,
    output: Option<std::fs::File>,
    quit: Arc<AtomicBool>,
    decision: Option<FilterDecision>,
}

impl FilterHost {
    fn open(
        input_path: &std::path::Path,
        output_path: PathBuf,
        quit: Arc<AtomicBool>,
    ) -> io::Result<FilterHost> {
        Ok(FilterHost {
            input: std::fs::File::open(input_path)?,
            output_path,
            output: None,
            quit,
            decision: None,
        })
    }
}

impl Host for FilterHost {
    fn start_data(&mut self, _ctx: &SessionContext) -> io::Result<()> {
        Ok(())
    }

    fn cache_data(&mut self, _ctx: &SessionContext) -> io::Result<()> {
        // The body is already fully committed to `self.input` by `handle_mail`
        // before the dispatcher runs.
        Ok(())
    }

    fn write_data(&mut self, _ctx: &SessionContext, buf: &[u8]) -> io::Result<()> {
        if self.output.is_none() {
            self.output = Some(std::fs::File::create(&self.output_path)?);
        }
        if buf.is_empty() {
            return Ok(());
        }
        io::Write::write_all(self.output.as_mut().unwrap(), buf)
    }

    fn read_data(&mut self, _ctx: &SessionContext, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.input, buf)
    }

    fn done_data(&mut self, _ctx: &SessionContext, _header: Option<&str>) {
        self.decision = Some(FilterDecision::Accept);
    }

    fn fail_data(&mut self, _ctx: &SessionContext, reply_line: Option<&str>) {
        self.decision = Some(match reply_line {
            Some(line) => FilterDecision::Reject(line.to_owned()),
            None => FilterDecision::Error,
        });
    }

    fn fail_msg(&mut self, _ctx: &SessionContext, reply_line: &str) {
        self.decision = Some(FilterDecision::Reject(reply_line.to_owned()));
    }

    fn add_log(&mut self, _ctx: &SessionContext, key: &str, value: &str) {
        info!(key, value, "filter log");
    }

    fn setup_forked(&self, ctx: &SessionContext, _is_filter: bool) {
        std::env::set_var("SENDER", ctx.sender.as_deref().unwrap_or(""));
        std::env::set_var("RECIPIENTS", ctx.recipients.join(" "));
        std::env::set_var("CLIENT_ADDR", &ctx.peername);
        std::env::set_var("CACHE_FILE", &ctx.cachename);
    }

    fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}
