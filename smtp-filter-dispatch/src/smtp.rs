//! SMTP-filter driver: speaks a minimal, privileged XCLIENT dialog to a
//! downstream MTA so it sees the original client's address, then streams
//! the cached body through and reports the final reply as the verdict.

use std::{
    io::{Read, Write},
    net::{Ipv4Addr, TcpStream},
    time::Duration,
};

use smtp_message::{nom, MaybeUtf8, Reply};

use crate::{DispatchError, FilterConfig, Host, SessionContext, Verdict};

const SMTP_PORT: u16 = 25;
const READ_CHUNK: usize = 4096;
const BODY_CHUNK: usize = 4 * 1024;
const EHLO_NAME: &str = "proxsmtp";

struct Conn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Conn {
    fn connect(addr: Ipv4Addr, port: u16, timeout: Duration) -> Result<Conn, DispatchError> {
        let stream = TcpStream::connect_timeout(&std::net::SocketAddr::from((addr, port)), timeout)
            .map_err(DispatchError::Io)?;
        stream.set_read_timeout(Some(timeout)).map_err(DispatchError::Io)?;
        stream.set_write_timeout(Some(timeout)).map_err(DispatchError::Io)?;
        Ok(Conn {
            stream,
            buf: Vec::new(),
        })
    }

    fn send_line(&mut self, line: &str) -> Result<(), DispatchError> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        Ok(())
    }

    /// Reads wire bytes in bounded chunks until `Reply::parse` succeeds,
    /// matching `smtp-client`'s own `read_reply` Incomplete/Error handling.
    fn read_reply(&mut self) -> Result<Reply<String>, DispatchError> {
        loop {
            match Reply::<&str>::parse(&self.buf) {
                Ok((rem, reply)) => {
                    let consumed = self.buf.len() - rem.len();
                    let owned = reply.into_owned();
                    self.buf.drain(..consumed);
                    return Ok(owned);
                }
                Err(nom::Err::Incomplete(_)) => {
                    let mut chunk = [0u8; READ_CHUNK];
                    let n = self.stream.read(&mut chunk)?;
                    if n == 0 {
                        return Err(DispatchError::Protocol(
                            "connection closed while waiting for a reply".to_owned(),
                        ));
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                Err(_) => {
                    return Err(DispatchError::Protocol(format!(
                        "malformed reply: {:?}",
                        String::from_utf8_lossy(&self.buf)
                    )))
                }
            }
        }
    }

    fn expect(&mut self, code: u16) -> Result<Reply<String>, DispatchError> {
        let reply = self.read_reply()?;
        if reply.code.code() == code {
            Ok(reply)
        } else {
            Err(DispatchError::Protocol(format!(
                "expected {}, got {}: {}",
                code,
                reply.code.code(),
                first_line(&reply)
            )))
        }
    }
}

fn first_line(reply: &Reply<String>) -> String {
    match reply.text.first() {
        Some(MaybeUtf8::Ascii(s)) | Some(MaybeUtf8::Utf8(s)) => s.clone(),
        None => String::new(),
    }
}

/// Runs the SMTP-filter driver to completion:
/// `INIT → CONNECTED → EHLO_OK → XCLIENT_OK → MAIL_OK → RCPT_LOOP →
/// DATA_OPEN → STREAMING → FINAL_REPLY → DONE`.
pub fn run(
    ctx: &SessionContext,
    cfg: &FilterConfig,
    host: &mut impl Host,
) -> Result<Verdict, DispatchError> {
    run_on_port(ctx, cfg, host, SMTP_PORT)
}

fn run_on_port(
    ctx: &SessionContext,
    cfg: &FilterConfig,
    host: &mut impl Host,
    port: u16,
) -> Result<Verdict, DispatchError> {
    let sender = ctx
        .sender
        .as_deref()
        .ok_or_else(|| DispatchError::Protocol("no sender on this envelope".to_owned()))?;
    if ctx.recipients.is_empty() {
        return Err(DispatchError::Protocol(
            "no recipients on this envelope".to_owned(),
        ));
    }

    let downstream = cfg
        .command
        .as_deref()
        .ok_or_else(|| DispatchError::Protocol("no downstream address configured".to_owned()))?;
    let addr: Ipv4Addr = downstream
        .parse()
        .map_err(|_| DispatchError::Protocol(format!("not an IPv4 literal: {:?}", downstream)))?;

    host.setup_forked(ctx, false);

    // INIT → CONNECTED
    let mut conn = Conn::connect(addr, port, cfg.timeout)?;
    conn.expect(220)?;

    // CONNECTED → EHLO_OK
    conn.send_line(&format!("EHLO {}", EHLO_NAME))?;
    conn.expect(250)?;

    // EHLO_OK → XCLIENT_OK
    let ipv6_prefix = if ctx.peer_is_ipv6() { "IPv6:" } else { "" };
    let mut xclient = format!("XCLIENT ADDR=[{}{}]", ipv6_prefix, ctx.peername);
    if let Some(helo) = &ctx.helo {
        xclient.push_str(" HELO=");
        xclient.push_str(helo);
    }
    conn.send_line(&xclient)?;
    conn.expect(220)?;

    // XCLIENT_OK → MAIL_OK
    conn.send_line(&format!("MAIL FROM: <{}>", sender))?;
    conn.expect(250)?;

    // RCPT_LOOP
    for rcpt in &ctx.recipients {
        conn.send_line(&format!("RCPT TO: <{}>", rcpt))?;
        let reply = conn.read_reply()?;
        if reply.code.code() != 250 {
            if reply.text.is_empty() {
                return Err(DispatchError::Protocol(format!(
                    "RCPT TO:<{}> rejected with no reply body",
                    rcpt
                )));
            }
            return Ok(Verdict::Rejected(first_line(&reply).trim().to_owned()));
        }
    }

    // DATA_OPEN
    conn.send_line("DATA")?;
    conn.expect(354)?;

    // STREAMING
    host.cache_data(ctx)?;
    let mut chunk = vec![0u8; BODY_CHUNK];
    loop {
        let n = host.read_data(ctx, &mut chunk)?;
        if n == 0 {
            break;
        }
        conn.stream.write_all(&chunk[..n])?;
    }
    conn.send_line(".")?;

    // FINAL_REPLY
    let reply = conn.read_reply()?;

    // best-effort; server's reply to QUIT is not consulted
    let _ = conn.send_line("QUIT");

    if reply.code.code() == 250 {
        Ok(Verdict::Accepted)
    } else {
        Ok(Verdict::Rejected(first_line(&reply).trim().to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashMap,
        io::BufRead,
        net::TcpListener,
        thread,
    };

    struct FakeHost {
        body: Vec<u8>,
        pos: usize,
        logs: HashMap<String, String>,
    }

    impl Host for FakeHost {
        fn start_data(&mut self, _ctx: &SessionContext) -> std::io::Result<()> {
            Ok(())
        }
        fn cache_data(&mut self, _ctx: &SessionContext) -> std::io::Result<()> {
            Ok(())
        }
        fn write_data(&mut self, _ctx: &SessionContext, _buf: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn read_data(&mut self, _ctx: &SessionContext, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = (self.body.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
        fn done_data(&mut self, _ctx: &SessionContext, _header: Option<&str>) {}
        fn fail_data(&mut self, _ctx: &SessionContext, _reply_line: Option<&str>) {}
        fn fail_msg(&mut self, _ctx: &SessionContext, _reply_line: &str) {}
        fn add_log(&mut self, _ctx: &SessionContext, key: &str, value: &str) {
            self.logs.insert(key.to_owned(), value.to_owned());
        }
        fn setup_forked(&self, _ctx: &SessionContext, _is_filter: bool) {}
        fn is_quit(&self) -> bool {
            false
        }
    }

    fn ctx_and_cfg() -> (SessionContext, FilterConfig) {
        let ctx = SessionContext {
            sender: Some("a@example.org".into()),
            recipients: vec!["b@example.org".into()],
            helo: Some("client.example.org".into()),
            peername: "203.0.113.9".into(),
            cachename: "/tmp/does-not-matter".into(),
        };
        let cfg = FilterConfig {
            command: Some("127.0.0.1".to_owned()),
            timeout: Duration::from_secs(5),
            ..FilterConfig::default()
        };
        (ctx, cfg)
    }

    /// A tiny scripted downstream MTA that accepts everything.
    fn spawn_accepting_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, true);
        });
        port
    }

    fn spawn_rejecting_rcpt_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, false);
        });
        port
    }

    fn serve(stream: TcpStream, accept_rcpt: bool) {
        let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        writer.write_all(b"220 fake.example.org ESMTP\r\n").unwrap();
        let mut line = String::new();

        reader.read_line(&mut line).unwrap(); // EHLO
        writer.write_all(b"250 fake.example.org\r\n").unwrap();

        line.clear();
        reader.read_line(&mut line).unwrap(); // XCLIENT
        writer.write_all(b"220 XCLIENT ok\r\n").unwrap();

        line.clear();
        reader.read_line(&mut line).unwrap(); // MAIL FROM
        writer.write_all(b"250 ok\r\n").unwrap();

        line.clear();
        reader.read_line(&mut line).unwrap(); // RCPT TO
        if accept_rcpt {
            writer.write_all(b"250 ok\r\n").unwrap();
        } else {
            writer
                .write_all(b"550 5.1.1 user unknown\r\n")
                .unwrap();
            return;
        }

        line.clear();
        reader.read_line(&mut line).unwrap(); // DATA
        writer.write_all(b"354 go ahead\r\n").unwrap();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).unwrap();
            if n == 0 || line == ".\r\n" {
                break;
            }
        }
        writer.write_all(b"250 queued\r\n").unwrap();
    }

    #[test]
    fn accepts_when_downstream_accepts() {
        let port = spawn_accepting_server();
        let (ctx, cfg) = ctx_and_cfg();
        let mut host = FakeHost {
            body: b"Subject: hi\r\n\r\nhello\r\n".to_vec(),
            pos: 0,
            logs: HashMap::new(),
        };
        let verdict = run_on_port(&ctx, &cfg, &mut host, port).unwrap();
        assert_eq!(verdict, Verdict::Accepted);
    }

    #[test]
    fn rejects_with_trimmed_rcpt_reply() {
        let port = spawn_rejecting_rcpt_server();
        let (ctx, cfg) = ctx_and_cfg();
        let mut host = FakeHost {
            body: b"hi\r\n".to_vec(),
            pos: 0,
            logs: HashMap::new(),
        };
        let verdict = run_on_port(&ctx, &cfg, &mut host, port).unwrap();
        assert_eq!(verdict, Verdict::Rejected("5.1.1 user unknown".to_owned()));
    }

    #[test]
    fn errors_without_a_sender() {
        let (mut ctx, cfg) = ctx_and_cfg();
        ctx.sender = None;
        let mut host = FakeHost {
            body: Vec::new(),
            pos: 0,
            logs: HashMap::new(),
        };
        assert!(run_on_port(&ctx, &cfg, &mut host, 0).is_err());
    }
}
