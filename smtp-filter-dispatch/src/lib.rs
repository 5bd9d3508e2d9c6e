//! Data-phase content filter dispatcher for an SMTP filtering proxy.
//!
//! This crate implements the core described as "the data-phase filter
//! dispatcher" of a transparent SMTP filtering proxy: once the front-end
//! (outside this crate) has accepted an envelope and captured a message body,
//! [`Dispatcher::data_hook`] drives one of four backends (pipe, file, smtp,
//! reject) to a [`Verdict`] and reports it back through the [`Host`] trait.
//!
//! The front-end — command parsing, envelope accumulation, the connection
//! accept loop, and cache-file I/O primitives — is out of scope here and
//! lives in `smtp-filter-daemon`, which implements [`Host`].

pub mod child;
pub mod config;
mod error;
pub mod file;
pub mod pipe;
pub mod reject_buffer;
pub mod smtp;

mod dispatch;

pub use config::{ConfigError, FilterConfig, FilterType};
pub use dispatch::Dispatcher;
pub use error::DispatchError;
pub use reject_buffer::RejectBuffer;

/// The per-message outcome of the data-phase filter dispatcher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The host must dispatch the cached body, possibly augmented with a
    /// header.
    Accepted,
    /// SMTP reply for the client.
    Rejected(String),
    /// The host should issue a generic failure; logged with
    /// `status=FILTER-ERROR`.
    Error,
}

/// The envelope and connection data the core reads; borrowed from the host,
/// never owned by the core.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub helo: Option<String>,
    /// IPv4 or IPv6 literal of the connecting peer.
    pub peername: String,
    /// Path to the temporary file holding the captured message body.
    pub cachename: std::path::PathBuf,
}

impl SessionContext {
    /// `true` iff `ADDR=[IPv6:]<peer>` should carry the `IPv6:` prefix, per
    /// the SMTP-filter driver's XCLIENT line.
    pub fn peer_is_ipv6(&self) -> bool {
        self.peername.contains(':')
    }
}

/// The abstract interface the dispatcher core calls back into, implemented
/// exactly once by the daemon front-end.
///
/// Every method here corresponds to one row of the host interface: the core
/// never touches a socket, the client-facing SMTP session, or the cache file
/// directly, only through these calls.
pub trait Host {
    /// Tell the client to begin the DATA transfer.
    fn start_data(&mut self, ctx: &SessionContext) -> std::io::Result<()>;

    /// Read the remaining client body and write it to the cache file.
    fn cache_data(&mut self, ctx: &SessionContext) -> std::io::Result<()>;

    /// Open (`buf` empty, called once before any data) or append to the
    /// message-out cache; `n == 0` additionally means "close for writing".
    fn write_data(&mut self, ctx: &SessionContext, buf: &[u8]) -> std::io::Result<()>;

    /// Pulls the next chunk of the captured body; an empty slice signals
    /// end-of-input.
    fn read_data(&mut self, ctx: &SessionContext, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Commit the accepted message, prepending `header` if present.
    fn done_data(&mut self, ctx: &SessionContext, header: Option<&str>);

    /// Issue an SMTP rejection with the given reply, or a generic one if
    /// `None`.
    fn fail_data(&mut self, ctx: &SessionContext, reply_line: Option<&str>);

    /// Pre-data rejection.
    fn fail_msg(&mut self, ctx: &SessionContext, reply_line: &str);

    /// Append a structured log field.
    fn add_log(&mut self, ctx: &SessionContext, key: &str, value: &str);

    /// Publish envelope-derived variables into the about-to-exec filter's
    /// environment. `is_filter` distinguishes the pipe/file backends (which
    /// exec a local filter) from the smtp backend (which does not fork).
    fn setup_forked(&self, ctx: &SessionContext, is_filter: bool);

    /// Cooperative cancellation signal, consulted inside the I/O loops.
    fn is_quit(&self) -> bool;
}
