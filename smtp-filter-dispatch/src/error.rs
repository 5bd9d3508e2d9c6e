use crate::Verdict;

/// Unified error taxonomy for the dispatcher core.
///
/// Each variant maps onto a row of the error taxonomy: `Spawn`/`Io`/`Timeout`/
/// `Protocol`/`AbnormalExit` are all message-fatal and translate to
/// [`Verdict::Error`]; `FilterReject`/`PolicyReject` translate to
/// [`Verdict::Rejected`]; `Cancelled` also translates to [`Verdict::Error`]
/// but is logged distinctly.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to spawn filter: {0}")]
    Spawn(nix::Error),

    #[error("I/O error talking to filter: {0}")]
    Io(#[from] std::io::Error),

    #[error("filter did not complete within the configured timeout")]
    Timeout,

    #[error("unexpected reply from downstream SMTP server: {0}")]
    Protocol(String),

    #[error("filter child terminated abnormally")]
    AbnormalExit,

    #[error("filter rejected the message: {0}")]
    FilterReject(String),

    #[error("filter_type=reject policy in effect")]
    PolicyReject(String),

    #[error("host requested cancellation")]
    Cancelled,
}

impl DispatchError {
    /// Maps this error onto the per-message outcome reported to the host, per
    /// the taxonomy's rightmost column.
    pub fn to_verdict(&self) -> Verdict {
        match self {
            DispatchError::FilterReject(reason) => Verdict::Rejected(reason.clone()),
            DispatchError::PolicyReject(reason) => Verdict::Rejected(reason.clone()),
            _ => Verdict::Error,
        }
    }

    /// The `status=` log value this error should be recorded under.
    pub fn status(&self) -> String {
        match self {
            DispatchError::FilterReject(reason) => reason.clone(),
            DispatchError::PolicyReject(_) => "REJECTED".to_owned(),
            _ => "FILTER-ERROR".to_owned(),
        }
    }
}
