use thiserror::Error;

/// Result alias used across every component: typed failures from this
/// crate coexist with ad-hoc internal failures via [`Error::Internal`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("hypervisor monitor failure: {0}")]
    MonitorFailure(String),

    #[error("external tool failure: {0}")]
    ExternalFailure(String),

    /// The hypervisor exited on its own, or was killed by us. This is not
    /// a failure of the operation that observed it - it just means the VM
    /// transitions to QUIT rather than ERROR.
    #[error("recoverable exit: {0}")]
    Recoverable(String),

    #[error(transparent)]
    Internal(#[from] eyre::Error),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn monitor_failure(msg: impl Into<String>) -> Self {
        Self::MonitorFailure(msg.into())
    }

    pub fn external_failure(msg: impl Into<String>) -> Self {
        Self::ExternalFailure(msg.into())
    }

    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }
}
