use thiserror::Error;

use crate::ddk::DdkError;

/// Result alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the crypto pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unsupported or malformed algorithm parameters. Not retried.
    #[error("build: {0}")]
    Build(String),
    /// DMA or memory exhaustion. The caller may retry later.
    #[error("allocation: {0}")]
    Alloc(String),
    /// Hardware rejected an SA or transform registration.
    #[error("register: {0}")]
    Register(String),
    /// Hardware rejected a command submission.
    #[error("submit: {0}")]
    Submit(String),
    /// Authentication tag / ICV mismatch.
    #[error("integrity check failed")]
    IntegrityFailure,
    /// Unexpected error code in a result descriptor.
    #[error("hardware fault: error code {0:#x}")]
    HardwareFault(u32),
    /// Polled retrieval exhausted its attempts.
    #[error("timed out waiting for a hardware result")]
    Timeout,
    /// Configuration rejected by `Config::validate`.
    #[error("config: {0}")]
    Config(String),
    /// Ring index out of range.
    #[error("invalid ring")]
    InvalidRing,
    /// Tunnel id out of range.
    #[error("invalid tunnel id")]
    InvalidTunnel,
    /// Stale or unknown association handle.
    #[error("invalid association")]
    InvalidAssociation,
    /// The session already has an operation outstanding.
    #[error("operation already in progress")]
    Busy,
    /// The engine is shutting down.
    #[error("engine shut down")]
    Shutdown,
}

/// Completion status as seen by the host crypto framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Output computed.
    Ok,
    /// Authentication failure (protocol-defined "bad message").
    AuthFailed,
    /// I/O failure (timeouts and hardware faults).
    IoError,
    /// Generic operation failure.
    Failed,
}

impl Error {
    /// Host-visible status class for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::IntegrityFailure => Status::AuthFailed,
            Error::Timeout | Error::HardwareFault(_) => Status::IoError,
            _ => Status::Failed,
        }
    }

    pub(crate) fn build(what: impl Into<String>) -> Self {
        Error::Build(what.into())
    }

    pub(crate) fn alloc(what: &str, err: DdkError) -> Self {
        Error::Alloc(format!("{what}: {err}"))
    }

    pub(crate) fn register(what: &str, err: DdkError) -> Self {
        Error::Register(format!("{what}: {err}"))
    }

    pub(crate) fn submit(what: &str, err: DdkError) -> Self {
        Error::Submit(format!("{what}: {err}"))
    }
}
