//! The error taxonomy shared by every component of the core.
//!
//! Each variant corresponds to one of the named error kinds from the
//! auditing protocol: a caller matches on `CoreError` rather than on
//! a stringly-typed message.

use std::path::PathBuf;

/// The unified error type returned by VM, ledger, archive, replay, and
/// verifier operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The call log's first entry was not `init`, or a required field was
    /// absent from a decoded entry.
    #[error("malformed call log: {0}")]
    MalformedLog(String),

    /// A caller-supplied expectation (a files archive URL, most commonly)
    /// disagreed with what was actually recorded.
    #[error("assertion mismatch: expected {expected}, found {found}")]
    AssertionMismatch { expected: String, found: String },

    /// A call queue or a factory's child registry is at its configured
    /// limit.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// An RPC call named a method that is blacklisted or not exported by
    /// the guest.
    #[error("method not supported: {0}")]
    MethodNotSupported(String),

    /// The guest method itself threw. Carries the guest's own message,
    /// verbatim, so it can be surfaced to the RPC caller unmodified.
    #[error("guest error: {0}")]
    Guest(String),

    /// The underlying archive or log storage raised an I/O error.
    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    /// The operation targeted a VM, factory, or mount that is closed or
    /// closing.
    #[error("closed")]
    Closed,

    /// `compareLogs` or `compareArchives` found a divergence. Deliberately
    /// uninformative about which side is at fault.
    #[error("verifier mismatch: {0}")]
    VerifierMismatch(String),

    /// A guest script failed to evaluate (syntax error, or it threw during
    /// top-level evaluation rather than during a call).
    #[error("script evaluation failed: {0}")]
    ScriptEvaluation(String),

    /// A path supplied to the files archive escaped its root.
    #[error("path escapes archive root: {0}")]
    PathEscape(PathBuf),

    /// A malformed or out-of-range configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Config(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// The stable string tag used when an error crosses the RPC boundary
    /// (see spec §6 and §7 — these are not Rust `Error::source` chains,
    /// they are the wire-visible `code` field).
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::MalformedLog(_) => "malformed-log",
            CoreError::AssertionMismatch { .. } => "assertion-mismatch",
            CoreError::Capacity(_) => "capacity",
            CoreError::MethodNotSupported(_) => "method-not-supported",
            CoreError::Guest(_) => "guest-error",
            CoreError::Store(_) => "store-error",
            CoreError::Closed => "closed",
            CoreError::VerifierMismatch(_) => "verifier-mismatch",
            CoreError::ScriptEvaluation(_) => "guest-error",
            CoreError::PathEscape(_) => "store-error",
            CoreError::Config(_) => "store-error",
        }
    }
}
