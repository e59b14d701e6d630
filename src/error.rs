//! Typed error kinds for the ETL core.
//!
//! Most call sites just want `anyhow::Result` with context attached at each
//! boundary, but a few outcomes are expected and need to be matched on
//! specifically (the interlock trip in particular is not a failure, it is a
//! clean no-op exit).

use thiserror::Error;

/// Top-level error kind distinguishing the handful of outcomes the
/// orchestrator and CLI entrypoint need to branch on.
#[derive(Debug, Error)]
pub enum EtlError {
    /// A previous run's `global_state` was still `START` when this process
    /// started: a prior invocation never reached `FINISH` or `ERROR`.
    #[error("a previous run is still in flight (global_state == START); refusing to start")]
    Interlock,

    /// The index bulk write failed. The orchestrator marks the run `ERROR`
    /// and does not advance the watermark.
    #[error("index write failed: {0}")]
    IndexWrite(#[source] anyhow::Error),

    /// Any other failure, already carrying context via `anyhow::Context`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EtlError {
    /// True for the one outcome that is not logged as a run failure.
    pub fn is_interlock(&self) -> bool {
        matches!(self, EtlError::Interlock)
    }
}
