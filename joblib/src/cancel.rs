//! Job cancellation with an attached cause.
//!
//! A job's termination record must distinguish "a user asked for this job to
//! stop" from every other reason its lifetime ended (server shutdown, startup
//! failure). The cause is recorded once, by whichever caller cancels first,
//! and read back by the reaper when it fills in the termination record.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// The job was stopped by an explicit user request.
    UserStop,
    /// The server is shutting down.
    ShutdownRequested,
    /// Any other reason, with a human-readable description.
    Other(String),
}

/// A cancellation handle for a single job. Cloning yields handles to the same
/// underlying token and cause.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the handle. The first cause wins; later calls only cancel the
    /// token (a no-op after the first).
    pub fn cancel(&self, cause: CancelCause) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The cause recorded at cancellation, if the handle has been cancelled.
    pub fn cause(&self) -> Option<&CancelCause> {
        self.cause.get()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
