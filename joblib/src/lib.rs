//! Core library for the remote job execution service: the fan-out stream
//! buffer, the cgroup v2 job runtime, and the authentication and policy
//! middleware used by the server.

pub mod auth;
pub mod buffer;
pub mod cancel;
pub mod cgroup;
pub mod jobs;
pub mod rbac;

pub use buffer::StreamBuffer;
pub use cancel::{CancelCause, CancelHandle};
pub use jobs::{detect_runtime, Process, Runtime, RuntimeError, RuntimeId, RuntimeRegistry};
