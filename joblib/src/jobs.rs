//! The runtime and process model.
//!
//! A [`Runtime`] is a specific isolation environment that can execute jobs; a
//! [`Process`] is a read-only view of one job started by a runtime. Runtimes
//! are registered explicitly in a [`RuntimeRegistry`] at program start and
//! selected by probing the filesystem type mounted at `/sys/fs/cgroup`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use nix::errno::Errno;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use protobuf::job::v1::{JobSpec, JobStatus};

use crate::cancel::CancelHandle;
use crate::cgroup::v2::CgroupError;

/// An opaque identifier for a registered runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(pub &'static str);

pub const CGROUPS_V1: RuntimeId = RuntimeId("cgroupsv1");
pub const CGROUPS_V2: RuntimeId = RuntimeId("cgroupsv2");

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// defined at https://github.com/torvalds/linux/blob/master/include/uapi/linux/magic.h
const CGROUP_SUPER_MAGIC: i64 = 0x27e0eb;
const CGROUP2_SUPER_MAGIC: i64 = 0x63677270;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} is not supported")]
    Unsupported(RuntimeId),
    #[error("failed to statfs /sys/fs/cgroup: {0}")]
    DetectFailed(#[source] Errno),
    #[error("unknown filesystem type at /sys/fs/cgroup: {0:x}")]
    UnknownFilesystem(i64),
    #[error("no runtime found for {0:?}")]
    NotRegistered(RuntimeId),
    #[error("failed to setup jobserver cgroup: {0}")]
    Setup(#[source] CgroupError),
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("failed to create cgroup for job {id}: {source}")]
    CreateCgroup {
        id: String,
        #[source]
        source: CgroupError,
    },
    #[error("{source}: cgroup {path} has domain controllers enabled in cgroup.subtree_control")]
    DomainControllersEnabled {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{source}: cgroup {path} is in the 'domain invalid' state")]
    DomainInvalid {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open cgroup {path}: {source}")]
    OpenCgroup {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create output pipe: {0}")]
    Pipe(#[source] std::io::Error),
}

/// A read-only view of the underlying process of a job.
pub trait Process: Send + Sync {
    /// The unique id of the job, 32 lowercase hex characters.
    fn id(&self) -> &str;

    /// Streams the combined stdout and stderr of the process. The channel
    /// replays the full history, then follows the output in real time until
    /// the job terminates or `cancel` fires. Every call returns a new
    /// independent stream.
    fn output(&self, cancel: CancellationToken) -> mpsc::Receiver<Bytes>;

    /// A snapshot of the current job status.
    fn status(&self) -> JobStatus;

    /// A token that is cancelled once the job has terminated and its status
    /// reflects the termination. Successive calls observe the same state.
    fn done(&self) -> CancellationToken;
}

impl std::fmt::Debug for dyn Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("id", &self.id()).finish()
    }
}

/// A runtime environment that can execute jobs.
pub trait Runtime: Send + Sync {
    /// Creates a job from `spec`, starts it, and returns a handle.
    ///
    /// `cancel` controls the lifetime of the job: cancelling it after a
    /// successful start triggers graceful termination. If the recorded
    /// [`CancelCause`](crate::cancel::CancelCause) is `UserStop`, the job's
    /// termination record will have `stopped` set.
    fn execute(
        &self,
        cancel: CancelHandle,
        spec: JobSpec,
    ) -> Result<Arc<dyn Process>, RuntimeError>;
}

pub type RuntimeBuilder = fn() -> Result<Arc<dyn Runtime>, RuntimeError>;

/// An explicit mapping from runtime ids to factories, populated from a static
/// list before the server is built.
pub struct RuntimeRegistry {
    builders: Vec<(RuntimeId, RuntimeBuilder)>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            builders: Vec::new(),
        }
    }

    /// A registry with every built-in runtime registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(CGROUPS_V1, crate::cgroup::v1::build);
        registry.register(CGROUPS_V2, crate::cgroup::v2::build);
        registry
    }

    pub fn register(&mut self, id: RuntimeId, builder: RuntimeBuilder) {
        self.builders.push((id, builder));
    }

    pub fn lookup(&self, id: RuntimeId) -> Option<RuntimeBuilder> {
        self.builders
            .iter()
            .find(|(registered, _)| *registered == id)
            .map(|(_, builder)| *builder)
    }

    /// Detects which registered runtime matches the filesystem mounted at
    /// `/sys/fs/cgroup`, and builds it.
    pub fn build_detected(&self) -> Result<Arc<dyn Runtime>, RuntimeError> {
        let id = detect_runtime()?;
        let builder = self.lookup(id).ok_or(RuntimeError::NotRegistered(id))?;
        builder()
    }
}

/// Probes `/sys/fs/cgroup` for the cgroup hierarchy version.
pub fn detect_runtime() -> Result<RuntimeId, RuntimeError> {
    loop {
        let stat = match nix::sys::statfs::statfs("/sys/fs/cgroup") {
            Ok(stat) => stat,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(RuntimeError::DetectFailed(errno)),
        };
        let magic = stat.filesystem_type().0 as i64;
        return match magic {
            CGROUP_SUPER_MAGIC => Ok(CGROUPS_V1),
            CGROUP2_SUPER_MAGIC => Ok(CGROUPS_V2),
            _ => Err(RuntimeError::UnknownFilesystem(magic)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_both_cgroup_runtimes() {
        let registry = RuntimeRegistry::with_defaults();
        assert!(registry.lookup(CGROUPS_V1).is_some());
        assert!(registry.lookup(CGROUPS_V2).is_some());
        assert!(registry.lookup(RuntimeId("lxc")).is_none());
    }

    #[test]
    fn cgroups_v1_factory_is_unsupported() {
        let registry = RuntimeRegistry::with_defaults();
        let builder = registry.lookup(CGROUPS_V1).unwrap();
        assert!(matches!(
            builder().err(),
            Some(RuntimeError::Unsupported(CGROUPS_V1))
        ));
    }
}
