use std::sync::Arc;

use crate::jobs::{Runtime, RuntimeError, CGROUPS_V1};

/// Factory for the cgroup v1 runtime. Only the unified v2 hierarchy is
/// supported; registering this factory makes detection on a v1 host fail
/// with a clear error instead of an unknown-runtime lookup failure.
pub fn build() -> Result<Arc<dyn Runtime>, RuntimeError> {
    Err(RuntimeError::Unsupported(CGROUPS_V1))
}
