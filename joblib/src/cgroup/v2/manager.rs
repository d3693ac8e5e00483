//! Creation and teardown of per-job cgroup subtrees under the unified
//! hierarchy, and the encoding of resource limits into cgroup control files.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use thiserror::Error;

use protobuf::job::v1::{IoLimits, ResourceLimits};

const HIERARCHY_ROOT: &str = "/sys/fs/cgroup";
const JOBSERVER_CGROUP: &str = "kralicky-jobserver";
const REQUIRED_CONTROLLERS: &[&str] = &["cpu", "memory", "io"];

pub const CFS_PERIOD: i64 = 100_000;
pub const CFS_MIN_QUOTA: i64 = 1_000;

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("failed to read cgroup controllers: {0}")]
    ReadControllers(#[source] io::Error),
    #[error("required cgroup controller {controller:?} is not enabled in {file}")]
    ControllerNotEnabled { controller: &'static str, file: String },
    #[error("failed to create jobserver cgroup: {0}")]
    CreateRoot(#[source] io::Error),
    #[error("failed to enable controller {controller:?}: {source}")]
    EnableController {
        controller: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to create cgroup {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to set {file}: {source}")]
    SetLimit {
        file: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to lookup device id for {device}: {source}")]
    DeviceLookup {
        device: String,
        #[source]
        source: Errno,
    },
}

/// Manages the `kralicky-jobserver` cgroup and its per-job children.
#[derive(Debug)]
pub struct CgroupManager {
    path: PathBuf,
}

impl CgroupManager {
    /// Asserts that the unified hierarchy has the `cpu`, `memory`, and `io`
    /// controllers available and delegated, creates the jobserver parent
    /// cgroup if needed, and enables the controllers for its children.
    pub fn new() -> Result<Self, CgroupError> {
        Self::at_root(Path::new(HIERARCHY_ROOT))
    }

    fn at_root(root: &Path) -> Result<Self, CgroupError> {
        required_controllers_enabled(&root.join("cgroup.controllers"))?;
        required_controllers_enabled(&root.join("cgroup.subtree_control"))?;

        let path = root.join(JOBSERVER_CGROUP);
        if !path.exists() {
            DirBuilder::new()
                .mode(0o755)
                .create(&path)
                .map_err(CgroupError::CreateRoot)?;
            tracing::info!(path = %path.display(), "created jobserver cgroup");
        }

        enable_required_controllers(&path.join("cgroup.subtree_control"))?;
        tracing::info!(path = %path.display(), "initialized jobserver cgroup");
        Ok(Self { path })
    }

    /// Creates a cgroup for the job and writes all configured limit files.
    /// On failure the partially configured cgroup is removed.
    pub fn create(
        &self,
        id: &str,
        limits: Option<&ResourceLimits>,
    ) -> Result<PathBuf, CgroupError> {
        let path = self.path.join(id);
        DirBuilder::new()
            .mode(0o755)
            .create(&path)
            .map_err(|source| CgroupError::Create {
                path: path.display().to_string(),
                source,
            })?;
        tracing::info!(path = %path.display(), job = id, "created cgroup");

        if let Some(limits) = limits {
            if let Err(err) = apply_limits(&path, limits) {
                let _ = fs::remove_dir(&path);
                return Err(err);
            }
        }
        Ok(path)
    }
}

fn apply_limits(path: &Path, limits: &ResourceLimits) -> Result<(), CgroupError> {
    if let Some(mcpus) = limits.cpu {
        let quota = mcpus_to_cfs_quota(mcpus, available_milli_cpus());
        write_control(&path.join("cpu.max"), &format!("{quota} {CFS_PERIOD}\n"))
            .map_err(|source| CgroupError::SetLimit {
                file: "cpu.max",
                source,
            })?;
    }
    if let Some(memory) = &limits.memory {
        if let Some(high) = memory.soft_limit {
            write_control(&path.join("memory.high"), &format!("{high}\n")).map_err(|source| {
                CgroupError::SetLimit {
                    file: "memory.high",
                    source,
                }
            })?;
        }
        if let Some(max) = memory.limit {
            write_control(&path.join("memory.max"), &format!("{max}\n")).map_err(|source| {
                CgroupError::SetLimit {
                    file: "memory.max",
                    source,
                }
            })?;
        }
    }
    for device in &limits.io {
        let device_id = lookup_device_id(&device.device)?;
        let Some(io_limits) = &device.limits else {
            continue;
        };
        if let Some(line) = io_max_line(&device_id, io_limits) {
            write_control(&path.join("io.max"), &line).map_err(|source| {
                CgroupError::SetLimit {
                    file: "io.max",
                    source,
                }
            })?;
        }
    }
    Ok(())
}

/// Converts a millicore count into a CFS quota over the fixed 100ms period,
/// clamped to `[CFS_MIN_QUOTA, CFS_PERIOD]`. Requests at or above the
/// machine's total millicores all saturate to one full period.
pub fn mcpus_to_cfs_quota(milli_cores: i64, available_milli_cpus: i64) -> i64 {
    let ratio = (milli_cores as f64 / available_milli_cpus as f64).min(1.0);
    CFS_MIN_QUOTA.max((ratio * CFS_PERIOD as f64) as i64)
}

fn available_milli_cpus() -> i64 {
    std::thread::available_parallelism().map_or(1, |n| n.get()) as i64 * 1000
}

/// Formats one `io.max` line for a device, omitting absent fields. Returns
/// `None` when no limit is set at all.
fn io_max_line(device_id: &str, limits: &IoLimits) -> Option<String> {
    let mut args = Vec::new();
    if let Some(rbps) = limits.read_bps {
        args.push(format!("rbps={rbps}"));
    }
    if let Some(wbps) = limits.write_bps {
        args.push(format!("wbps={wbps}"));
    }
    if let Some(riops) = limits.read_iops {
        args.push(format!("riops={riops}"));
    }
    if let Some(wiops) = limits.write_iops {
        args.push(format!("wiops={wiops}"));
    }
    if args.is_empty() {
        return None;
    }
    Some(format!("{device_id} {}\n", args.join(" ")))
}

/// Resolves a device reference to a `major:minor` id. Absolute paths are
/// stat'd; anything else is assumed to already be in `major:minor` form.
fn lookup_device_id(device: &str) -> Result<String, CgroupError> {
    if !device.starts_with('/') {
        return Ok(device.to_owned());
    }
    let stat = nix::sys::stat::stat(device).map_err(|source| CgroupError::DeviceLookup {
        device: device.to_owned(),
        source,
    })?;
    let major = nix::sys::stat::major(stat.st_rdev);
    let minor = nix::sys::stat::minor(stat.st_rdev);
    Ok(format!("{major}:{minor}"))
}

fn list_controllers(file: &Path) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(file)?;
    Ok(contents.split_whitespace().map(str::to_owned).collect())
}

fn required_controllers_enabled(file: &Path) -> Result<(), CgroupError> {
    let controllers = list_controllers(file).map_err(CgroupError::ReadControllers)?;
    for &required in REQUIRED_CONTROLLERS {
        if !controllers.iter().any(|c| c == required) {
            return Err(CgroupError::ControllerNotEnabled {
                controller: required,
                file: file.display().to_string(),
            });
        }
    }
    Ok(())
}

fn enable_required_controllers(file: &Path) -> Result<(), CgroupError> {
    let enabled = list_controllers(file).map_err(CgroupError::ReadControllers)?;
    for &controller in REQUIRED_CONTROLLERS {
        if !enabled.iter().any(|c| c == controller) {
            tracing::info!(controller, file = %file.display(), "enabling controller");
            write_control(file, &format!("+{controller}\n")).map_err(|source| {
                CgroupError::EnableController { controller, source }
            })?;
        }
    }
    // verify that every required controller took effect
    required_controllers_enabled(file)
}

fn write_control(file: &Path, contents: &str) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).create(true).open(file)?;
    f.write_all(contents.as_bytes())
}

/// SIGKILLs every task in the subtree via `cgroup.kill` and blocks until the
/// cgroup reports itself unpopulated. The kernel returns from the kill write
/// before all tasks have exited, so this watches `cgroup.events` with inotify
/// and re-checks the populated state after each modification.
pub(super) fn kill_cgroup(path: &Path) -> io::Result<()> {
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    // the watch must exist before the kill is written, or the final
    // modification could be missed
    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)?;
    let events_path = path.join("cgroup.events");
    inotify.add_watch(&events_path, AddWatchFlags::IN_MODIFY)?;

    write_control(&path.join("cgroup.kill"), "1")?;

    let start = std::time::Instant::now();
    tracing::debug!(path = %path.display(), "killed cgroup; waiting for event signal");
    loop {
        if !cgroup_populated(&events_path)? {
            break;
        }
        match inotify.read_events() {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
    tracing::debug!(path = %path.display(), took = ?start.elapsed(), "cgroup killed successfully");
    Ok(())
}

fn cgroup_populated(events_path: &Path) -> io::Result<bool> {
    let contents = fs::read_to_string(events_path)?;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("populated ") {
            return Ok(value.trim() == "1");
        }
    }
    Ok(false)
}
