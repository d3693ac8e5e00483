//! Executes jobs inside freshly created cgroup v2 subtrees.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use uuid::Uuid;

use protobuf::job::v1::JobSpec;

use super::manager::{kill_cgroup, CgroupManager};
use super::process::JobProcess;
use crate::buffer::StreamBuffer;
use crate::cancel::{CancelCause, CancelHandle};
use crate::jobs::{Process, Runtime, RuntimeError};

const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct CgroupRuntime {
    manager: CgroupManager,
}

pub fn build() -> Result<Arc<dyn Runtime>, RuntimeError> {
    Ok(Arc::new(CgroupRuntime::new()?))
}

impl CgroupRuntime {
    pub fn new() -> Result<Self, RuntimeError> {
        let manager = CgroupManager::new().map_err(RuntimeError::Setup)?;
        Ok(Self { manager })
    }
}

impl Runtime for CgroupRuntime {
    fn execute(
        &self,
        cancel: CancelHandle,
        spec: JobSpec,
    ) -> Result<Arc<dyn Process>, RuntimeError> {
        let command_spec = spec.command.clone().unwrap_or_default();
        if command_spec.command.is_empty() {
            return Err(RuntimeError::InvalidSpec("command cannot be empty".into()));
        }

        // raw hex, no dashes: most terminals treat '-' as a word separator,
        // which makes dashed ids hard to copy with a double-click
        let uuid = Uuid::new_v4();
        let id = uuid.simple().to_string();

        let buffer = Arc::new(StreamBuffer::new());
        let process = Arc::new(JobProcess::new(id.clone(), spec.clone(), buffer.clone()));

        let path = match self.manager.create(&id, spec.limits.as_ref()) {
            Ok(path) => path,
            Err(source) => {
                let err = RuntimeError::CreateCgroup { id, source };
                buffer.close();
                process.set_failed(err.to_string());
                process.mark_done();
                return Err(err);
            }
        };

        // the child enters the cgroup through this fd before exec
        let cgroup_file = match open_cgroup_dir(&path) {
            Ok(file) => file,
            Err(err) => {
                buffer.close();
                process.set_failed(err.to_string());
                process.mark_done();
                cleanup_cgroup_blocking(&path);
                return Err(err);
            }
        };

        // one pipe for both stdout and stderr, so a single writer feeds the
        // stream buffer and interleaving matches what the kernel delivered
        let (pipe_write, pipe_read) = match output_pipe() {
            Ok(ends) => ends,
            Err(source) => {
                let err = RuntimeError::Pipe(source);
                buffer.close();
                process.set_failed(err.to_string());
                process.mark_done();
                drop(cgroup_file);
                cleanup_cgroup_blocking(&path);
                return Err(err);
            }
        };

        let stderr_fd = match pipe_write.try_clone() {
            Ok(fd) => fd,
            Err(source) => {
                let err = RuntimeError::Pipe(source);
                buffer.close();
                process.set_failed(err.to_string());
                process.mark_done();
                drop(cgroup_file);
                cleanup_cgroup_blocking(&path);
                return Err(err);
            }
        };

        let mut command = tokio::process::Command::new(&command_spec.command);
        command.args(&command_spec.args);
        for entry in &command_spec.env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(pipe_write));
        command.stderr(Stdio::from(stderr_fd));

        let cgroup_fd = cgroup_file.as_raw_fd();
        unsafe {
            command.pre_exec(move || enter_cgroup(cgroup_fd));
        }

        let spawned = command.spawn();
        // release the parent's copies of the pipe write end, or readers
        // would never see EOF
        drop(command);

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(
                    command = %command_spec.command,
                    error = %err,
                    driver = "cgroupsv2",
                    "failed to start command"
                );
                buffer.close();
                process.set_failed(spawn_error_message(&err, &path));
                process.mark_done();
                drop(cgroup_file);
                cleanup_cgroup_blocking(&path);
                return Ok(process);
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or_default();
        process.set_running(pid);
        tracing::info!(
            command = %command_spec.command,
            id = %id,
            pid,
            driver = "cgroupsv2",
            "command started"
        );

        // pump the combined output pipe into the stream buffer
        let pump_buffer = buffer.clone();
        tokio::spawn(async move {
            let mut reader = pipe_read;
            let mut chunk = BytesMut::with_capacity(4096);
            loop {
                match reader.read_buf(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if pump_buffer.write(&chunk.split()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // graceful stop: SIGTERM on cancellation, SIGKILL after the grace
        // period if the process is still running
        let stop_buffer = buffer.clone();
        let stop_done = process.done();
        let stop_cancel = cancel.clone();
        let stop_id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop_cancel.cancelled() => {}
                () = stop_done.cancelled() => return,
            }
            tracing::debug!(id = %stop_id, "cancellation requested; attempting graceful shutdown");
            // close the buffer before signalling: stdio handles inherited by
            // descendants can hold the pipe open past the child's exit
            stop_buffer.close();
            let start = Instant::now();
            if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::error!(id = %stop_id, error = %err, "failed to send SIGTERM");
            }
            tokio::select! {
                () = tokio::time::sleep(GRACE_PERIOD) => {
                    tracing::warn!(id = %stop_id, "process did not exit within grace period, sending SIGKILL");
                    if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                        tracing::error!(id = %stop_id, error = %err, "failed to send SIGKILL");
                    }
                }
                () = stop_done.cancelled() => {
                    tracing::debug!(id = %stop_id, took = ?start.elapsed(), "process exited within grace period");
                }
            }
        });

        // reaper: wait for the child, record the termination, signal done
        let reap_process = process.clone();
        let reap_buffer = buffer.clone();
        let reap_id = id.clone();
        let started_at = Instant::now();
        tokio::spawn(async move {
            let wait_result = child.wait().await;
            reap_buffer.close();
            let stopped = matches!(cancel.cause(), Some(CancelCause::UserStop));
            match wait_result {
                Ok(exit_status) => {
                    reap_process.set_terminated(stopped, &exit_status);
                    tracing::info!(
                        id = %reap_id,
                        exit_code = exit_status.code().unwrap_or_default(),
                        signal = exit_status.signal().unwrap_or_default(),
                        stopped,
                        duration = ?started_at.elapsed(),
                        "command terminated"
                    );
                }
                Err(err) => {
                    tracing::error!(id = %reap_id, error = %err, "failed to wait for command");
                    reap_process.set_wait_failed(stopped, err.to_string());
                }
            }
            reap_process.mark_done();
        });

        // cgroup teardown after the job is done: close the fd, kill any
        // orphaned descendants, remove the directory
        let teardown_done = process.done();
        tokio::spawn(async move {
            teardown_done.cancelled().await;
            drop(cgroup_file);
            let _ = tokio::task::spawn_blocking(move || cleanup_cgroup_blocking(&path)).await;
        });

        Ok(process)
    }
}

fn open_cgroup_dir(path: &Path) -> Result<File, RuntimeError> {
    // File::open is O_RDONLY|O_CLOEXEC
    File::open(path).map_err(|source| {
        let display = path.display().to_string();
        match source.raw_os_error() {
            Some(libc::EBUSY) => RuntimeError::DomainControllersEnabled {
                path: display,
                source,
            },
            Some(libc::EOPNOTSUPP) => RuntimeError::DomainInvalid {
                path: display,
                source,
            },
            _ => RuntimeError::OpenCgroup {
                path: display,
                source,
            },
        }
    })
}

fn output_pipe() -> io::Result<(OwnedFd, pipe::Receiver)> {
    let (tx, rx) = pipe::pipe()?;
    // the child writes through a plain blocking fd
    let write_fd = tx.into_blocking_fd()?;
    Ok((write_fd, rx))
}

/// Moves the calling process into the cgroup referred to by `cgroup_fd`.
/// Runs in the forked child before exec; only async-signal-safe calls.
fn enter_cgroup(cgroup_fd: RawFd) -> io::Result<()> {
    unsafe {
        let fd = libc::openat(
            cgroup_fd,
            c"cgroup.procs".as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let buf: &[u8] = b"0\n";
        let written = libc::write(fd, buf.as_ptr().cast(), buf.len());
        let result = if written < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        };
        libc::close(fd);
        result
    }
}

fn spawn_error_message(err: &io::Error, path: &Path) -> String {
    match err.raw_os_error() {
        Some(libc::EBUSY) => format!(
            "{err}: cgroup {} has domain controllers enabled in cgroup.subtree_control",
            path.display()
        ),
        Some(libc::EOPNOTSUPP) => format!(
            "{err}: cgroup {} is in the 'domain invalid' state",
            path.display()
        ),
        _ => err.to_string(),
    }
}

fn cleanup_cgroup_blocking(path: &Path) {
    if let Err(err) = kill_cgroup(path) {
        tracing::error!(path = %path.display(), error = %err, "failed to kill cgroup");
    }
    if let Err(err) = std::fs::remove_dir(path) {
        tracing::error!(path = %path.display(), error = %err, "failed to remove cgroup");
    } else {
        tracing::info!(path = %path.display(), "removed cgroup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protobuf::job::v1::{CommandSpec, State};
    use tokio_util::sync::CancellationToken;

    fn shell_spec(script: &str) -> JobSpec {
        JobSpec {
            command: Some(CommandSpec {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                env: vec![],
            }),
            limits: None,
        }
    }

    #[tokio::test]
    async fn rejects_empty_command() {
        // spec validation happens before any cgroup is touched, so this runs
        // without root
        let cancel = CancelHandle::new();
        let runtime = match CgroupRuntime::new() {
            Ok(runtime) => runtime,
            // not on a cgroup v2 host with delegated controllers
            Err(_) => return,
        };
        let err = runtime.execute(cancel, JobSpec::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidSpec(_)));
    }

    // The remaining tests exercise real process execution inside cgroups and
    // require root on a host with a delegated unified hierarchy.

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 unified hierarchy"]
    async fn runs_a_command_and_replays_output() {
        let runtime = CgroupRuntime::new().expect("runtime init");
        let process = runtime
            .execute(CancelHandle::new(), shell_spec("printf hello"))
            .expect("execute");

        process.done().cancelled().await;

        let mut rx = process.output(CancellationToken::new());
        let mut out = Vec::new();
        while let Some(bytes) = rx.recv().await {
            out.extend_from_slice(&bytes);
        }
        assert_eq!(out, b"hello");

        let status = process.status();
        assert_eq!(status.state, State::Terminated as i32);
        let terminated = status.terminated.unwrap();
        assert_eq!(terminated.exit_code, 0);
        assert!(!terminated.stopped);
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 unified hierarchy"]
    async fn graceful_stop_delivers_sigterm() {
        let runtime = CgroupRuntime::new().expect("runtime init");
        let cancel = CancelHandle::new();
        let process = runtime
            .execute(
                cancel.clone(),
                shell_spec("trap 'exit 0' TERM; sleep 60 & wait"),
            )
            .expect("execute");

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel(CancelCause::UserStop);
        process.done().cancelled().await;

        let status = process.status();
        assert_eq!(status.state, State::Terminated as i32);
        let terminated = status.terminated.unwrap();
        assert!(terminated.stopped);
        assert_eq!(terminated.exit_code, 0);
        assert_eq!(terminated.signal, 0);
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 unified hierarchy"]
    async fn forceful_kill_after_grace_period() {
        let runtime = CgroupRuntime::new().expect("runtime init");
        let cancel = CancelHandle::new();
        let process = runtime
            .execute(cancel.clone(), shell_spec("trap '' TERM; sleep 60 & wait"))
            .expect("execute");

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel(CancelCause::UserStop);
        process.done().cancelled().await;

        let status = process.status();
        assert_eq!(status.state, State::Terminated as i32);
        let terminated = status.terminated.unwrap();
        assert!(terminated.stopped);
        assert_eq!(terminated.signal, libc::SIGKILL);
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 unified hierarchy"]
    async fn failed_spawn_yields_failed_state() {
        let runtime = CgroupRuntime::new().expect("runtime init");
        let process = runtime
            .execute(
                CancelHandle::new(),
                JobSpec {
                    command: Some(CommandSpec {
                        command: "this-command-does-not-exist".into(),
                        args: vec![],
                        env: vec![],
                    }),
                    limits: None,
                },
            )
            .expect("spawn failures are recorded in the job status");
        process.done().cancelled().await;
        assert_eq!(process.status().state, State::Failed as i32);
    }
}
