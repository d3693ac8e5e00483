//! The process handle returned by the cgroups v2 runtime.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use protobuf::job::v1::{JobSpec, JobStatus, State, TerminationStatus};

use crate::buffer::StreamBuffer;
use crate::jobs::Process;

pub(super) struct JobProcess {
    id: String,
    buffer: Arc<StreamBuffer>,
    // all state transitions happen under this lock; readers get a deep copy
    status: Mutex<JobStatus>,
    done: CancellationToken,
}

impl JobProcess {
    pub(super) fn new(id: String, spec: JobSpec, buffer: Arc<StreamBuffer>) -> Self {
        Self {
            id,
            buffer,
            status: Mutex::new(JobStatus {
                state: State::Pending as i32,
                message: State::Pending.as_str_name().to_owned(),
                spec: Some(spec),
                ..Default::default()
            }),
            done: CancellationToken::new(),
        }
    }

    pub(super) fn set_running(&self, pid: i32) {
        let mut status = self.status.lock().unwrap();
        status.state = State::Running as i32;
        status.message = State::Running.as_str_name().to_owned();
        status.pid = pid;
        status.start_time = Some(SystemTime::now().into());
    }

    pub(super) fn set_failed(&self, message: String) {
        let mut status = self.status.lock().unwrap();
        status.state = State::Failed as i32;
        status.message = message;
    }

    pub(super) fn set_terminated(&self, stopped: bool, exit_status: &ExitStatus) {
        let mut status = self.status.lock().unwrap();
        status.state = State::Terminated as i32;
        status.message = exit_status.to_string();
        status.terminated = Some(TerminationStatus {
            stopped,
            time: Some(SystemTime::now().into()),
            exit_code: exit_status.code().unwrap_or_default(),
            signal: exit_status.signal().unwrap_or_default(),
        });
    }

    /// Records termination when `wait` itself failed and no exit status is
    /// available.
    pub(super) fn set_wait_failed(&self, stopped: bool, message: String) {
        let mut status = self.status.lock().unwrap();
        status.state = State::Terminated as i32;
        status.message = message;
        status.terminated = Some(TerminationStatus {
            stopped,
            time: Some(SystemTime::now().into()),
            ..Default::default()
        });
    }

    /// Signals that the job has terminated. Must be called after the final
    /// status transition so waiters observe the terminal state.
    pub(super) fn mark_done(&self) {
        self.done.cancel();
    }
}

impl Process for JobProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn output(&self, cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
        self.buffer.new_stream(cancel)
    }

    fn status(&self) -> JobStatus {
        self.status.lock().unwrap().clone()
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}
