// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod launcher;
mod logger;
mod supervisor;

pub use launcher::{LaunchFailure, Launcher, WorkerHandle, LINE_BUFFER_ENV};
pub use logger::{attach, format_line, forward, LineSink, WriterSink};
pub use supervisor::{RunOutcome, Supervisor, SupervisorState, WorkerExit};

use std::convert::TryFrom;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Lifecycle of a single worker process
///
/// `Starting -> Running -> Exited(code) | Killed(signal)`, where `Running` means the output
/// of the process is being read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Exited(i32),
    /// Terminated by a signal, None if the exit status could not be collected
    Killed(Option<i32>),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Exited(_) | WorkerState::Killed(_))
    }

    pub fn code(&self) -> Option<i32> {
        match *self {
            WorkerState::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

impl From<ExitStatus> for WorkerState {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => WorkerState::Exited(code),
            None => WorkerState::Killed(status.signal()),
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WorkerState::Starting => f.write_str("starting"),
            WorkerState::Running => f.write_str("running"),
            WorkerState::Exited(code) => write!(f, "exited with code {}", code),
            WorkerState::Killed(Some(sig)) => match Signal::try_from(sig) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
            WorkerState::Killed(None) => f.write_str("killed"),
        }
    }
}
