// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::convert::TryFrom;
use std::ffi::OsString;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ConfigUnit;
use crate::pipe::{OutputPipe, OutputReader};
use crate::procs::WorkerState;
use crate::Error;

/// Environment that asks common runtimes not to block buffer a piped stdout
pub const LINE_BUFFER_ENV: &[(&str, &str)] = &[("PYTHONUNBUFFERED", "1")];

/// A worker that could not be started, its siblings are unaffected
#[derive(Debug, thiserror::Error)]
#[error("failed to start bot with config {}: {source}", .unit.path().display())]
pub struct LaunchFailure {
    pub unit: ConfigUnit,
    pub source: Error,
}

/// Launch workers
///
/// Rules:
/// - one process per configuration unit, `program [args...] <config path>`
/// - the unit's `key=value` pairs are added to the inherited environment
/// - stdout and stderr of the worker are captured as one stream
#[derive(Clone, Debug)]
pub struct Launcher {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    required: Vec<String>,
}

impl Launcher {
    pub fn new<P: Into<OsString>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: LINE_BUFFER_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            required: Vec::new(),
        }
    }

    /// Arguments placed before the config path
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Extra environment for every worker, config file pairs take precedence
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// A key every config file must define with a non-empty value
    pub fn require<K: Into<String>>(mut self, key: K) -> Self {
        self.required.push(key.into());
        self
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Start the worker for `unit`.
    ///
    /// Must be called within a tokio runtime. Returns as soon as the process exists, the
    /// worker's own initialization is never awaited.
    pub fn launch(&self, unit: &ConfigUnit) -> Result<WorkerHandle, LaunchFailure> {
        self.try_launch(unit).map_err(|source| LaunchFailure {
            unit: unit.clone(),
            source,
        })
    }

    fn try_launch(&self, unit: &ConfigUnit) -> Result<WorkerHandle, Error> {
        let config = unit.load_checked(&self.required)?;
        let (output, stdio) = OutputPipe::new()?.split()?;

        // FIXME: set working directory? uid/gid?
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(unit.path())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(config.iter())
            .kill_on_drop(true)
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr);

        let child = command.spawn()?;

        // the command holds the parent's copies of the write end
        drop(command);

        let pid = child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw);
        debug!(
            "started {} with {} config key(s), pid: {:?}",
            unit.label(),
            config.len(),
            pid
        );

        Ok(WorkerHandle {
            unit: unit.clone(),
            pid,
            state: WorkerState::Starting,
            child,
            output: Some(output),
            reader: None,
        })
    }
}

/// A launched worker, owned by the Supervisor
#[derive(Debug)]
pub struct WorkerHandle {
    unit: ConfigUnit,
    pid: Option<Pid>,
    state: WorkerState,
    child: Child,
    output: Option<OutputReader>,
    reader: Option<JoinHandle<Result<u64, Error>>>,
}

impl WorkerHandle {
    pub fn unit(&self) -> &ConfigUnit {
        &self.unit
    }

    pub fn label(&self) -> &str {
        self.unit.label()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Hands the output stream over to its reader, only possible once
    pub(crate) fn take_output(&mut self) -> Option<OutputReader> {
        self.output.take()
    }

    pub(crate) fn set_reader(&mut self, reader: JoinHandle<Result<u64, Error>>) {
        self.reader = Some(reader);
        self.state = WorkerState::Running;
    }

    /// Send `signal` to the worker if it has not yet been reaped
    pub fn signal(&self, signal: Signal) -> Result<(), Error> {
        match self.pid {
            Some(pid) if !self.state.is_terminal() => Ok(kill(pid, signal)?),
            _ => Ok(()),
        }
    }

    /// Wait for the process to exit, then give its reader up to `grace` to flush what is left.
    ///
    /// A reader still blocked after that, e.g. because a grandchild inherited the output pipe,
    /// is no longer waited on, it keeps forwarding until the pipe closes.
    pub async fn wait(&mut self, grace: Duration) -> WorkerState {
        if self.state.is_terminal() {
            return self.state;
        }

        self.state = match self.child.wait().await {
            Ok(status) => WorkerState::from(status),
            Err(e) => {
                warn!("{}: failed to collect exit status: {}", self.label(), e);
                WorkerState::Killed(None)
            }
        };

        if let Some(mut reader) = self.reader.take() {
            match timeout(grace, &mut reader).await {
                Ok(Ok(Ok(lines))) => debug!("{}: forwarded {} line(s)", self.label(), lines),
                Ok(Ok(Err(e))) => warn!("{}: output lost: {}", self.label(), e),
                Ok(Err(e)) => warn!("{}: output reader failed: {}", self.label(), e),
                // dropping the handle detaches the reader, it still forwards until EOF
                Err(_) => warn!(
                    "{}: output still open {:?} after exit, no longer waiting on it",
                    self.label(),
                    grace
                ),
            }
        }

        self.state
    }
}
