// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{FuturesUnordered, StreamExt};
use nix::sys::signal::Signal;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Discovery;
use crate::procs::{attach, LaunchFailure, Launcher, LineSink, WorkerHandle, WorkerState};
use crate::Error;

pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Discovering,
    Launching,
    /// Number of workers successfully launched
    Running(usize),
    Draining,
    /// All workers are gone, nothing left to do but stay alive
    Held,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SupervisorState::Idle => f.write_str("idle"),
            SupervisorState::Discovering => f.write_str("discovering"),
            SupervisorState::Launching => f.write_str("launching"),
            SupervisorState::Running(k) => write!(f, "running({})", k),
            SupervisorState::Draining => f.write_str("draining"),
            SupervisorState::Held => f.write_str("held"),
        }
    }
}

/// Final state of one launched worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub label: String,
    pub state: WorkerState,
}

impl WorkerExit {
    pub fn code(&self) -> Option<i32> {
        self.state.code()
    }

    pub fn success(&self) -> bool {
        self.state.success()
    }
}

/// Everything that happened during one run
#[derive(Debug, Default)]
pub struct RunOutcome {
    discovered: usize,
    launched: usize,
    exits: Vec<WorkerExit>,
    failures: Vec<LaunchFailure>,
}

impl RunOutcome {
    pub fn discovered(&self) -> usize {
        self.discovered
    }

    pub fn launched(&self) -> usize {
        self.launched
    }

    /// Exits ordered by label
    pub fn exits(&self) -> &[WorkerExit] {
        &self.exits
    }

    pub fn exit_codes(&self) -> Vec<(&str, Option<i32>)> {
        self.exits
            .iter()
            .map(|exit| (exit.label.as_str(), exit.code()))
            .collect()
    }

    pub fn failures(&self) -> &[LaunchFailure] {
        &self.failures
    }

    pub fn any_launch_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The closing log line of a run, none if nothing was discovered
    pub fn summary(&self) -> Option<String> {
        if self.discovered == 0 {
            return None;
        }

        let failed = self.exits.iter().filter(|exit| !exit.success()).count();
        Some(format!(
            "All bots have exited: {} clean, {} failed, {} never started",
            self.launched - failed,
            failed,
            self.failures.len()
        ))
    }
}

/// Launch and monitor a fleet of workers
///
/// Rules:
///   - one worker per discovered configuration, launched exactly once
///   - a worker that fails to start, crashes or exits never affects its siblings
///   - never restarts workers
///   - once every worker is gone, holds forever; teardown is left to whoever started us
pub struct Supervisor {
    discovery: Discovery,
    launcher: Launcher,
    sink: Arc<dyn LineSink>,
    drain_grace: Duration,
    state: SupervisorState,
    workers: Vec<WorkerHandle>,
}

impl Supervisor {
    pub fn new(discovery: Discovery, launcher: Launcher, sink: Arc<dyn LineSink>) -> Self {
        Self {
            discovery,
            launcher,
            sink,
            drain_grace: DEFAULT_DRAIN_GRACE,
            state: SupervisorState::Idle,
            workers: Vec::new(),
        }
    }

    /// How long a worker's output may stay open after the worker itself exited
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    fn transition(&mut self, state: SupervisorState) {
        debug!("supervisor {} -> {}", self.state, state);
        self.state = state;
    }

    /// Discover, launch and wait for every worker.
    ///
    /// Returns once all launched workers have terminated, with the supervisor `Held`. The only
    /// error is a failed discovery, in which case nothing was launched.
    pub async fn run(&mut self) -> Result<RunOutcome, Error> {
        if self.state != SupervisorState::Idle {
            return Err(Error::from("a supervisor only runs once"));
        }

        self.transition(SupervisorState::Discovering);
        let units = self.discovery.discover()?;

        self.transition(SupervisorState::Launching);
        let mut outcome = RunOutcome {
            discovered: units.len(),
            ..RunOutcome::default()
        };

        for unit in units {
            info!("Starting bot with config {}", unit.path().display());

            let mut worker = match self.launcher.launch(&unit) {
                Ok(worker) => worker,
                Err(failure) => {
                    warn!("{}", failure);
                    outcome.failures.push(failure);
                    continue;
                }
            };

            if let Err(e) = attach(&mut worker, Arc::clone(&self.sink)) {
                warn!("{}: output not captured: {}", worker.label(), e);
            }
            self.workers.push(worker);
        }

        outcome.launched = self.workers.len();
        self.transition(SupervisorState::Running(outcome.launched));

        if outcome.discovered == 0 {
            let dirs = self
                .discovery
                .dirs()
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            info!("No configuration files found in {}, nothing to supervise", dirs);
        } else {
            info!(
                "Started {} bot(s), {} failed to start",
                outcome.launched,
                outcome.failures.len()
            );
        }

        self.transition(SupervisorState::Draining);
        outcome.exits = self.drain().await;

        if let Some(summary) = outcome.summary() {
            info!("{}", summary);
            for exit in &outcome.exits {
                info!("  {}: {}", exit.label, exit.state);
            }
        }

        self.transition(SupervisorState::Held);
        Ok(outcome)
    }

    /// Wait for every worker concurrently, recording each exit as it happens
    async fn drain(&mut self) -> Vec<WorkerExit> {
        let grace = self.drain_grace;
        let mut pending = self
            .workers
            .iter_mut()
            .map(|worker| async move {
                let state = worker.wait(grace).await;
                WorkerExit {
                    label: worker.label().to_string(),
                    state,
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut exits = Vec::with_capacity(pending.len());
        while let Some(exit) = pending.next().await {
            if exit.success() {
                info!("Bot {} {}", exit.label, exit.state);
            } else {
                warn!("Bot {} {}", exit.label, exit.state);
            }
            exits.push(exit);
        }

        exits.sort_by(|a, b| a.label.cmp(&b.label));
        exits
    }

    /// The terminal state, this never completes
    pub async fn hold(&self) -> Infallible {
        debug!("holding in state {}", self.state);
        future::pending().await
    }

    /// Forward a termination request to every live worker and wait up to the drain grace for them
    /// to exit. Anything still running after that is killed when the supervisor is dropped.
    pub async fn shutdown(&mut self) {
        for worker in &self.workers {
            if let Err(e) = worker.signal(Signal::SIGTERM) {
                warn!("{}: failed to signal: {}", worker.label(), e);
            }
        }

        let grace = self.drain_grace;
        let waits = self
            .workers
            .iter_mut()
            .filter(|worker| !worker.state().is_terminal())
            .map(|worker| worker.wait(grace));

        if timeout(grace, future::join_all(waits)).await.is_err() {
            warn!("bots still running after {:?}, killing", grace);
        }
    }
}
