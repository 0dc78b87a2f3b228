// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Supervision of a fixed set of async tasks.
//!
//! A supervisor runs each [`ChildSpec`] under a per-child monitor inside a
//! single task group. The monitor restarts the child according to its
//! [`RestartStrategy`], within the restart-intensity budget of
//! [`SupervisorOptions`]: at most `max_restarts` restarts within any window
//! of `max_seconds` seconds. When the budget overflows, the monitor gives up
//! and the last termination outcome propagates.
//!
//! ```no_run
//! use otplite::supervisor::{self, ChildSpec, RestartStrategy, SupervisorOptions};
//!
//! async fn example() {
//!     let children = vec![
//!         ChildSpec::new("ticker", || async {
//!             // do some work
//!             Ok(())
//!         })
//!         .with_restart(RestartStrategy::Transient),
//!     ];
//!     let opts = SupervisorOptions {
//!         max_restarts: 3,
//!         max_seconds: 5,
//!     };
//!     supervisor::start(children, opts, None).await.unwrap();
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{error, info};

use crate::exit::{panic_message, ExitReason};

/// Describes when to restart a terminated child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartStrategy {
    /// Always restart the child, even after a normal exit.
    Permanent,
    /// Restart the child only if it failed.
    Transient,
    /// Never restart the child.
    Temporary,
}

/// Restart-intensity budget shared by every child of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorOptions {
    /// Maximum number of restarts tolerated within the window.
    pub max_restarts: usize,
    /// Width of the sliding window, in seconds.
    pub max_seconds: u64,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        SupervisorOptions {
            max_restarts: 3,
            max_seconds: 5,
        }
    }
}

pub(crate) type TaskFactory = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Describes one supervised task.
///
/// The task is a factory so that each restart runs a fresh future; arguments
/// are captured by the closure.
pub struct ChildSpec {
    /// Task identifier, used as the logging channel.
    pub id: String,
    task: TaskFactory,
    pub restart: RestartStrategy,
}

impl ChildSpec {
    pub fn new<F, Fut>(id: impl Into<String>, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_factory(id, Box::new(move || task().boxed()))
    }

    pub(crate) fn from_factory(id: impl Into<String>, task: TaskFactory) -> Self {
        ChildSpec {
            id: id.into(),
            task,
            restart: RestartStrategy::Permanent,
        }
    }

    pub fn with_restart(mut self, restart: RestartStrategy) -> Self {
        self.restart = restart;
        self
    }
}

impl fmt::Debug for ChildSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("ChildSpec")
            .field("id", &self.id)
            .field("restart", &self.restart)
            .finish_non_exhaustive()
    }
}

/// Starts the supervisor and its children.
///
/// Every child gets its own monitor inside a single task group; dropping or
/// aborting the returned future cancels every descendant. `ready` fires once
/// all monitors are spawned.
///
/// Returns once every monitor has given up restarting its child: `Ok` when
/// all children ended within policy, the propagated reason otherwise.
pub async fn start(
    children: Vec<ChildSpec>,
    opts: SupervisorOptions,
    ready: Option<oneshot::Sender<()>>,
) -> Result<(), ExitReason> {
    let mut monitors: JoinSet<Result<(), ExitReason>> = JoinSet::new();
    for spec in children {
        monitors.spawn(child_monitor(spec, opts));
    }
    if let Some(ready) = ready {
        let _ = ready.send(());
    }
    join_group(&mut monitors).await
}

/// Runs one child under its restart policy.
pub(crate) async fn child_monitor(
    spec: ChildSpec,
    opts: SupervisorOptions,
) -> Result<(), ExitReason> {
    let mut window = RestartWindow::new(opts.max_restarts, Duration::from_secs(opts.max_seconds));
    loop {
        let outcome = run_once(&spec).await;
        if let Err(exit) = &outcome {
            if exit.is_cancelled() {
                // Cooperative teardown: reraise unchanged, never restart.
                info!(child_id = %spec.id, "task cancelled");
                return Err(ExitReason::Cancelled);
            }
        }
        let eligible = match spec.restart {
            RestartStrategy::Permanent => true,
            RestartStrategy::Transient => outcome.is_err(),
            RestartStrategy::Temporary => false,
        };
        if !eligible || !window.record(Instant::now()) {
            return outcome;
        }
        match &outcome {
            Ok(()) => error!(child_id = %spec.id, "restarting task after unexpected exit"),
            Err(exit) => error!(child_id = %spec.id, cause = %exit, "restarting task after failure"),
        }
    }
}

/// Runs the child future once, converting a panic into an exit reason and
/// collapsing cancellation-only aggregates bubbling up from nested groups.
async fn run_once(spec: &ChildSpec) -> Result<(), ExitReason> {
    let task = (spec.task)();
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(ExitReason::from(error).defer_to_cancelled()),
        Err(panic) => Err(ExitReason::Panicked(panic_message(panic))),
    }
}

pub(crate) fn classify_join(
    join_result: Result<Result<(), ExitReason>, JoinError>,
) -> Result<(), ExitReason> {
    match join_result {
        Ok(monitor_result) => monitor_result,
        Err(join_error) if join_error.is_panic() => Err(ExitReason::Panicked(panic_message(
            join_error.into_panic(),
        ))),
        Err(_) => Err(ExitReason::Cancelled),
    }
}

/// Joins every monitor of a group.
///
/// The first real failure aborts the rest of the group; cancellations caused
/// by that abort are absorbed, everything else is aggregated and deferred to
/// cancellation.
pub(crate) async fn join_group(
    monitors: &mut JoinSet<Result<(), ExitReason>>,
) -> Result<(), ExitReason> {
    let mut reasons: Vec<ExitReason> = Vec::new();
    let mut aborted = false;
    while let Some(join_result) = monitors.join_next().await {
        let Err(exit) = classify_join(join_result) else {
            continue;
        };
        if exit.is_cancelled() && aborted {
            continue;
        }
        if !exit.is_cancelled() && !aborted {
            monitors.abort_all();
            aborted = true;
        }
        reasons.push(exit);
    }
    match ExitReason::combine(reasons) {
        Some(exit) => Err(exit),
        None => Ok(()),
    }
}

/// Sliding-window restart accounting.
///
/// Every eligible termination is timestamped. Up to `max_restarts` recorded
/// terminations always allow a restart; past that, the restart is allowed
/// only if the overflow pushed the oldest record out of the window.
struct RestartWindow {
    max_restarts: usize,
    window: Duration,
    failure_times: VecDeque<Instant>,
}

impl RestartWindow {
    fn new(max_restarts: usize, window: Duration) -> Self {
        RestartWindow {
            max_restarts,
            window,
            failure_times: VecDeque::new(),
        }
    }

    /// Records a termination and reports whether a restart is still within
    /// budget.
    fn record(&mut self, now: Instant) -> bool {
        self.failure_times.push_back(now);
        if self.failure_times.len() <= self.max_restarts {
            return true;
        }
        if let Some(oldest) = self.failure_times.pop_front() {
            now.duration_since(oldest) >= self.window
        } else {
            true
        }
    }
}
