// dbsnapshot/src/scheduler/mod.rs
//! Feature-toggled periodic tasks.
//!
//! A [`Task`] runs once when submitted and then, if it has an interval, on a
//! fixed cadence in its own tokio task until the group's
//! [`CancellationToken`] fires. Runs of the same task never overlap: a tick
//! that arrives while a run is in flight is skipped. Cancellation is
//! cooperative, so an in-flight run always finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type OperationFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Operation = Arc<dyn Fn() -> OperationFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// A previous run of the same task was still in flight.
    Skipped,
}

#[derive(Clone)]
pub struct Task {
    name: String,
    enabled: bool,
    interval: Option<Duration>,
    operation: Operation,
    in_flight: Arc<Mutex<()>>,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, enabled: bool, interval: Option<Duration>, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            enabled,
            // A zero interval would spin; treat it as "run once".
            interval: interval.filter(|d| !d.is_zero()),
            operation: Arc::new(move || -> OperationFuture { Box::pin(operation()) }),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the operation unless a run of this task is already in progress.
    /// A failed run is reported here; operations only log their successes.
    pub async fn run_guarded(&self) -> RunOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!(task = %self.name, "Previous run still in progress, skipping tick");
            return RunOutcome::Skipped;
        };

        match (self.operation)().await {
            Ok(()) => RunOutcome::Completed,
            Err(e) => {
                let cause = format!("{:#}", e);
                tracing::error!(task = %self.name, error = %cause, "Task run failed");
                RunOutcome::Failed
            }
        }
    }
}

/// Owns the repeating loops of every submitted task and the shared stop signal.
pub struct TaskGroup {
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            loops: Vec::new(),
        }
    }

    pub fn active_loops(&self) -> usize {
        self.loops.len()
    }

    /// Disabled tasks do nothing. Enabled tasks run once right away; tasks with
    /// an interval then keep running in the background.
    pub async fn submit(&mut self, task: Task) {
        if !task.enabled {
            tracing::info!(task = %task.name, "Task disabled, not scheduling");
            return;
        }
        if self.cancel.is_cancelled() {
            tracing::info!(task = %task.name, "Shutdown already requested, not running task");
            return;
        }

        tracing::info!(task = %task.name, "Running task");
        task.run_guarded().await;

        if let Some(period) = task.interval {
            tracing::info!(task = %task.name, interval_secs = period.as_secs(), "Scheduling task");
            let cancel = self.cancel.clone();
            self.loops
                .push(tokio::spawn(run_loop(task, period, cancel)));
        }
    }

    /// Signals every loop to stop and waits for in-flight runs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Task loop panicked");
            }
        }
    }
}

async fn run_loop(task: Task, period: Duration, cancel: CancellationToken) {
    let Some(first_tick) = Instant::now().checked_add(period) else {
        tracing::error!(task = %task.name, interval_secs = period.as_secs(), "Interval too large, not repeating task");
        return;
    };
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(task = %task.name, "Task loop stopping");
                break;
            }
            _ = ticker.tick() => {}
        }

        // Not raced against `cancel`: a started run is allowed to complete.
        task.run_guarded().await;
    }
}
