// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manages execution of background tasks

use super::ActivationReason;
use super::BackgroundTask;
use super::CurrentStatus;
use super::LastResult;
use super::LastResultCompleted;
use super::TaskName;
use super::TaskStatus;
use chrono::Utc;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Drives the execution of background tasks
///
/// The provisioner has one Driver.  Every background task is registered with
/// it at startup and runs in its own tokio task.  The Driver lets callers
/// activate a task explicitly and see what each one last did.
pub struct Driver {
    tasks: BTreeMap<TaskName, Task>,
}

/// Driver-side state of a background task
struct Task {
    /// what this task does (for developers)
    description: String,
    /// configured period of the task
    period: Duration,
    /// updates from the task's tokio task about what it is doing
    status: watch::Receiver<TaskStatus>,
    /// join handle for the tokio task that's executing this background task
    tokio_task: tokio::task::JoinHandle<()>,
    /// wakes up the tokio task for an explicit activation
    notify: Arc<Notify>,
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}

impl Driver {
    pub fn new() -> Driver {
        Driver { tasks: BTreeMap::new() }
    }

    /// Register a new background task
    ///
    /// The task runs right away and then whenever it has not run for
    /// `period`, as well as whenever [`Driver::activate()`] is called.
    ///
    /// All background tasks have a unique `name` for observability.  This
    /// function panics if the name conflicts with that of a
    /// previously-registered task.
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        period: Duration,
        imp: Box<dyn BackgroundTask>,
        log: &Logger,
    ) -> TaskName {
        // Activation happens in a separate tokio task, which reports status
        // back to us over this channel.
        let (status_tx, status_rx) = watch::channel(TaskStatus {
            current: CurrentStatus::Idle,
            last: LastResult::NeverCompleted,
        });
        let notify = Arc::new(Notify::new());

        let log = log.new(o!("background_task" => name.to_string()));
        let task_exec =
            TaskExec::new(period, imp, Arc::clone(&notify), log, status_tx);
        let tokio_task = tokio::task::spawn(task_exec.run());

        let task = Task {
            description: description.to_string(),
            period,
            status: status_rx,
            tokio_task,
            notify,
        };
        let name = TaskName(name.to_string());
        if self.tasks.insert(name.clone(), task).is_some() {
            panic!("started two background tasks called {:?}", name);
        }
        name
    }

    /// Enumerate all registered background tasks
    pub fn tasks(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.keys()
    }

    fn task_required(&self, task: &TaskName) -> &Task {
        // A TaskName only comes from `register()` on the same Driver, so
        // this would be a programming error.
        self.tasks.get(task).unwrap_or_else(|| {
            panic!("attempted to get non-existent background task: {:?}", task)
        })
    }

    /// Returns a summary of what this task does (for developers)
    pub fn task_description(&self, task: &TaskName) -> &str {
        &self.task_required(task).description
    }

    /// Returns the configured period of the task
    pub fn task_period(&self, task: &TaskName) -> Duration {
        self.task_required(task).period
    }

    /// Activate the specified background task
    ///
    /// If the task is currently running, it will be activated again when it
    /// finishes.
    pub fn activate(&self, task: &TaskName) {
        self.task_required(task).notify.notify_one();
    }

    /// Returns the runtime status of the background task
    pub fn task_status(&self, task: &TaskName) -> TaskStatus {
        // Borrowing from a watch channel's receiver blocks the sender.  Clone
        // the status to avoid an errant caller gumming up the works by hanging
        // on to a reference.
        self.task_required(task).status.borrow().clone()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // When the driver is dropped, terminate all tokio tasks that were used
        // to run background tasks.
        for t in self.tasks.values() {
            t.tokio_task.abort();
        }
    }
}

/// State needed by the tokio task that activates one background task
struct TaskExec {
    /// how often the background task should be activated
    period: Duration,
    imp: Box<dyn BackgroundTask>,
    /// signals an explicit activation request from the Driver
    notify: Arc<Notify>,
    log: Logger,
    status_tx: watch::Sender<TaskStatus>,
    /// counts iterations of the task, for debuggability
    iteration: u64,
}

impl TaskExec {
    fn new(
        period: Duration,
        imp: Box<dyn BackgroundTask>,
        notify: Arc<Notify>,
        log: Logger,
        status_tx: watch::Sender<TaskStatus>,
    ) -> TaskExec {
        TaskExec { period, imp, notify, log, status_tx, iteration: 0 }
    }

    /// Body of the tokio task that manages activation of this background task
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.activate(ActivationReason::Timeout).await;
                },

                _ = self.notify.notified() => {
                    self.activate(ActivationReason::Signaled).await;
                }
            }
        }
    }

    /// Invokes the background task, with status reporting around it
    async fn activate(&mut self, reason: ActivationReason) {
        self.iteration += 1;
        let iteration = self.iteration;
        let start_time = Utc::now();
        let start_instant = Instant::now();

        debug!(
            &self.log,
            "activating";
            "reason" => ?reason,
            "iteration" => iteration
        );

        self.status_tx.send_modify(|status| {
            status.current =
                CurrentStatus::Running { start_time, reason, iteration };
        });

        let details = self.imp.activate(&self.log).await;

        let elapsed = start_instant.elapsed();

        self.status_tx.send_modify(|status| {
            *status = TaskStatus {
                current: CurrentStatus::Idle,
                last: LastResult::Completed(LastResultCompleted {
                    iteration,
                    start_time,
                    reason,
                    elapsed,
                    details,
                }),
            };
        });

        debug!(
            &self.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
        );
    }
}
