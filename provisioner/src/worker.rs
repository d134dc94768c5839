// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workers that lease tasks from the dispatcher and run them

use crate::dispatcher::Dispatcher;
use crate::dispatcher::QueueError;
use crate::executor::ActionExecutor;
use crate::executor::ActionRequest;
use provisioner_types::task::WorkerId;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A fixed set of workers sharing one dispatcher and one executor
pub struct WorkerPool {
    log: Logger,
    workers: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Starts `count` workers
    pub fn start(
        log: &Logger,
        count: usize,
        dispatcher: Arc<Dispatcher>,
        executor: Arc<dyn ActionExecutor>,
        lease_timeout: Duration,
        lease_wait: Duration,
    ) -> WorkerPool {
        let log = log.new(o!("component" => "WorkerPool"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for i in 0..count {
            let worker = Worker {
                id: WorkerId(format!("worker-{i}")),
                log: log.new(o!("worker_id" => i)),
                dispatcher: dispatcher.clone(),
                executor: executor.clone(),
                lease_timeout,
                lease_wait,
            };
            workers.spawn(worker.run(shutdown_rx.clone()));
        }
        info!(log, "started workers"; "count" => count);
        WorkerPool { log, workers, shutdown_tx }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stops every worker, abandoning whatever tasks they are running
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        while let Some(result) = self.workers.join_next().await {
            if let Err(error) = result {
                warn!(self.log, "worker exited abnormally"; "error" => %error);
            }
        }
        info!(self.log, "workers stopped");
    }
}

struct Worker {
    id: WorkerId,
    log: Logger,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<dyn ActionExecutor>,
    lease_timeout: Duration,
    lease_wait: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            let leased = tokio::select! {
                leased = self.dispatcher.lease(
                    &self.id,
                    self.lease_timeout,
                    self.lease_wait,
                ) => leased,
                _ = shutdown.changed() => return,
            };
            let Some(leased) = leased else {
                continue;
            };

            let request = ActionRequest {
                task_id: leased.task.id,
                cluster_id: leased.task.cluster_id,
                unit: leased.task.unit.clone(),
                attempt: leased.task.attempts,
            };
            debug!(self.log, "executing";
                "task_id" => %request.task_id,
                "unit" => %request.unit,
                "attempt" => request.attempt,
            );
            // An abandoned task is handed out again once its lease expires.
            let outcome = tokio::select! {
                outcome = self.executor.execute(&request) => outcome,
                _ = shutdown.changed() => return,
            };
            match self.dispatcher.ack(&leased.token, outcome) {
                Ok(()) => {}
                Err(error @ QueueError::LeaseExpired { .. }) => {
                    warn!(self.log, "discarding outcome";
                        "task_id" => %request.task_id,
                        "error" => %error,
                    );
                }
                Err(error) => {
                    warn!(self.log, "failed to acknowledge task";
                        "task_id" => %request.task_id,
                        "error" => %error,
                    );
                }
            }
        }
    }
}
