// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-job control loop
//!
//! Every active job has exactly one [`JobRunner`], running in its own tokio
//! task.  The runner is the only writer of the job's task records.  It hands
//! eligible tasks to the dispatcher, hears back about leases and outcomes
//! over a channel, and applies each outcome in turn: node side effects, task
//! status, newly eligible dependents, retries, and finally the job's and the
//! cluster's terminal state.
//!
//! Every decision is persisted before it is acted upon.  If the datastore
//! fails, the runner stops without marking anything terminal and recovery
//! resumes the job later from what was stored.

use crate::datastore::Datastore;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::JobEvent;
use crate::dispatcher::JobEventSender;
use crate::dispatcher::Withdraw;
use crate::executor::ActionOutcome;
use crate::locks::ClusterLocks;
use crate::retry::abort_plan;
use crate::retry::RetryDecision;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use chrono::Utc;
use provisioner_common::api::Error;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::cluster::ClusterEvent;
use provisioner_types::cluster::NodeProperties;
use provisioner_types::job::ClusterJob;
use provisioner_types::job::JobStatus;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::Task;
use provisioner_types::task::TaskStatus;
use provisioner_types::task::TaskUnit;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// Requests sent to a running job
pub(crate) enum JobControl {
    /// Stop starting new work.  Work in flight still reports its outcome.
    Cancel { reply: oneshot::Sender<Result<(), Error>> },
}

/// Runners currently alive, by job
#[derive(Default)]
pub(crate) struct JobRegistry {
    jobs: Mutex<BTreeMap<JobUuid, RunnerHandle>>,
}

struct RunnerHandle {
    control: mpsc::UnboundedSender<JobControl>,
    abort: tokio::task::AbortHandle,
}

impl JobRegistry {
    fn jobs(&self) -> MutexGuard<'_, BTreeMap<JobUuid, RunnerHandle>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_running(&self, job_id: JobUuid) -> bool {
        self.jobs().contains_key(&job_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs().len()
    }

    /// Asks a running job to cancel itself
    ///
    /// Returns `None` if no runner is alive to answer, in which case the
    /// caller must cancel the job's persisted state directly.
    pub(crate) async fn cancel(
        &self,
        job_id: JobUuid,
    ) -> Option<Result<(), Error>> {
        let control = self.jobs().get(&job_id)?.control.clone();
        let (reply, rx) = oneshot::channel();
        control.send(JobControl::Cancel { reply }).ok()?;
        rx.await.ok()
    }

    /// Stops every runner wherever it is.  Jobs keep their persisted state
    /// and are resumed by the next recovery pass.
    pub(crate) fn abort_all(&self) -> usize {
        let mut jobs = self.jobs();
        let count = jobs.len();
        for runner in jobs.values() {
            runner.abort.abort();
        }
        jobs.clear();
        count
    }
}

/// Shared pieces a runner needs
#[derive(Clone)]
pub(crate) struct JobContext {
    pub log: Logger,
    pub datastore: Arc<dyn Datastore>,
    pub dispatcher: Arc<Dispatcher>,
    pub locks: Arc<ClusterLocks>,
    pub registry: Arc<JobRegistry>,
    pub retry: RetryPolicy,
}

pub(crate) struct JobRunner {
    log: Logger,
    cx: JobContext,
    job: ClusterJob,
    tasks: BTreeMap<TaskUuid, Task>,
    scheduler: Scheduler,
    events_tx: JobEventSender,
    events_rx: mpsc::UnboundedReceiver<JobEvent>,
    /// cancelled by a delete that is taking the cluster over
    superseded: bool,
}

impl JobRunner {
    /// `tasks` may be in any order; the job's `task_ids` give the plan order.
    pub(crate) fn new(
        cx: &JobContext,
        job: ClusterJob,
        tasks: Vec<Task>,
    ) -> JobRunner {
        let mut by_id: BTreeMap<TaskUuid, Task> =
            tasks.into_iter().map(|t| (t.id, t)).collect();
        let ordered: Vec<Task> = job
            .task_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        let scheduler = Scheduler::new(&ordered);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        JobRunner {
            log: cx.log.new(o!(
                "job_id" => job.id.to_string(),
                "cluster_id" => job.cluster_id.to_string(),
                "operation" => job.operation.kind().to_string(),
            )),
            cx: cx.clone(),
            job,
            tasks: ordered.into_iter().map(|t| (t.id, t)).collect(),
            scheduler,
            events_tx,
            events_rx,
            superseded: false,
        }
    }

    /// Starts the runner in its own tokio task
    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        let (control, control_rx) = mpsc::unbounded_channel();
        let job_id = self.job.id;
        let registry = self.cx.registry.clone();
        // Hold the registry while spawning so the runner can't deregister
        // before it is registered.
        let mut jobs = registry.jobs();
        let exit_registry = registry.clone();
        let handle = tokio::spawn(async move {
            self.run(control_rx).await;
            exit_registry.jobs().remove(&job_id);
        });
        jobs.insert(
            job_id,
            RunnerHandle { control, abort: handle.abort_handle() },
        );
        drop(jobs);
        handle
    }

    async fn run(mut self, mut control: mpsc::UnboundedReceiver<JobControl>) {
        match self.drive(&mut control).await {
            Ok(()) => {
                info!(self.log, "job finished"; "status" => %self.job.status())
            }
            Err(error) => warn!(
                self.log,
                "job runner stopped; the job will resume on recovery";
                "error" => %error,
            ),
        }
        self.cx.dispatcher.withdraw_job(self.job.id, Withdraw::All);
    }

    async fn drive(
        &mut self,
        control: &mut mpsc::UnboundedReceiver<JobControl>,
    ) -> Result<(), Error> {
        self.start().await?;
        loop {
            if self.job.status().is_terminal() {
                if self.in_flight() == 0 {
                    return self.settle().await;
                }
            } else if self.scheduler.is_complete() {
                return self.succeed().await;
            } else if self.in_flight() == 0 {
                // Nothing is queued or running, so nothing left can ever
                // become eligible.
                warn!(self.log, "job cannot make progress");
                self.abort(
                    JobStatus::Failed,
                    "no remaining task can become eligible".to_string(),
                )
                .await?;
                continue;
            }

            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await?;
                }
                Some(JobControl::Cancel { reply }) = control.recv() => {
                    let result = self.cancel().await;
                    let _ = reply.send(result.clone());
                    result?;
                }
                else => {
                    return Err(Error::internal_error("job channels closed"));
                }
            }
        }
    }

    /// Puts the job's eligible tasks in the queue
    ///
    /// A resumed job also gets back whatever it had queued or leased before:
    /// the queue doesn't survive a restart, and a lease from before the
    /// restart can no longer be acknowledged.
    ///
    /// A job that was stopped partway through aborting finishes the abort
    /// instead.
    async fn start(&mut self) -> Result<(), Error> {
        if self.job.status().is_terminal() {
            return Ok(());
        }
        if let Some((status, message)) = self.interrupted_abort() {
            // Whatever was queued or leased went away with the old runner.
            for task in self.tasks.values_mut() {
                if matches!(
                    task.status,
                    TaskStatus::Queued | TaskStatus::InProgress
                ) {
                    task.status = TaskStatus::Skipped;
                    task.lease = None;
                    self.cx.datastore.task_save(task).await?;
                }
            }
            info!(self.log, "finishing interrupted abort"; "status" => %status);
            return self.abort(status, message).await;
        }
        let mut resumed = Vec::new();
        for id in &self.job.task_ids {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            match task.status {
                TaskStatus::Queued => resumed.push(*id),
                TaskStatus::InProgress => {
                    task.status = TaskStatus::Queued;
                    task.lease = None;
                    self.cx.datastore.task_save(task).await?;
                    resumed.push(*id);
                }
                _ => (),
            }
        }
        if !resumed.is_empty() {
            info!(self.log, "resuming job"; "requeued" => resumed.len());
        }
        for id in resumed {
            self.dispatch(id)?;
        }

        let in_order =
            self.job.task_ids.iter().filter_map(|id| self.tasks.get(id));
        let ready = self.scheduler.initial_ready(in_order);
        for id in ready {
            self.submit(id).await?;
        }
        Ok(())
    }

    /// Works out whether an ACTIVE job's tasks show it was being aborted
    ///
    /// A FAILED task means the job had run out of attempts; SKIPPED tasks
    /// without one mean it was being cancelled.
    fn interrupted_abort(&self) -> Option<(JobStatus, String)> {
        let mut in_order =
            self.job.task_ids.iter().filter_map(|id| self.tasks.get(id));
        if let Some(failed) =
            in_order.clone().find(|t| t.status == TaskStatus::Failed)
        {
            let details =
                failed.last_error.as_deref().unwrap_or("no details recorded");
            return Some((
                JobStatus::Failed,
                format!("{} failed: {details}", failed.unit),
            ));
        }
        if in_order.any(|t| t.status == TaskStatus::Skipped) {
            return Some((
                JobStatus::Cancelled,
                "superseded by delete".to_string(),
            ));
        }
        None
    }

    /// Marks a task QUEUED, then hands it to the dispatcher
    async fn submit(&mut self, task_id: TaskUuid) -> Result<(), Error> {
        let task = task_entry(&mut self.tasks, task_id)?;
        task.status = TaskStatus::Queued;
        task.time_submitted = Some(Utc::now());
        let task = task.clone();
        self.cx.datastore.task_save(&task).await?;
        self.dispatch(task_id)
    }

    fn dispatch(&self, task_id: TaskUuid) -> Result<(), Error> {
        let task = self.task(task_id)?;
        if let Err(error) =
            self.cx.dispatcher.enqueue(task.clone(), self.events_tx.clone())
        {
            debug!(self.log, "task already in the queue"; "error" => %error);
        }
        Ok(())
    }

    fn task(&self, task_id: TaskUuid) -> Result<&Task, Error> {
        self.tasks.get(&task_id).ok_or_else(|| {
            Error::internal_error(&format!("task {task_id} is not in the job"))
        })
    }

    async fn save_task(&self, task_id: TaskUuid) -> Result<(), Error> {
        self.cx.datastore.task_save(self.task(task_id)?).await
    }

    /// Number of tasks that are queued or held by a worker
    fn in_flight(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Queued | TaskStatus::InProgress)
            })
            .count()
    }

    async fn handle_event(&mut self, event: JobEvent) -> Result<(), Error> {
        match event {
            JobEvent::Leased { task_id, lease } => {
                let task = task_entry(&mut self.tasks, task_id)?;
                if task.status != TaskStatus::Queued {
                    return Ok(());
                }
                debug!(self.log, "task leased";
                    "unit" => %task.unit,
                    "worker_id" => %lease.worker_id,
                    "generation" => lease.generation,
                );
                task.status = TaskStatus::InProgress;
                task.lease = Some(lease);
                self.save_task(task_id).await
            }

            JobEvent::Expired { task_id, generation } => {
                let draining = self.job.status().is_terminal();
                let task = task_entry(&mut self.tasks, task_id)?;
                let current = task.lease.as_ref().map(|l| l.generation);
                if task.status != TaskStatus::InProgress
                    || current != Some(generation)
                {
                    return Ok(());
                }
                task.lease = None;
                // A draining job's expired tasks are dropped from the queue.
                task.status = if draining {
                    TaskStatus::Skipped
                } else {
                    TaskStatus::Queued
                };
                self.save_task(task_id).await
            }

            JobEvent::Finished { task_id, generation, outcome } => {
                let task = self.task(task_id)?;
                if task.status.is_terminal() {
                    return Ok(());
                }
                if task.lease.as_ref().is_some_and(|l| l.generation != generation)
                {
                    debug!(self.log, "outcome from an old lease";
                        "unit" => %task.unit,
                        "generation" => generation,
                    );
                }
                match outcome {
                    ActionOutcome::Success { properties } => {
                        self.task_succeeded(task_id, properties).await
                    }
                    ActionOutcome::Failure { details } => {
                        self.task_failed(task_id, details).await
                    }
                }
            }
        }
    }

    async fn task_succeeded(
        &mut self,
        task_id: TaskUuid,
        properties: NodeProperties,
    ) -> Result<(), Error> {
        let unit = self.task(task_id)?.unit.clone();
        // A cancelled job's nodes belong to the job that superseded it.
        if self.job.status() != JobStatus::Cancelled {
            self.apply_side_effects(&unit, properties).await?;
        }

        let task = task_entry(&mut self.tasks, task_id)?;
        task.status = TaskStatus::Complete;
        task.time_completed = Some(Utc::now());
        task.lease = None;
        self.save_task(task_id).await?;
        debug!(self.log, "task complete"; "unit" => %unit);

        let ready = self.scheduler.complete(task_id);
        if self.job.status().is_terminal() {
            return Ok(());
        }
        for id in ready {
            self.submit(id).await?;
        }
        Ok(())
    }

    /// Updates the node record to reflect a completed action
    async fn apply_side_effects(
        &self,
        unit: &TaskUnit,
        properties: NodeProperties,
    ) -> Result<(), Error> {
        let datastore = &self.cx.datastore;
        if unit.service.is_none() && unit.action == ProvisionerAction::Delete {
            return datastore.node_delete(unit.node_id).await;
        }
        let Some(mut node) = datastore.node_load(unit.node_id).await? else {
            warn!(self.log, "completed action on a node that doesn't exist";
                "unit" => %unit,
            );
            return Ok(());
        };
        node.properties.merge(properties);
        match (&unit.service, unit.action) {
            (Some(service), ProvisionerAction::Install) => {
                node.services.insert(service.clone());
            }
            (Some(service), ProvisionerAction::Remove) => {
                node.services.remove(service);
            }
            _ => (),
        }
        datastore.node_save(&node).await
    }

    async fn task_failed(
        &mut self,
        task_id: TaskUuid,
        details: String,
    ) -> Result<(), Error> {
        let retry = self.cx.retry;
        let job_active = !self.job.status().is_terminal();
        let task = task_entry(&mut self.tasks, task_id)?;
        let unit = task.unit.clone();

        if !job_active {
            task.attempts += 1;
            task.last_error = Some(details);
            task.lease = None;
            task.status = TaskStatus::Failed;
            return self.save_task(task_id).await;
        }

        let decision = retry.on_failure(task, details.clone());
        let attempts = task.attempts;
        warn!(self.log, "task failed";
            "unit" => %unit,
            "attempts" => attempts,
            "error" => &details,
        );
        self.save_task(task_id).await?;
        match decision {
            RetryDecision::Retry => self.dispatch(task_id),
            RetryDecision::Fail => {
                let message = format!("{unit} failed: {details}");
                self.abort(JobStatus::Failed, message).await
            }
        }
    }

    /// Stops starting new work and moves the job to `status`
    async fn abort(
        &mut self,
        status: JobStatus,
        message: String,
    ) -> Result<(), Error> {
        let withdrawn: BTreeSet<TaskUuid> = self
            .cx
            .dispatcher
            .withdraw_job(self.job.id, Withdraw::Queued)
            .into_iter()
            .collect();
        let skipped = abort_plan(self.tasks.values_mut(), &withdrawn);
        for id in &skipped {
            self.save_task(*id).await?;
        }
        self.job
            .finish(status, Utc::now(), Some(message.clone()))
            .map_err(|e| Error::internal_error(&e.to_string()))?;
        self.cx.datastore.job_save(&self.job).await?;
        info!(self.log, "job aborted";
            "status" => %status,
            "skipped" => skipped.len(),
            "in_flight" => self.in_flight(),
            "message" => message,
        );
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        self.superseded = true;
        if self.job.status().is_terminal() {
            return Ok(());
        }
        self.abort(JobStatus::Cancelled, "superseded by delete".to_string())
            .await
    }

    async fn succeed(&mut self) -> Result<(), Error> {
        self.job
            .finish(JobStatus::Complete, Utc::now(), None)
            .map_err(|e| Error::internal_error(&e.to_string()))?;
        self.cx.datastore.job_save(&self.job).await?;
        let event =
            ClusterEvent::JobSucceeded { operation: self.job.operation.kind() };
        settle_cluster(&self.cx, &self.log, &self.job, event).await
    }

    /// Records a failed job's outcome on its cluster once nothing is in
    /// flight
    async fn settle(&mut self) -> Result<(), Error> {
        match self.job.status() {
            JobStatus::Failed => {
                let event = ClusterEvent::JobFailed {
                    operation: self.job.operation.kind(),
                };
                settle_cluster(&self.cx, &self.log, &self.job, event).await
            }
            // the superseding job owns the cluster now
            JobStatus::Cancelled if self.superseded => Ok(()),
            JobStatus::Cancelled => {
                release_cancelled(&self.cx, &self.job).await.map(|_| ())
            }
            JobStatus::Active | JobStatus::Complete => Ok(()),
        }
    }
}

fn task_entry(
    tasks: &mut BTreeMap<TaskUuid, Task>,
    task_id: TaskUuid,
) -> Result<&mut Task, Error> {
    tasks.get_mut(&task_id).ok_or_else(|| {
        Error::internal_error(&format!("task {task_id} is not in the job"))
    })
}

/// Applies a finished job's outcome to its cluster and releases the
/// cluster's lock
///
/// Does nothing if the job no longer holds the lock.
pub(crate) async fn settle_cluster(
    cx: &JobContext,
    log: &Logger,
    job: &ClusterJob,
    event: ClusterEvent,
) -> Result<(), Error> {
    let _guard = cx.locks.records().await;
    if cx.locks.holder(job.cluster_id) != Some(job.id) {
        return Ok(());
    }
    let mut cluster = cx.datastore.cluster_fetch(job.cluster_id).await?;
    if cluster.active_job != Some(job.id) {
        cx.locks.release(job.cluster_id, job.id);
        return Ok(());
    }
    let nodes = cx.datastore.node_list(job.cluster_id).await?;
    cluster.nodes = nodes.iter().map(|n| n.id).collect();
    match event {
        ClusterEvent::JobSucceeded { .. } => {
            cluster.services = job.target_services.clone();
            cluster.node_count = job.target_node_count;
        }
        ClusterEvent::JobFailed { .. } | ClusterEvent::JobStarted => {
            cluster.services =
                nodes.iter().flat_map(|n| n.services.iter().cloned()).collect();
        }
    }
    match cluster.status.transition(event) {
        Ok(status) => cluster.status = status,
        Err(error) => {
            warn!(log, "ignoring job outcome"; "error" => %error);
        }
    }
    cluster.active_job = None;
    cx.datastore.cluster_save(&cluster).await?;
    cx.locks.release(job.cluster_id, job.id);
    info!(log, "cluster updated"; "status" => %cluster.status);
    Ok(())
}

/// Lets go of a cluster whose active job was cancelled without another job
/// taking over, returning whether the cluster still named the job
pub(crate) async fn release_cancelled(
    cx: &JobContext,
    job: &ClusterJob,
) -> Result<bool, Error> {
    let _guard = cx.locks.records().await;
    let mut cluster = cx.datastore.cluster_fetch(job.cluster_id).await?;
    let named = cluster.active_job == Some(job.id);
    if named {
        cluster.active_job = None;
        cx.datastore.cluster_save(&cluster).await?;
    }
    cx.locks.release(job.cluster_id, job.id);
    Ok(named)
}
