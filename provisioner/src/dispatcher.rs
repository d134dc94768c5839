// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue of eligible tasks, handed to workers under time-bounded leases
//!
//! A task is enqueued once all of its predecessors have completed.  A worker
//! leases it, executes it, and acknowledges the outcome.  If the worker does
//! not acknowledge before the lease expires, the task goes back into the
//! queue at its original position and any later acknowledgment for that
//! lease is rejected.  Each lease carries a generation number so that a stale
//! worker can never overwrite the outcome of a newer lease.
//!
//! Everything that happens to a task is reported to the job that enqueued it
//! as a [`JobEvent`].  The queue itself is not persisted: the job runners
//! persist task state and re-enqueue on recovery.

use crate::executor::ActionOutcome;
use chrono::DateTime;
use chrono::Utc;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::task::Task;
use provisioner_types::task::TaskLease;
use provisioner_types::task::WorkerId;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Identifies one lease of one task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseToken {
    pub task_id: TaskUuid,
    pub worker_id: WorkerId,
    pub generation: u64,
}

/// A task handed to a worker
#[derive(Clone, Debug)]
pub struct LeasedTask {
    pub token: LeaseToken,
    pub task: Task,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("lease on task {task_id} expired or was superseded")]
    LeaseExpired { task_id: TaskUuid },
    #[error("task {0} is already queued")]
    AlreadyQueued(TaskUuid),
}

/// What happened to a task enqueued by a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Leased { task_id: TaskUuid, lease: TaskLease },
    Finished { task_id: TaskUuid, generation: u64, outcome: ActionOutcome },
    /// The lease ran out.  The task is queued again unless its job is
    /// draining.
    Expired { task_id: TaskUuid, generation: u64 },
}

pub type JobEventSender = mpsc::UnboundedSender<JobEvent>;

/// Which of a job's tasks to remove from the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Withdraw {
    /// Tasks waiting for a worker.  Leased tasks may still be acknowledged,
    /// but an expired lease no longer puts its task back in the queue.
    Queued,
    /// Every task of the job, leased or not
    All,
}

pub struct Dispatcher {
    log: Logger,
    queue: Mutex<Queue>,
    notify: Notify,
}

#[derive(Default)]
struct Queue {
    next_seq: u64,
    next_generation: u64,
    /// tasks waiting for a worker, by enqueue order
    ready: BTreeMap<u64, TaskUuid>,
    entries: BTreeMap<TaskUuid, Entry>,
    draining: BTreeSet<JobUuid>,
}

struct Entry {
    seq: u64,
    task: Task,
    events: JobEventSender,
    lease: Option<Held>,
}

struct Held {
    worker_id: WorkerId,
    generation: u64,
    deadline: Instant,
}

impl Dispatcher {
    pub fn new(log: &Logger) -> Dispatcher {
        Dispatcher {
            log: log.new(o!("component" => "Dispatcher")),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        // Nothing panics while holding the lock, but if something did, the
        // queue is still structurally sound.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes `task` available to workers, reporting what happens to it on
    /// `events`
    pub fn enqueue(
        &self,
        task: Task,
        events: JobEventSender,
    ) -> Result<(), QueueError> {
        let mut queue = self.queue();
        if queue.entries.contains_key(&task.id) {
            return Err(QueueError::AlreadyQueued(task.id));
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        debug!(self.log, "enqueued"; "task_id" => %task.id, "unit" => %task.unit);
        queue.ready.insert(seq, task.id);
        queue.entries.insert(task.id, Entry { seq, task, events, lease: None });
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    /// Leases the oldest queued task to `worker_id`
    ///
    /// Waits up to `wait` for a task to become available, returning `None`
    /// if none does.
    pub async fn lease(
        &self,
        worker_id: &WorkerId,
        lease_timeout: Duration,
        wait: Duration,
    ) -> Option<LeasedTask> {
        let give_up = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut queue = self.queue();
                queue.reclaim_expired(&self.log, Instant::now());
                if let Some(leased) =
                    queue.pop(&self.log, worker_id, lease_timeout)
                {
                    return Some(leased);
                }
                queue.next_expiry()
            };

            if Instant::now() >= give_up {
                return None;
            }
            let wake = next_expiry.map_or(give_up, |e| e.min(give_up));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Records the outcome of a leased task
    ///
    /// Fails if the lease has expired or been superseded; the outcome is then
    /// discarded.
    pub fn ack(
        &self,
        token: &LeaseToken,
        outcome: ActionOutcome,
    ) -> Result<(), QueueError> {
        let expired = || QueueError::LeaseExpired { task_id: token.task_id };
        let mut queue = self.queue();
        let now = Instant::now();
        let Some(entry) = queue.entries.get(&token.task_id) else {
            return Err(expired());
        };
        let Some(held) = &entry.lease else {
            return Err(expired());
        };
        if held.generation != token.generation
            || held.worker_id != token.worker_id
        {
            return Err(expired());
        }
        if held.deadline <= now {
            queue.reclaim_expired(&self.log, now);
            return Err(expired());
        }

        let Some(entry) = queue.entries.remove(&token.task_id) else {
            return Err(expired());
        };
        debug!(self.log, "acknowledged";
            "task_id" => %token.task_id,
            "worker_id" => %token.worker_id,
            "success" => outcome.is_success(),
        );
        // A closed channel means the job runner has gone away.  Recovery
        // will resume the job from its persisted state.
        let _ = entry.events.send(JobEvent::Finished {
            task_id: token.task_id,
            generation: token.generation,
            outcome,
        });
        Ok(())
    }

    /// Returns every task whose lease has run out to the queue, returning how
    /// many were reclaimed
    pub fn reclaim_expired(&self) -> usize {
        let count = self.queue().reclaim_expired(&self.log, Instant::now());
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    /// Removes a job's tasks from the queue, returning the ids of those that
    /// were waiting for a worker
    pub fn withdraw_job(&self, job_id: JobUuid, which: Withdraw) -> Vec<TaskUuid> {
        let mut queue = self.queue();
        let Queue { ready, entries, draining, .. } = &mut *queue;
        let mut withdrawn = Vec::new();
        entries.retain(|task_id, entry| {
            if entry.task.job_id != job_id {
                return true;
            }
            if entry.lease.is_none() {
                ready.remove(&entry.seq);
                withdrawn.push(*task_id);
                return false;
            }
            which == Withdraw::Queued
        });
        match which {
            Withdraw::Queued => {
                draining.insert(job_id);
            }
            Withdraw::All => {
                draining.remove(&job_id);
            }
        }
        if !withdrawn.is_empty() {
            info!(self.log, "withdrew queued tasks";
                "job_id" => %job_id,
                "count" => withdrawn.len(),
            );
        }
        withdrawn
    }

    pub fn queued_count(&self) -> usize {
        self.queue().ready.len()
    }

    pub fn leased_count(&self) -> usize {
        let queue = self.queue();
        queue.entries.len() - queue.ready.len()
    }
}

impl Queue {
    fn pop(
        &mut self,
        log: &Logger,
        worker_id: &WorkerId,
        lease_timeout: Duration,
    ) -> Option<LeasedTask> {
        let (_, task_id) = self.ready.pop_first()?;
        let entry = self.entries.get_mut(&task_id)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        entry.lease = Some(Held {
            worker_id: worker_id.clone(),
            generation,
            deadline: Instant::now() + lease_timeout,
        });
        let expires_at = chrono::Duration::from_std(lease_timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let lease = TaskLease {
            worker_id: worker_id.clone(),
            generation,
            expires_at,
        };
        debug!(log, "leased";
            "task_id" => %task_id,
            "worker_id" => %worker_id,
            "generation" => generation,
        );
        let _ = entry.events.send(JobEvent::Leased { task_id, lease });
        Some(LeasedTask {
            token: LeaseToken {
                task_id,
                worker_id: worker_id.clone(),
                generation,
            },
            task: entry.task.clone(),
            expires_at,
        })
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|e| e.lease.as_ref().map(|held| held.deadline))
            .min()
    }

    fn reclaim_expired(&mut self, log: &Logger, now: Instant) -> usize {
        let expired: Vec<TaskUuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.lease.as_ref().is_some_and(|h| h.deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        for task_id in &expired {
            let Some(entry) = self.entries.get_mut(task_id) else {
                continue;
            };
            let Some(held) = entry.lease.take() else {
                continue;
            };
            info!(log, "lease expired";
                "task_id" => %task_id,
                "worker_id" => %held.worker_id,
                "generation" => held.generation,
            );
            let _ = entry.events.send(JobEvent::Expired {
                task_id: *task_id,
                generation: held.generation,
            });
            if self.draining.contains(&entry.task.job_id) {
                self.entries.remove(task_id);
            } else {
                self.ready.insert(entry.seq, *task_id);
            }
        }
        expired.len()
    }
}
