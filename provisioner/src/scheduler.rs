// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracks which of a job's tasks are eligible to run
//!
//! A task becomes eligible once every one of its predecessors has completed.
//! The scheduler only does the bookkeeping; the job runner decides what to do
//! with eligible tasks.

use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::task::Task;
use provisioner_types::task::TaskStatus;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub struct Scheduler {
    /// position of each task in the plan
    order: BTreeMap<TaskUuid, usize>,
    /// number of predecessors of each task that haven't completed
    waiting_on: BTreeMap<TaskUuid, usize>,
    dependents: BTreeMap<TaskUuid, Vec<TaskUuid>>,
    completed: BTreeSet<TaskUuid>,
}

impl Scheduler {
    /// Builds the scheduler for `tasks`, given in plan order
    ///
    /// Tasks already COMPLETE count as completed predecessors, so a job
    /// resumed after a restart picks up where it left off.
    pub fn new(tasks: &[Task]) -> Scheduler {
        let completed: BTreeSet<TaskUuid> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| t.id)
            .collect();
        let mut dependents: BTreeMap<TaskUuid, Vec<TaskUuid>> = BTreeMap::new();
        let mut waiting_on = BTreeMap::new();
        for task in tasks {
            let mut count = 0;
            for predecessor in &task.predecessors {
                dependents.entry(*predecessor).or_default().push(task.id);
                if !completed.contains(predecessor) {
                    count += 1;
                }
            }
            waiting_on.insert(task.id, count);
        }
        let order =
            tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
        Scheduler { order, waiting_on, dependents, completed }
    }

    /// Returns the tasks that have not been submitted and have nothing left to
    /// wait on, in plan order
    pub fn initial_ready<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a Task>,
    ) -> Vec<TaskUuid> {
        tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Created)
            .filter(|t| self.waiting_on.get(&t.id) == Some(&0))
            .map(|t| t.id)
            .collect()
    }

    /// Records that `task_id` completed, returning the tasks that became
    /// eligible as a result, in plan order
    ///
    /// Completing a task twice has no further effect.
    pub fn complete(&mut self, task_id: TaskUuid) -> Vec<TaskUuid> {
        if !self.completed.insert(task_id) {
            return Vec::new();
        }
        let mut ready = Vec::new();
        for dependent in self.dependents.get(&task_id).into_iter().flatten() {
            if let Some(count) = self.waiting_on.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(*dependent);
                }
            }
        }
        ready.sort_by_key(|id| self.order.get(id).copied());
        ready
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.order.len()
    }
}
