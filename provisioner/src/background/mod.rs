// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background tasks
//!
//! A background task is work the provisioner does periodically (and on
//! demand) rather than in response to a request: reclaiming expired task
//! leases, resuming jobs that lost their control loop, and deleting clusters
//! whose lease ran out.  Each task implements [`BackgroundTask`] and is
//! registered with the [`Driver`], which runs it in its own tokio task and
//! tracks what it last did.
//!
//! Activations of a given task never overlap.  If the task is activated while
//! running, it runs again once the current activation finishes.

mod driver;
mod status;
pub mod tasks;

pub use driver::Driver;
pub use status::ActivationReason;
pub use status::CurrentStatus;
pub use status::LastResult;
pub use status::LastResultCompleted;
pub use status::TaskStatus;

use futures::future::BoxFuture;
use slog::Logger;

/// An operation activated both periodically and by an explicit signal
///
/// The returned value summarizes what the activation did.  It is kept by the
/// driver for whoever asks about the task's status.
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value>;
}

/// Identifies a background task registered with the [`Driver`]
#[derive(Clone, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct TaskName(String);

impl TaskName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
