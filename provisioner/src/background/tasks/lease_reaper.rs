// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for returning tasks with expired leases to the queue

use crate::app::Orchestrator;
use crate::background::BackgroundTask;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::info;
use slog::Logger;
use std::sync::Arc;

/// Requeues tasks whose worker stopped renewing or acknowledging them
pub struct LeaseReaper {
    orchestrator: Arc<Orchestrator>,
}

impl LeaseReaper {
    pub fn new(orchestrator: Arc<Orchestrator>) -> LeaseReaper {
        LeaseReaper { orchestrator }
    }
}

impl BackgroundTask for LeaseReaper {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let reclaimed = self.orchestrator.reclaim_leases();
            if reclaimed > 0 {
                info!(log, "reclaimed expired task leases"; "count" => reclaimed);
            }
            json!({
                "reclaimed": reclaimed,
                "queued": self.orchestrator.dispatcher().queued_count(),
                "leased": self.orchestrator.dispatcher().leased_count(),
            })
        }
        .boxed()
    }
}
