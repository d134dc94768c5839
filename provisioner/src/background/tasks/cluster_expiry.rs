// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for deleting clusters whose lease has run out

use crate::app::Orchestrator;
use crate::background::BackgroundTask;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::warn;
use slog::Logger;
use std::sync::Arc;

pub struct ClusterExpiry {
    orchestrator: Arc<Orchestrator>,
}

impl ClusterExpiry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> ClusterExpiry {
        ClusterExpiry { orchestrator }
    }
}

impl BackgroundTask for ClusterExpiry {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            match self.orchestrator.expire_clusters(Utc::now()).await {
                Ok(deleting) => json!({ "deletions_started": deleting }),
                Err(error) => {
                    warn!(log, "failed to list clusters for expiry";
                        "error" => %error);
                    json!({ "error": error.to_string() })
                }
            }
        }
        .boxed()
    }
}
