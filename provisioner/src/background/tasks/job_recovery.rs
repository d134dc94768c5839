// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for resuming jobs that have no control loop

use crate::app::Orchestrator;
use crate::app::RecoveryReport;
use crate::background::BackgroundTask;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::Arc;

pub struct JobRecovery {
    orchestrator: Arc<Orchestrator>,
}

impl JobRecovery {
    pub fn new(orchestrator: Arc<Orchestrator>) -> JobRecovery {
        JobRecovery { orchestrator }
    }
}

impl BackgroundTask for JobRecovery {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            match self.orchestrator.recover().await {
                Ok(report) => {
                    if report != RecoveryReport::default() {
                        info!(log, "recovered jobs";
                            "resumed" => report.resumed,
                            "settled" => report.settled,
                            "abandoned" => report.abandoned,
                        );
                    }
                    json!(report)
                }
                Err(error) => {
                    warn!(log, "job recovery failed"; "error" => %error);
                    json!({ "error": error.to_string() })
                }
            }
        }
        .boxed()
    }
}
