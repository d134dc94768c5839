// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability that carries out provisioning actions on nodes
//!
//! Remote provisioning agents sit behind [`ActionExecutor`].  The orchestrator
//! never assumes an execution finishes promptly (or at all): a worker holds a
//! lease while it waits, and the lease expiring is what hands the task to
//! someone else.
//!
//! [`SimExecutor`] is an in-process agent used by the `provisioner` binary
//! and the test suite.  It can be told to fail or hang on chosen units.

use async_trait::async_trait;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::cluster::NodeProperties;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::TaskUnit;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// One action for an agent to perform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionRequest {
    pub task_id: TaskUuid,
    pub cluster_id: ClusterUuid,
    pub unit: TaskUnit,
    /// executions of this task before this one
    pub attempt: u32,
}

/// What an agent reports after performing an action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Properties are merged into the node's record (e.g., a host's address
    /// after `create`).
    Success { properties: NodeProperties },
    Failure { details: String },
}

impl ActionOutcome {
    pub fn success() -> ActionOutcome {
        ActionOutcome::Success { properties: NodeProperties::default() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success { .. })
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> ActionOutcome;
}

/// Selects the units a fault applies to
///
/// `None` matches anything.  `service: Some(None)` matches only node-level
/// actions.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitMatcher {
    pub service: Option<Option<String>>,
    pub action: Option<ProvisionerAction>,
}

impl UnitMatcher {
    pub fn service_action(service: &str, action: ProvisionerAction) -> Self {
        UnitMatcher {
            service: Some(Some(service.to_string())),
            action: Some(action),
        }
    }

    pub fn node_action(action: ProvisionerAction) -> Self {
        UnitMatcher { service: Some(None), action: Some(action) }
    }

    pub fn matches(&self, unit: &TaskUnit) -> bool {
        self.service.as_ref().map_or(true, |s| *s == unit.service)
            && self.action.map_or(true, |a| a == unit.action)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// fail the next `times` matching executions, or every one if `None`
    Fail { times: Option<u32> },
    /// don't return until [`SimExecutor::release`] is called
    Hold,
}

/// Record of one execution, for tests to inspect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    pub unit: TaskUnit,
    pub attempt: u32,
    pub succeeded: bool,
    /// position in a sequence shared by starts and finishes
    pub started: u64,
    pub finished: u64,
}

/// In-process provisioning agent
pub struct SimExecutor {
    log: Logger,
    latency: Duration,
    faults: Mutex<Vec<(UnitMatcher, Fault)>>,
    released: watch::Sender<bool>,
    clock: AtomicU64,
    history: Mutex<Vec<Execution>>,
}

impl SimExecutor {
    pub fn new(log: &Logger, latency: Duration) -> SimExecutor {
        let (released, _) = watch::channel(false);
        SimExecutor {
            log: log.new(o!("component" => "SimExecutor")),
            latency,
            faults: Mutex::new(Vec::new()),
            released,
            clock: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Installs a fault.  The first fault matching a unit decides what
    /// happens to it.
    pub fn inject(&self, matcher: UnitMatcher, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((matcher, fault));
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Lets every held execution (and every later one) complete
    pub fn release(&self) {
        self.released.send_replace(true);
    }

    pub fn history(&self) -> Vec<Execution> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Decides the fate of one execution, consuming a counted failure
    fn fault_for(&self, unit: &TaskUnit) -> Option<Fault> {
        let mut faults = self.faults.lock().ok()?;
        let (_, fault) = faults.iter_mut().find(|(m, _)| m.matches(unit))?;
        match fault {
            Fault::Fail { times: Some(0) } => None,
            Fault::Fail { times: Some(n) } => {
                *n -= 1;
                Some(Fault::Fail { times: Some(*n) })
            }
            other => Some(other.clone()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for SimExecutor {
    async fn execute(&self, request: &ActionRequest) -> ActionOutcome {
        let started = self.tick();
        let unit = &request.unit;
        debug!(self.log, "executing"; "unit" => %unit, "attempt" => request.attempt);

        let fault = self.fault_for(unit);
        if fault == Some(Fault::Hold) {
            let mut released = self.released.subscribe();
            // The sender lives as long as `self`, so this only ends on
            // release.
            let _ = released.wait_for(|released| *released).await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = match fault {
            Some(Fault::Fail { .. }) => ActionOutcome::Failure {
                details: format!("simulated failure of {unit}"),
            },
            _ if unit.action == ProvisionerAction::Create => {
                let short = unit.node_id.to_string();
                let short = &short[..8];
                let n = started % 250 + 1;
                ActionOutcome::Success {
                    properties: NodeProperties {
                        hostname: Some(format!("node-{short}.sim")),
                        ip_addresses: BTreeMap::from([(
                            "access_v4".to_string(),
                            format!("10.0.0.{n}"),
                        )]),
                        extra: BTreeMap::new(),
                    },
                }
            }
            _ => ActionOutcome::success(),
        };

        let finished = self.tick();
        if let Ok(mut history) = self.history.lock() {
            history.push(Execution {
                unit: unit.clone(),
                attempt: request.attempt,
                succeeded: outcome.is_success(),
                started,
                finished,
            });
        }
        outcome
    }
}
