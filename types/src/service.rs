// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Services and the actions provisioning agents perform on them

use parse_display::Display;
use parse_display::FromStr;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

/// An action a provisioning agent performs on a node
///
/// `Create` and `Delete` act on the node itself (they bring up and tear down
/// the host).  Everything else acts on one service on the node.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    FromStr,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerAction {
    Create,
    Install,
    Configure,
    Initialize,
    Start,
    Stop,
    Remove,
    Delete,
}

impl ProvisionerAction {
    /// Returns true for actions that operate on the node rather than on a
    /// service
    pub fn is_node_action(&self) -> bool {
        matches!(self, ProvisionerAction::Create | ProvisionerAction::Delete)
    }

    /// Actions that bring a service up, in the order they run
    pub const BRING_UP: &'static [ProvisionerAction] = &[
        ProvisionerAction::Install,
        ProvisionerAction::Configure,
        ProvisionerAction::Initialize,
        ProvisionerAction::Start,
    ];

    /// Actions that take a service down, in the order they run
    pub const TEAR_DOWN: &'static [ProvisionerAction] =
        &[ProvisionerAction::Stop, ProvisionerAction::Remove];
}

/// Declares a service and how it relates to other services
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: ServiceDependencies,
    /// Actions this service has hooks for.  Actions a service doesn't
    /// support are never planned for it.
    pub actions: BTreeSet<ProvisionerAction>,
}

impl ServiceSpec {
    pub fn supports(&self, action: ProvisionerAction) -> bool {
        self.actions.contains(&action)
    }
}

/// Ordering relations between a service and the services it depends on
///
/// Relations apply cluster-wide: a dependency placed on any node orders this
/// service's actions on every node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ServiceDependencies {
    /// services whose install must finish before this service installs
    #[serde(default)]
    pub install: BTreeSet<String>,
    /// services that must be running before this service installs
    #[serde(default)]
    pub live: BTreeSet<String>,
    /// services that must start before this service starts
    #[serde(default)]
    pub runtime: BTreeSet<String>,
}

impl ServiceDependencies {
    /// Every service named by any relation
    pub fn all(&self) -> BTreeSet<&str> {
        self.install
            .iter()
            .chain(self.live.iter())
            .chain(self.runtime.iter())
            .map(|s| s.as_str())
            .collect()
    }
}
