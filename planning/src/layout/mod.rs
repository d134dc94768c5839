// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster layout solver
//!
//! Given a template, the nodes a cluster already has, a target node count,
//! and the services the cluster should run, [`solve`] decides which services
//! run on which nodes.  It is a small constraint-satisfaction search:
//!
//! * services that must share a node are merged into co-location groups and
//!   placed as a unit (see [`groups`])
//! * groups are placed greedily to meet their minimum instance counts, then
//!   any empty node is filled, backtracking out of dead ends (see
//!   [`placement`])
//! * shrinking picks which nodes to drop (see [`shrink`])
//! * every result is re-validated against the template before it is returned
//!   (see [`check_layout`])
//!
//! The solver is a pure function of its input: the same template, nodes,
//! target, and request always produce the same layout.  Nothing is persisted
//! here, so a failure leaves no partial state behind.

use provisioner_common::typed_uuid::NodeUuid;
use provisioner_types::cluster::Node;
use provisioner_types::service::ServiceSpec;
use provisioner_types::template::ClusterTemplate;
use provisioner_types::template::InstanceBounds;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

mod check;
mod groups;
mod placement;
#[cfg(test)]
mod proptests;
mod shrink;

pub use check::check_layout;

/// Default number of backtracking steps the search may take
pub const DEFAULT_SEARCH_BUDGET: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SolverError {
    #[error("no services requested")]
    NoServices,
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("service {0:?} is not allowed by the template")]
    ServiceNotAllowed(String),
    #[error("service {service:?} depends on {dependency:?}, which was not requested")]
    MissingDependency { service: String, dependency: String },
    #[error("nodes of hardware type {hardware_type:?} and image type {image_type:?} are not allowed")]
    NodeTypeNotAllowed { hardware_type: String, image_type: String },
    #[error("cluster size {size} is outside the allowed range {bounds:?}")]
    SizeOutOfBounds { size: usize, bounds: InstanceBounds },
    #[error("services {a:?} and {b:?} must be placed together but are mutually exclusive")]
    ConflictingColocation { a: String, b: String },
    #[error("services {group} allow no instance count (bounds {bounds:?})")]
    EmptyBounds { group: String, bounds: InstanceBounds },
    #[error("removing services would leave node {ordinal} with no services")]
    EmptyNode { ordinal: u32 },
    #[error("search gave up after {0} backtracks")]
    BudgetExhausted(usize),
    #[error("no layout satisfies the template: {0}")]
    Unsatisfiable(String),
    #[error("layout violates the template: {0}")]
    Violation(String),
}

/// The services a cluster should run, and the kind of nodes to add
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRequest {
    pub services: BTreeSet<String>,
    pub hardware_type: String,
    pub image_type: String,
}

pub struct SolverInput<'a> {
    pub template: &'a ClusterTemplate,
    pub catalog: &'a BTreeMap<String, ServiceSpec>,
    /// the cluster's current nodes, with the services actually on them
    pub existing: &'a [Node],
    pub target_node_count: usize,
    pub request: ServiceRequest,
    pub search_budget: usize,
}

/// A node in a solved layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedNode {
    /// `None` for a node the layout adds
    pub id: Option<NodeUuid>,
    pub ordinal: u32,
    pub hardware_type: String,
    pub image_type: String,
    pub services: BTreeSet<String>,
}

impl From<&Node> for PlannedNode {
    fn from(node: &Node) -> Self {
        PlannedNode {
            id: Some(node.id),
            ordinal: node.ordinal,
            hardware_type: node.hardware_type.clone(),
            image_type: node.image_type.clone(),
            services: node.services.clone(),
        }
    }
}

/// Output of [`solve`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// every node the cluster should have, ordered by ordinal
    pub nodes: Vec<PlannedNode>,
    /// existing nodes the cluster should drop
    pub removed: Vec<PlannedNode>,
}

impl Layout {
    pub fn service_count(&self, service: &str) -> usize {
        self.nodes.iter().filter(|n| n.services.contains(service)).count()
    }
}

/// Counts backtracking steps against a limit
struct SearchBudget {
    limit: usize,
    used: usize,
}

impl SearchBudget {
    fn new(limit: usize) -> Self {
        SearchBudget { limit, used: 0 }
    }

    fn backtrack(&mut self) -> Result<(), SolverError> {
        self.used += 1;
        if self.used > self.limit {
            return Err(SolverError::BudgetExhausted(self.limit));
        }
        Ok(())
    }
}

/// Computes the layout a cluster should have
///
/// Existing nodes keep the requested services they already run.  Services
/// no longer requested are dropped from them, new nodes are appended after
/// the highest existing ordinal, and when the target is below the number of
/// existing nodes some of them are chosen for removal instead.
pub fn solve(input: &SolverInput<'_>) -> Result<Layout, SolverError> {
    validate_request(input)?;
    let template = input.template;
    let request = &input.request;
    let groups = groups::colocation_groups(template, &request.services)?;
    let mut budget = SearchBudget::new(input.search_budget);

    let mut existing: Vec<PlannedNode> =
        input.existing.iter().map(PlannedNode::from).collect();
    existing.sort_by(|a, b| (a.ordinal, a.id).cmp(&(b.ordinal, b.id)));

    let layout = if input.target_node_count < existing.len() {
        let remove = existing.len() - input.target_node_count;
        let chosen = shrink::choose_removals(
            &groups,
            &existing,
            remove,
            &mut budget,
        )?;
        let (removed, nodes) = existing
            .into_iter()
            .enumerate()
            .partition::<Vec<_>, _>(|(i, _)| chosen.contains(i));
        Layout {
            nodes: nodes.into_iter().map(|(_, n)| n).collect(),
            removed: removed.into_iter().map(|(_, n)| n).collect(),
        }
    } else {
        for node in &mut existing {
            let had_services = !node.services.is_empty();
            node.services.retain(|s| request.services.contains(s));
            if had_services && node.services.is_empty() {
                return Err(SolverError::EmptyNode { ordinal: node.ordinal });
            }
        }
        let first_new =
            existing.iter().map(|n| n.ordinal + 1).max().unwrap_or(0);
        let new_nodes = input.target_node_count - existing.len();
        existing.extend((0..new_nodes).map(|i| PlannedNode {
            id: None,
            ordinal: first_new + u32::try_from(i).unwrap_or(u32::MAX),
            hardware_type: request.hardware_type.clone(),
            image_type: request.image_type.clone(),
            services: BTreeSet::new(),
        }));
        let nodes =
            placement::place(template, &groups, existing, &mut budget)?;
        Layout { nodes, removed: Vec::new() }
    };

    check_layout(template, &request.services, &layout.nodes)?;
    Ok(layout)
}

fn validate_request(input: &SolverInput<'_>) -> Result<(), SolverError> {
    let template = input.template;
    let request = &input.request;
    if request.services.is_empty() {
        return Err(SolverError::NoServices);
    }
    for service in &request.services {
        let spec = input
            .catalog
            .get(service)
            .ok_or_else(|| SolverError::UnknownService(service.clone()))?;
        if !template.allows_service(service) {
            return Err(SolverError::ServiceNotAllowed(service.clone()));
        }
        if let Some(dependency) = spec
            .dependencies
            .all()
            .into_iter()
            .find(|d| !request.services.contains(*d))
        {
            return Err(SolverError::MissingDependency {
                service: service.clone(),
                dependency: dependency.to_string(),
            });
        }
    }
    if !template.allows_node_type(&request.hardware_type, &request.image_type)
    {
        return Err(SolverError::NodeTypeNotAllowed {
            hardware_type: request.hardware_type.clone(),
            image_type: request.image_type.clone(),
        });
    }
    let size = input.target_node_count;
    let bounds = template.constraints.size;
    if size == 0 || !bounds.contains(size) {
        return Err(SolverError::SizeOutOfBounds { size, bounds });
    }
    Ok(())
}
