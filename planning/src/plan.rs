// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning plans
//!
//! A plan is the partially ordered set of [`TaskUnit`]s that carries out one
//! cluster operation.  Ordering comes from two places:
//!
//! * each (node, service) pair runs its actions in order (install before
//!   configure before initialize before start; stop before remove), bracketed
//!   by the node-level `create` and `delete` actions when the node itself is
//!   being created or destroyed
//! * declared service dependencies order actions across the whole cluster:
//!
//!   | relation  | bringing services up       | taking services down      |
//!   |-----------|----------------------------|---------------------------|
//!   | `install` | dep install -> svc install | svc remove -> dep remove  |
//!   | `live`    | dep start -> svc install   | svc remove -> dep stop    |
//!   | `runtime` | dep start -> svc start     | svc stop -> dep stop      |
//!
//! Services only get units for the actions they support.  When a relation
//! names an action a service doesn't support, it resolves to the nearest one
//! it does: the closest earlier action on the side that must finish first,
//! the closest later action on the side that waits.

use provisioner_common::typed_uuid::NodeUuid;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::service::ServiceDependencies;
use provisioner_types::service::ServiceSpec;
use provisioner_types::task::TaskUnit;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Cyclic Dependency among services: {}", services.join(", "))]
    CyclicDependency { services: Vec<String> },
    #[error("unknown service {0:?}")]
    UnknownService(String),
}

/// What a plan does to a cluster's services
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanOperation {
    /// Moves every node from its current services to its target services,
    /// creating and deleting nodes as marked
    Provision,
    Start,
    Stop,
    /// stop then start
    Restart,
}

/// What happens to a node itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeChange {
    Keep,
    Create,
    Delete,
}

#[derive(Clone, Debug)]
pub struct PlanNode {
    pub id: NodeUuid,
    pub ordinal: u32,
    pub change: NodeChange,
    /// services installed on the node now
    pub current: BTreeSet<String>,
    /// services the node should have once the plan completes
    pub target: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedUnit {
    pub unit: TaskUnit,
    /// indexes of units that must complete first; all lower than this unit's
    pub predecessors: BTreeSet<usize>,
}

/// Units in a deterministic topological order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub units: Vec<PlannedUnit>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn position(&self, unit: &TaskUnit) -> Option<usize> {
        self.units.iter().position(|u| &u.unit == unit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Down,
    Up,
}

const STOP: &[ProvisionerAction] = &[ProvisionerAction::Stop];
const START: &[ProvisionerAction] = &[ProvisionerAction::Start];

/// Builds the plan for `operation` over `nodes`
///
/// Fails if the declared dependencies of any service on the cluster form a
/// cycle.  The result is the same for the same input.
pub fn build_plan(
    catalog: &BTreeMap<String, ServiceSpec>,
    nodes: &[PlanNode],
    operation: PlanOperation,
) -> Result<Plan, PlanError> {
    let mut specs: BTreeMap<&str, &ServiceSpec> = BTreeMap::new();
    for service in nodes.iter().flat_map(|n| n.current.iter().chain(&n.target))
    {
        let spec = catalog
            .get(service)
            .ok_or_else(|| PlanError::UnknownService(service.clone()))?;
        specs.insert(service.as_str(), spec);
    }
    check_acyclic(&specs)?;

    let mut sorted: Vec<&PlanNode> = nodes.iter().collect();
    sorted.sort_by_key(|n| (n.ordinal, n.id));

    let mut graph = Graph::default();
    for node in sorted {
        graph.add_node(node, operation, &specs);
    }
    graph.add_dependency_edges(&specs);
    graph.into_plan()
}

/// Work on one service on one node: which actions run in which phase
fn node_work(
    node: &PlanNode,
    operation: PlanOperation,
) -> BTreeMap<&str, Vec<(Phase, &'static [ProvisionerAction])>> {
    let mut work: BTreeMap<&str, Vec<_>> = BTreeMap::new();
    match operation {
        PlanOperation::Provision => {
            let (down, up): (Vec<&String>, Vec<&String>) = match node.change {
                NodeChange::Create => (vec![], node.target.iter().collect()),
                NodeChange::Delete => (node.current.iter().collect(), vec![]),
                NodeChange::Keep => (
                    node.current.difference(&node.target).collect(),
                    node.target.difference(&node.current).collect(),
                ),
            };
            for service in down {
                work.entry(service.as_str())
                    .or_default()
                    .push((Phase::Down, ProvisionerAction::TEAR_DOWN));
            }
            for service in up {
                work.entry(service.as_str())
                    .or_default()
                    .push((Phase::Up, ProvisionerAction::BRING_UP));
            }
        }
        PlanOperation::Start | PlanOperation::Stop | PlanOperation::Restart => {
            for service in &node.current {
                let entry = work.entry(service.as_str()).or_default();
                if operation != PlanOperation::Start {
                    entry.push((Phase::Down, STOP));
                }
                if operation != PlanOperation::Stop {
                    entry.push((Phase::Up, START));
                }
            }
        }
    }
    work
}

/// Supported actions of one service on one node within one phase, in order,
/// with their unit indexes
type ActionUnits = Vec<(ProvisionerAction, usize)>;

fn at_or_before(
    units: &ActionUnits,
    action: ProvisionerAction,
) -> Option<usize> {
    units.iter().rev().find(|(a, _)| *a <= action).map(|(_, i)| *i)
}

fn at_or_after(
    units: &ActionUnits,
    action: ProvisionerAction,
) -> Option<usize> {
    units.iter().find(|(a, _)| *a >= action).map(|(_, i)| *i)
}

#[derive(Default)]
struct Graph {
    units: Vec<TaskUnit>,
    edges: BTreeSet<(usize, usize)>,
    /// per (service, phase), the unit lists of every node doing that work
    phases: BTreeMap<(String, Phase), Vec<ActionUnits>>,
}

impl Graph {
    fn add_unit(&mut self, unit: TaskUnit) -> usize {
        self.units.push(unit);
        self.units.len() - 1
    }

    fn add_node(
        &mut self,
        node: &PlanNode,
        operation: PlanOperation,
        specs: &BTreeMap<&str, &ServiceSpec>,
    ) {
        let provisioning = operation == PlanOperation::Provision;
        let create = (provisioning && node.change == NodeChange::Create)
            .then(|| {
                self.add_unit(TaskUnit::node(node.id, ProvisionerAction::Create))
            });

        let mut lasts = Vec::new();
        for (service, phases) in node_work(node, operation) {
            let Some(spec) = specs.get(service) else { continue };
            let mut previous = create;
            for (phase, actions) in phases {
                let mut units = ActionUnits::new();
                for &action in actions.iter().filter(|a| spec.supports(**a)) {
                    let index = self
                        .add_unit(TaskUnit::service(node.id, service, action));
                    if let Some(previous) = previous {
                        self.edges.insert((previous, index));
                    }
                    previous = Some(index);
                    units.push((action, index));
                }
                if !units.is_empty() {
                    self.phases
                        .entry((service.to_string(), phase))
                        .or_default()
                        .push(units);
                }
            }
            if let Some(last) = previous.filter(|&p| Some(p) != create) {
                lasts.push(last);
            }
        }

        if provisioning && node.change == NodeChange::Delete {
            let delete =
                self.add_unit(TaskUnit::node(node.id, ProvisionerAction::Delete));
            for last in lasts {
                self.edges.insert((last, delete));
            }
        }
    }

    fn add_dependency_edges(&mut self, specs: &BTreeMap<&str, &ServiceSpec>) {
        use ProvisionerAction::*;
        let mut edges = Vec::new();
        for ((service, phase), dependents) in &self.phases {
            let Some(spec) = specs.get(service.as_str()) else { continue };
            let deps: &ServiceDependencies = &spec.dependencies;
            // (dependencies, dependency's action, this service's action)
            let relations = [
                (&deps.install, Install, Install),
                (&deps.live, Start, Install),
                (&deps.runtime, Start, Start),
            ];
            let down_relations = [
                (&deps.install, Remove, Remove),
                (&deps.live, Stop, Remove),
                (&deps.runtime, Stop, Stop),
            ];
            let relations =
                if *phase == Phase::Up { relations } else { down_relations };
            for (names, dep_action, own_action) in relations {
                for name in names {
                    let Some(dependencies) =
                        self.phases.get(&(name.clone(), *phase))
                    else {
                        continue;
                    };
                    for own in dependents {
                        for dep in dependencies {
                            let edge = match phase {
                                Phase::Up => at_or_before(dep, dep_action)
                                    .zip(at_or_after(own, own_action)),
                                Phase::Down => at_or_before(own, own_action)
                                    .zip(at_or_after(dep, dep_action)),
                            };
                            edges.extend(edge);
                        }
                    }
                }
            }
        }
        self.edges.extend(edges);
    }

    /// Sorts units topologically, lowest original index first among ready
    /// units
    fn into_plan(self) -> Result<Plan, PlanError> {
        let n = self.units.len();
        let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(from, to) in &self.edges {
            predecessors[to].insert(from);
            successors[from].push(to);
        }
        let mut waiting: Vec<usize> =
            predecessors.iter().map(|p| p.len()).collect();
        let mut ready: BTreeSet<usize> =
            (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &s in &successors[next] {
                waiting[s] -= 1;
                if waiting[s] == 0 {
                    ready.insert(s);
                }
            }
        }
        if order.len() != n {
            let services: BTreeSet<String> = (0..n)
                .filter(|&i| waiting[i] > 0)
                .filter_map(|i| self.units[i].service.clone())
                .collect();
            return Err(PlanError::CyclicDependency {
                services: services.into_iter().collect(),
            });
        }

        let mut position = vec![0; n];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }
        let mut units: Vec<Option<TaskUnit>> =
            self.units.into_iter().map(Some).collect();
        let units = order
            .iter()
            .map(|&old| PlannedUnit {
                unit: units[old].take().unwrap_or_else(|| {
                    unreachable!("each unit appears once in the order")
                }),
                predecessors: predecessors[old]
                    .iter()
                    .map(|&p| position[p])
                    .collect(),
            })
            .collect();
        Ok(Plan { units })
    }
}

/// Rejects cyclic dependency declarations among `specs`
///
/// Dependencies outside `specs` are ignored; they were validated when the
/// services were chosen.
fn check_acyclic(specs: &BTreeMap<&str, &ServiceSpec>) -> Result<(), PlanError> {
    // edges point from a dependency to the services that depend on it
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut waiting: BTreeMap<&str, usize> = BTreeMap::new();
    for (name, spec) in specs {
        let deps: BTreeSet<&str> = spec
            .dependencies
            .all()
            .into_iter()
            .filter(|d| specs.contains_key(d))
            .collect();
        waiting.insert(*name, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().insert(*name);
        }
    }

    let mut ready: Vec<&str> = waiting
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(name, _)| *name)
        .collect();
    while let Some(name) = ready.pop() {
        waiting.remove(name);
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = waiting.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push(*dependent);
                }
            }
        }
    }
    if waiting.is_empty() {
        return Ok(());
    }

    // What's left is on a cycle or downstream of one.  Peel off services
    // nothing left depends on until only the cycles remain.
    let mut remaining: BTreeSet<&str> = waiting.into_keys().collect();
    loop {
        let leaves: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|name| {
                !dependents
                    .get(name)
                    .into_iter()
                    .flatten()
                    .any(|d| remaining.contains(d))
            })
            .collect();
        if leaves.is_empty() {
            break;
        }
        for leaf in leaves {
            remaining.remove(leaf);
        }
    }
    Err(PlanError::CyclicDependency {
        services: remaining.into_iter().map(String::from).collect(),
    })
}
