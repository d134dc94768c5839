// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Placement of co-location groups onto nodes

use super::groups::Group;
use super::PlannedNode;
use super::SearchBudget;
use super::SolverError;
use provisioner_types::template::ClusterTemplate;

/// Places groups on `nodes` until every group meets its minimum and no node
/// is empty
///
/// Services already on a node stay there.  A node holding only part of a
/// group has the rest of the group added first.
pub(super) fn place(
    template: &ClusterTemplate,
    groups: &[Group],
    nodes: Vec<PlannedNode>,
    budget: &mut SearchBudget,
) -> Result<Vec<PlannedNode>, SolverError> {
    let mut search = Search { template, groups, nodes, budget };
    search.complete_partial_groups()?;
    for (g, group) in groups.iter().enumerate() {
        let count = search.count(g);
        if group.bounds.max.map_or(false, |max| count > max) {
            return Err(SolverError::Unsatisfiable(format!(
                "{} already runs on {} nodes, more than the maximum {:?}",
                group, count, group.bounds.max
            )));
        }
    }

    // One step per missing instance, in group order.
    let deficits: Vec<usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(g, group)| {
            let missing = group.bounds.min.saturating_sub(search.count(g));
            std::iter::repeat(g).take(missing)
        })
        .collect();

    if search.search(&deficits, 0)? {
        Ok(search.nodes)
    } else {
        Err(SolverError::Unsatisfiable(format!(
            "cannot place {} on {} nodes",
            groups
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            search.nodes.len()
        )))
    }
}

struct Search<'a> {
    template: &'a ClusterTemplate,
    groups: &'a [Group],
    nodes: Vec<PlannedNode>,
    budget: &'a mut SearchBudget,
}

impl Search<'_> {
    fn holds(&self, n: usize, g: usize) -> bool {
        self.groups[g].members.iter().any(|m| self.nodes[n].services.contains(m))
    }

    fn count(&self, g: usize) -> usize {
        (0..self.nodes.len()).filter(|&n| self.holds(n, g)).count()
    }

    /// Returns true if group `g` may be added to node `n`
    fn eligible(&self, g: usize, n: usize) -> bool {
        let group = &self.groups[g];
        let node = &self.nodes[n];
        let layout = &self.template.constraints.layout;
        !self.holds(n, g)
            && !group.max_reached(self.count(g))
            && group.members.iter().all(|m| {
                self.template.service_fits(
                    m,
                    &node.hardware_type,
                    &node.image_type,
                ) && !node.services.iter().any(|s| layout.excludes(m, s))
            })
    }

    fn complete_partial_groups(&mut self) -> Result<(), SolverError> {
        let template = self.template;
        let layout = &template.constraints.layout;
        for n in 0..self.nodes.len() {
            for g in 0..self.groups.len() {
                let group = &self.groups[g];
                let node = &self.nodes[n];
                if !self.holds(n, g)
                    || group.members.iter().all(|m| node.services.contains(m))
                {
                    continue;
                }
                let missing: Vec<&String> = group
                    .members
                    .iter()
                    .filter(|m| !node.services.contains(*m))
                    .collect();
                let blocked = missing.iter().any(|m| {
                    !template.service_fits(
                        m,
                        &node.hardware_type,
                        &node.image_type,
                    ) || node.services.iter().any(|s| layout.excludes(m, s))
                });
                if blocked {
                    return Err(SolverError::Unsatisfiable(format!(
                        "node {} runs part of {} and the rest cannot join it",
                        node.ordinal, group
                    )));
                }
                let missing: Vec<String> =
                    missing.into_iter().cloned().collect();
                self.nodes[n].services.extend(missing);
            }
        }
        Ok(())
    }

    fn place(&mut self, g: usize, n: usize) {
        let members = self.groups[g].members.iter().cloned();
        self.nodes[n].services.extend(members);
    }

    fn unplace(&mut self, g: usize, n: usize) {
        for m in &self.groups[g].members {
            self.nodes[n].services.remove(m);
        }
    }

    /// Nodes that may take group `g`, best first
    ///
    /// Prefers the node with the fewest services, then the lowest ordinal.
    /// New nodes with identical contents are interchangeable, so only the
    /// first of them is offered.
    fn candidate_nodes(&self, g: usize) -> Vec<usize> {
        let mut candidates: Vec<usize> =
            (0..self.nodes.len()).filter(|&n| self.eligible(g, n)).collect();
        candidates.sort_by_key(|&n| {
            (self.nodes[n].services.len(), self.nodes[n].ordinal)
        });
        let mut offered: Vec<usize> = Vec::with_capacity(candidates.len());
        for n in candidates {
            let node = &self.nodes[n];
            let duplicate = node.id.is_none()
                && offered.iter().any(|&o| {
                    let other = &self.nodes[o];
                    other.id.is_none()
                        && other.services == node.services
                        && other.hardware_type == node.hardware_type
                        && other.image_type == node.image_type
                });
            if !duplicate {
                offered.push(n);
            }
        }
        offered
    }

    /// Groups that may fill node `n`, fewest instances first
    fn candidate_groups(&self, n: usize) -> Vec<usize> {
        let mut candidates: Vec<usize> =
            (0..self.groups.len()).filter(|&g| self.eligible(g, n)).collect();
        candidates.sort_by_key(|&g| (self.count(g), g));
        candidates
    }

    /// Depth-first search over placements
    ///
    /// The first `deficits.len()` steps place one missing instance each.
    /// After that, each step fills the lowest empty node.  Returns false if
    /// no completion exists from the current state.
    fn search(
        &mut self,
        deficits: &[usize],
        step: usize,
    ) -> Result<bool, SolverError> {
        if let Some(&g) = deficits.get(step) {
            for n in self.candidate_nodes(g) {
                self.place(g, n);
                if self.search(deficits, step + 1)? {
                    return Ok(true);
                }
                self.unplace(g, n);
                self.budget.backtrack()?;
            }
            return Ok(false);
        }

        let Some(n) = self.nodes.iter().position(|n| n.services.is_empty())
        else {
            return Ok(true);
        };
        for g in self.candidate_groups(n) {
            self.place(g, n);
            if self.search(deficits, step)? {
                return Ok(true);
            }
            self.unplace(g, n);
            self.budget.backtrack()?;
        }
        Ok(false)
    }
}
