// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing which nodes leave a shrinking cluster

use super::groups::Group;
use super::PlannedNode;
use super::SearchBudget;
use super::SolverError;
use std::cmp::Reverse;
use std::collections::BTreeSet;

/// Picks `remove` of `nodes` to drop, returned as indices into `nodes`
///
/// Survivors keep every group at or above its minimum.  Candidates are tried
/// in order of how many still-needed services they would take with them,
/// then how many services they run at all, then highest ordinal first.
pub(super) fn choose_removals(
    groups: &[Group],
    nodes: &[PlannedNode],
    remove: usize,
    budget: &mut SearchBudget,
) -> Result<BTreeSet<usize>, SolverError> {
    let holds = |n: usize, g: usize| {
        groups[g].members.iter().any(|m| nodes[n].services.contains(m))
    };
    let mut counts: Vec<usize> = (0..groups.len())
        .map(|g| (0..nodes.len()).filter(|&n| holds(n, g)).count())
        .collect();

    let needed_lost = |n: usize| -> usize {
        (0..groups.len())
            .filter(|&g| holds(n, g) && counts[g] <= groups[g].bounds.min)
            .map(|g| groups[g].members.len())
            .sum()
    };
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&n| {
        (needed_lost(n), nodes[n].services.len(), Reverse(nodes[n].ordinal))
    });

    let held: Vec<Vec<usize>> = (0..nodes.len())
        .map(|n| (0..groups.len()).filter(|&g| holds(n, g)).collect())
        .collect();
    let mut search = Removal {
        groups,
        held: &held,
        counts: &mut counts,
        chosen: BTreeSet::new(),
        budget,
    };
    if search.search(&order, 0, remove)? {
        Ok(search.chosen)
    } else {
        Err(SolverError::Unsatisfiable(format!(
            "no {} of the {} nodes can be removed without dropping a \
             service below its minimum",
            remove,
            nodes.len()
        )))
    }
}

struct Removal<'a> {
    groups: &'a [Group],
    /// groups held by each node
    held: &'a [Vec<usize>],
    counts: &'a mut Vec<usize>,
    chosen: BTreeSet<usize>,
    budget: &'a mut SearchBudget,
}

impl Removal<'_> {
    fn can_remove(&self, n: usize) -> bool {
        self.held[n]
            .iter()
            .all(|&g| self.counts[g] > self.groups[g].bounds.min)
    }

    fn search(
        &mut self,
        order: &[usize],
        start: usize,
        remaining: usize,
    ) -> Result<bool, SolverError> {
        if remaining == 0 {
            return Ok(true);
        }
        for pos in start..order.len() {
            if order.len() - pos < remaining {
                break;
            }
            let n = order[pos];
            if !self.can_remove(n) {
                continue;
            }
            for &g in &self.held[n] {
                self.counts[g] -= 1;
            }
            self.chosen.insert(n);
            if self.search(order, pos + 1, remaining - 1)? {
                return Ok(true);
            }
            self.chosen.remove(&n);
            for &g in &self.held[n] {
                self.counts[g] += 1;
            }
            self.budget.backtrack()?;
        }
        Ok(false)
    }
}
