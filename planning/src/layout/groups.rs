// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Co-location groups: the units the solver places

use super::SolverError;
use provisioner_types::template::ClusterTemplate;
use provisioner_types::template::InstanceBounds;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

/// A set of services that always share a node
///
/// Services not named by any co-location rule form a group of one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Group {
    pub members: BTreeSet<String>,
    /// number of nodes that may run the group; `min` is at least one
    pub bounds: InstanceBounds,
}

impl Group {
    fn is_single_instance(&self) -> bool {
        self.bounds.max == Some(1)
    }

    pub fn max_reached(&self, count: usize) -> bool {
        self.bounds.max.map_or(false, |max| count >= max)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.members.iter().map(|s| s.as_str()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Merges the template's co-location rules over `services` into groups
///
/// Overlapping rules merge transitively.  Groups come back in placement
/// order: single-instance groups first, then by descending minimum, then by
/// name.
pub(super) fn colocation_groups(
    template: &ClusterTemplate,
    services: &BTreeSet<String>,
) -> Result<Vec<Group>, SolverError> {
    let names: Vec<&String> = services.iter().collect();
    let index: BTreeMap<&str, usize> =
        names.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
    let mut sets = DisjointSets::new(names.len());
    for rule in &template.constraints.layout.must_coexist {
        let mut present = rule.iter().filter_map(|s| index.get(s.as_str()));
        if let Some(&first) = present.next() {
            for &other in present {
                sets.union(first, other);
            }
        }
    }

    let mut members: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    for (i, name) in names.iter().enumerate() {
        members.entry(sets.find(i)).or_default().insert((*name).clone());
    }

    let exclusions = &template.constraints.layout;
    let mut groups = Vec::with_capacity(members.len());
    for members in members.into_values() {
        for a in &members {
            if let Some(b) = members.iter().find(|b| exclusions.excludes(a, b))
            {
                return Err(SolverError::ConflictingColocation {
                    a: a.clone(),
                    b: b.clone(),
                });
            }
        }
        let mut bounds = members
            .iter()
            .map(|s| template.service_bounds(s))
            .fold(InstanceBounds::default(), |acc, b| acc.intersect(&b));
        bounds.min = bounds.min.max(1);
        let group = Group { members, bounds };
        if bounds.is_empty() {
            return Err(SolverError::EmptyBounds {
                group: group.to_string(),
                bounds,
            });
        }
        groups.push(group);
    }

    groups.sort_by(|a, b| {
        b.is_single_instance()
            .cmp(&a.is_single_instance())
            .then_with(|| b.bounds.min.cmp(&a.bounds.min))
            .then_with(|| a.members.cmp(&b.members))
    });
    Ok(groups)
}

/// Union-find over `0..n`
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        DisjointSets { parent: (0..n).collect() }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        // Keep the smaller root so groups are rooted at their first member.
        if ra < rb {
            self.parent[rb] = ra;
        } else {
            self.parent[ra] = rb;
        }
    }
}
