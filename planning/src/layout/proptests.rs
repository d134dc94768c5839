// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property tests for the layout solver

use super::test::catalog;
use super::test::materialize;
use super::test::template;
use super::*;
use proptest::arbitrary::any;
use proptest::collection::vec;
use proptest::option;
use provisioner_types::template::LayoutConstraint;
use test_strategy::proptest;
use test_strategy::Arbitrary;

#[derive(Debug, Clone, Arbitrary)]
struct ArbitraryService {
    #[strategy(0_usize..3)]
    min: usize,
    #[strategy(option::of(1_usize..5))]
    max: Option<usize>,
}

#[derive(Debug, Clone, Arbitrary)]
struct ArbitraryTemplate {
    #[strategy(vec(any::<ArbitraryService>(), 1..6))]
    services: Vec<ArbitraryService>,
    #[strategy(vec((0_usize..6, 0_usize..6), 0..3))]
    must_coexist: Vec<(usize, usize)>,
    #[strategy(vec((0_usize..6, 0_usize..6), 0..4))]
    cant_coexist: Vec<(usize, usize)>,
    #[strategy(1_usize..8)]
    size: usize,
}

struct TestInput {
    names: Vec<String>,
    template: ClusterTemplate,
    catalog: BTreeMap<String, ServiceSpec>,
    size: usize,
}

impl From<ArbitraryTemplate> for TestInput {
    fn from(input: ArbitraryTemplate) -> Self {
        let names: Vec<String> =
            (0..input.services.len()).map(|i| format!("s{i}")).collect();
        let name = |i: usize| names[i % names.len()].clone();
        let pair_sets = |pairs: &[(usize, usize)]| {
            pairs
                .iter()
                .filter(|(a, b)| a % names.len() != b % names.len())
                .map(|&(a, b)| BTreeSet::from([name(a), name(b)]))
                .collect::<Vec<_>>()
        };
        let layout = LayoutConstraint {
            must_coexist: pair_sets(&input.must_coexist),
            cant_coexist: pair_sets(&input.cant_coexist),
        };
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let bounds: Vec<(&str, usize, Option<usize>)> = refs
            .iter()
            .zip(&input.services)
            .map(|(name, s)| {
                // keep the bounds themselves consistent
                let max = s.max.map(|max| max.max(s.min).max(1));
                (*name, s.min, max)
            })
            .collect();
        let template = template(&refs, &bounds, layout);
        let catalog = catalog(&refs);
        TestInput { names, template, catalog, size: input.size }
    }
}

impl TestInput {
    fn solve(
        &self,
        existing: &[Node],
        size: usize,
    ) -> Result<Layout, SolverError> {
        let refs: Vec<&str> = self.names.iter().map(|s| s.as_str()).collect();
        solve(&SolverInput {
            template: &self.template,
            catalog: &self.catalog,
            existing,
            target_node_count: size,
            request: super::test::request(&refs),
            search_budget: DEFAULT_SEARCH_BUDGET,
        })
    }

    /// Checks a layout directly against the template, without going through
    /// `check_layout`
    fn validate(&self, layout: &Layout) -> Result<(), String> {
        let rules = &self.template.constraints.layout;
        for node in &layout.nodes {
            if node.services.is_empty() {
                return Err(format!("node {} is empty", node.ordinal));
            }
            for set in &rules.cant_coexist {
                if set.iter().filter(|s| node.services.contains(*s)).count()
                    > 1
                {
                    return Err(format!(
                        "node {} breaks exclusion {set:?}",
                        node.ordinal
                    ));
                }
            }
            for set in &rules.must_coexist {
                let on = set.iter().filter(|s| node.services.contains(*s));
                let on = on.count();
                if on != 0 && on != set.len() {
                    return Err(format!(
                        "node {} breaks co-location {set:?}",
                        node.ordinal
                    ));
                }
            }
        }
        for name in &self.names {
            let count = layout.service_count(name);
            let bounds = self.template.service_bounds(name);
            if count < bounds.min.max(1)
                || bounds.max.map_or(false, |max| count > max)
            {
                return Err(format!("{name} has {count} instances"));
            }
        }
        Ok(())
    }
}

#[proptest]
fn test_layouts_satisfy_template(input: ArbitraryTemplate) {
    let input = TestInput::from(input);
    match input.solve(&[], input.size) {
        Ok(layout) => {
            assert_eq!(layout.nodes.len(), input.size);
            input.validate(&layout).expect("valid layout");
            let again = input.solve(&[], input.size).expect("solvable twice");
            assert_eq!(layout, again);
        }
        Err(error) => {
            assert!(
                !matches!(error, SolverError::Violation(_)),
                "solver produced an invalid layout: {error}"
            );
        }
    }
}

#[proptest]
fn test_unconstrained_layouts_always_solve(
    #[strategy(vec(0_usize..3, 1..6))] mins: Vec<usize>,
    #[strategy(3_usize..8)] size: usize,
) {
    let input = TestInput::from(ArbitraryTemplate {
        services: mins
            .iter()
            .map(|&min| ArbitraryService { min, max: None })
            .collect(),
        must_coexist: vec![],
        cant_coexist: vec![],
        size,
    });
    let layout = input.solve(&[], size).expect("solvable");
    input.validate(&layout).expect("valid layout");
}

#[proptest]
fn test_resize_keeps_surviving_nodes(
    input: ArbitraryTemplate,
    #[strategy(1_usize..8)] new_size: usize,
) {
    let input = TestInput::from(input);
    let nodes = match input.solve(&[], input.size) {
        Ok(layout) => materialize(&layout),
        Err(_) => Vec::new(),
    };
    if !nodes.is_empty() {
        if let Ok(resized) = input.solve(&nodes, new_size) {
            assert_eq!(resized.nodes.len(), new_size);
            input.validate(&resized).expect("valid layout");
            for planned in resized.nodes.iter().filter(|n| n.id.is_some()) {
                let before = nodes
                    .iter()
                    .find(|n| Some(n.id) == planned.id)
                    .expect("existing node");
                assert_eq!(before.services, planned.services);
            }
            assert_eq!(
                resized.removed.len(),
                input.size.saturating_sub(new_size)
            );
        }
    }
}
