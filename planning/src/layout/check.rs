// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::PlannedNode;
use super::SolverError;
use provisioner_types::template::ClusterTemplate;
use std::collections::BTreeSet;

/// Checks a layout against every rule of its template
///
/// The solver runs this on everything it returns.  It is independent of how
/// the layout was found, so it also serves to validate layouts from other
/// sources.
pub fn check_layout(
    template: &ClusterTemplate,
    services: &BTreeSet<String>,
    nodes: &[PlannedNode],
) -> Result<(), SolverError> {
    let size = template.constraints.size;
    if nodes.is_empty() || !size.contains(nodes.len()) {
        return violation(format!(
            "{} nodes is outside the allowed range {:?}",
            nodes.len(),
            size
        ));
    }

    let layout = &template.constraints.layout;
    for node in nodes {
        if node.services.is_empty() {
            return violation(format!("node {} runs nothing", node.ordinal));
        }
        if !template.allows_node_type(&node.hardware_type, &node.image_type) {
            return violation(format!(
                "node {} has disallowed type {}/{}",
                node.ordinal, node.hardware_type, node.image_type
            ));
        }
        for service in &node.services {
            if !services.contains(service) || !template.allows_service(service)
            {
                return violation(format!(
                    "node {} runs unrequested service {:?}",
                    node.ordinal, service
                ));
            }
            if !template.service_fits(
                service,
                &node.hardware_type,
                &node.image_type,
            ) {
                return violation(format!(
                    "service {:?} cannot run on node {} ({}/{})",
                    service,
                    node.ordinal,
                    node.hardware_type,
                    node.image_type
                ));
            }
            if let Some(other) =
                node.services.iter().find(|o| layout.excludes(service, o))
            {
                return violation(format!(
                    "node {} runs mutually exclusive {:?} and {:?}",
                    node.ordinal, service, other
                ));
            }
        }
        for rule in &layout.must_coexist {
            let present: Vec<&String> =
                rule.iter().filter(|s| services.contains(*s)).collect();
            let on_node =
                present.iter().filter(|s| node.services.contains(**s)).count();
            if on_node != 0 && on_node != present.len() {
                return violation(format!(
                    "node {} runs only part of co-located {:?}",
                    node.ordinal, present
                ));
            }
        }
    }

    for service in services {
        let count =
            nodes.iter().filter(|n| n.services.contains(service)).count();
        let bounds = template.service_bounds(service);
        if count == 0 || !bounds.contains(count) {
            return violation(format!(
                "service {:?} runs on {} nodes, outside {:?}",
                service, count, bounds
            ));
        }
    }
    Ok(())
}

fn violation(message: String) -> Result<(), SolverError> {
    Err(SolverError::Violation(message))
}
