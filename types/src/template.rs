// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster templates: the immutable description of what a cluster may contain

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Reusable definition of allowed services, constraints, and defaults for
/// clusters created from it
///
/// A template is immutable once a running cluster references it.  Clusters
/// record the template's name; the catalog that supplied it is treated as a
/// read-only input.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClusterTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub defaults: ClusterDefaults,
    #[serde(default)]
    pub compatibility: Compatibilities,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub administration: Administration,
}

/// What a cluster gets when the request doesn't say otherwise
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClusterDefaults {
    pub services: BTreeSet<String>,
    pub hardware_type: String,
    pub image_type: String,
    /// free-form configuration handed to the provisioning agents
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Everything a cluster built from the template is allowed to use
///
/// An empty hardware or image set means "anything".
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Compatibilities {
    #[serde(default)]
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub hardware_types: BTreeSet<String>,
    #[serde(default)]
    pub image_types: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Constraints {
    #[serde(default)]
    pub layout: LayoutConstraint,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConstraint>,
    #[serde(default)]
    pub size: SizeConstraint,
}

/// Rules about which services may share a node
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct LayoutConstraint {
    /// Each set lists services that must always be placed together.
    #[serde(default)]
    pub must_coexist: Vec<BTreeSet<String>>,
    /// Each set lists services no two of which may share a node.
    #[serde(default)]
    pub cant_coexist: Vec<BTreeSet<String>>,
}

impl LayoutConstraint {
    /// Returns true if `a` and `b` are declared mutually exclusive
    pub fn excludes(&self, a: &str, b: &str) -> bool {
        a != b
            && self
                .cant_coexist
                .iter()
                .any(|set| set.contains(a) && set.contains(b))
    }
}

/// Per-service placement rules
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ServiceConstraint {
    #[serde(default)]
    pub quantities: InstanceBounds,
    /// Hardware types the service may run on.  Empty means any.
    #[serde(default)]
    pub hardware_types: BTreeSet<String>,
    /// Image types the service may run on.  Empty means any.
    #[serde(default)]
    pub image_types: BTreeSet<String>,
}

/// Inclusive bounds on a count; `max` of `None` is unbounded
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct InstanceBounds {
    #[serde(default)]
    pub min: usize,
    #[serde(default)]
    pub max: Option<usize>,
}

impl InstanceBounds {
    pub fn contains(&self, count: usize) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }

    /// Returns the tightest bounds satisfying both `self` and `other`
    pub fn intersect(&self, other: &InstanceBounds) -> InstanceBounds {
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        InstanceBounds { min: self.min.max(other.min), max }
    }

    pub fn is_empty(&self) -> bool {
        self.max.map_or(false, |max| max < self.min)
    }
}

pub type SizeConstraint = InstanceBounds;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Administration {
    #[serde(default)]
    pub lease_duration: LeaseDuration,
}

/// Bounds on how long a cluster may live, in seconds
///
/// Zero means unbounded: an `initial` of zero gives clusters that never
/// expire, a `max` of zero allows extending forever, and a `step` of zero
/// allows extending by any amount at once.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct LeaseDuration {
    pub initial: u64,
    pub max: u64,
    pub step: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("clusters from this template do not expire")]
    NoExpiry,
    #[error("requested expiry {requested} is not after current expiry {current}")]
    NotLater { requested: DateTime<Utc>, current: DateTime<Utc> },
    #[error("requested expiry {requested} exceeds the maximum lease ({limit})")]
    BeyondMax { requested: DateTime<Utc>, limit: DateTime<Utc> },
    #[error("requested expiry {requested} extends by more than one step ({limit})")]
    BeyondStep { requested: DateTime<Utc>, limit: DateTime<Utc> },
}

impl LeaseDuration {
    /// Expiry time for a cluster created at `created`
    pub fn initial_expiry(
        &self,
        created: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        (self.initial > 0).then(|| created + seconds(self.initial))
    }

    /// Validates a request to move a cluster's expiry to `requested`
    pub fn extend(
        &self,
        created: DateTime<Utc>,
        current: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        requested: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, LeaseError> {
        let current = current.ok_or(LeaseError::NoExpiry)?;
        if requested <= current {
            return Err(LeaseError::NotLater { requested, current });
        }
        if self.max > 0 {
            let limit = created + seconds(self.max);
            if requested > limit {
                return Err(LeaseError::BeyondMax { requested, limit });
            }
        }
        if self.step > 0 {
            let limit = std::cmp::max(current, now) + seconds(self.step);
            if requested > limit {
                return Err(LeaseError::BeyondStep { requested, limit });
            }
        }
        Ok(requested)
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

impl ClusterTemplate {
    /// Returns true if the template allows clusters to run `service`
    pub fn allows_service(&self, service: &str) -> bool {
        self.compatibility.services.contains(service)
    }

    /// Instance-count bounds for `service`
    pub fn service_bounds(&self, service: &str) -> InstanceBounds {
        self.constraints
            .services
            .get(service)
            .map(|c| c.quantities)
            .unwrap_or_default()
    }

    /// Returns true if `service` may run on a node of the given hardware and
    /// image types
    pub fn service_fits(
        &self,
        service: &str,
        hardware_type: &str,
        image_type: &str,
    ) -> bool {
        match self.constraints.services.get(service) {
            None => true,
            Some(c) => {
                allowed(&c.hardware_types, hardware_type)
                    && allowed(&c.image_types, image_type)
            }
        }
    }

    /// Returns true if the template allows nodes of the given types at all
    pub fn allows_node_type(
        &self,
        hardware_type: &str,
        image_type: &str,
    ) -> bool {
        allowed(&self.compatibility.hardware_types, hardware_type)
            && allowed(&self.compatibility.image_types, image_type)
    }

    /// Checks the template's internal consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("template name must not be empty".to_string());
        }
        for service in &self.defaults.services {
            if !self.allows_service(service) {
                return Err(format!(
                    "default service {:?} is not a compatible service",
                    service
                ));
            }
        }
        for (service, constraint) in &self.constraints.services {
            if constraint.quantities.is_empty() {
                return Err(format!(
                    "service {:?} has min {} greater than max {:?}",
                    service,
                    constraint.quantities.min,
                    constraint.quantities.max
                ));
            }
        }
        if self.constraints.size.is_empty() {
            return Err("cluster size has min greater than max".to_string());
        }
        let lease = &self.administration.lease_duration;
        if lease.max > 0 && lease.initial > lease.max {
            return Err(format!(
                "initial lease {} exceeds max lease {}",
                lease.initial, lease.max
            ));
        }
        Ok(())
    }
}

fn allowed(set: &BTreeSet<String>, value: &str) -> bool {
    set.is_empty() || set.contains(value)
}
