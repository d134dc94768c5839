// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Versioned on-disk and catalog formats
//!
//! Catalog documents (templates and service specs) are decoded through the
//! `*V1` structs below rather than straight into the domain types so that a
//! missing field is reported by name and the decoded value is validated
//! before anything sees it.  Persisted records are wrapped in a
//! [`VersionedRecord`] envelope.

use crate::service::ProvisionerAction;
use crate::service::ServiceDependencies;
use crate::service::ServiceSpec;
use crate::template::Administration;
use crate::template::ClusterDefaults;
use crate::template::ClusterTemplate;
use crate::template::Compatibilities;
use crate::template::Constraints;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Schema version written by this code
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed document")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("{kind} {name:?} is missing required field {field:?}")]
    MissingField { kind: &'static str, name: String, field: &'static str },
    #[error("{kind} {name:?} is invalid: {message}")]
    Invalid { kind: &'static str, name: String, message: String },
    #[error("duplicate {kind} {name:?}")]
    Duplicate { kind: &'static str, name: String },
}

/// Envelope around every persisted record
#[derive(Debug, Deserialize, Serialize)]
pub struct VersionedRecord<T> {
    pub schema_version: u32,
    pub record: T,
}

/// Serializes `record` in the current schema version
pub fn encode_record<T: Serialize>(
    record: &T,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(&VersionedRecord {
        schema_version: SCHEMA_VERSION,
        record,
    })
}

/// Deserializes a record written by [`encode_record`]
pub fn decode_record<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, DecodeError> {
    let envelope: VersionedRecord<serde_json::Value> =
        serde_json::from_slice(bytes)?;
    check_version(envelope.schema_version)?;
    Ok(serde_json::from_value(envelope.record)?)
}

fn check_version(found: u32) -> Result<(), DecodeError> {
    if found != SCHEMA_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// A catalog document: every service and template the provisioner knows
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CatalogV1 {
    pub schema_version: u32,
    #[serde(default)]
    pub services: Vec<ServiceSpecV1>,
    #[serde(default)]
    pub templates: Vec<ClusterTemplateV1>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ServiceSpecV1 {
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: ServiceDependencies,
    pub actions: Option<BTreeSet<ProvisionerAction>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClusterTemplateV1 {
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub defaults: Option<ClusterDefaults>,
    pub compatibility: Option<Compatibilities>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub administration: Administration,
}

/// Decoded contents of a catalog document
#[derive(Clone, Debug)]
pub struct DecodedCatalog {
    pub services: BTreeMap<String, ServiceSpec>,
    pub templates: BTreeMap<String, ClusterTemplate>,
}

impl ServiceSpecV1 {
    pub fn decode(self) -> Result<ServiceSpec, DecodeError> {
        let name = self.name.ok_or(DecodeError::MissingField {
            kind: "service",
            name: String::new(),
            field: "name",
        })?;
        let actions = self.actions.ok_or_else(|| DecodeError::MissingField {
            kind: "service",
            name: name.clone(),
            field: "actions",
        })?;
        if self.dependencies.all().contains(name.as_str()) {
            return Err(DecodeError::Invalid {
                kind: "service",
                name,
                message: "service depends on itself".to_string(),
            });
        }
        Ok(ServiceSpec {
            name,
            description: self.description,
            dependencies: self.dependencies,
            actions,
        })
    }
}

impl ClusterTemplateV1 {
    pub fn decode(self) -> Result<ClusterTemplate, DecodeError> {
        let name = self.name.ok_or(DecodeError::MissingField {
            kind: "template",
            name: String::new(),
            field: "name",
        })?;
        let missing = |field| DecodeError::MissingField {
            kind: "template",
            name: name.clone(),
            field,
        };
        let defaults = self.defaults.ok_or_else(|| missing("defaults"))?;
        let compatibility =
            self.compatibility.ok_or_else(|| missing("compatibility"))?;
        let template = ClusterTemplate {
            name,
            description: self.description,
            defaults,
            compatibility,
            constraints: self.constraints,
            administration: self.administration,
        };
        template.validate().map_err(|message| DecodeError::Invalid {
            kind: "template",
            name: template.name.clone(),
            message,
        })?;
        Ok(template)
    }
}

impl CatalogV1 {
    /// Decodes and cross-checks every entry
    ///
    /// Beyond each entry's own checks, every service a template allows and
    /// every dependency a service declares must be defined in the catalog.
    pub fn decode(self) -> Result<DecodedCatalog, DecodeError> {
        check_version(self.schema_version)?;
        let mut services = BTreeMap::new();
        for spec in self.services {
            let spec = spec.decode()?;
            if services.contains_key(&spec.name) {
                return Err(DecodeError::Duplicate {
                    kind: "service",
                    name: spec.name,
                });
            }
            services.insert(spec.name.clone(), spec);
        }
        for spec in services.values() {
            if let Some(unknown) =
                spec.dependencies.all().into_iter().find(|d| {
                    !services.contains_key(*d)
                })
            {
                return Err(DecodeError::Invalid {
                    kind: "service",
                    name: spec.name.clone(),
                    message: format!("depends on unknown service {unknown:?}"),
                });
            }
        }

        let mut templates = BTreeMap::new();
        for template in self.templates {
            let template = template.decode()?;
            if let Some(unknown) = template
                .compatibility
                .services
                .iter()
                .find(|s| !services.contains_key(*s))
            {
                return Err(DecodeError::Invalid {
                    kind: "template",
                    name: template.name.clone(),
                    message: format!("allows unknown service {unknown:?}"),
                });
            }
            if templates.contains_key(&template.name) {
                return Err(DecodeError::Duplicate {
                    kind: "template",
                    name: template.name,
                });
            }
            templates.insert(template.name.clone(), template);
        }
        Ok(DecodedCatalog { services, templates })
    }
}
