// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only source of cluster templates and service specs

use camino::Utf8Path;
use camino::Utf8PathBuf;
use provisioner_common::api::Error;
use provisioner_common::api::LookupResult;
use provisioner_common::api::ResourceType;
use provisioner_types::codec::CatalogV1;
use provisioner_types::codec::DecodeError;
use provisioner_types::codec::DecodedCatalog;
use provisioner_types::service::ServiceSpec;
use provisioner_types::template::ClusterTemplate;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid catalog: {0}")]
    Decode(#[from] DecodeError),
}

/// Every template and service spec the provisioner knows about
#[derive(Clone, Debug)]
pub struct TemplateCatalog {
    services: BTreeMap<String, ServiceSpec>,
    templates: BTreeMap<String, ClusterTemplate>,
}

impl TemplateCatalog {
    pub fn from_file(path: &Utf8Path) -> Result<TemplateCatalog, CatalogError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| CatalogError::Io { path: path.into(), err })?;
        TemplateCatalog::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<TemplateCatalog, CatalogError> {
        let document: CatalogV1 = toml::from_str(contents)?;
        Ok(TemplateCatalog::from(document.decode()?))
    }

    pub fn services(&self) -> &BTreeMap<String, ServiceSpec> {
        &self.services
    }

    pub fn templates(&self) -> impl Iterator<Item = &ClusterTemplate> {
        self.templates.values()
    }

    pub fn template(&self, name: &str) -> LookupResult<&ClusterTemplate> {
        self.templates.get(name).ok_or_else(|| {
            Error::not_found_by_name(ResourceType::ClusterTemplate, name)
        })
    }
}

impl From<DecodedCatalog> for TemplateCatalog {
    fn from(decoded: DecodedCatalog) -> Self {
        TemplateCatalog {
            services: decoded.services,
            templates: decoded.templates,
        }
    }
}
