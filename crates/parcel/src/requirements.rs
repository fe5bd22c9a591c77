//! Batch installs described by a YAML requirements file.
//!
//! ```yaml
//! packages:
//!   - alice/sales:v:1.0
//!   - bob/weather/stations:t:stable
//!   - carol/census
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parcel_registry::RegistryClient;
use parcel_store::PackageStore;
use parcel_tree::PackageSpec;
use serde::Deserialize;

use crate::{install, InstallError, InstallOptions, InstallResult, Reporter};

/// An error that occurred while reading a requirements file.
#[derive(Debug, thiserror::Error)]
pub enum RequirementsError {
    /// The file could not be read.
    #[error("failed to read {0}")]
    Io(PathBuf, #[source] std::io::Error),

    /// The content is not a valid requirements document.
    #[error("invalid requirements")]
    Parse(#[from] serde_yaml::Error),
}

/// The packages a requirements document asks for, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Requirements {
    /// The packages to install.
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
}

impl Requirements {
    /// Parses a YAML requirements document.
    pub fn from_yaml_str(source: &str) -> Result<Self, RequirementsError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Reads a YAML requirements file.
    pub fn from_path(path: &Path) -> Result<Self, RequirementsError> {
        let source = fs_err::read_to_string(path)
            .map_err(|err| RequirementsError::Io(path.to_path_buf(), err))?;
        Self::from_yaml_str(&source)
    }

    /// Interprets a command line argument: `@<path>` names a requirements
    /// file, anything else is an inline YAML document.
    pub fn from_argument(argument: &str) -> Result<Self, RequirementsError> {
        match argument.strip_prefix('@') {
            Some(path) => Self::from_path(Path::new(path)),
            None => Self::from_yaml_str(argument),
        }
    }
}

/// Installs every package of `requirements` in order, stopping at the first
/// failure. Packages installed before the failure stay installed.
pub async fn install_requirements(
    store: &PackageStore,
    registry: &RegistryClient,
    requirements: &Requirements,
    options: InstallOptions,
    reporter: Option<Arc<dyn Reporter>>,
) -> Result<Vec<InstallResult>, InstallError> {
    let mut results = Vec::with_capacity(requirements.packages.len());
    for spec in &requirements.packages {
        tracing::debug!("installing requirement {spec}");
        results.push(install(store, registry, spec, options, reporter.clone()).await?);
    }
    Ok(results)
}
