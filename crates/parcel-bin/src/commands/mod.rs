use std::{path::PathBuf, sync::Arc};

use parcel::{PackageStore, RegistryClient, RegistryConfig, Reporter};

use crate::{global_multi_progress, reporter::IndicatifReporter};

pub mod install;
pub mod list;
pub mod log;
pub mod push;
pub mod remove;
pub mod tag;
pub mod version;

/// What every command needs: the local store and the registry configuration.
pub struct Context {
    pub store: PackageStore,
    pub config: RegistryConfig,
}

impl Context {
    pub fn new(store_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let store_dir = match store_dir {
            Some(dir) => dir,
            None => parcel_store::default_store_dir()?,
        };
        let config = RegistryConfig::load()?;
        tracing::debug!("using store {} and {config:?}", store_dir.display());
        Ok(Self {
            store: PackageStore::new(store_dir),
            config,
        })
    }

    pub fn registry(&self) -> anyhow::Result<RegistryClient> {
        Ok(RegistryClient::new(self.config.clone())?)
    }

    pub fn reporter(&self) -> anyhow::Result<Arc<dyn Reporter>> {
        Ok(Arc::new(IndicatifReporter::new(global_multi_progress())?))
    }
}

/// Abbreviates a hash the way the log shows it.
pub fn short_hash(hash: &parcel::Sha256Hash) -> String {
    format!("{hash:x}")[..12].to_string()
}
