#![deny(missing_docs)]

//! Push and install parcel data packages.
//!
//! [`push()`] uploads the objects of a locally installed package with a
//! bounded pool of workers and only then publishes its tree. [`install()`]
//! resolves a [`PackageSpec`](parcel_tree::PackageSpec), verifies the tree
//! it receives and downloads missing objects with resumable range requests.
//! Both report their progress through an optional [`Reporter`].

pub mod install;
pub mod push;
mod reporter;
pub mod requirements;

#[cfg(test)]
mod test_registry;

pub use install::{install, DownloadError, InstallError, InstallOptions, InstallResult};
pub use push::{push, PushError, PushOptions, PushResult, UploadError};
pub use reporter::Reporter;
pub use requirements::{install_requirements, Requirements, RequirementsError};

pub use parcel_digest::Sha256Hash;
pub use parcel_registry::{RegistryClient, RegistryConfig};
pub use parcel_store::{ObjectStore, PackageStore};
pub use parcel_tree::{GroupNode, PackageRef, PackageSpec, Selector};
