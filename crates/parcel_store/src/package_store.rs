//! Records of the packages that are installed in a store.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use parcel_digest::{serde::SerializableHash, Sha256Hash};
use parcel_tree::{
    find_object_hashes, hash_contents, FileNode, GroupNode, Metadata, PackageFormat, PackageRef,
    TableNode,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{run_blocking, ObjectStore, StoreError, PACKAGES_DIR};

/// The record of an installed package: its package hash and its contents tree.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// The package hash of `contents`.
    #[serde_as(as = "SerializableHash")]
    pub hash: Sha256Hash,
    /// The contents tree.
    pub contents: GroupNode,
}

/// A store of installed packages on top of an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct PackageStore {
    objects: ObjectStore,
}

impl PackageStore {
    /// Constructs a package store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            objects: ObjectStore::new(root),
        }
    }

    /// Returns the underlying object store.
    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Returns the path of the record for `package`. Any subpath is ignored.
    pub fn record_path(&self, package: &PackageRef) -> PathBuf {
        self.objects
            .root()
            .join(PACKAGES_DIR)
            .join(&package.owner)
            .join(format!("{}.json", package.name))
    }

    /// Reads the record of an installed package.
    pub fn get_package(&self, package: &PackageRef) -> Result<Option<InstalledPackage>, StoreError> {
        read_record(&self.record_path(package))
    }

    /// Records `tree` as the installed contents of `package`.
    ///
    /// Every object the tree references must already be present in the store,
    /// otherwise [`StoreError::MissingObject`] is returned and no record is
    /// written. The record replaces any previous record atomically. Returns
    /// the package hash of the tree.
    pub fn install_tree(
        &self,
        package: &PackageRef,
        tree: &GroupNode,
    ) -> Result<Sha256Hash, StoreError> {
        if let Some(missing) = find_object_hashes(tree)
            .into_iter()
            .find(|hash| !self.objects.has_object(hash))
        {
            return Err(StoreError::MissingObject(missing));
        }

        let record = InstalledPackage {
            hash: hash_contents(tree),
            contents: tree.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&record).map_err(std::io::Error::from)?;

        let path = self.record_path(package);
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let temp_dir = self.objects.temp_dir();
        fs_err::create_dir_all(&temp_dir)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(&temp_dir)?;
        temp_file.write_all(&encoded)?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(&path).map_err(|e| e.error)?;

        tracing::info!(
            "installed {}/{} at {:x}",
            package.owner,
            package.name,
            record.hash
        );
        Ok(record.hash)
    }

    /// Like [`PackageStore::install_tree`] but checks the objects and writes
    /// the record on the blocking thread pool.
    pub async fn install_tree_async(
        &self,
        package: &PackageRef,
        tree: &GroupNode,
    ) -> Result<Sha256Hash, StoreError> {
        let (store, package, tree) = (self.clone(), package.clone(), tree.clone());
        run_blocking(move || store.install_tree(&package, &tree)).await
    }

    /// Lists every installed package together with its package hash, sorted by
    /// owner and name.
    pub fn list_packages(&self) -> Result<Vec<(PackageRef, Sha256Hash)>, StoreError> {
        let packages_dir = self.objects.root().join(PACKAGES_DIR);
        let owners = match fs_err::read_dir(&packages_dir) {
            Ok(owners) => owners,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut result = Vec::new();
        for owner in owners {
            let owner = owner?;
            if !owner.file_type()?.is_dir() {
                continue;
            }
            let owner_name = owner.file_name().to_string_lossy().into_owned();
            for entry in fs_err::read_dir(owner.path())? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let Ok(package) = PackageRef::new(owner_name.clone(), name) else {
                    tracing::warn!("ignoring unexpected file {}", path.display());
                    continue;
                };
                if let Some(record) = read_record(&path)? {
                    result.push((package, record.hash));
                }
            }
        }

        result.sort_by(|(a, _), (b, _)| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        Ok(result)
    }

    /// Removes the record of an installed package. Returns `false` if the
    /// package was not installed. Objects are left in place since other
    /// packages may reference them.
    pub fn remove_package(&self, package: &PackageRef) -> Result<bool, StoreError> {
        match fs_err::remove_file(self.record_path(package)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Imports a file into the object store and returns a leaf referencing it.
    pub fn save_file(&self, path: &Path, metadata: Metadata) -> Result<FileNode, StoreError> {
        let hash = self.objects.import_file(path)?;
        Ok(FileNode::new(hash, metadata))
    }

    /// Imports serialized table data into the object store and returns a leaf
    /// referencing it.
    pub fn save_table(
        &self,
        reader: &mut impl Read,
        format: PackageFormat,
        metadata: Metadata,
    ) -> Result<TableNode, StoreError> {
        let hash = self.objects.write_reader(reader)?;
        Ok(TableNode::new(vec![hash], format, metadata))
    }
}

fn read_record(path: &Path) -> Result<Option<InstalledPackage>, StoreError> {
    let content = match fs_err::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| StoreError::InvalidRecord(path.to_path_buf(), e))
}
