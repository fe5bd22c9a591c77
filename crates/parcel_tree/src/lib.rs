#![deny(missing_docs)]

//! The content tree of a parcel data package.
//!
//! A package is an immutable tree of [`GroupNode`]s whose leaves are
//! [`TableNode`]s and [`FileNode`]s. Leaves reference the objects holding
//! their bytes by SHA-256 digest. The [`hash_contents`] function maps a tree
//! to its package hash, the content identity of one package instance, and
//! [`find_object_hashes`] enumerates the objects a tree needs.

pub mod diff;
mod hash;
mod node;
mod package_ref;

pub use hash::{find_object_hashes, hash_contents, hash_node};
pub use node::{
    ContentNode, FileNode, GroupNode, Leaves, Metadata, PackageFormat, TableNode, TreeError,
};
pub use package_ref::{
    is_valid_name, PackageRef, PackageRefError, PackageSpec, Selector, LATEST_TAG,
};
