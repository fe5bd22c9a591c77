//! Request and response bodies of the registry REST API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parcel_digest::{serde::SerializableHash, Sha256Hash};
use parcel_tree::GroupNode;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use url::Url;

/// Body of `PUT /api/package/{owner}/{name}/{hash}`.
#[derive(Debug, Serialize)]
pub struct PushRequest<'a> {
    /// Only negotiate upload urls, do not commit the tree.
    pub dry_run: bool,
    /// Whether the package is readable by everyone.
    pub public: bool,
    /// The tree of the package instance.
    pub contents: &'a GroupNode,
    /// A free-form description.
    pub description: &'a str,
}

/// The pair of urls the registry hands out for every object during a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadUrls {
    /// Answers HEAD with a success status if the object is already stored.
    pub head: Url,
    /// Accepts the gzip compressed object.
    pub put: Url,
}

/// Response of a push.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Upload urls keyed by object digest. Only present for a dry run.
    #[serde_as(as = "BTreeMap<SerializableHash, _>")]
    #[serde(default)]
    pub upload_urls: BTreeMap<Sha256Hash, UploadUrls>,
}

/// Response of `GET /api/package/{owner}/{name}/{hash}`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageResponse {
    /// Download urls keyed by object digest.
    #[serde_as(as = "BTreeMap<SerializableHash, _>")]
    pub urls: BTreeMap<Sha256Hash, Url>,
    /// The tree of the package instance.
    pub contents: GroupNode,
}

/// A body that carries only a package hash, used by tags and versions.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashBody {
    /// The package hash.
    #[serde_as(as = "SerializableHash")]
    pub hash: Sha256Hash,
}

/// A tag and the package hash it points at.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// The tag name.
    pub tag: String,
    /// The package hash.
    #[serde_as(as = "SerializableHash")]
    pub hash: Sha256Hash,
}

/// A version and the package hash it points at.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// The version string.
    pub version: String,
    /// The package hash.
    #[serde_as(as = "SerializableHash")]
    pub hash: Sha256Hash,
}

/// One push in the history of a package.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The package hash that was pushed.
    #[serde_as(as = "SerializableHash")]
    pub hash: Sha256Hash,
    /// The user that pushed it.
    pub author: String,
    /// Seconds since the unix epoch.
    pub created: f64,
}

impl LogEntry {
    /// Returns the time of the push, if the timestamp is representable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.created.floor();
        let nanos = ((self.created - secs) * 1e9) as u32;
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagList {
    pub tags: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionList {
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogList {
    pub logs: Vec<LogEntry>,
}

/// The error body the registry sends along with a failure status.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub message: String,
}
