//! Resolution of selectors to package hashes.

use std::collections::BTreeSet;

use parcel_digest::{parse_digest_from_hex, Sha256Hash, SHA256_HEX_LEN};
use parcel_tree::{PackageRef, Selector};

use crate::{LogEntry, RegistryClient, RegistryError};

/// An error that occurred while resolving a selector.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No pushed instance matches the hash.
    #[error("no instance of {package} matches the hash '{hash}'")]
    UnknownHash {
        /// The package that was searched.
        package: String,
        /// The full or abbreviated hash.
        hash: String,
    },

    /// More than one pushed instance starts with the abbreviated hash.
    #[error("the hash '{hash}' is ambiguous for {package}, it matches {}", .candidates.join(", "))]
    AmbiguousHash {
        /// The package that was searched.
        package: String,
        /// The abbreviated hash.
        hash: String,
        /// Every full hash that starts with the abbreviation.
        candidates: Vec<String>,
    },

    /// The registry could not be queried.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Matches an abbreviated hash against the push history of a package.
///
/// The prefix is compared case insensitively. An instance that was pushed
/// more than once counts as a single candidate.
pub fn match_hash(
    package: &PackageRef,
    entries: &[LogEntry],
    hash: &str,
) -> Result<Sha256Hash, ResolveError> {
    let unknown = || ResolveError::UnknownHash {
        package: package.to_string(),
        hash: hash.to_string(),
    };

    let prefix = hash.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        return Err(unknown());
    }

    let candidates: BTreeSet<Sha256Hash> = entries
        .iter()
        .map(|entry| entry.hash)
        .filter(|candidate| format!("{candidate:x}").starts_with(&prefix))
        .collect();

    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (None, _) => Err(unknown()),
        (Some(found), None) => Ok(found),
        (Some(first), Some(second)) => Err(ResolveError::AmbiguousHash {
            package: package.to_string(),
            hash: hash.to_string(),
            candidates: [first, second]
                .into_iter()
                .chain(candidates)
                .map(|h| format!("{h:x}"))
                .collect(),
        }),
    }
}

impl RegistryClient {
    /// Resolves a full or abbreviated hash. A full length hash is returned
    /// without consulting the registry.
    pub async fn resolve_hash(
        &self,
        package: &PackageRef,
        hash: &str,
    ) -> Result<Sha256Hash, ResolveError> {
        if hash.len() == SHA256_HEX_LEN {
            return parse_digest_from_hex(hash).ok_or_else(|| ResolveError::UnknownHash {
                package: package.to_string(),
                hash: hash.to_string(),
            });
        }
        let entries = self.get_log(package).await?;
        match_hash(package, &entries, hash)
    }

    /// Resolves a selector to the package hash it currently denotes.
    pub async fn resolve_selector(
        &self,
        package: &PackageRef,
        selector: &Selector,
    ) -> Result<Sha256Hash, ResolveError> {
        let package = package.package();
        let hash = match selector {
            Selector::Hash(hash) => self.resolve_hash(&package, hash).await?,
            Selector::Version(version) => self.get_version(&package, version).await?,
            Selector::Tag(tag) => self.get_tag(&package, tag).await?,
        };
        tracing::debug!("resolved {package}{selector} to {hash:x}");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{client, serve};
    use assert_matches::assert_matches;
    use axum::{routing::get, Json, Router};
    use parcel_digest::compute_bytes_digest;

    fn package() -> PackageRef {
        PackageRef::parse_package("alice/sales").unwrap()
    }

    fn entry(hash: Sha256Hash, created: f64) -> LogEntry {
        LogEntry {
            hash,
            author: "alice".into(),
            created,
        }
    }

    fn history() -> (Vec<LogEntry>, Vec<Sha256Hash>) {
        let hashes: Vec<_> = ["a", "b", "c"].iter().map(compute_bytes_digest).collect();
        let entries = hashes
            .iter()
            .enumerate()
            .map(|(idx, hash)| entry(*hash, idx as f64))
            .collect();
        (entries, hashes)
    }

    #[test]
    fn test_unique_prefix() {
        let (entries, hashes) = history();
        for hash in &hashes {
            let hex = format!("{hash:x}");
            assert_eq!(match_hash(&package(), &entries, &hex[..8]).unwrap(), *hash);
            assert_eq!(
                match_hash(&package(), &entries, &hex[..8].to_uppercase()).unwrap(),
                *hash
            );
        }
    }

    #[test]
    fn test_unknown_prefix() {
        let (entries, _) = history();
        assert_matches!(
            match_hash(&package(), &entries, "zzzz"),
            Err(ResolveError::UnknownHash { .. })
        );
        assert_matches!(
            match_hash(&package(), &entries, ""),
            Err(ResolveError::UnknownHash { .. })
        );
        assert_matches!(
            match_hash(&package(), &[], "abcd"),
            Err(ResolveError::UnknownHash { .. })
        );
    }

    #[test]
    fn test_ambiguous_prefix() {
        let (mut entries, hashes) = history();
        let mut sibling = hashes[0];
        sibling[31] ^= 0xff;
        entries.push(entry(sibling, 10.0));

        let prefix = format!("{:x}", hashes[0])[..8].to_string();
        assert_matches!(
            match_hash(&package(), &entries, &prefix),
            Err(ResolveError::AmbiguousHash { candidates, .. })
                if candidates == [format!("{:x}", hashes[0].min(sibling)), format!("{:x}", hashes[0].max(sibling))]
        );
    }

    #[test]
    fn test_repeated_push_is_not_ambiguous() {
        let hash = compute_bytes_digest("same");
        let entries = vec![entry(hash, 1.0), entry(hash, 2.0)];
        let hex = format!("{hash:x}");
        assert_eq!(match_hash(&package(), &entries, &hex[..6]).unwrap(), hash);
    }

    #[tokio::test]
    async fn test_full_hash_short_circuits() {
        // Nothing listens on this port; consulting the log would fail.
        let registry = client(&url::Url::parse("http://127.0.0.1:9").unwrap(), None);
        let hash = compute_bytes_digest("full");
        assert_eq!(
            registry
                .resolve_hash(&package(), &format!("{hash:x}"))
                .await
                .unwrap(),
            hash
        );
    }

    #[tokio::test]
    async fn test_resolve_short_hash_against_log() {
        let (_, hashes) = history();
        let logs: Vec<_> = hashes
            .iter()
            .map(|h| serde_json::json!({"hash": format!("{h:x}"), "author": "alice", "created": 1.0}))
            .collect();
        let router = Router::new().route(
            "/api/log/{owner}/{name}/",
            get(move || {
                let logs = logs.clone();
                async move { Json(serde_json::json!({ "logs": logs })) }
            }),
        );
        let url = serve(router).await;
        let registry = client(&url, None);

        let hex = format!("{:x}", hashes[1]);
        let selector = Selector::Hash(hex[..10].to_string());
        assert_eq!(
            registry
                .resolve_selector(&package(), &selector)
                .await
                .unwrap(),
            hashes[1]
        );
    }
}
