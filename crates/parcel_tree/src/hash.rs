//! Canonical hashing of content trees.
//!
//! Every node is hashed post-order. A leaf hashes its type tag, its canonical
//! metadata and the digests of the objects it references. A group hashes its
//! type tag, its metadata and, for every child sorted by name, the pair
//! `(name, child hash)`. Sorting makes the hash independent of the insertion
//! order that is kept for display. Variable length fields are prefixed with
//! their length so that no two different trees produce the same byte stream.

use std::collections::BTreeSet;

use parcel_digest::{digest::Digest, Sha256, Sha256Hash};

use crate::{ContentNode, GroupNode, Metadata};

const GROUP_TAG: &[u8] = b"GROUP";
const TABLE_TAG: &[u8] = b"TABLE";
const FILE_TAG: &[u8] = b"FILE";

/// Computes the package hash of a tree rooted at `root`.
pub fn hash_contents(root: &GroupNode) -> Sha256Hash {
    hash_group(root)
}

/// Computes the hash of a single node and everything below it.
pub fn hash_node(node: &ContentNode) -> Sha256Hash {
    match node {
        ContentNode::Group(group) => hash_group(group),
        ContentNode::Table(table) => {
            let mut hasher = Sha256::default();
            update_bytes(&mut hasher, TABLE_TAG);
            update_metadata(&mut hasher, &table.metadata);
            update_bytes(&mut hasher, table.format.as_str().as_bytes());
            update_len(&mut hasher, table.hashes.len());
            for hash in &table.hashes {
                hasher.update(hash);
            }
            hasher.finalize()
        }
        ContentNode::File(file) => {
            let mut hasher = Sha256::default();
            update_bytes(&mut hasher, FILE_TAG);
            update_metadata(&mut hasher, &file.metadata);
            update_len(&mut hasher, 1);
            hasher.update(file.hash);
            hasher.finalize()
        }
    }
}

fn hash_group(group: &GroupNode) -> Sha256Hash {
    let mut children: Vec<_> = group.children().collect();
    children.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

    let mut hasher = Sha256::default();
    update_bytes(&mut hasher, GROUP_TAG);
    update_metadata(&mut hasher, &group.metadata);
    update_len(&mut hasher, children.len());
    for (name, child) in children {
        update_bytes(&mut hasher, name.as_bytes());
        hasher.update(hash_node(child));
    }
    hasher.finalize()
}

/// Returns every object digest referenced anywhere in the tree. Objects that
/// are referenced more than once appear only once.
pub fn find_object_hashes(root: &GroupNode) -> BTreeSet<Sha256Hash> {
    root.leaves()
        .flat_map(|(_, leaf)| leaf.object_hashes().iter().copied())
        .collect()
}

fn update_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn update_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    update_len(hasher, bytes.len());
    hasher.update(bytes);
}

fn update_metadata(hasher: &mut Sha256, metadata: &Metadata) {
    let mut encoded = Vec::new();
    encoded.push(b'{');
    for (idx, (key, value)) in metadata.iter().enumerate() {
        if idx > 0 {
            encoded.push(b',');
        }
        write_canonical_string(&mut encoded, key);
        encoded.push(b':');
        write_canonical_json(&mut encoded, value);
    }
    encoded.push(b'}');
    update_bytes(hasher, &encoded);
}

/// Writes compact JSON with object keys sorted, independent of whether
/// `serde_json` preserves insertion order.
fn write_canonical_json(out: &mut Vec<u8>, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            out.push(b'{');
            for (idx, (key, value)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical_string(out, key);
                out.push(b':');
                write_canonical_json(out, value);
            }
            out.push(b'}');
        }
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical_json(out, item);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

fn write_canonical_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(serde_json::Value::from(value).to_string().as_bytes());
}
