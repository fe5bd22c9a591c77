//! Serialization helpers for [`Sha256Hash`].
//!
//! Human-readable formats (JSON, YAML, TOML) store digests as lowercase hex strings, binary
//! formats store the raw 32 bytes. Use [`SerializableHash`] directly or through `serde_with`:
//!
//! ```
//! use parcel_digest::{serde::SerializableHash, Sha256Hash};
//! use serde_with::serde_as;
//!
//! #[serde_as]
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Entry {
//!     #[serde_as(as = "SerializableHash")]
//!     hash: Sha256Hash,
//! }
//! ```
use crate::Sha256Hash;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};
use std::borrow::Cow;
use std::ops::Deref;

/// Deserialize a [`Sha256Hash`].
///
/// If the deserializer is human-readable, it will parse the digest from a hex
/// string. Otherwise, it will deserialize raw bytes.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Sha256Hash, D::Error>
where
    D: Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        let str = Cow::<'de, str>::deserialize(deserializer)?;
        super::parse_digest_from_hex(str.as_ref())
            .ok_or_else(|| Error::custom(format!("invalid sha256 digest '{str}'")))
    } else {
        Sha256Hash::deserialize(deserializer)
    }
}

/// Serializes a [`Sha256Hash`].
///
/// If the serializer is human-readable, it will write the digest as a hex
/// string. Otherwise, it will write raw bytes.
pub fn serialize<S: Serializer>(digest: &Sha256Hash, s: S) -> Result<S::Ok, S::Error> {
    if s.is_human_readable() {
        format!("{digest:x}").serialize(s)
    } else {
        digest.serialize(s)
    }
}

/// Wrapper type for easily serializing a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerializableHash(pub Sha256Hash);

impl Serialize for SerializableHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for SerializableHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer).map(SerializableHash)
    }
}

impl From<Sha256Hash> for SerializableHash {
    fn from(output: Sha256Hash) -> Self {
        SerializableHash(output)
    }
}

impl From<SerializableHash> for Sha256Hash {
    fn from(s: SerializableHash) -> Self {
        s.0
    }
}

impl Deref for SerializableHash {
    type Target = Sha256Hash;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SerializeAs<Sha256Hash> for SerializableHash {
    fn serialize_as<S>(source: &Sha256Hash, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(source, serializer)
    }
}

impl<'de> DeserializeAs<'de, Sha256Hash> for SerializableHash {
    fn deserialize_as<D>(deserializer: D) -> Result<Sha256Hash, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer)
    }
}

#[cfg(test)]
mod test {
    use super::SerializableHash;
    use crate::Sha256Hash;
    use serde::{Deserialize, Serialize};
    use serde_with::serde_as;
    use std::collections::BTreeMap;

    #[test]
    fn test_serde_json_hex() {
        let hash = crate::compute_bytes_digest("Hello, world!");
        let json = serde_json::to_string(&SerializableHash(hash)).unwrap();
        assert_eq!(
            json,
            "\"315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3\""
        );
        let parsed: SerializableHash = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.0, hash);
    }

    #[test]
    fn test_digest_as_map_key() {
        #[serde_as]
        #[derive(Serialize, Deserialize)]
        struct Urls {
            #[serde_as(as = "BTreeMap<SerializableHash, _>")]
            urls: BTreeMap<Sha256Hash, String>,
        }

        let hash = crate::compute_bytes_digest("1234567890");
        let json = format!(r#"{{"urls": {{"{hash:x}": "https://example.com/object"}}}}"#);
        let urls: Urls = serde_json::from_str(&json).unwrap();
        assert_eq!(urls.urls[&hash], "https://example.com/object");
    }

    #[test]
    fn test_reject_invalid_hex() {
        let result = serde_json::from_str::<SerializableHash>("\"not-a-digest\"");
        assert!(result.is_err());
    }
}
