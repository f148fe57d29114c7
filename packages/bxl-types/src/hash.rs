//! Content hashing.

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 256-bit content hash. Equality is bitwise.
///
/// A distinguished [`ContentHash::ABSENT`] value denotes "file known to be
/// absent at this path" rather than any real blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// The constant marker for "file known to be absent at this path".
    pub const ABSENT: ContentHash = ContentHash([0xffu8; 32]);

    /// Hash the contents of a buffer to produce a content hash.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let hash = blake3::hash(buffer.as_ref());
        Self(*hash.as_bytes())
    }

    /// Hash the contents of an iterator of fields in order, as a single
    /// combined hash. Used to derive fingerprints from structured data.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_ref());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// View the hash as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a hash from exactly 32 raw bytes.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let len = bytes.len();
        if len != 32 {
            bail!("invalid content hash length: expected 32 bytes, got {len}");
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// View the hash as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hash from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex content hash")?;
        Self::from_bytes(bytes)
    }

    /// Whether this is the distinguished absent marker.
    pub fn is_absent(&self) -> bool {
        *self == Self::ABSENT
    }

    /// The two-level hex-prefix shard path component, `(first two chars,
    /// next two chars)`, matching the teacher's CAS directory layout.
    pub fn shard_prefix(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..4].to_string())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip_hex() {
        let hash = ContentHash::from_buffer(b"hello world");
        let hex = hash.to_hex();
        let parsed = ContentHash::from_hex(&hex).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn absent_is_distinct_from_any_real_hash() {
        let hash = ContentHash::from_buffer(b"");
        assert!(!hash.is_absent());
        assert!(ContentHash::ABSENT.is_absent());
    }

    #[test]
    fn from_buffer_is_deterministic() {
        let a = ContentHash::from_buffer(b"same content");
        let b = ContentHash::from_buffer(b"same content");
        assert_eq!(a, b);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(ContentHash::from_bytes([0u8; 16]).is_err());
    }
}
