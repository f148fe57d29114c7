//! Weak/strong fingerprint newtypes.
//!
//! Kept as fixed-size byte arrays rather than strings so maps can be keyed on
//! them directly — see the "string-keyed maps" redesign note.

use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! fingerprint_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
        #[display("{}", hex::encode(self.0))]
        #[debug("{}", hex::encode(self.0))]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let hex = String::deserialize(deserializer)?;
                let bytes = hex::decode(&hex).map_err(serde::de::Error::custom)?;
                if bytes.len() != 32 {
                    return Err(serde::de::Error::custom("expected 32 bytes"));
                }
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(Self(out))
            }
        }
    };
}

fingerprint_newtype!(
    WeakFingerprint,
    "Hash of a pip's static declaration plus build-session salts."
);
fingerprint_newtype!(
    StrongFingerprint,
    "Hash of (weak fingerprint, path-set hash, observed-inputs digest)."
);

/// Hash of a canonicalized path set, used to key TPFS candidates.
pub type PathSetHash = [u8; 32];
