use crate::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

pub const HASH_LEN: usize = 32;

/// A 32 byte digest identifying a tree node, or the root of a tree
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// The key of the empty node
    pub const ZERO: Hash = Hash([0; HASH_LEN]);

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let arr = <[u8; HASH_LEN]>::try_from(bytes).map_err(|_| Error::MalformedRoot(bytes.len()))?;
        Ok(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bit `level` of the path described by this hash, least significant bit of byte 0 first
    pub fn bit(&self, level: usize) -> bool {
        self.0[level / 8] & (1 << (level % 8)) != 0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s)?;
        Hash::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The hash function backing a census tree.
///
/// Persisted as an `i32` in census references and dumps, so discriminants must never change.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive,
)]
#[repr(i32)]
#[serde(into = "i32", try_from = "i32")]
pub enum CensusType {
    Sha256 = 0,
    Blake3 = 1,
}

impl Default for CensusType {
    fn default() -> Self {
        CensusType::Sha256
    }
}

impl CensusType {
    pub fn from_i32(value: i32) -> Result<Self, Error> {
        CensusType::try_from(value).map_err(|_| Error::UnknownCensusType(value))
    }

    /// Hash the concatenation of `parts`
    pub fn hash(self, parts: &[&[u8]]) -> Hash {
        match self {
            CensusType::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                let mut out = [0u8; HASH_LEN];
                out.copy_from_slice(&hasher.finalize());
                Hash(out)
            }
            CensusType::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                Hash(*hasher.finalize().as_bytes())
            }
        }
    }
}
