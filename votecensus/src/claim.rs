use crate::*;
use unicode_normalization::UnicodeNormalization;

/// Maximum size of a claim payload, and the size every payload is padded to
pub const MAX_CLAIM_SIZE: usize = 120;

/// Size of the index slot: the first 400 bits of the padded payload
pub const INDEX_SLOT_SIZE: usize = 400 / 8;

/// Size of a serialized claim record: index slot followed by value slot
pub const CLAIM_RECORD_SIZE: usize = INDEX_SLOT_SIZE + MAX_CLAIM_SIZE;

/// A fixed-size tree leaf derived from an arbitrary payload.
///
/// Encoding is deterministic: identical payloads always produce identical slots,
/// hence identical hashes and proofs.
#[derive(Clone, PartialEq, Eq)]
pub struct Claim {
    index: [u8; INDEX_SLOT_SIZE],
    value: [u8; MAX_CLAIM_SIZE],
}

impl Claim {
    /// Encode a payload, using the first 50 bytes of the padded payload as the index slot
    pub fn encode(payload: &[u8]) -> Result<Self, Error> {
        let value = pad_value(payload)?;
        let mut index = [0u8; INDEX_SLOT_SIZE];
        index.copy_from_slice(&value[..INDEX_SLOT_SIZE]);
        Ok(Claim { index, value })
    }

    /// Encode a payload under an explicit key, for indexed censuses
    pub fn with_key(key: &[u8], payload: &[u8]) -> Result<Self, Error> {
        if key.len() > INDEX_SLOT_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        let value = pad_value(payload)?;
        let mut index = [0u8; INDEX_SLOT_SIZE];
        index[..key.len()].copy_from_slice(key);
        Ok(Claim { index, value })
    }

    pub fn index_slot(&self) -> &[u8] {
        &self.index
    }

    pub fn value_slot(&self) -> &[u8] {
        &self.value
    }

    pub fn hash_index(&self, census_type: CensusType) -> Hash {
        census_type.hash(&[&self.index[..]])
    }

    pub fn hash_value(&self, census_type: CensusType) -> Hash {
        census_type.hash(&[&self.value[..]])
    }

    /// The inserted payload, with the zero padding stripped
    pub fn payload(&self) -> &[u8] {
        strip_trailing_zeros(&self.value)
    }

    /// The fixed-size record used in dumps
    pub fn to_bytes(&self) -> [u8; CLAIM_RECORD_SIZE] {
        let mut out = [0u8; CLAIM_RECORD_SIZE];
        out[..INDEX_SLOT_SIZE].copy_from_slice(&self.index);
        out[INDEX_SLOT_SIZE..].copy_from_slice(&self.value);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != CLAIM_RECORD_SIZE {
            return Err(Error::CorruptedNode(format!(
                "claim record of {} bytes",
                bytes.len()
            )));
        }
        let mut index = [0u8; INDEX_SLOT_SIZE];
        let mut value = [0u8; MAX_CLAIM_SIZE];
        index.copy_from_slice(&bytes[..INDEX_SLOT_SIZE]);
        value.copy_from_slice(&bytes[INDEX_SLOT_SIZE..]);
        Ok(Claim { index, value })
    }

    /// Whether the index slot is derived from the payload rather than an explicit key
    pub fn is_self_indexed(&self) -> bool {
        self.index[..] == self.value[..INDEX_SLOT_SIZE]
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("index", &hex::encode(strip_trailing_zeros(&self.index)))
            .field("value", &hex::encode(self.payload()))
            .finish()
    }
}

fn pad_value(payload: &[u8]) -> Result<[u8; MAX_CLAIM_SIZE], Error> {
    if payload.len() > MAX_CLAIM_SIZE {
        return Err(Error::ClaimTooLarge(payload.len()));
    }
    let mut value = [0u8; MAX_CLAIM_SIZE];
    value[..payload.len()].copy_from_slice(payload);
    Ok(value)
}

fn strip_trailing_zeros(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Recover the payload stored in a leaf's value fields.
///
/// Fields are concatenated and trailing zero bytes stripped.
pub fn decode_leaf_to_payload(fields: &[&[u8]]) -> Vec<u8> {
    let joined: Vec<u8> = fields.iter().flat_map(|f| f.iter().copied()).collect();
    strip_trailing_zeros(&joined).to_vec()
}

/// Same as [`decode_leaf_to_payload`], rendered as NFC normalized text
pub fn decode_leaf_to_text(fields: &[&[u8]]) -> String {
    let payload = decode_leaf_to_payload(fields);
    String::from_utf8_lossy(&payload).nfc().collect()
}
