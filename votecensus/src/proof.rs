use crate::*;

const PROOF_VERSION: u8 = 1;
const BITMAP_LEN: usize = MAX_LEVELS / 8;
const HEADER_LEN: usize = 3 + BITMAP_LEN;

const LEAF_TAG: u8 = 0x01;
const MIDDLE_TAG: u8 = 0x02;

/// Key of a leaf node
pub(crate) fn leaf_key(census_type: CensusType, h_index: &Hash, h_value: &Hash) -> Hash {
    census_type.hash(&[&[LEAF_TAG][..], h_index.as_bytes(), h_value.as_bytes()])
}

/// Key of a middle node
pub(crate) fn middle_key(census_type: CensusType, left: &Hash, right: &Hash) -> Hash {
    census_type.hash(&[&[MIDDLE_TAG][..], left.as_bytes(), right.as_bytes()])
}

/// A Merkle inclusion proof.
///
/// Wire format: `[version][census type][depth][not-empty bitmap: 32 bytes][siblings: 32 bytes each]`.
/// Siblings are listed from the root downwards and only non-empty ones are included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub census_type: CensusType,
    pub depth: u8,
    not_empties: [u8; BITMAP_LEN],
    siblings: Vec<Hash>,
}

impl Proof {
    /// Build a proof from the full sibling path, root first. Empty siblings are compressed away.
    pub(crate) fn from_path(census_type: CensusType, path: &[Hash]) -> Self {
        let mut not_empties = [0u8; BITMAP_LEN];
        let mut siblings = Vec::new();
        for (level, sibling) in path.iter().enumerate() {
            if !sibling.is_zero() {
                not_empties[level / 8] |= 1 << (level % 8);
                siblings.push(*sibling);
            }
        }
        Proof {
            census_type,
            depth: path.len() as u8,
            not_empties,
            siblings,
        }
    }

    fn is_not_empty(&self, level: usize) -> bool {
        self.not_empties[level / 8] & (1 << (level % 8)) != 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.siblings.len() * HASH_LEN);
        out.push(PROOF_VERSION);
        out.push(i32::from(self.census_type) as u8);
        out.push(self.depth);
        out.extend_from_slice(&self.not_empties);
        for sibling in &self.siblings {
            out.extend_from_slice(sibling.as_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedProof("too short"));
        }
        if bytes[0] != PROOF_VERSION {
            return Err(Error::MalformedProof("unknown version"));
        }
        let census_type = CensusType::from_i32(bytes[1] as i32)
            .map_err(|_| Error::MalformedProof("unknown census type"))?;
        let depth = bytes[2];
        let mut not_empties = [0u8; BITMAP_LEN];
        not_empties.copy_from_slice(&bytes[3..HEADER_LEN]);

        let body = &bytes[HEADER_LEN..];
        if body.len() % HASH_LEN != 0 {
            return Err(Error::MalformedProof("truncated sibling"));
        }
        let siblings: Vec<Hash> = body
            .chunks(HASH_LEN)
            .map(Hash::from_slice)
            .collect::<Result<_, _>>()
            .map_err(|_| Error::MalformedProof("truncated sibling"))?;

        let proof = Proof {
            census_type,
            depth,
            not_empties,
            siblings,
        };

        let mut expected = 0;
        for level in 0..MAX_LEVELS {
            if proof.is_not_empty(level) {
                if level >= depth as usize {
                    return Err(Error::MalformedProof("sibling below proof depth"));
                }
                expected += 1;
            }
        }
        if expected != proof.siblings.len() {
            return Err(Error::MalformedProof("sibling count mismatch"));
        }
        Ok(proof)
    }

    /// Compute the root implied by this proof for the given leaf
    pub fn root_for(&self, h_index: &Hash, h_value: &Hash) -> Hash {
        let mut node = leaf_key(self.census_type, h_index, h_value);
        let mut siblings = self.siblings.iter().rev();
        for level in (0..self.depth as usize).rev() {
            let sibling = if self.is_not_empty(level) {
                siblings.next().copied().unwrap_or(Hash::ZERO)
            } else {
                Hash::ZERO
            };
            node = if h_index.bit(level) {
                middle_key(self.census_type, &sibling, &node)
            } else {
                middle_key(self.census_type, &node, &sibling)
            };
        }
        node
    }

    pub fn verify(&self, root: &Hash, claim: &Claim) -> bool {
        let h_index = claim.hash_index(self.census_type);
        let h_value = claim.hash_value(self.census_type);
        self.root_for(&h_index, &h_value) == *root
    }
}

/// Check a proof for `payload` against `root`, independently of any tree.
///
/// Returns `Ok(false)` when the proof decodes but does not lead to `root`.
pub fn check_proof(root: &[u8], proof: &[u8], payload: &[u8]) -> Result<bool, Error> {
    let claim = Claim::encode(payload)?;
    check_claim_proof(root, proof, &claim)
}

/// Same as [`check_proof`] for an already encoded (possibly keyed) claim
pub fn check_claim_proof(root: &[u8], proof: &[u8], claim: &Claim) -> Result<bool, Error> {
    let proof = Proof::from_bytes(proof)?;
    let root = Hash::from_slice(root)?;
    Ok(proof.verify(&root, claim))
}
