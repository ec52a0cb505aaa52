use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("votecensus: {0} already exists")]
    AlreadyExists(String),

    #[error("votecensus: {0} not found")]
    NotFound(String),

    #[error("votecensus: census is locked")]
    CensusLocked,

    #[error("votecensus: wrong authentication token")]
    WrongAuthToken,

    #[error("votecensus: claim data too large: {0} bytes (max {})", crate::MAX_CLAIM_SIZE)]
    ClaimTooLarge(usize),

    #[error("votecensus: claim key too large: {0} bytes (max {})", crate::INDEX_SLOT_SIZE)]
    KeyTooLarge(usize),

    #[error("votecensus: namespace not valid")]
    InvalidNamespace,

    #[error("votecensus: malformed proof: {0}")]
    MalformedProof(&'static str),

    #[error("votecensus: malformed root: expected 32 bytes, found {0}")]
    MalformedRoot(usize),

    #[error("votecensus: root hash does not match after importing dump")]
    RootMismatch,

    #[error("votecensus: missing dump or root parameters")]
    MissingFields,

    #[error("votecensus: census is read-only")]
    ReadOnly,

    #[error("votecensus: keyed claims require an indexed census and vice versa")]
    NotIndexed,

    #[error("votecensus: reached maximum tree depth")]
    ReachedMaxLevels,

    #[error("votecensus: unknown census type {0}")]
    UnknownCensusType(i32),

    #[error("votecensus: unsupported {record} version {version}")]
    UnsupportedVersion { record: &'static str, version: u8 },

    #[error("votecensus: max levels must be between 2 and {}, found {0}", crate::MAX_LEVELS)]
    InvalidMaxLevels(usize),

    #[error("votecensus: corrupted node {0}")]
    CorruptedNode(String),

    #[error("votecensus: storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("votecensus: CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),

    #[error("votecensus: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("votecensus: invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("votecensus: invalid hexadecimal: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("votecensus: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("votecensus: invalid configuration value for {0}")]
    Config(&'static str),
}

impl Error {
    /// Binary, JSON or text decoding failure
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Cbor(_)
                | Error::Json(_)
                | Error::Base64(_)
                | Error::Hex(_)
                | Error::Io(_)
                | Error::UnsupportedVersion { .. }
        )
    }

    /// Failure of the backing key/value store
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::CorruptedNode(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
