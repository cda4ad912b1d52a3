// src/error.rs - error taxonomy for the chain engine and its consumers
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Every distinct failure kind the chain engine, store, and loops can
/// produce. Domain errors are reported to API callers with their own
/// message; transport/infrastructure errors are normalised to
/// `SystemError` before they leave the API layer (see `category`).
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("wrong hash")]
    WrongHash,

    #[error("wrong merkle root")]
    WrongMerkleRoot,

    #[error("wrong nonce")]
    WrongNonce,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("transaction failed verification")]
    VerifyFailed,

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("negative amount")]
    NegativeAmount,

    #[error("fee too low")]
    FeeTooLow,

    #[error("transaction already confirmed")]
    AlreadyConfirmed,

    #[error("transaction already pending")]
    AlreadyPending,

    #[error("difficulty mismatch")]
    DifficultyMismatch,

    #[error("block invalid")]
    BlockInvalid,

    #[error("bad reward transaction: {0}")]
    BadRewardTx(String),

    #[error("bad transaction fields: {0}")]
    BadTxFields(String),

    #[error("block already exists")]
    BlockExists,

    #[error("missing parent block")]
    MissingParent,

    #[error("prev_hash does not match parent")]
    PrevHashMismatch,

    #[error("double spend")]
    DoubleSpend,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("internal error")]
    SystemError,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

impl NodeError {
    /// Stable, human-readable message surfaced to API callers.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// True for errors that must never reach a caller as-is; the API
    /// layer normalises these to `SystemError` and logs the original
    /// in full.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            NodeError::Io(_)
                | NodeError::Json(_)
                | NodeError::Store(_)
                | NodeError::Secp256k1(_)
                | NodeError::HexDecode(_)
                | NodeError::TransportError(_)
                | NodeError::SystemError
        )
    }

    /// Short machine-readable tag, used for logging and for the
    /// `error` status payload's `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::WrongHash => "WrongHash",
            NodeError::WrongMerkleRoot => "WrongMerkleRoot",
            NodeError::WrongNonce => "WrongNonce",
            NodeError::InvalidSignature => "InvalidSignature",
            NodeError::VerifyFailed => "VerifyFailed",
            NodeError::BadAddress(_) => "BadAddress",
            NodeError::NegativeAmount => "NegativeAmount",
            NodeError::FeeTooLow => "FeeTooLow",
            NodeError::AlreadyConfirmed => "AlreadyConfirmed",
            NodeError::AlreadyPending => "AlreadyPending",
            NodeError::DifficultyMismatch => "DifficultyMismatch",
            NodeError::BlockInvalid => "BlockInvalid",
            NodeError::BadRewardTx(_) => "BadRewardTx",
            NodeError::BadTxFields(_) => "BadTxFields",
            NodeError::BlockExists => "BlockExists",
            NodeError::MissingParent => "MissingParent",
            NodeError::PrevHashMismatch => "PrevHashMismatch",
            NodeError::DoubleSpend => "DoubleSpend",
            NodeError::InsufficientFunds => "InsufficientFunds",
            NodeError::UnknownEntity(_) => "UnknownEntity",
            NodeError::TransportError(_) => "TransportError",
            NodeError::SystemError
            | NodeError::Io(_)
            | NodeError::Json(_)
            | NodeError::Store(_)
            | NodeError::Secp256k1(_)
            | NodeError::HexDecode(_) => "SystemError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_are_flagged() {
        assert!(NodeError::SystemError.is_infrastructure());
        assert!(NodeError::TransportError("timeout".into()).is_infrastructure());
        assert!(!NodeError::DoubleSpend.is_infrastructure());
    }

    #[test]
    fn kinds_are_stable_strings() {
        assert_eq!(NodeError::InsufficientFunds.kind(), "InsufficientFunds");
        assert_eq!(NodeError::BadAddress("x".into()).kind(), "BadAddress");
    }
}
