//! Error types and RPC error classification.
//!
//! Raw transport failures arrive as alloy's `TransportError`. They are
//! classified by message so the runtime can tell transient conditions (worth
//! retrying in a background task) from permanent ones (surfaced to the caller
//! as is). Different RPC providers word the same condition differently, so
//! each kind checks several patterns.

use alloy::{
    primitives::{Address, B256},
    transports::{RpcError, TransportError},
};
use thiserror::Error;

use crate::ext::DecodedError;

// ============================================================================
// Error Classification Types
// ============================================================================

/// Classified RPC error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Nonce already used on chain (a replacement may have been mined)
    NonceTooLow,

    /// Nonce leaves a gap behind the account's on-chain nonce
    NonceTooHigh,

    /// Replacement does not pay enough over the transaction it replaces
    ReplacementUnderpriced,

    /// Insufficient funds for gas * price + value
    InsufficientFunds,

    /// Gas limit too low for the transaction
    IntrinsicGasTooLow,

    /// Execution reverted (custom error data may be attached)
    Reverted,

    /// Network/connection error
    NetworkError,

    /// Transaction already known to the node (duplicate broadcast)
    AlreadyKnown,

    /// Unknown or unclassified error
    Unknown,
}

impl RpcErrorKind {
    /// Whether the same request may succeed if sent again later.
    ///
    /// The synchronous submit path never retries a failed broadcast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcErrorKind::NetworkError
                | RpcErrorKind::ReplacementUnderpriced
                | RpcErrorKind::AlreadyKnown
        )
    }

    /// Whether this is a contract-level failure that must never be retried.
    /// The mining monitor stops replacing a transaction after one.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RpcErrorKind::Reverted | RpcErrorKind::InsufficientFunds
        )
    }
}

// ============================================================================
// Error Classification Functions
// ============================================================================

/// Classify an RPC error by matching its message against known patterns.
pub fn classify_rpc_error<E: std::fmt::Display>(error: &RpcError<E>) -> RpcErrorKind {
    classify_error_message(&error.to_string())
}

/// Classify a raw error message. See [`classify_rpc_error`].
pub fn classify_error_message(message: &str) -> RpcErrorKind {
    let error_str = message.to_lowercase();

    if error_str.contains("nonce too low")
        || error_str.contains("nonce is too low")
        || error_str.contains("nonce has already been used")
        || error_str.contains("invalid nonce")
            && (error_str.contains("too low") || error_str.contains("expected"))
    {
        return RpcErrorKind::NonceTooLow;
    }

    if error_str.contains("nonce too high")
        || error_str.contains("nonce is too high")
        || error_str.contains("nonce gap")
    {
        return RpcErrorKind::NonceTooHigh;
    }

    if error_str.contains("replacement transaction underpriced")
        || error_str.contains("underpriced")
        || error_str.contains("fee too low")
        || error_str.contains("gas price too low")
        || error_str.contains("max fee per gas less than block base fee")
    {
        return RpcErrorKind::ReplacementUnderpriced;
    }

    if error_str.contains("insufficient funds")
        || error_str.contains("insufficient balance")
        || error_str.contains("not enough funds")
        || error_str.contains("exceeds balance")
    {
        return RpcErrorKind::InsufficientFunds;
    }

    if error_str.contains("intrinsic gas too low")
        || error_str.contains("gas limit too low")
        || error_str.contains("out of gas")
    {
        return RpcErrorKind::IntrinsicGasTooLow;
    }

    if error_str.contains("execution reverted") || error_str.contains("revert") {
        return RpcErrorKind::Reverted;
    }

    if error_str.contains("already known")
        || error_str.contains("already imported")
        || error_str.contains("transaction already exists")
        || error_str.contains("known transaction")
    {
        return RpcErrorKind::AlreadyKnown;
    }

    if error_str.contains("connection")
        || error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("network")
        || error_str.contains("transport")
        || error_str.contains("backend")
        || error_str.contains("eof")
        || error_str.contains("broken pipe")
    {
        return RpcErrorKind::NetworkError;
    }

    RpcErrorKind::Unknown
}

// ============================================================================
// Codec / signer errors
// ============================================================================

/// Failure of the ABI encoding/decoding service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("no overload of `{method}` takes {arity} arguments")]
    ArityMismatch { method: String, arity: usize },

    #[error("failed to encode `{method}`: {reason}")]
    Encode { method: String, reason: String },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("log does not match event `{0}`")]
    EventMismatch(String),
}

/// Failure to produce a signed envelope.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("gas or fee estimation failed: {0}")]
    Estimate(#[source] TransportError),

    #[error("failed to build signed transaction: {0}")]
    Build(String),
}

// ============================================================================
// Public operation errors
// ============================================================================

/// Error returned by `TransactionSubmitter::submit`.
///
/// Whatever the variant, the cached account nonce has not been incremented.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// More than one override set was supplied for a single call
    #[error("at most one set of transaction overrides per call, got {0}")]
    ConflictingOverrides(usize),

    #[error("failed to resolve chain id: {0}")]
    ChainId(#[source] TransportError),

    #[error("failed to fetch nonce for {address}: {source}")]
    Nonce {
        address: Address,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Sign(#[from] SignerError),

    /// Broadcast rejected with an error no catalogue could decode
    #[error("broadcast of nonce {nonce} failed: {source}")]
    Broadcast {
        nonce: u64,
        #[source]
        source: TransportError,
    },

    /// Broadcast rejected with a decoded custom error
    #[error("broadcast of nonce {nonce} reverted: {error}")]
    Reverted { nonce: u64, error: DecodedError },
}

impl SubmitError {
    /// Classified kind of the underlying transport failure, if any.
    pub fn kind(&self) -> Option<RpcErrorKind> {
        match self {
            SubmitError::ChainId(source)
            | SubmitError::Nonce { source, .. }
            | SubmitError::Broadcast { source, .. } => Some(classify_rpc_error(source)),
            SubmitError::Reverted { .. } => Some(RpcErrorKind::Reverted),
            _ => None,
        }
    }

    /// The decoded custom error, when the failure was a recognised revert.
    pub fn decoded(&self) -> Option<&DecodedError> {
        match self {
            SubmitError::Reverted { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Error returned by the read-only query path.
#[derive(Debug, Error)]
pub enum CallError {
    /// Encoding the call or decoding its return data failed
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("call failed: {0}")]
    Transport(#[source] TransportError),

    #[error("call reverted: {0}")]
    Reverted(DecodedError),
}

impl CallError {
    pub fn decoded(&self) -> Option<&DecodedError> {
        match self {
            CallError::Reverted(error) => Some(error),
            _ => None,
        }
    }
}

/// Error returned by event queries.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid block range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("log query failed: {0}")]
    Transport(#[source] TransportError),
}

/// Error returned when waiting on a transaction handle.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("transaction {tx_hash} with nonce {nonce} was abandoned before it was mined")]
    Abandoned { nonce: u64, tx_hash: B256 },
}
