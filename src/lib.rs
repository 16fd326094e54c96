//! # alloy-relay
//!
//! Runtime for talking to an external EVM chain from a relayer: submitting
//! contract calls under nonce contention and following contract events across
//! RPC endpoint failures.
//!
//! ## Core Features
//!
//! - **Nonce Sequencing**: Per-account submission mutex; consecutive nonces in entry order, reused after a failed broadcast
//! - **Forced Mining**: Background monitor rebroadcasts unmined transactions with the same nonce and a bumped fee
//! - **Custom Error Resolution**: Revert data decoded against injected or link-time registered error catalogues
//! - **Event Streams**: Bounded backfill merged with a live subscription, ordered per subscription, reconnected with backoff
//! - **Block Height Tracking**: Monotonic chain head used to size backfill windows
//!
//! ## Usage
//!
//! ```ignore
//! use alloy_relay::ext::*;
//!
//! let transport = Arc::new(ProviderTransport::connect_ws(ws_url).await?);
//! let signer = Arc::new(WalletSigner::new(transport.provider().clone(), key));
//! let codec = Arc::new(JsonAbiCodec::from_json("Bridge", BRIDGE_ABI)?);
//!
//! let runtime = ChainRuntime::new(transport, signer, codec, RuntimeConfig::default());
//! let tx = runtime
//!     .submitter()
//!     .submit(CallRequest::new(bridge, "relay").arg(payload))
//!     .await?;
//! ```

// ============================================================================
// Internal Module Declarations
// ============================================================================

/// Reconnection backoff state machine
mod backoff;

/// Call requests and per-call transaction overrides
mod call;

/// ABI codec seams for calls and events
mod codec;

/// Serde-backed runtime configuration
mod config;

/// Custom error catalogues and the error resolver
mod contract_error;

/// RPC error classification and operation error types
mod error;

/// Event stream engine and historical queries
mod events;

/// Fee bump policy for replacement transactions
mod gas;

/// Monotonic block height tracker
mod height;

/// Mining monitor task (forced mining)
mod monitor;

/// Per-account nonce sequencing
mod nonce;

/// Observability hooks for background work
mod observer;

/// Submitted transaction handles
mod pending_tx;

/// Runtime facade and builder
mod runtime;

/// Signing seam and local-key signer
mod signer;

/// Transaction submission and read-only calls
mod submitter;

/// Subscription tasks and handles
mod subscription;

/// Chain RPC seam and alloy provider adapter
mod transport;

/// Test harness module (compiled only in test mode)
#[cfg(test)]
pub mod test_harness;

// ============================================================================
// Public Exports
// ============================================================================

/// Re-export all public APIs from the alloy crate.
pub use alloy::*;

/// Internal module for macro usage.
#[doc(hidden)]
pub mod __private {
    /// inventory crate - link-time registration of contract error catalogues
    pub use inventory;
}

/// Extension module containing the runtime:
///
/// - `ChainRuntime` - Facade owning the root cancellation token
/// - `TransactionSubmitter` - Nonce-sequenced submission and read-only calls
/// - `EventStream` - Backfill + live event subscriptions
/// - `BlockHeightTracker` - Monotonic chain head
/// - `ErrorResolver` - Custom error decoding
/// - `Transport` / `TxSigner` / `CallCodec` / `EventKind` - Collaborator seams
pub mod ext {
    pub use super::backoff::*;
    pub use super::call::*;
    pub use super::codec::*;
    pub use super::config::*;
    pub use super::contract_error::*;
    pub use super::error::*;
    pub use super::events::*;
    pub use super::gas::*;
    pub use super::height::*;
    pub use super::nonce::*;
    pub use super::observer::*;
    pub use super::pending_tx::*;
    pub use super::runtime::*;
    pub use super::signer::*;
    pub use super::submitter::*;
    pub use super::subscription::*;
    pub use super::transport::*;
}
