//! Handle to a submitted transaction.
//!
//! `submit` returns a [`TxHandle`] as soon as the node accepts the broadcast.
//! The mining monitor publishes progress on a `watch` channel behind the
//! handle, so any number of clones can observe or await the outcome:
//!
//! ```text
//!   Pending { attempt: 0 } ──► Pending { attempt: 1 } ──► ... ──► Mined
//!            │                          │
//!            └──────────────────────────┴──────────────────────► Abandoned
//! ```
//!
//! With the monitor disabled the status stays at `Pending { attempt: 0 }` and
//! `wait_mined` fails straight away.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ext::{CallRequest, MinedReceipt, SignedEnvelope, WaitError};

/// Lifecycle of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Waiting to be mined; `tx_hash` is the latest broadcast
    Pending { attempt: u32, tx_hash: B256 },
    /// One of the broadcasts was mined
    Mined {
        tx_hash: B256,
        block_number: u64,
        success: bool,
    },
    /// Monitoring stopped before anything was observed mined
    Abandoned,
}

impl TxStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TxStatus::Pending { .. })
    }
}

#[derive(Clone)]
pub struct TxHandle {
    address: Address,
    nonce: u64,
    envelope: SignedEnvelope,
    request: Arc<CallRequest>,
    status: watch::Receiver<TxStatus>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("address", &self.address)
            .field("nonce", &self.nonce)
            .field("tx_hash", &self.envelope.tx_hash)
            .field("method", &self.request.method)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl TxHandle {
    pub(crate) fn new(
        address: Address,
        envelope: SignedEnvelope,
        request: Arc<CallRequest>,
        status: watch::Receiver<TxStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            nonce: envelope.nonce,
            envelope,
            request,
            status,
            cancel,
        }
    }

    /// Sending account.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Nonce shared by the original broadcast and every replacement.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Hash of the broadcast made by `submit`.
    pub fn original_hash(&self) -> B256 {
        self.envelope.tx_hash
    }

    /// Hash of the most recent broadcast, or of the mined one.
    pub fn latest_hash(&self) -> B256 {
        match *self.status.borrow() {
            TxStatus::Pending { tx_hash, .. } | TxStatus::Mined { tx_hash, .. } => tx_hash,
            TxStatus::Abandoned => self.envelope.tx_hash,
        }
    }

    /// The envelope broadcast by `submit`.
    pub fn envelope(&self) -> &SignedEnvelope {
        &self.envelope
    }

    pub fn request(&self) -> &CallRequest {
        &self.request
    }

    pub fn status(&self) -> TxStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<TxStatus> {
        self.status.clone()
    }

    /// Wait until a broadcast is mined.
    ///
    /// Fails with `WaitError::Abandoned` if monitoring stops first.
    pub async fn wait_mined(&self) -> Result<MinedReceipt, WaitError> {
        let mut status = self.status.clone();
        let abandoned = WaitError::Abandoned {
            nonce: self.nonce,
            tx_hash: self.envelope.tx_hash,
        };
        let outcome = match status.wait_for(|s| !s.is_pending()).await {
            Ok(outcome) => *outcome,
            Err(_) => return Err(abandoned),
        };
        match outcome {
            TxStatus::Mined {
                tx_hash,
                block_number,
                success,
            } => Ok(MinedReceipt {
                tx_hash,
                block_number,
                success,
            }),
            _ => Err(abandoned),
        }
    }

    /// Stop monitoring this transaction. Already-broadcast envelopes stay in
    /// the mempool; nothing further is sent.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }
}
