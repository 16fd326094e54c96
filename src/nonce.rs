//! Account nonce sequencing.
//!
//! ## Ownership
//!
//! Each signing account has one [`NonceSequencer`] wrapped in a
//! `tokio::sync::Mutex`. That mutex is the submission mutex: the submitter
//! holds it across nonce read, signing and broadcast, so the sequencer itself
//! needs no synchronization of its own.
//!
//! ```text
//!   lock ──► current_nonce() ──► sign ──► broadcast ──┬─► increment_nonce() ──► unlock
//!                                                     │
//!                                                     └─► (failure) ──────────► unlock
//! ```
//!
//! A failed broadcast leaves the cache untouched, so the next submission
//! reuses the nonce. The cache is never decremented.

use std::sync::Arc;

use alloy::{primitives::Address, transports::TransportResult};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::trace;

use crate::ext::Transport;

// ============================================================================
// NonceSequencer
// ============================================================================

/// Process-local cache of the next nonce for one account.
#[derive(Debug)]
pub struct NonceSequencer {
    address: Address,
    next: Option<u64>,
}

impl NonceSequencer {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            next: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Next nonce to use. The first call (and the first after [`resync`])
    /// loads it from the chain; later calls are in-memory reads.
    ///
    /// [`resync`]: Self::resync
    pub async fn current_nonce<T>(&mut self, transport: &T) -> TransportResult<u64>
    where
        T: Transport + ?Sized,
    {
        if let Some(next) = self.next {
            return Ok(next);
        }
        let next = transport.transaction_count(self.address).await?;
        trace!(address = %self.address, nonce = next, "loaded nonce from chain");
        self.next = Some(next);
        Ok(next)
    }

    /// Advance past the nonce just broadcast.
    pub fn increment_nonce(&mut self) {
        if let Some(next) = self.next.as_mut() {
            *next += 1;
            trace!(address = %self.address, nonce = *next, "incremented nonce");
        }
    }

    /// Record that `nonce` was used by a broadcast outside the sequence
    /// (a caller-supplied nonce). Moves the cache forward if needed so the
    /// sequence never hands that nonce out again.
    pub fn observe_used(&mut self, nonce: u64) {
        if let Some(next) = self.next.as_mut() {
            if nonce >= *next {
                *next = nonce + 1;
                trace!(address = %self.address, nonce = *next, "advanced nonce past custom nonce");
            }
        }
    }

    /// Cached next nonce, if loaded.
    pub fn peek(&self) -> Option<u64> {
        self.next
    }

    /// Drop the cache; the next [`current_nonce`](Self::current_nonce)
    /// reloads from the chain.
    pub fn resync(&mut self) {
        trace!(address = %self.address, "dropped cached nonce");
        self.next = None;
    }
}

// ============================================================================
// NonceRegistry
// ============================================================================

/// Per-account submission mutexes, shared by every submitter in the process.
#[derive(Clone, Debug, Default)]
pub struct NonceRegistry {
    accounts: Arc<DashMap<Address, Arc<Mutex<NonceSequencer>>>>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The submission mutex for `address`, created on first use.
    pub fn sequencer(&self, address: Address) -> Arc<Mutex<NonceSequencer>> {
        self.accounts
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(NonceSequencer::new(address))))
            .clone()
    }

    /// Cached next nonce of `address`. Waits for any in-flight submission.
    pub async fn peek(&self, address: Address) -> Option<u64> {
        let sequencer = self.accounts.get(&address).map(|entry| entry.clone())?;
        let guard = sequencer.lock().await;
        guard.peek()
    }

    /// Force `address` to reload its nonce from the chain on next use.
    pub async fn resync(&self, address: Address) {
        if let Some(sequencer) = self.accounts.get(&address).map(|entry| entry.clone()) {
            sequencer.lock().await.resync();
        }
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}
