//! Observability hooks.
//!
//! Background work (mining monitors, subscription tasks) cannot return errors
//! to anyone, so everything worth knowing about it is reported through a
//! [`RuntimeObserver`] handed to the runtime at construction. Every method
//! has an empty default; [`TracingObserver`] forwards them to `tracing`.

use std::{fmt, time::Duration};

use alloy::primitives::{Address, B256};

use crate::ext::CodecError;

pub trait RuntimeObserver: Send + Sync {
    /// A submission was accepted by the node.
    fn on_broadcast(&self, _address: Address, _nonce: u64, _tx_hash: B256) {}

    /// The mining monitor broadcast a replacement.
    fn on_rebroadcast(&self, _address: Address, _nonce: u64, _attempt: u32, _tx_hash: B256) {}

    /// A replacement broadcast failed. The monitor keeps going.
    fn on_rebroadcast_failed(
        &self,
        _address: Address,
        _nonce: u64,
        _attempt: u32,
        _error: &dyn fmt::Display,
    ) {
    }

    fn on_mined(&self, _address: Address, _nonce: u64, _tx_hash: B256, _block_number: u64) {}

    /// The live leg of a subscription failed and will be retried after `delay`.
    fn on_resubscribe_failure(
        &self,
        _subscription: &str,
        _attempt: u32,
        _delay: Duration,
        _error: &dyn fmt::Display,
    ) {
    }

    /// The live leg has been down for longer than the alert threshold.
    fn on_resubscribe_alert(&self, _subscription: &str, _disconnected_for: Duration) {}

    /// The live leg reconnected after `attempts` failures.
    fn on_resubscribed(&self, _subscription: &str, _attempts: u32) {}

    /// The backfill leg failed; the subscription retries on the next tick.
    fn on_backfill_failed(&self, _subscription: &str, _error: &dyn fmt::Display) {}

    fn on_events_delivered(&self, _subscription: &str, _count: usize, _through_block: u64) {}

    /// A matching log could not be decoded and was skipped.
    fn on_decode_failure(
        &self,
        _subscription: &str,
        _block_number: u64,
        _log_index: u64,
        _error: &CodecError,
    ) {
    }
}

/// Observer that logs every hook with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RuntimeObserver for TracingObserver {
    fn on_broadcast(&self, address: Address, nonce: u64, tx_hash: B256) {
        tracing::debug!(%address, nonce, %tx_hash, "transaction broadcast");
    }

    fn on_rebroadcast(&self, address: Address, nonce: u64, attempt: u32, tx_hash: B256) {
        tracing::info!(%address, nonce, attempt, %tx_hash, "broadcast replacement transaction");
    }

    fn on_rebroadcast_failed(
        &self,
        address: Address,
        nonce: u64,
        attempt: u32,
        error: &dyn fmt::Display,
    ) {
        tracing::warn!(%address, nonce, attempt, error = %error, "replacement broadcast failed");
    }

    fn on_mined(&self, address: Address, nonce: u64, tx_hash: B256, block_number: u64) {
        tracing::debug!(%address, nonce, %tx_hash, block_number, "transaction mined");
    }

    fn on_resubscribe_failure(
        &self,
        subscription: &str,
        attempt: u32,
        delay: Duration,
        error: &dyn fmt::Display,
    ) {
        tracing::debug!(subscription, attempt, ?delay, error = %error, "live subscription failed");
    }

    fn on_resubscribe_alert(&self, subscription: &str, disconnected_for: Duration) {
        tracing::warn!(
            subscription,
            ?disconnected_for,
            "live subscription down past alert threshold"
        );
    }

    fn on_resubscribed(&self, subscription: &str, attempts: u32) {
        tracing::info!(subscription, attempts, "live subscription re-established");
    }

    fn on_backfill_failed(&self, subscription: &str, error: &dyn fmt::Display) {
        tracing::warn!(subscription, error = %error, "backfill failed");
    }

    fn on_events_delivered(&self, subscription: &str, count: usize, through_block: u64) {
        tracing::trace!(subscription, count, through_block, "delivered events");
    }

    fn on_decode_failure(
        &self,
        subscription: &str,
        block_number: u64,
        log_index: u64,
        error: &CodecError,
    ) {
        tracing::error!(subscription, block_number, log_index, error = %error, "skipping undecodable log");
    }
}
