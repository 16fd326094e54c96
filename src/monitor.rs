//! Forced mining.
//!
//! One [`MiningMonitor`] task runs per submitted transaction:
//!
//! ```text
//!   ┌──────────── every check_interval ────────────┐
//!   ▼                                              │
//! any broadcast hash mined? ── yes ──► Mined (exit)│
//!   │ no                                           │
//!   ▼                                              │
//! threshold elapsed since last broadcast? ── no ───┤
//!   │ yes                                          │
//!   ▼                                              │
//! re-sign with the same nonce and a bumped fee,    │
//! broadcast, remember the new hash ────────────────┘
//!
//! cancellation (abandon / shutdown / submitter dropped) ──► Abandoned (exit)
//! ```
//!
//! Replacement failures are reported to the observer and never returned to
//! anyone: the caller already holds its handle. A transient failure is retried
//! on the next check; a permanent one (revert, insufficient funds) stops
//! replacements while receipt checks continue.

use std::sync::{Arc, Weak};

use alloy::primitives::B256;
use tokio::{
    sync::watch,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::period,
    ext::{
        CallRequest, MinedReceipt, MiningConfig, RpcErrorKind, SignedEnvelope, SubmitError,
        TxOptions, TxStatus,
    },
    submitter::SubmitCore,
};

pub(crate) struct MiningMonitor {
    core: Weak<SubmitCore>,
    config: MiningConfig,
    request: Arc<CallRequest>,
    options: TxOptions,
    nonce: u64,
    hashes: Vec<B256>,
    attempt: u32,
    /// Cleared after a permanent replacement failure
    replacing: bool,
    status: watch::Sender<TxStatus>,
    cancel: CancellationToken,
}

impl MiningMonitor {
    pub(crate) fn new(
        core: Weak<SubmitCore>,
        config: MiningConfig,
        request: Arc<CallRequest>,
        options: TxOptions,
        envelope: SignedEnvelope,
        status: watch::Sender<TxStatus>,
        cancel: CancellationToken,
    ) -> Self {
        // Replacements carry the gas limit only if the caller set it
        let options = TxOptions {
            gas_limit: options.replacement_gas_limit(),
            ..options
        };
        Self {
            core,
            config,
            request,
            options,
            nonce: envelope.nonce,
            hashes: vec![envelope.tx_hash],
            attempt: 0,
            replacing: true,
            status,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = interval(period(self.config.check_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick
        ticker.tick().await;
        let mut last_broadcast = Instant::now();
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish_abandoned("monitor cancelled");
                    return;
                }

                _ = ticker.tick() => {
                    let Some(core) = self.core.upgrade() else {
                        self.finish_abandoned("submitter dropped");
                        return;
                    };

                    if let Some(receipt) = self.check_mined(&core).await {
                        core.observer.on_mined(
                            core.address(),
                            self.nonce,
                            receipt.tx_hash,
                            receipt.block_number,
                        );
                        self.status.send_replace(TxStatus::Mined {
                            tx_hash: receipt.tx_hash,
                            block_number: receipt.block_number,
                            success: receipt.success,
                        });
                        return;
                    }

                    if last_broadcast.elapsed() < self.config.threshold {
                        continue;
                    }
                    if !self.replacing
                        || self
                            .config
                            .max_rebroadcasts
                            .is_some_and(|max| self.attempt >= max)
                    {
                        continue;
                    }

                    // A failed replacement is retried on the next check
                    if self.rebroadcast(&core).await {
                        last_broadcast = Instant::now();
                    }
                }
            }
        }
    }

    /// Look for a receipt of any hash broadcast so far, newest first.
    async fn check_mined(&self, core: &SubmitCore) -> Option<MinedReceipt> {
        for tx_hash in self.hashes.iter().rev() {
            match core.transport.get_transaction_receipt(*tx_hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(
                        address = %core.address(),
                        nonce = self.nonce,
                        %tx_hash,
                        error = %e,
                        "receipt lookup failed"
                    );
                }
            }
        }
        None
    }

    /// Broadcast one replacement. Returns whether the node now holds a
    /// transaction for this nonce at the bumped fee.
    async fn rebroadcast(&mut self, core: &SubmitCore) -> bool {
        self.attempt += 1;
        let attempt = self.attempt;
        let address = core.address();
        let fee_multiplier = self.config.gas_bump.multiplier(attempt);

        match core
            .sign_and_broadcast(&self.request, &self.options, self.nonce, fee_multiplier)
            .await
        {
            Ok(envelope) => {
                if !self.hashes.contains(&envelope.tx_hash) {
                    self.hashes.push(envelope.tx_hash);
                }
                core.observer
                    .on_rebroadcast(address, self.nonce, attempt, envelope.tx_hash);
                self.status.send_replace(TxStatus::Pending {
                    attempt,
                    tx_hash: envelope.tx_hash,
                });
                true
            }
            Err(e) => match e.kind() {
                Some(RpcErrorKind::AlreadyKnown) => {
                    tracing::trace!(%address, nonce = self.nonce, attempt, "replacement: tx still in mempool");
                    true
                }
                Some(RpcErrorKind::NonceTooLow) => {
                    // A previous broadcast was mined; the next check picks it up
                    tracing::debug!(%address, nonce = self.nonce, attempt, "replacement: nonce already used, tx may be mined");
                    false
                }
                Some(kind) if kind.is_permanent() => {
                    // Re-signing the same call cannot succeed; keep watching the earlier broadcasts
                    self.replacing = false;
                    self.report_failure(core, attempt, &e);
                    false
                }
                _ => {
                    self.report_failure(core, attempt, &e);
                    false
                }
            },
        }
    }

    fn report_failure(&self, core: &SubmitCore, attempt: u32, error: &SubmitError) {
        core.observer
            .on_rebroadcast_failed(core.address(), self.nonce, attempt, error);
    }

    fn finish_abandoned(&self, reason: &'static str) {
        tracing::debug!(nonce = self.nonce, tx_hash = ?self.hashes.first(), reason, "stopped mining monitor");
        self.status.send_replace(TxStatus::Abandoned);
    }
}
