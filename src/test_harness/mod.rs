//! In-memory test harness for the chain runtime.
//!
//! [`MockTransport`] stands in for the chain RPC endpoint: account nonces,
//! broadcasts, receipts, read-only calls, a log store with range queries and
//! live log subscriptions that can be stalled, broken or refused. Every
//! failure mode is injected explicitly. [`MockSigner`] produces deterministic
//! envelopes whose hash depends on every signed field, fee multiplier
//! included, so replacements get distinct hashes.
//!
//! # Example
//!
//! ```ignore
//! let harness = RuntimeHarness::new(RuntimeConfig::default());
//! harness.transport.set_nonce(harness.address(), 5);
//!
//! let handle = harness.submitter().submit(transfer_a(BOB, 1)).await.unwrap();
//! assert_eq!(handle.nonce(), 5);
//! ```

mod scenario;

pub use scenario::*;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy::{
    eips::BlockId,
    primitives::{keccak256, Address, Bytes, B256},
    rpc::{json_rpc::ErrorPayload, types::Log},
    transports::{RpcError, TransportError, TransportErrorKind, TransportResult},
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::ext::{
    LogFilter, LogStream, MinedReceipt, SignedEnvelope, SignerError, Transport, TxSigner,
    UnsignedTx,
};

// ============================================================================
// Injected errors
// ============================================================================

/// An error to inject; converted to a fresh `TransportError` on use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockError {
    /// Plain transport error carrying this message
    Message(String),
    /// JSON-RPC `execution reverted` response carrying this revert data
    Revert(Bytes),
}

impl MockError {
    pub fn message(message: impl Into<String>) -> Self {
        MockError::Message(message.into())
    }

    pub fn into_error(self) -> TransportError {
        match self {
            MockError::Message(message) => TransportErrorKind::custom_str(&message),
            MockError::Revert(data) => {
                let data = serde_json::value::to_raw_value(&data.to_string()).ok();
                RpcError::ErrorResp(ErrorPayload {
                    code: 3,
                    message: "execution reverted".into(),
                    data,
                })
            }
        }
    }
}

impl From<&str> for MockError {
    fn from(message: &str) -> Self {
        MockError::message(message)
    }
}

// ============================================================================
// MockTransport
// ============================================================================

type LiveSender = mpsc::UnboundedSender<TransportResult<Log>>;

#[derive(Default)]
struct MockState {
    chain_id: u64,
    block_number: u64,
    nonces: HashMap<Address, u64>,
    nonce_failures: VecDeque<MockError>,
    broadcast_failures: VecDeque<MockError>,
    broadcast_latency: Option<Duration>,
    broadcasts: Vec<SignedEnvelope>,
    auto_mine: bool,
    receipts: HashMap<B256, MinedReceipt>,
    call_results: VecDeque<Result<Bytes, MockError>>,
    calls: Vec<(Address, Bytes, BlockId)>,
    logs: Vec<Log>,
    filter_queries: Vec<(u64, u64)>,
    filter_failures: VecDeque<MockError>,
    subscribe_failures: usize,
    live: Vec<(LogFilter, LiveSender)>,
    stalled: Vec<(LogFilter, LiveSender)>,
}

/// In-memory chain endpoint.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    nonce_queries: AtomicUsize,
    subscribe_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        transport.state().chain_id = 31337;
        Arc::new(transport)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Chain state
    // ------------------------------------------------------------------

    pub fn chain_id_value(&self) -> u64 {
        self.state().chain_id
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.state().block_number = block_number;
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    pub fn nonce_queries(&self) -> usize {
        self.nonce_queries.load(Ordering::SeqCst)
    }

    pub fn fail_next_nonce_query(&self, error: impl Into<MockError>) {
        self.state().nonce_failures.push_back(error.into());
    }

    // ------------------------------------------------------------------
    // Broadcasts and receipts
    // ------------------------------------------------------------------

    pub fn fail_next_broadcast(&self, error: impl Into<MockError>) {
        self.state().broadcast_failures.push_back(error.into());
    }

    /// Delay every broadcast, widening the window for interleaving.
    pub fn set_broadcast_latency(&self, latency: Duration) {
        self.state().broadcast_latency = Some(latency);
    }

    /// Mine every accepted broadcast immediately in a new block.
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state().auto_mine = auto_mine;
    }

    pub fn broadcasts(&self) -> Vec<SignedEnvelope> {
        self.state().broadcasts.clone()
    }

    pub fn broadcast_nonces(&self) -> Vec<u64> {
        self.state().broadcasts.iter().map(|e| e.nonce).collect()
    }

    /// Largest number of broadcasts that were in progress at once.
    pub fn max_concurrent_broadcasts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Mark `tx_hash` mined in a new block.
    pub fn mine(&self, tx_hash: B256) -> MinedReceipt {
        let mut state = self.state();
        state.block_number += 1;
        let receipt = MinedReceipt {
            tx_hash,
            block_number: state.block_number,
            success: true,
        };
        state.receipts.insert(tx_hash, receipt);
        receipt
    }

    // ------------------------------------------------------------------
    // Read-only calls
    // ------------------------------------------------------------------

    pub fn push_call_result(&self, result: Result<Bytes, MockError>) {
        self.state().call_results.push_back(result);
    }

    pub fn calls(&self) -> Vec<(Address, Bytes, BlockId)> {
        self.state().calls.clone()
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Store `log` and push it to every live subscription it matches.
    pub fn emit_log(&self, log: Log) {
        let mut state = self.state();
        state.live.retain(|(filter, sender)| {
            if filter.matches(&log) {
                sender.send(Ok(log.clone())).is_ok()
            } else {
                !sender.is_closed()
            }
        });
        state.logs.push(log);
    }

    /// Store `log` without pushing it anywhere.
    pub fn insert_log(&self, log: Log) {
        self.state().logs.push(log);
    }

    pub fn filter_queries(&self) -> Vec<(u64, u64)> {
        self.state().filter_queries.clone()
    }

    pub fn fail_next_filter(&self, error: impl Into<MockError>) {
        self.state().filter_failures.push_back(error.into());
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Refuse the next `count` subscription attempts.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.state().subscribe_failures += count;
    }

    /// Keep current live subscriptions open but stop pushing to them.
    pub fn stall_live(&self) {
        let mut state = self.state();
        let live = std::mem::take(&mut state.live);
        state.stalled.extend(live);
    }

    /// Push an error into every live subscription and forget them.
    pub fn break_live(&self, message: &str) {
        let mut state = self.state();
        for (_, sender) in state.live.drain(..) {
            let _ = sender.send(Err(TransportErrorKind::custom_str(message)));
        }
    }

    /// Close every live and stalled subscription.
    pub fn close_live(&self) {
        let mut state = self.state();
        state.live.clear();
        state.stalled.clear();
    }

    /// Live subscriptions whose consumer is still attached.
    pub fn live_subscribers(&self) -> usize {
        self.state()
            .live
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }
}

struct InFlight<'a>(&'a MockTransport);

impl<'a> InFlight<'a> {
    fn enter(transport: &'a MockTransport) -> Self {
        let now = transport.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(transport)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn chain_id(&self) -> TransportResult<u64> {
        Ok(self.state().chain_id)
    }

    async fn block_number(&self) -> TransportResult<u64> {
        Ok(self.state().block_number)
    }

    async fn transaction_count(&self, address: Address) -> TransportResult<u64> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.nonce_failures.pop_front() {
            return Err(error.into_error());
        }
        Ok(state.nonces.get(&address).copied().unwrap_or_default())
    }

    async fn broadcast(&self, envelope: &SignedEnvelope) -> TransportResult<B256> {
        let _in_flight = InFlight::enter(self);
        let latency = self.state().broadcast_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(error) = state.broadcast_failures.pop_front() {
            return Err(error.into_error());
        }
        state.broadcasts.push(envelope.clone());
        if state.auto_mine {
            state.block_number += 1;
            let receipt = MinedReceipt {
                tx_hash: envelope.tx_hash,
                block_number: state.block_number,
                success: true,
            };
            state.receipts.insert(envelope.tx_hash, receipt);
        }
        Ok(envelope.tx_hash)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> TransportResult<Option<MinedReceipt>> {
        Ok(self.state().receipts.get(&tx_hash).copied())
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> TransportResult<Bytes> {
        let mut state = self.state();
        state.calls.push((to, data, block));
        match state.call_results.pop_front() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(error)) => Err(error.into_error()),
            None => Ok(Bytes::new()),
        }
    }

    async fn filter_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> TransportResult<Vec<Log>> {
        let mut state = self.state();
        state.filter_queries.push((from, to));
        if let Some(error) = state.filter_failures.pop_front() {
            return Err(error.into_error());
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .is_some_and(|block| (from..=to).contains(&block))
                    && filter.matches(log)
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> TransportResult<LogStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(TransportErrorKind::custom_str("connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.live.push((filter.clone(), tx));
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

// ============================================================================
// MockSigner
// ============================================================================

/// Gas limit the mock signer "estimates" when none is given.
pub const ESTIMATED_GAS: u64 = 100_000;

/// Deterministic signer for one account.
pub struct MockSigner {
    address: Address,
    signed: Mutex<Vec<UnsignedTx>>,
    estimate_failures: Mutex<VecDeque<MockError>>,
}

impl MockSigner {
    pub fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            signed: Mutex::new(Vec::new()),
            estimate_failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Every transaction signed so far, in order.
    pub fn signed(&self) -> Vec<UnsignedTx> {
        self.signed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Make the next gas estimation fail.
    pub fn fail_next_estimate(&self, error: impl Into<MockError>) {
        self.estimate_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(error.into());
    }
}

#[async_trait]
impl TxSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: UnsignedTx) -> Result<SignedEnvelope, SignerError> {
        if tx.gas_limit.is_none() {
            let failure = self
                .estimate_failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            if let Some(error) = failure {
                return Err(SignerError::Estimate(error.into_error()));
            }
        }
        let gas_limit = tx.gas_limit.unwrap_or(ESTIMATED_GAS);

        let mut raw = Vec::new();
        raw.extend_from_slice(self.address.as_slice());
        raw.extend_from_slice(&tx.chain_id.to_be_bytes());
        raw.extend_from_slice(&tx.nonce.to_be_bytes());
        raw.extend_from_slice(tx.to.as_slice());
        raw.extend_from_slice(&tx.value.to_be_bytes::<32>());
        raw.extend_from_slice(&gas_limit.to_be_bytes());
        raw.extend_from_slice(&tx.fee_multiplier.to_bits().to_be_bytes());
        raw.extend_from_slice(&tx.data);

        let envelope = SignedEnvelope {
            tx_hash: keccak256(&raw),
            raw: raw.into(),
            nonce: tx.nonce,
            gas_limit,
        };
        self.signed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        Ok(envelope)
    }
}
