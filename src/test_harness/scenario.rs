//! Test fixtures and the submission scenario framework.
//!
//! [`RuntimeHarness`] wires a [`ChainRuntime`] to the in-memory transport and
//! signer with a [`RecordingObserver`], using a small token contract ABI.
//! [`SubmissionScenario`] runs a sequence of submissions, some with injected
//! broadcast failures, and checks the nonce each one ends up with.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::{
    dyn_abi::{DynSolValue, JsonAbiExt},
    json_abi::JsonAbi,
    primitives::{address, keccak256, Address, B256, U256},
    rpc::types::Log,
    sol,
    sol_types::SolEvent,
};
use anyhow::{anyhow, bail, Result};

use crate::ext::{
    CallRequest, ChainRuntime, CodecError, ErrorResolver, JsonAbiCodec, RuntimeConfig,
    RuntimeObserver, SubmitError, TransactionSubmitter,
};

use super::{MockError, MockSigner, MockTransport};

pub const ALICE: Address = address!("00000000000000000000000000000000000a11ce");
pub const BOB: Address = address!("0000000000000000000000000000000000000b0b");
pub const TOKEN: Address = address!("000000000000000000000000000000000000700c");

pub const TOKEN_ABI: [&str; 5] = [
    "function transferA(address to, uint256 amount)",
    "function transferB(address to, uint256 amount)",
    "function balanceOf(address account) returns (uint256)",
    "error InsufficientBalance(uint256 available, uint256 required)",
    "event Transfer(address indexed from, address indexed to, uint256 value)",
];

sol! {
    #[derive(Debug, PartialEq, Eq)]
    event Transfer(address indexed from, address indexed to, uint256 value);
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn token_codec() -> JsonAbiCodec {
    JsonAbiCodec::parse("Token", TOKEN_ABI).unwrap()
}

pub fn transfer_a(to: Address, amount: u64) -> CallRequest {
    CallRequest::new(TOKEN, "transferA")
        .arg(to)
        .arg(U256::from(amount))
}

pub fn transfer_b(to: Address, amount: u64) -> CallRequest {
    CallRequest::new(TOKEN, "transferB")
        .arg(to)
        .arg(U256::from(amount))
}

pub fn balance_of(account: Address) -> CallRequest {
    CallRequest::new(TOKEN, "balanceOf").arg(account)
}

/// Revert data for `InsufficientBalance(available, required)`.
pub fn insufficient_balance(available: u64, required: u64) -> Vec<u8> {
    let abi = JsonAbi::parse(TOKEN_ABI).unwrap();
    let error = abi.errors().next().unwrap();
    error
        .abi_encode_input(&[
            DynSolValue::Uint(U256::from(available), 256),
            DynSolValue::Uint(U256::from(required), 256),
        ])
        .unwrap()
}

/// A mined `Transfer` log emitted by [`TOKEN`].
pub fn transfer_log(block_number: u64, log_index: u64, value: u64) -> Log {
    let data = Transfer {
        from: ALICE,
        to: BOB,
        value: U256::from(value),
    }
    .encode_log_data();
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&block_number.to_be_bytes());
    seed[8..].copy_from_slice(&log_index.to_be_bytes());
    Log {
        inner: alloy::primitives::Log {
            address: TOKEN,
            data,
        },
        block_number: Some(block_number),
        block_hash: Some(B256::with_last_byte(block_number as u8)),
        transaction_hash: Some(keccak256(seed)),
        log_index: Some(log_index),
        ..Default::default()
    }
}

/// A log carrying the `Transfer` topic but a body that cannot be decoded.
pub fn garbled_transfer_log(block_number: u64, log_index: u64) -> Log {
    let mut log = transfer_log(block_number, log_index, 0);
    log.inner.data = alloy::primitives::LogData::new_unchecked(
        vec![Transfer::SIGNATURE_HASH],
        vec![0xff; 3].into(),
    );
    log
}

// ============================================================================
// RecordingObserver
// ============================================================================

/// One observer callback, as recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Broadcast { nonce: u64, tx_hash: B256 },
    Rebroadcast { nonce: u64, attempt: u32, tx_hash: B256 },
    RebroadcastFailed { nonce: u64, attempt: u32, error: String },
    Mined { nonce: u64, tx_hash: B256, block_number: u64 },
    ResubscribeFailure { attempt: u32, delay: Duration },
    ResubscribeAlert { disconnected_for: Duration },
    Resubscribed { attempts: u32 },
    BackfillFailed(String),
    Delivered { count: usize, through_block: u64 },
    DecodeFailure { block_number: u64, log_index: u64 },
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Observed) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, predicate: impl Fn(&Observed) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }

    pub fn alerts(&self) -> usize {
        self.count(|e| matches!(e, Observed::ResubscribeAlert { .. }))
    }

    pub fn resubscribe_delays(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::ResubscribeFailure { delay, .. } => Some(delay),
                _ => None,
            })
            .collect()
    }
}

impl RuntimeObserver for RecordingObserver {
    fn on_broadcast(&self, _address: Address, nonce: u64, tx_hash: B256) {
        self.push(Observed::Broadcast { nonce, tx_hash });
    }

    fn on_rebroadcast(&self, _address: Address, nonce: u64, attempt: u32, tx_hash: B256) {
        self.push(Observed::Rebroadcast {
            nonce,
            attempt,
            tx_hash,
        });
    }

    fn on_rebroadcast_failed(
        &self,
        _address: Address,
        nonce: u64,
        attempt: u32,
        error: &dyn std::fmt::Display,
    ) {
        self.push(Observed::RebroadcastFailed {
            nonce,
            attempt,
            error: error.to_string(),
        });
    }

    fn on_mined(&self, _address: Address, nonce: u64, tx_hash: B256, block_number: u64) {
        self.push(Observed::Mined {
            nonce,
            tx_hash,
            block_number,
        });
    }

    fn on_resubscribe_failure(
        &self,
        _subscription: &str,
        attempt: u32,
        delay: Duration,
        _error: &dyn std::fmt::Display,
    ) {
        self.push(Observed::ResubscribeFailure { attempt, delay });
    }

    fn on_resubscribe_alert(&self, _subscription: &str, disconnected_for: Duration) {
        self.push(Observed::ResubscribeAlert { disconnected_for });
    }

    fn on_resubscribed(&self, _subscription: &str, attempts: u32) {
        self.push(Observed::Resubscribed { attempts });
    }

    fn on_backfill_failed(&self, _subscription: &str, error: &dyn std::fmt::Display) {
        self.push(Observed::BackfillFailed(error.to_string()));
    }

    fn on_events_delivered(&self, _subscription: &str, count: usize, through_block: u64) {
        self.push(Observed::Delivered {
            count,
            through_block,
        });
    }

    fn on_decode_failure(
        &self,
        _subscription: &str,
        block_number: u64,
        log_index: u64,
        _error: &CodecError,
    ) {
        self.push(Observed::DecodeFailure {
            block_number,
            log_index,
        });
    }
}

// ============================================================================
// RuntimeHarness
// ============================================================================

/// A runtime for [`ALICE`] on top of the in-memory transport.
pub struct RuntimeHarness {
    pub transport: Arc<MockTransport>,
    pub signer: Arc<MockSigner>,
    pub observer: Arc<RecordingObserver>,
    pub runtime: ChainRuntime,
}

impl RuntimeHarness {
    pub fn new(config: RuntimeConfig) -> Self {
        let transport = MockTransport::new();
        let signer = MockSigner::new(ALICE);
        let observer = RecordingObserver::new();
        let runtime = ChainRuntime::builder(
            transport.clone(),
            signer.clone(),
            Arc::new(token_codec()),
        )
        .config(config)
        .observer(observer.clone())
        .resolver(ErrorResolver::new())
        .build();

        Self {
            transport,
            signer,
            observer,
            runtime,
        }
    }

    pub fn address(&self) -> Address {
        self.runtime.address()
    }

    pub fn submitter(&self) -> &TransactionSubmitter {
        self.runtime.submitter()
    }

    /// Cached next nonce of [`ALICE`].
    pub async fn cached_nonce(&self) -> Option<u64> {
        self.submitter().nonces().peek(ALICE).await
    }
}

// ============================================================================
// SubmissionScenario
// ============================================================================

/// What happens to one submission
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitAction {
    /// Broadcast accepted
    Accept,
    /// Broadcast rejected with this transport error
    Reject(MockError),
}

/// One submission in a scenario
#[derive(Debug, Clone)]
pub struct SubmitStep {
    pub name: String,
    pub request: CallRequest,
    pub action: SubmitAction,
    /// Nonce the submission should use; `None` expects an error
    pub expected_nonce: Option<u64>,
}

impl SubmitStep {
    pub fn accept(name: impl Into<String>, request: CallRequest, nonce: u64) -> Self {
        Self {
            name: name.into(),
            request,
            action: SubmitAction::Accept,
            expected_nonce: Some(nonce),
        }
    }

    pub fn reject(name: impl Into<String>, request: CallRequest, error: impl Into<MockError>) -> Self {
        Self {
            name: name.into(),
            request,
            action: SubmitAction::Reject(error.into()),
            expected_nonce: None,
        }
    }
}

/// Outcome of a scenario run
#[derive(Debug)]
pub struct ScenarioResult {
    pub outcomes: Vec<(String, Result<u64, SubmitError>)>,
    pub final_nonce: Option<u64>,
}

/// Sequential submissions from one account starting at a given chain nonce.
///
/// # Example
///
/// ```ignore
/// SubmissionScenario::new("retry after failed broadcast", 3)
///     .submit(SubmitStep::reject("first", transfer_a(BOB, 1), "connection reset"))
///     .submit(SubmitStep::accept("retry", transfer_a(BOB, 1), 3))
///     .expect_final_nonce(4)
///     .run(&harness)
///     .await
///     .unwrap();
/// ```
pub struct SubmissionScenario {
    name: String,
    chain_nonce: u64,
    steps: Vec<SubmitStep>,
    final_nonce: Option<u64>,
}

impl SubmissionScenario {
    pub fn new(name: impl Into<String>, chain_nonce: u64) -> Self {
        Self {
            name: name.into(),
            chain_nonce,
            steps: Vec::new(),
            final_nonce: None,
        }
    }

    pub fn submit(mut self, step: SubmitStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn expect_final_nonce(mut self, nonce: u64) -> Self {
        self.final_nonce = Some(nonce);
        self
    }

    pub async fn run(self, harness: &RuntimeHarness) -> Result<ScenarioResult> {
        tracing::info!(scenario = %self.name, submissions = self.steps.len(), "running scenario");
        harness.transport.set_nonce(harness.address(), self.chain_nonce);

        let mut outcomes = Vec::new();
        for step in self.steps {
            if let SubmitAction::Reject(error) = &step.action {
                harness.transport.fail_next_broadcast(error.clone());
            }

            let outcome = harness
                .submitter()
                .submit(step.request)
                .await
                .map(|handle| handle.nonce());

            match (&outcome, step.expected_nonce) {
                (Ok(nonce), Some(expected)) if *nonce != expected => {
                    bail!("{}: used nonce {nonce}, expected {expected}", step.name)
                }
                (Ok(nonce), None) => bail!("{}: expected failure, used nonce {nonce}", step.name),
                (Err(e), Some(_)) => bail!("{}: unexpected failure: {e}", step.name),
                _ => {}
            }
            outcomes.push((step.name, outcome));
        }

        let final_nonce = harness.cached_nonce().await;
        if let Some(expected) = self.final_nonce {
            if final_nonce != Some(expected) {
                return Err(anyhow!(
                    "{}: cached nonce {final_nonce:?}, expected {expected}",
                    self.name
                ));
            }
        }

        Ok(ScenarioResult {
            outcomes,
            final_nonce,
        })
    }
}
