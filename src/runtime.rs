//! Chain runtime facade.
//!
//! Wires the transport, signer and codec into a submitter, an event stream
//! and a height tracker that share one observer and one root cancellation
//! token:
//!
//! ```text
//! ChainRuntime (root token)
//!  ├── TransactionSubmitter ── mining monitor per tx   (child tokens)
//!  ├── EventStream ─────────── 2 tasks per subscription (child tokens)
//!  └── BlockHeightTracker ──── optional poller          (child token)
//! ```
//!
//! `shutdown()` cancels the root; every background task stops at its next
//! check point.

use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ext::{
    BlockHeightTracker, CallCodec, ErrorResolver, EventStream, NonceRegistry, RuntimeConfig,
    RuntimeObserver, TracingObserver, TransactionSubmitter, Transport, TxSigner,
};

pub struct RuntimeBuilder {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn TxSigner>,
    codec: Arc<dyn CallCodec>,
    config: RuntimeConfig,
    observer: Arc<dyn RuntimeObserver>,
    resolver: Option<ErrorResolver>,
    nonces: Option<NonceRegistry>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Error resolver (default: every catalogue registered with
    /// `register_contract_errors!`).
    pub fn resolver(mut self, resolver: ErrorResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Share account mutexes with another runtime signing for the same
    /// account.
    pub fn nonce_registry(mut self, nonces: NonceRegistry) -> Self {
        self.nonces = Some(nonces);
        self
    }

    pub fn build(self) -> ChainRuntime {
        let cancel = CancellationToken::new();
        let RuntimeConfig {
            submit,
            mining,
            subscription,
            backoff,
            height,
        } = self.config;

        let height = Arc::new(BlockHeightTracker::new(self.transport.clone(), height));

        let mut submitter =
            TransactionSubmitter::new(self.transport.clone(), self.signer, self.codec)
                .with_config(submit)
                .with_mining(mining)
                .with_observer(self.observer.clone())
                .with_cancellation(cancel.child_token());
        if let Some(resolver) = self.resolver {
            submitter = submitter.with_resolver(resolver);
        }
        if let Some(nonces) = self.nonces {
            submitter = submitter.with_nonce_registry(nonces);
        }

        let events = EventStream::new(self.transport, height.clone())
            .with_observer(self.observer)
            .with_backoff(backoff)
            .with_options(subscription)
            .with_cancellation(cancel.child_token());

        tracing::info!(address = %submitter.address(), "chain runtime started");

        ChainRuntime {
            submitter,
            events,
            height,
            cancel,
        }
    }
}

/// Everything needed to interact with one external chain from one account.
#[derive(Debug)]
pub struct ChainRuntime {
    submitter: TransactionSubmitter,
    events: EventStream,
    height: Arc<BlockHeightTracker>,
    cancel: CancellationToken,
}

impl ChainRuntime {
    pub fn builder(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn TxSigner>,
        codec: Arc<dyn CallCodec>,
    ) -> RuntimeBuilder {
        RuntimeBuilder {
            transport,
            signer,
            codec,
            config: RuntimeConfig::default(),
            observer: Arc::new(TracingObserver),
            resolver: None,
            nonces: None,
        }
    }

    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn TxSigner>,
        codec: Arc<dyn CallCodec>,
        config: RuntimeConfig,
    ) -> Self {
        Self::builder(transport, signer, codec).config(config).build()
    }

    pub fn address(&self) -> Address {
        self.submitter.address()
    }

    pub fn submitter(&self) -> &TransactionSubmitter {
        &self.submitter
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn height(&self) -> &Arc<BlockHeightTracker> {
        &self.height
    }

    /// Keep the height tracker fresh in the background.
    pub fn spawn_height_poller(&self, period: Duration) -> JoinHandle<()> {
        self.height.spawn_poller(period, self.cancel.child_token())
    }

    /// Token cancelled on shutdown; use it to tie caller tasks to the
    /// runtime's lifetime.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Abandon every mining monitor and stop every subscription.
    pub fn shutdown(&self) {
        tracing::info!(address = %self.address(), "chain runtime shutting down");
        self.cancel.cancel();
    }
}
