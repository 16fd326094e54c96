//! Transaction submission and read-only calls.
//!
//! ## Submission
//!
//! ```text
//! submit(request)
//!     │  resolve overrides (usage errors fail here, before any RPC)
//!     ▼
//! lock account mutex ─► nonce ─► encode ─► sign ─► broadcast
//!     │                                               │
//!     │          failure: resolve error, nonce kept ◄─┤
//!     │                                               ▼
//!     │                              increment nonce, spawn mining monitor
//!     ▼
//! unlock, return TxHandle
//! ```
//!
//! Exactly one broadcast happens on the synchronous path. Replacements are the
//! mining monitor's business and go through the same encode/sign/broadcast
//! step ([`SubmitCore::sign_and_broadcast`]) with the nonce fixed.

use std::sync::Arc;

use alloy::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes},
    transports::TransportError,
};
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::{
    ext::{
        classify_rpc_error, revert_data, BlockTag, CallCodec, CallError, CallRequest,
        ErrorResolver, MiningConfig, NonceRegistry, ResolvedError, RpcErrorKind,
        RuntimeObserver, SignedEnvelope, SignerError, SubmitConfig, SubmitError, TracingObserver,
        Transport, TxHandle, TxOptions, TxSigner, TxStatus, UnsignedTx,
    },
    monitor::MiningMonitor,
};

// ============================================================================
// SubmitCore
// ============================================================================

/// Collaborators shared by the submitter and its mining monitors.
pub(crate) struct SubmitCore {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) signer: Arc<dyn TxSigner>,
    pub(crate) codec: Arc<dyn CallCodec>,
    pub(crate) resolver: ErrorResolver,
    pub(crate) observer: Arc<dyn RuntimeObserver>,
    chain_id: OnceCell<u64>,
}

impl SubmitCore {
    pub(crate) fn address(&self) -> Address {
        self.signer.address()
    }

    /// Chain id, fetched once and cached.
    pub(crate) async fn chain_id(&self) -> Result<u64, TransportError> {
        self.chain_id
            .get_or_try_init(|| self.transport.chain_id())
            .await
            .copied()
    }

    /// Encode, sign and broadcast `request` with a fixed nonce.
    ///
    /// `fee_multiplier` is 1.0 for the original broadcast; replacements pass
    /// the bump for their attempt.
    pub(crate) async fn sign_and_broadcast(
        &self,
        request: &CallRequest,
        options: &TxOptions,
        nonce: u64,
        fee_multiplier: f64,
    ) -> Result<SignedEnvelope, SubmitError> {
        let chain_id = self.chain_id().await.map_err(SubmitError::ChainId)?;
        let data = self.codec.encode_call(&request.method, &request.args)?;

        let unsigned = UnsignedTx {
            chain_id,
            nonce,
            to: request.to,
            data,
            value: options.value,
            gas_limit: options.gas_limit,
            fee_multiplier,
        };
        let envelope = match self.signer.sign(unsigned).await {
            Ok(envelope) => envelope,
            // Gas estimation runs the call, so reverts usually surface here
            Err(SignerError::Estimate(error)) => {
                return Err(match self.resolve(error, request) {
                    ResolvedError::Decoded(error) => SubmitError::Reverted { nonce, error },
                    ResolvedError::Raw(error) => SubmitError::Sign(SignerError::Estimate(error)),
                })
            }
            Err(error) => return Err(error.into()),
        };

        if let Err(error) = self.transport.broadcast(&envelope).await {
            return Err(match self.resolve(error, request) {
                ResolvedError::Decoded(error) => SubmitError::Reverted { nonce, error },
                ResolvedError::Raw(source) => SubmitError::Broadcast { nonce, source },
            });
        }
        Ok(envelope)
    }

    /// Try the call's own codec first, then the resolver's catalogues.
    pub(crate) fn resolve(&self, error: TransportError, request: &CallRequest) -> ResolvedError {
        if let Some(decoded) = revert_data(&error).and_then(|data| self.codec.decode_error(&data)) {
            return ResolvedError::Decoded(decoded);
        }
        self.resolver.resolve(error, self.address(), request)
    }
}

// ============================================================================
// TransactionSubmitter
// ============================================================================

/// Submits contract calls from one signing account.
///
/// Cheap to clone; clones share the account mutex, the chain id cache and the
/// mining monitors' cancellation scope.
#[derive(Clone)]
pub struct TransactionSubmitter {
    core: Arc<SubmitCore>,
    nonces: NonceRegistry,
    config: SubmitConfig,
    mining: MiningConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TransactionSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSubmitter")
            .field("address", &self.core.address())
            .field("config", &self.config)
            .field("mining", &self.mining)
            .field("resolver", &self.core.resolver)
            .finish()
    }
}

impl TransactionSubmitter {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn TxSigner>,
        codec: Arc<dyn CallCodec>,
    ) -> Self {
        Self {
            core: Arc::new(SubmitCore {
                transport,
                signer,
                codec,
                resolver: ErrorResolver::with_registered(),
                observer: Arc::new(TracingObserver),
                chain_id: OnceCell::new(),
            }),
            nonces: NonceRegistry::new(),
            config: SubmitConfig::default(),
            mining: MiningConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the error resolver (default: every registered catalogue).
    pub fn with_resolver(mut self, resolver: ErrorResolver) -> Self {
        self.rebuild_core(|core| core.resolver = resolver);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.rebuild_core(|core| core.observer = observer);
        self
    }

    pub fn with_config(mut self, config: SubmitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mining(mut self, mining: MiningConfig) -> Self {
        self.mining = mining;
        self
    }

    /// Share account mutexes with other submitters signing for the same
    /// accounts.
    pub fn with_nonce_registry(mut self, nonces: NonceRegistry) -> Self {
        self.nonces = nonces;
        self
    }

    /// Attach mining monitors to `cancel`; cancelling it abandons them all.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn rebuild_core(&mut self, f: impl FnOnce(&mut SubmitCore)) {
        let mut core = SubmitCore {
            transport: self.core.transport.clone(),
            signer: self.core.signer.clone(),
            codec: self.core.codec.clone(),
            resolver: self.core.resolver.clone(),
            observer: self.core.observer.clone(),
            chain_id: self.core.chain_id.clone(),
        };
        f(&mut core);
        self.core = Arc::new(core);
    }

    /// Signing account.
    pub fn address(&self) -> Address {
        self.core.address()
    }

    pub fn nonces(&self) -> &NonceRegistry {
        &self.nonces
    }

    /// Sign and broadcast `request`, returning once the node accepts it.
    ///
    /// Submissions from the same account are serialized and take consecutive
    /// nonces in entry order. On any error the cached nonce is left as it was,
    /// so the next submission reuses it. A nonce override bypasses the
    /// sequence but still holds the account mutex.
    pub async fn submit(&self, request: CallRequest) -> Result<TxHandle, SubmitError> {
        let overrides = request.overrides()?;
        let options = TxOptions::resolve(&self.config, overrides);
        let address = self.address();

        let sequencer = self.nonces.sequencer(address);
        let mut sequencer = sequencer.lock().await;

        let nonce = match options.nonce {
            Some(nonce) => nonce,
            None => sequencer
                .current_nonce(self.core.transport.as_ref())
                .await
                .map_err(|source| SubmitError::Nonce { address, source })?,
        };

        let envelope = match self
            .core
            .sign_and_broadcast(&request, &options, nonce, 1.0)
            .await
        {
            Ok(envelope) => envelope,
            Err(error) => {
                if error.kind() == Some(RpcErrorKind::NonceTooLow) && options.nonce.is_none() {
                    // Someone else used this nonce; reload before the next submission
                    sequencer.resync();
                }
                tracing::debug!(%address, nonce, method = %request.method, error = %error, "submission failed");
                return Err(error);
            }
        };

        match options.nonce {
            Some(custom) => sequencer.observe_used(custom),
            None => sequencer.increment_nonce(),
        }
        drop(sequencer);

        self.core
            .observer
            .on_broadcast(address, nonce, envelope.tx_hash);

        let request = Arc::new(request);
        let (status_tx, status_rx) = watch::channel(TxStatus::Pending {
            attempt: 0,
            tx_hash: envelope.tx_hash,
        });
        let cancel = self.cancel.child_token();
        let handle = TxHandle::new(address, envelope.clone(), request.clone(), status_rx, cancel.clone());

        if self.mining.enabled {
            let monitor = MiningMonitor::new(
                Arc::downgrade(&self.core),
                self.mining.clone(),
                request,
                options,
                envelope,
                status_tx,
                cancel,
            );
            tokio::spawn(monitor.run());
        }

        Ok(handle)
    }

    /// Run `request` as a read-only call against `block` (latest when
    /// `None`). Never touches the nonce or the account mutex.
    pub async fn call_at_block(
        &self,
        request: &CallRequest,
        block: impl Into<BlockTag>,
    ) -> Result<Vec<DynSolValue>, CallError> {
        let data = self.call_raw(request, block).await?;
        Ok(self
            .core
            .codec
            .decode_output(&request.method, request.args.len(), &data)?)
    }

    /// Like [`call_at_block`](Self::call_at_block) but returns undecoded
    /// return data.
    pub async fn call_raw(
        &self,
        request: &CallRequest,
        block: impl Into<BlockTag>,
    ) -> Result<Bytes, CallError> {
        let data = self.core.codec.encode_call(&request.method, &request.args)?;
        let block: BlockTag = block.into();
        self.core
            .transport
            .call(request.to, data, block.into())
            .await
            .map_err(|error| match self.core.resolve(error, request) {
                ResolvedError::Decoded(decoded) => CallError::Reverted(decoded),
                ResolvedError::Raw(error) => {
                    tracing::debug!(
                        to = %request.to,
                        method = %request.method,
                        kind = ?classify_rpc_error(&error),
                        error = %error,
                        "call failed"
                    );
                    CallError::Transport(error)
                }
            })
    }
}
