//! Chain RPC seam.
//!
//! The runtime talks to the external chain only through [`Transport`]. The
//! production adapter, [`ProviderTransport`], wraps any alloy `Provider`; the
//! test harness ships an in-memory mock.

use alloy::{
    eips::BlockId,
    network::{ReceiptResponse, TransactionBuilder},
    primitives::{Address, Bytes, B256},
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    rpc::types::{Filter, Log, TransactionRequest},
    transports::{TransportError, TransportResult},
};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};

use crate::ext::SignedEnvelope;

/// Stream of logs pushed by a live subscription. It ends when the
/// subscription closes; an `Err` item means the subscription broke.
pub type LogStream = BoxStream<'static, Result<Log, TransportError>>;

/// Receipt summary for a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinedReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    /// Whether execution succeeded
    pub success: bool,
}

// ============================================================================
// LogFilter
// ============================================================================

/// Address and topic predicates of a log query or subscription.
///
/// Topic 0 is the event signature; topics 1 to 3 are the indexed fields. A
/// `None` position matches anything, a set matches any of its values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Option<Address>,
    pub topic0: Option<B256>,
    pub topics: [Option<Vec<B256>>; 3],
}

impl LogFilter {
    pub fn new(address: Address) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    /// Filter on logs from any address.
    pub fn any_address() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, topic0: B256) -> Self {
        self.topic0 = Some(topic0);
        self
    }

    /// Match indexed field `index` (1..=3) against any of `values`.
    ///
    /// Out-of-range indices are ignored.
    pub fn with_topic(mut self, index: usize, values: impl IntoIterator<Item = B256>) -> Self {
        if let Some(slot) = index
            .checked_sub(1)
            .and_then(|i| self.topics.get_mut(i))
        {
            slot.get_or_insert_with(Vec::new).extend(values);
        }
        self
    }

    /// Whether `log` satisfies every predicate.
    pub fn matches(&self, log: &Log) -> bool {
        if self.address.is_some_and(|address| address != log.address()) {
            return false;
        }
        let topics = log.topics();
        if let Some(topic0) = self.topic0 {
            if topics.first() != Some(&topic0) {
                return false;
            }
        }
        self.topics.iter().enumerate().all(|(i, wanted)| match wanted {
            None => true,
            Some(values) => topics
                .get(i + 1)
                .is_some_and(|topic| values.contains(topic)),
        })
    }

    /// Convert to an alloy filter over `from..=to`.
    pub fn to_filter(&self, from: u64, to: u64) -> Filter {
        self.live_filter().from_block(from).to_block(to)
    }

    /// Convert to an alloy filter without a block range.
    pub fn live_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if let Some(address) = self.address {
            filter = filter.address(address);
        }
        if let Some(topic0) = self.topic0 {
            filter = filter.event_signature(topic0);
        }
        let [t1, t2, t3] = &self.topics;
        if let Some(values) = t1 {
            filter = filter.topic1(values.clone());
        }
        if let Some(values) = t2 {
            filter = filter.topic2(values.clone());
        }
        if let Some(values) = t3 {
            filter = filter.topic3(values.clone());
        }
        filter
    }
}

// ============================================================================
// Transport
// ============================================================================

/// RPC operations the runtime needs from the external chain.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn chain_id(&self) -> TransportResult<u64>;

    async fn block_number(&self) -> TransportResult<u64>;

    /// Next nonce of `address`, pending transactions included.
    async fn transaction_count(&self, address: Address) -> TransportResult<u64>;

    /// Send a signed envelope; returns the transaction hash the node reports.
    async fn broadcast(&self, envelope: &SignedEnvelope) -> TransportResult<B256>;

    async fn get_transaction_receipt(&self, tx_hash: B256)
        -> TransportResult<Option<MinedReceipt>>;

    /// Read-only call against `block`.
    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> TransportResult<Bytes>;

    /// Logs matching `filter` in `from..=to`.
    async fn filter_logs(&self, filter: &LogFilter, from: u64, to: u64)
        -> TransportResult<Vec<Log>>;

    /// Open a push subscription for logs matching `filter`.
    async fn subscribe_logs(&self, filter: &LogFilter) -> TransportResult<LogStream>;
}

// ============================================================================
// ProviderTransport
// ============================================================================

/// [`Transport`] over an alloy provider.
///
/// Log subscriptions need a pubsub connection (`connect_ws`); over HTTP,
/// `subscribe_logs` fails and the event engine keeps retrying it while the
/// backfill leg carries delivery alone.
#[derive(Debug, Clone)]
pub struct ProviderTransport<P> {
    provider: P,
}

impl<P: Provider> ProviderTransport<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl ProviderTransport<DynProvider> {
    /// Connect over HTTP.
    pub fn connect_http(rpc_url: &str) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(rpc_url.parse()?);
        Ok(Self::new(provider.erased()))
    }

    /// Connect over a websocket, enabling live log subscriptions.
    pub async fn connect_ws(rpc_url: &str) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_ws(WsConnect::new(rpc_url))
            .await?;
        Ok(Self::new(provider.erased()))
    }
}

#[async_trait]
impl<P: Provider + 'static> Transport for ProviderTransport<P> {
    async fn chain_id(&self) -> TransportResult<u64> {
        self.provider.get_chain_id().await
    }

    async fn block_number(&self) -> TransportResult<u64> {
        self.provider.get_block_number().await
    }

    async fn transaction_count(&self, address: Address) -> TransportResult<u64> {
        self.provider.get_transaction_count(address).pending().await
    }

    async fn broadcast(&self, envelope: &SignedEnvelope) -> TransportResult<B256> {
        let pending = self.provider.send_raw_transaction(&envelope.raw).await?;
        Ok(*pending.tx_hash())
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> TransportResult<Option<MinedReceipt>> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        Ok(receipt.and_then(|receipt| {
            receipt.block_number().map(|block_number| MinedReceipt {
                tx_hash,
                block_number,
                success: receipt.status(),
            })
        }))
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> TransportResult<Bytes> {
        let request = TransactionRequest::default().with_to(to).with_input(data);
        self.provider.call(request).block(block).await
    }

    async fn filter_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> TransportResult<Vec<Log>> {
        self.provider.get_logs(&filter.to_filter(from, to)).await
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> TransportResult<LogStream> {
        let subscription = self.provider.subscribe_logs(&filter.live_filter()).await?;
        Ok(subscription.into_stream().map(Ok).boxed())
    }
}
