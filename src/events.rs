//! Event stream engine.
//!
//! Every subscription merges two legs into one ordered delivery:
//!
//! ```text
//!            live watcher task                     delivery task
//!   ┌──────────────────────────────┐      ┌───────────────────────────────────┐
//!   │ subscribe_logs ──► pump logs │─────►│ gap open?  hold live logs         │
//!   │      ▲                │      │ mpsc │ gap closed: deliver immediately   │
//!   │      │   fail/close/stall    │      │                                   │
//!   │      └── backoff ◄────┘      │      │ every tick (and on reconnect):    │
//!   └──────────────────────────────┘      │  range query [h - past_blocks, h] │
//!                                         │  + held logs, sort, drop <= cursor│
//!                                         │  deliver, close gap               │
//!                                         └───────────────────────────────────┘
//! ```
//!
//! The delivery task owns a `(block, log_index)` cursor and normally only
//! delivers keys above it, so a consumer sees records in ascending order
//! across both legs. The gap opens whenever the live leg (re)connects; logs it
//! pushes are held until the next backfill has covered whatever was missed
//! while it was down. Nothing emitted within `past_blocks` of the head during
//! an outage is lost.
//!
//! Two cases trade ordering for delivery. When the backfill fails, held logs
//! go out at the next tick (or as soon as `channel_capacity` of them pile up)
//! and the eventual backfill delivers what was missed below them. When the
//! live leg reports a log as removed, the cursor moves back before its block.
//! Either way a consumer may see an earlier key or the same record again;
//! `(tx_hash, log_index)` identifies duplicates.

use std::sync::Arc;

use alloy::{
    primitives::B256,
    rpc::types::Log,
    transports::TransportResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ext::{
        BackoffConfig, BlockHeightTracker, EventError, EventKind, LogFilter, RuntimeObserver,
        Subscription, SubscriptionHandle, SubscriptionOptions, TracingObserver, Transport,
    },
    subscription::{self, Sink},
};

/// A decoded event with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord<R> {
    pub record: R,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl<R> EventRecord<R> {
    /// Ordering key within a subscription.
    pub fn key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Position of a mined log, `None` for pending or removed logs.
pub(crate) fn log_key(log: &Log) -> Option<(u64, u64)> {
    if log.removed {
        return None;
    }
    Some((log.block_number?, log.log_index?))
}

/// Range query split into spans of at most `max_blocks` blocks.
pub(crate) async fn fetch_logs(
    transport: &dyn Transport,
    filter: &LogFilter,
    start: u64,
    end: u64,
    max_blocks: u64,
) -> TransportResult<Vec<Log>> {
    let span = max_blocks.max(1);
    let mut logs = Vec::new();
    let mut from = start;
    while from <= end {
        let to = from.saturating_add(span - 1).min(end);
        logs.extend(transport.filter_logs(filter, from, to).await?);
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    Ok(logs)
}

// ============================================================================
// EventStream
// ============================================================================

/// Subscribes to contract events and runs historical queries.
///
/// Subscriptions are attached to the stream's cancellation scope: cancelling
/// it (or the runtime's root token) stops every subscription made here.
#[derive(Clone)]
pub struct EventStream {
    transport: Arc<dyn Transport>,
    height: Arc<BlockHeightTracker>,
    observer: Arc<dyn RuntimeObserver>,
    backoff: BackoffConfig,
    options: SubscriptionOptions,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("backoff", &self.backoff)
            .field("options", &self.options)
            .finish()
    }
}

impl EventStream {
    pub fn new(transport: Arc<dyn Transport>, height: Arc<BlockHeightTracker>) -> Self {
        Self {
            transport,
            height,
            observer: Arc::new(TracingObserver),
            backoff: BackoffConfig::default(),
            options: SubscriptionOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Options used by [`subscribe`](Self::subscribe) and
    /// [`fetch_past_events`](Self::fetch_past_events).
    pub fn with_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// One-shot historical read of `kind` events in `start..=end`, in
    /// ascending `(block, log_index)` order.
    ///
    /// Logs that fail to decode are reported to the observer and skipped.
    pub async fn fetch_past_events<K: EventKind>(
        &self,
        kind: &K,
        filter: &LogFilter,
        start: u64,
        end: u64,
    ) -> Result<Vec<EventRecord<K::Record>>, EventError> {
        if start > end {
            return Err(EventError::InvalidRange { start, end });
        }
        let filter = filter.clone().with_event(kind.topic0());
        let logs = fetch_logs(
            self.transport.as_ref(),
            &filter,
            start,
            end,
            self.options.max_blocks_per_query,
        )
        .await
        .map_err(EventError::Transport)?;

        let mut keyed: Vec<_> = logs
            .into_iter()
            .filter_map(|log| log_key(&log).map(|key| (key, log)))
            .collect();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.dedup_by_key(|(key, _)| *key);

        let mut records = Vec::with_capacity(keyed.len());
        for ((block_number, log_index), log) in keyed {
            match kind.decode(&log) {
                Ok(record) => records.push(EventRecord {
                    record,
                    block_number,
                    tx_hash: log.transaction_hash.unwrap_or_default(),
                    log_index,
                }),
                Err(e) => self
                    .observer
                    .on_decode_failure(kind.name(), block_number, log_index, &e),
            }
        }
        Ok(records)
    }

    /// Subscribe with the stream's default options; records arrive on the
    /// returned [`Subscription`].
    pub fn subscribe<K: EventKind>(&self, kind: K, filter: LogFilter) -> Subscription<K::Record> {
        self.subscribe_with_options(kind, filter, self.options.clone())
    }

    pub fn subscribe_with_options<K: EventKind>(
        &self,
        kind: K,
        filter: LogFilter,
        options: SubscriptionOptions,
    ) -> Subscription<K::Record> {
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let handle = self.spawn(kind, filter, options, Sink::Channel(tx));
        Subscription::new(rx, handle)
    }

    /// Subscribe with a push callback, invoked on the subscription's delivery
    /// task in delivery order. Dropping the handle unsubscribes.
    pub fn subscribe_with<K, F>(
        &self,
        kind: K,
        filter: LogFilter,
        options: SubscriptionOptions,
        callback: F,
    ) -> SubscriptionHandle
    where
        K: EventKind,
        F: FnMut(EventRecord<K::Record>) + Send + 'static,
    {
        self.spawn(kind, filter, options, Sink::Callback(Box::new(callback)))
    }

    fn spawn<K: EventKind>(
        &self,
        kind: K,
        filter: LogFilter,
        options: SubscriptionOptions,
        sink: Sink<K::Record>,
    ) -> SubscriptionHandle {
        subscription::spawn(
            subscription::Context {
                transport: self.transport.clone(),
                height: self.height.clone(),
                observer: self.observer.clone(),
                backoff: self.backoff.clone(),
                cancel: self.cancel.child_token(),
            },
            kind,
            filter,
            options,
            sink,
        )
    }
}

