//! Per-subscription tasks and handles.
//!
//! [`spawn`] starts the two tasks behind every subscription: the live watcher
//! (push subscription with reconnection) and the delivery task (backfill
//! ticker, ordering, hand-off to the consumer). They share a child
//! cancellation token owned by the [`SubscriptionHandle`].

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::rpc::types::Log;
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    sync::mpsc,
    time::{interval, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    config::period,
    events::{fetch_logs, log_key},
    ext::{
        Backoff, BackoffConfig, BlockHeightTracker, EventKind, EventRecord, LogFilter, LogStream,
        RuntimeObserver, SubscriptionOptions, Transport,
    },
};

// ============================================================================
// Handles
// ============================================================================

/// Keeps a subscription alive. Dropping it, or calling
/// [`unsubscribe`](Self::unsubscribe), stops both of its tasks.
pub struct SubscriptionHandle {
    name: Arc<str>,
    cancel: CancellationToken,
    last_processed: Arc<AtomicU64>,
    _guard: DropGuard,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("last_processed_block", &self.last_processed_block())
            .finish()
    }
}

impl SubscriptionHandle {
    fn new(name: Arc<str>, cancel: CancellationToken, last_processed: Arc<AtomicU64>) -> Self {
        Self {
            name,
            _guard: cancel.clone().drop_guard(),
            cancel,
            last_processed,
        }
    }

    /// Event kind name the subscription was made for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest block the subscription has fully processed: the head covered
    /// by the last successful backfill, or the block of the last delivered
    /// record if later. 0 until the first delivery.
    pub fn last_processed_block(&self) -> u64 {
        self.last_processed.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }
}

/// Pull side of a subscription.
#[derive(Debug)]
pub struct Subscription<R> {
    events: mpsc::Receiver<EventRecord<R>>,
    handle: SubscriptionHandle,
}

impl<R: Send + 'static> Subscription<R> {
    pub(crate) fn new(events: mpsc::Receiver<EventRecord<R>>, handle: SubscriptionHandle) -> Self {
        Self { events, handle }
    }

    /// Next record, or `None` once the subscription has stopped.
    pub async fn recv(&mut self) -> Option<EventRecord<R>> {
        self.events.recv().await
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn unsubscribe(self) {
        self.handle.unsubscribe();
    }

    /// Consume into a stream that keeps the subscription alive while polled.
    pub fn into_stream(self) -> BoxStream<'static, EventRecord<R>> {
        futures::stream::unfold(self, |mut subscription| async move {
            let record = subscription.recv().await?;
            Some((record, subscription))
        })
        .boxed()
    }
}

// ============================================================================
// Spawning
// ============================================================================

/// Consumer end of the delivery task.
pub(crate) enum Sink<R> {
    Channel(mpsc::Sender<EventRecord<R>>),
    Callback(Box<dyn FnMut(EventRecord<R>) + Send>),
}

/// Shared collaborators handed to a new subscription.
pub(crate) struct Context {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) height: Arc<BlockHeightTracker>,
    pub(crate) observer: Arc<dyn RuntimeObserver>,
    pub(crate) backoff: BackoffConfig,
    pub(crate) cancel: CancellationToken,
}

enum LiveEvent {
    /// The live leg (re)connected; logs may have been missed before this
    Connected,
    Log(Log),
}

pub(crate) fn spawn<K: EventKind>(
    ctx: Context,
    kind: K,
    filter: LogFilter,
    options: SubscriptionOptions,
    sink: Sink<K::Record>,
) -> SubscriptionHandle {
    let filter = filter.with_event(kind.topic0());
    let name: Arc<str> = Arc::from(kind.name());
    let last_processed = Arc::new(AtomicU64::new(0));
    let (live_tx, live_rx) = mpsc::channel(options.channel_capacity.max(1));

    let watcher = LiveWatcher {
        transport: ctx.transport.clone(),
        filter: filter.clone(),
        backoff: Backoff::new(ctx.backoff, Instant::now()),
        stall_timeout: options.stall_timeout,
        observer: ctx.observer.clone(),
        name: name.clone(),
        events: live_tx,
        cancel: ctx.cancel.clone(),
    };
    let delivery = Delivery {
        kind,
        filter,
        options,
        transport: ctx.transport,
        height: ctx.height,
        observer: ctx.observer,
        name: name.clone(),
        sink,
        cursor: None,
        gap: Some(Gap::open(None)),
        last_processed: last_processed.clone(),
        cancel: ctx.cancel.clone(),
    };

    tracing::debug!(subscription = %name, "starting subscription");
    tokio::spawn(watcher.run());
    tokio::spawn(delivery.run(live_rx));

    SubscriptionHandle::new(name, ctx.cancel, last_processed)
}

// ============================================================================
// Live watcher
// ============================================================================

struct LiveWatcher {
    transport: Arc<dyn Transport>,
    filter: LogFilter,
    backoff: Backoff,
    stall_timeout: Option<Duration>,
    observer: Arc<dyn RuntimeObserver>,
    name: Arc<str>,
    events: mpsc::Sender<LiveEvent>,
    cancel: CancellationToken,
}

impl LiveWatcher {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut connected_before = false;

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.transport.subscribe_logs(&self.filter) => attempt,
            };

            let reason = match attempt {
                Err(e) => e.to_string(),
                Ok(stream) => {
                    let failures = self.backoff.on_connected(Instant::now());
                    if connected_before || failures > 0 {
                        self.observer.on_resubscribed(&self.name, failures);
                    }
                    connected_before = true;

                    if self.events.send(LiveEvent::Connected).await.is_err() {
                        break;
                    }
                    match self.pump(stream).await {
                        Some(reason) => reason,
                        None => break,
                    }
                }
            };

            let step = self.backoff.on_failure(Instant::now());
            self.observer
                .on_resubscribe_failure(&self.name, step.attempt, step.delay, &reason);
            if step.alert {
                self.observer
                    .on_resubscribe_alert(&self.name, step.disconnected_for);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(step.delay) => {}
            }
        }

        self.backoff.abandon();
        tracing::debug!(subscription = %self.name, "live watcher stopped");
    }

    /// Forward logs until the stream breaks. Returns why it broke, or `None`
    /// when the subscription is shutting down.
    async fn pump(&mut self, mut stream: LogStream) -> Option<String> {
        let cancel = self.cancel.clone();
        let stall_timeout = self.stall_timeout;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return None,
                next = next_log(&mut stream, stall_timeout) => next,
            };
            match next {
                None => {
                    return Some(format!(
                        "no logs received for {:?}",
                        stall_timeout.unwrap_or_default()
                    ))
                }
                Some(None) => return Some("subscription closed".to_string()),
                Some(Some(Err(e))) => return Some(e.to_string()),
                Some(Some(Ok(log))) => {
                    self.backoff.record_activity(Instant::now());
                    if self.events.send(LiveEvent::Log(log)).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Next stream item; the outer `None` means the stall timeout elapsed.
async fn next_log(
    stream: &mut LogStream,
    stall_timeout: Option<Duration>,
) -> Option<Option<Result<Log, alloy::transports::TransportError>>> {
    match stall_timeout {
        Some(limit) => timeout(limit, stream.next()).await.ok(),
        None => Some(stream.next().await),
    }
}

// ============================================================================
// Delivery
// ============================================================================

struct Delivery<K: EventKind> {
    kind: K,
    filter: LogFilter,
    options: SubscriptionOptions,
    transport: Arc<dyn Transport>,
    height: Arc<BlockHeightTracker>,
    observer: Arc<dyn RuntimeObserver>,
    name: Arc<str>,
    sink: Sink<K::Record>,
    /// Highest key handed to the consumer
    cursor: Option<(u64, u64)>,
    /// Set while live logs may be missing since the last backfill
    gap: Option<Gap>,
    last_processed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Live logs may be missing after `since`; the next successful backfill
/// closes the gap.
#[derive(Default)]
struct Gap {
    /// Cursor when the gap opened
    since: Option<(u64, u64)>,
    /// Live logs waiting for the backfill
    held: Vec<Log>,
    /// Keys of held logs delivered before the backfill could run
    released: HashSet<(u64, u64)>,
}

impl Gap {
    fn open(since: Option<(u64, u64)>) -> Self {
        Self {
            since,
            ..Default::default()
        }
    }
}

enum Wake {
    Cancelled,
    Tick,
    Live(Option<LiveEvent>),
}

impl<K: EventKind> Delivery<K> {
    async fn run(mut self, mut live: mpsc::Receiver<LiveEvent>) {
        let mut ticker = interval(period(self.options.tick));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = ticker.tick() => Wake::Tick,
                event = live.recv() => Wake::Live(event),
            };

            let keep_going = match wake {
                Wake::Cancelled | Wake::Live(None) => false,
                Wake::Tick => self.backfill().await,
                Wake::Live(Some(LiveEvent::Connected)) => {
                    let cursor = self.cursor;
                    self.gap.get_or_insert_with(|| Gap::open(cursor));
                    ticker.reset_immediately();
                    true
                }
                Wake::Live(Some(LiveEvent::Log(log))) if log.removed => {
                    self.rewind(&log);
                    true
                }
                Wake::Live(Some(LiveEvent::Log(log))) => {
                    let capacity = self.options.channel_capacity.max(1);
                    match self.gap.as_mut() {
                        Some(gap) => {
                            gap.held.push(log);
                            let full = gap.held.len() >= capacity;
                            if full {
                                self.release_held().await
                            } else {
                                true
                            }
                        }
                        None => self.deliver(vec![log], None).await,
                    }
                }
            };

            if !keep_going {
                break;
            }
        }

        // Stops the live watcher too when the consumer went away
        cancel.cancel();
        tracing::debug!(subscription = %self.name, "delivery stopped");
    }

    /// Range query over the window behind the head, merged with held live
    /// logs. A failure releases the held logs and keeps the gap open for the
    /// next tick.
    async fn backfill(&mut self) -> bool {
        let head = match self.height.current_height().await {
            Ok(head) => head,
            Err(e) => {
                self.observer.on_backfill_failed(&self.name, &e);
                return self.release_held().await;
            }
        };
        let from = head.saturating_sub(self.options.past_blocks);

        let mut logs = match fetch_logs(
            self.transport.as_ref(),
            &self.filter,
            from,
            head,
            self.options.max_blocks_per_query,
        )
        .await
        {
            Ok(logs) => logs,
            Err(e) => {
                self.observer.on_backfill_failed(&self.name, &e);
                return self.release_held().await;
            }
        };

        let mut gap = self.gap.take();
        if let Some(gap) = gap.as_mut() {
            logs.append(&mut gap.held);
        }
        let open = self.deliver(logs, gap).await;
        self.last_processed.fetch_max(head, Ordering::AcqRel);
        open
    }

    /// Deliver held live logs without waiting for the backfill. The gap stays
    /// open; its backfill later fills in whatever is missing below them.
    async fn release_held(&mut self) -> bool {
        let Some(gap) = self.gap.as_mut() else {
            return true;
        };
        if gap.held.is_empty() {
            return true;
        }
        let held = std::mem::take(&mut gap.held);
        gap.released.extend(held.iter().filter_map(log_key));
        tracing::debug!(
            subscription = %self.name,
            count = held.len(),
            "delivering live logs ahead of backfill"
        );
        self.deliver(held, None).await
    }

    /// A delivered log was reorged out. Move the cursor back before its
    /// block so whatever replaces it is delivered too.
    fn rewind(&mut self, removed: &Log) {
        let (Some(block_number), Some(log_index)) = (removed.block_number, removed.log_index)
        else {
            return;
        };
        if let Some(gap) = self.gap.as_mut() {
            gap.held.retain(|log| {
                log.log_index != Some(log_index)
                    || log.block_number != Some(block_number)
                    || log.transaction_hash != removed.transaction_hash
            });
        }
        if !self.cursor.is_some_and(|(block, _)| block >= block_number) {
            return;
        }

        let rewound = block_number.checked_sub(1).map(|block| (block, u64::MAX));
        self.cursor = rewound;
        if let Some(gap) = self.gap.as_mut() {
            gap.since = gap.since.min(rewound);
        }
        tracing::debug!(subscription = %self.name, block_number, log_index, "log removed, rewinding cursor");
    }

    /// Hand logs to the consumer in key order. Keys above the cursor always
    /// go out; with a closing `gap`, so do keys after the gap opened that were
    /// not released early. Returns `false` once the consumer is gone.
    async fn deliver(&mut self, logs: Vec<Log>, gap: Option<Gap>) -> bool {
        let cursor = self.cursor;
        let mut keyed: Vec<_> = {
            let missed = |key: &(u64, u64)| {
                gap.as_ref().is_some_and(|gap| {
                    gap.since.map_or(true, |since| *key > since) && !gap.released.contains(key)
                })
            };
            logs.into_iter()
                .filter_map(|log| log_key(&log).map(|key| (key, log)))
                .filter(|(key, _)| cursor.map_or(true, |cursor| *key > cursor) || missed(key))
                .collect()
        };
        drop(gap);
        keyed.sort_by_key(|(key, _)| *key);
        keyed.dedup_by_key(|(key, _)| *key);

        let mut delivered = 0;
        for ((block_number, log_index), log) in keyed {
            let key = (block_number, log_index);
            match self.kind.decode(&log) {
                Ok(record) => {
                    let record = EventRecord {
                        record,
                        block_number,
                        tx_hash: log.transaction_hash.unwrap_or_default(),
                        log_index,
                    };
                    if !self.send(record).await {
                        return false;
                    }
                    delivered += 1;
                }
                Err(e) => {
                    self.observer
                        .on_decode_failure(&self.name, block_number, log_index, &e);
                }
            }
            // Undecodable logs move the cursor too, so each is reported once
            self.cursor = self.cursor.max(Some(key));
            self.last_processed.fetch_max(block_number, Ordering::AcqRel);
        }

        if delivered > 0 {
            let through_block = self.cursor.map_or(0, |(block, _)| block);
            self.observer
                .on_events_delivered(&self.name, delivered, through_block);
        }
        true
    }

    async fn send(&mut self, record: EventRecord<K::Record>) -> bool {
        match &mut self.sink {
            Sink::Callback(callback) => {
                callback(record);
                true
            }
            Sink::Channel(tx) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    sent = tx.send(record) => sent.is_ok(),
                }
            }
        }
    }
}
