//! Block height tracking.
//!
//! Load-balanced RPC endpoints can answer `eth_blockNumber` from nodes at
//! different heights. The tracker keeps the highest height seen so far, so
//! the value it hands out never goes backwards.

use std::{sync::Arc, time::Duration};

use alloy::transports::TransportResult;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::ext::{HeightConfig, Transport};

pub struct BlockHeightTracker {
    transport: Arc<dyn Transport>,
    confirmations: u64,
    latest: watch::Sender<u64>,
}

impl std::fmt::Debug for BlockHeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHeightTracker")
            .field("confirmations", &self.confirmations)
            .field("latest", &*self.latest.borrow())
            .finish()
    }
}

impl BlockHeightTracker {
    pub fn new(transport: Arc<dyn Transport>, config: HeightConfig) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            transport,
            confirmations: config.confirmations,
            latest,
        }
    }

    /// Fetch the chain height and fold it into the tracked maximum.
    pub async fn current_height(&self) -> TransportResult<u64> {
        let height = self.transport.block_number().await?;
        Ok(self.observe(height))
    }

    /// Current height minus the configured confirmations.
    pub async fn safe_height(&self) -> TransportResult<u64> {
        Ok(self.current_height().await?.saturating_sub(self.confirmations))
    }

    /// Fold an externally observed height into the tracked maximum and
    /// return the maximum.
    pub fn observe(&self, height: u64) -> u64 {
        self.latest.send_if_modified(|latest| {
            if height > *latest {
                *latest = height;
                true
            } else {
                false
            }
        });
        *self.latest.borrow()
    }

    /// Highest height seen so far without an RPC round trip; 0 before the
    /// first observation.
    pub fn latest_known(&self) -> u64 {
        *self.latest.borrow()
    }

    /// Receive every increase of the tracked height.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.latest.subscribe()
    }

    /// Poll the chain height every `period` until `cancel` fires.
    pub fn spawn_poller(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.current_height().await {
                            tracing::debug!(error = %e, "block height poll failed");
                        }
                    }
                }
            }
        })
    }
}
