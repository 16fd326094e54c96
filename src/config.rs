//! Runtime configuration.
//!
//! Every section is a plain struct with a `Default` and chained `with_*`
//! setters, and (de)serializes from JSON with durations written in
//! milliseconds:
//!
//! ```json
//! {
//!   "mining": { "check_interval_ms": 2000, "threshold_ms": 30000 },
//!   "subscription": { "tick_ms": 15000, "past_blocks": 200 },
//!   "backoff": { "max_delay_ms": 60000 }
//! }
//! ```

use std::time::Duration;

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::ext::GasBump;

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Shortest period accepted for a ticker; `tokio::time::interval` rejects zero.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Clamp a ticker period to [`MIN_PERIOD`].
pub(crate) fn period(value: Duration) -> Duration {
    value.max(MIN_PERIOD)
}

/// Like [`duration_ms`], clamping to [`MIN_PERIOD`] on the way in.
pub(crate) mod period_ms {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        super::duration_ms::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        super::duration_ms::deserialize(deserializer).map(super::period)
    }
}

/// Same as [`duration_ms`] for optional durations.
pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Base transaction options copied into every submission before per-call
/// overrides are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    /// Gas limit applied to every call unless overridden (default: estimate)
    pub gas_limit: Option<u64>,
    /// Value attached to every call unless overridden (default: 0)
    pub value: U256,
}

impl SubmitConfig {
    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

// ============================================================================
// Forced mining
// ============================================================================

/// Configuration for the background mining monitor.
///
/// Every `check_interval` the monitor asks the transport whether any of the
/// transaction's broadcast hashes is mined. When `threshold` elapses since the
/// last broadcast without a receipt, the transaction is re-signed with the same
/// nonce and a bumped fee and broadcast again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Start a monitor for every submitted transaction (default: true)
    pub enabled: bool,
    /// Interval between receipt checks (default: 2 seconds, at least 1ms)
    #[serde(rename = "check_interval_ms", with = "period_ms")]
    pub check_interval: Duration,
    /// Time without a receipt before a replacement is broadcast (default: 30 seconds)
    #[serde(rename = "threshold_ms", with = "duration_ms")]
    pub threshold: Duration,
    /// Fee bump applied on each replacement
    pub gas_bump: GasBump,
    /// Upper bound on replacements; `None` keeps rebroadcasting until mined
    pub max_rebroadcasts: Option<u32>,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(2),
            threshold: Duration::from_secs(30),
            gas_bump: GasBump::default(),
            max_rebroadcasts: None,
        }
    }
}

impl MiningConfig {
    /// Config with the monitor switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = period(interval);
        self
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_gas_bump(mut self, gas_bump: GasBump) -> Self {
        self.gas_bump = gas_bump;
        self
    }

    pub fn with_max_rebroadcasts(mut self, max: u32) -> Self {
        self.max_rebroadcasts = Some(max);
        self
    }
}

// ============================================================================
// Event subscriptions
// ============================================================================

/// Per-subscription options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Backfill period (default: 30 seconds, at least 1ms)
    #[serde(rename = "tick_ms", with = "period_ms")]
    pub tick: Duration,
    /// Backfill window, in blocks behind the current height (default: 500)
    pub past_blocks: u64,
    /// Largest block span of a single range query (default: 2000)
    pub max_blocks_per_query: u64,
    /// Capacity of the delivery channel and of the live logs held during a
    /// gap (default: 1024)
    pub channel_capacity: usize,
    /// Treat a live subscription that stays silent this long as dead
    #[serde(rename = "stall_timeout_ms", with = "option_duration_ms")]
    pub stall_timeout: Option<Duration>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            past_blocks: 500,
            max_blocks_per_query: 2_000,
            channel_capacity: 1_024,
            stall_timeout: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = period(tick);
        self
    }

    pub fn with_past_blocks(mut self, past_blocks: u64) -> Self {
        self.past_blocks = past_blocks;
        self
    }

    pub fn with_max_blocks_per_query(mut self, max: u64) -> Self {
        self.max_blocks_per_query = max.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }
}

/// Resubscription backoff for the live leg of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failure (default: 500ms)
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Ceiling for the delay (default: 30 seconds)
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive failures (default: 2.0)
    pub factor: f64,
    /// Raise an alert once disconnected for longer than this (default: 60 seconds)
    #[serde(rename = "alert_threshold_ms", with = "duration_ms")]
    pub alert_threshold: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            alert_threshold: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_alert_threshold(mut self, threshold: Duration) -> Self {
        self.alert_threshold = threshold;
        self
    }
}

/// Block height tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeightConfig {
    /// Blocks subtracted from the head by `safe_height()` (default: 0)
    pub confirmations: u64,
}

// ============================================================================
// RuntimeConfig
// ============================================================================

/// Complete configuration for a [`ChainRuntime`](crate::ext::ChainRuntime).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub submit: SubmitConfig,
    pub mining: MiningConfig,
    pub subscription: SubscriptionOptions,
    pub backoff: BackoffConfig,
    pub height: HeightConfig,
}

impl RuntimeConfig {
    /// Parse a JSON document; missing sections and fields take their defaults.
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_submit(mut self, submit: SubmitConfig) -> Self {
        self.submit = submit;
        self
    }

    pub fn with_mining(mut self, mining: MiningConfig) -> Self {
        self.mining = mining;
        self
    }

    pub fn with_subscription(mut self, subscription: SubscriptionOptions) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_height(mut self, height: HeightConfig) -> Self {
        self.height = height;
        self
    }
}
