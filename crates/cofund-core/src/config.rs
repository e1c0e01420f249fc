use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

/// Fee figures carried in every payment intent's metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FeeQuote {
    pub platform_fee_minor: u64,
    pub gateway_fee_minor: u64,
    pub net_minor: u64,
}

/// Platform and gateway fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeePolicy {
    /// Platform cut in basis points.
    pub platform_fee_bps: u32,
    /// Gateway percentage fee in basis points.
    pub gateway_fee_bps: u32,
    /// Gateway fixed fee per charge (minor units).
    pub gateway_fixed_fee_minor: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            platform_fee_bps: 500,
            gateway_fee_bps: 290,
            gateway_fixed_fee_minor: 30,
        }
    }
}

impl FeePolicy {
    pub fn quote(&self, amount_minor: u64) -> FeeQuote {
        let platform_fee_minor = bps_of(amount_minor, self.platform_fee_bps);
        let gateway_fee_minor =
            bps_of(amount_minor, self.gateway_fee_bps).saturating_add(self.gateway_fixed_fee_minor);
        let net_minor = amount_minor
            .saturating_sub(platform_fee_minor)
            .saturating_sub(gateway_fee_minor);

        FeeQuote {
            platform_fee_minor,
            gateway_fee_minor,
            net_minor,
        }
    }
}

// Rounds half up.
fn bps_of(amount_minor: u64, bps: u32) -> u64 {
    let scaled = (amount_minor as u128 * bps as u128 + 5_000) / 10_000;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Persistence backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local tables; for development and tests.
    #[default]
    Memory,
    /// PostgreSQL with schema bootstrapped on connect.
    Postgres {
        database_url: String,
        #[serde(default = "default_pool_size")]
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

fn default_pool_size() -> u32 {
    5
}

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive failures that suspend a payer.
    pub failure_threshold: u32,
    /// Maximum live boosts across all resources.
    pub boost_cap: usize,
    pub boost_duration_secs: i64,
    pub boost_price_minor: u64,
    /// Upper bound for every outbound gateway call.
    pub gateway_timeout_ms: u64,
    /// Pending pledges older than this are withdrawn by the stale sweep.
    pub stale_pending_ttl_secs: i64,
    /// Day of the following month on which a cycle's payout falls due (1..=28).
    pub withdrawal_day_of_month: u32,
    pub fees: FeePolicy,
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            boost_cap: 10,
            boost_duration_secs: 24 * 60 * 60,
            boost_price_minor: 500,
            gateway_timeout_ms: 10_000,
            stale_pending_ttl_secs: 7 * 24 * 60 * 60,
            withdrawal_day_of_month: 1,
            fees: FeePolicy::default(),
            storage: StorageConfig::Memory,
        }
    }
}

impl EngineConfig {
    pub fn boost_duration(&self) -> Duration {
        Duration::seconds(self.boost_duration_secs.max(1))
    }

    pub fn gateway_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.gateway_timeout_ms.max(1))
    }

    pub fn stale_pending_ttl(&self) -> Duration {
        Duration::seconds(self.stale_pending_ttl_secs.max(0))
    }
}
