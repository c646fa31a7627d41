//! Engine configuration.
//!
//! All tunables in one value passed at construction. Intervals and timeouts
//! are milliseconds so controlled-clock tests can reason about them exactly.

use crate::messages::PROTOCOL_VERSION;

#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket capacity and replication factor.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// Per-request timeout before the pending-request reaper gives up.
    pub request_timeout_ms: u64,
    /// Per-lookup deadline.
    pub lookup_deadline_ms: u64,
    /// Timeout for the bucket-head liveness probe.
    pub ping_timeout_ms: u64,
    /// Buckets untouched for this long are refreshed.
    pub refresh_interval_ms: u64,
    /// Items unrepublished for this long are pushed to the K closest again;
    /// unrequested caching copies older than this are dropped.
    pub republish_interval_ms: u64,
    /// Cadence of the maintenance pass (expiry scan, republication, bucket
    /// refresh). One sixth of the refresh interval by default.
    pub maintenance_interval_ms: u64,
    /// Cadence of the pending-request reaper.
    pub reaper_interval_ms: u64,
    /// Failed requests tolerated before a contact is evicted.
    pub max_failures: u32,
    /// Accepted forward clock skew on item timestamps.
    pub max_clock_skew_ms: u64,
    /// Protocol version advertised in envelopes.
    pub version: String,
    /// Seed for the engine's RNG; `None` seeds from entropy. Set in tests
    /// for reproducible correlation ids and refresh targets.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            request_timeout_ms: 1_000,
            lookup_deadline_ms: 5_000,
            ping_timeout_ms: 500,
            refresh_interval_ms: 3_600_000,
            republish_interval_ms: 3_600_000,
            maintenance_interval_ms: 600_000,
            reaper_interval_ms: 250,
            max_failures: 3,
            max_clock_skew_ms: 60_000,
            version: PROTOCOL_VERSION.to_string(),
            rng_seed: None,
        }
    }
}
