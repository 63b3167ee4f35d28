//! Bridge core: vehicle commands in, vehicle telemetry out, with per-message
//! latency accounting across both hops.

pub mod bridge;
pub mod publisher;
pub mod slot;
pub mod timing;
pub mod translator;
pub mod worker;

pub use bridge::{Bridge, BridgeConfig, Shutdown};
pub use publisher::{BusPublisher, PublishError, RateLimiter, TelemetryPublisher};
pub use slot::LinkSlot;
pub use timing::{LatencyTracker, Side, TimingLog, TrackerConfig};
pub use translator::{plan, CommandError, CommandTranslator, Execution, SettleDelays, Step};
pub use worker::{spawn_worker, CommandQueue};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Seconds since the Unix epoch with sub-microsecond resolution.
pub fn epoch_secs() -> f64 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}
