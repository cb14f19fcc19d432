pub mod engine;
pub mod remote;
pub mod session;
pub mod types;

/// Every committed tick advances the virtual clock by exactly this much.
pub const TICK_INTERVAL_MS: i64 = 1_000;

/// Deviation between `virtual + tick` and the system clock beyond which the
/// backup driver recalibrates instead of blindly advancing.
pub const DEFAULT_DRIFT_LIMIT_MS: i64 = 30_000;

pub const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const TRADE_DATE_FORMAT: &str = "%Y-%m-%d";
