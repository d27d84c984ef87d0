/// Default configuration constants for the service graph

// Cache sizing and ageing
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10;
pub const DEFAULT_POLLED_ENTRY_AGE_OUT_SECS: u64 = 5 * 60;
pub const DEFAULT_SLOW_QUERY_ENTRY_AGE_OUT_SECS: u64 = 5 * 60;
pub const DEFAULT_MAX_TRUNCATED_ENTRY_AGE_SECS: u64 = 60 * 60;

// Background polling
pub const DEFAULT_POLL_LOOP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_POLL_QUERY_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_DATA_SETTLE_TIME_SECS: u64 = 15 * 60;

// Backend query limits
pub const DEFAULT_MAX_AGGREGATED_RECORDS: usize = 50_000;

// Prefetch
pub const DEFAULT_CLUSTER: &str = "cluster";
pub const PREFETCH_WINDOW_SECS: i64 = 15 * 60;
pub const PREFETCH_DEADLINE_SECS: u64 = 60;

// Request defaults
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REQUEST_FROM: &str = "now-15m";
pub const DEFAULT_REQUEST_TO: &str = "now";

// Logging
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const SUPPORTED_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
