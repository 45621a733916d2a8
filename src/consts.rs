pub(crate) const DEFAULT_PAGE_SIZE: u32 = 20;
pub(crate) const MAX_PAGE_SIZE: u32 = 100;
pub(crate) const DEFAULT_CACHE_LIMIT: usize = 200;
pub(crate) const MAX_CACHE_LIMIT: usize = 2000;
pub(crate) const DEFAULT_FRESHNESS_SECS: u64 = 300;
/// Off-list ids remembered per cached record.
pub(crate) const TRACKED_IDS_PER_CACHED: usize = 4;

pub(crate) const DEFAULT_STREAM_PATH: &str = "/notifications/stream";
pub(crate) const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const STREAM_INACTIVITY_SECS: u64 = 300;
pub(crate) const STREAM_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub(crate) const STREAM_RECONNECT_BASE_SECS: u64 = 3;
pub(crate) const STREAM_RECONNECT_MAX_SECS: u64 = 30;
pub(crate) const STREAM_RECONNECT_JITTER_MS: u64 = 500;

pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 15;
pub(crate) const STORE_EVENT_CAPACITY: usize = 256;
pub(crate) const LOG_PAYLOAD_CHARS: usize = 140;
