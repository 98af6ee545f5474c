//! Engine-wide tuning constants. Times are deciseconds unless suffixed.

use mega_core::Ds;

/// Default API endpoint; process-wide default copied per client.
pub const DEFAULT_API_URL: &str = "https://g.api.mega.co.nz/";

/// No data on the CS channel for this long triggers a lock probe.
pub const REQUEST_TIMEOUT_DS: Ds = 1200;

/// No data on any other stream for this long forces a reconnect.
pub const NETWORK_TIMEOUT_DS: Ds = 2400;

/// SC long-poll is abandoned and re-armed after this long.
pub const SC_REQUEST_TIMEOUT_DS: Ds = 4000;

/// Hard cap on concurrently active transfer slots.
pub const MAX_TOTAL_TRANSFERS: usize = 48;

/// Per-direction cap on active slots.
pub const MAX_TRANSFERS: usize = 32;

/// New slot starts per direction per dispatch tick, for responsiveness.
pub const MAX_NEW_STARTS_PER_TICK: usize = MAX_TRANSFERS / 2;

/// Boundary between the small and large transfer pipelines.
pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Minimum queued-ahead bytes per pipeline.
pub const MIN_PIPELINE_LOOKAHEAD: u64 = 2 * 1024 * 1024;

/// Cap on the speed-scaled pipeline lookahead.
pub const MAX_PIPELINE_LOOKAHEAD: u64 = 100 * 1024 * 1024;

/// Lookahead window in seconds of current direction throughput.
pub const PIPELINE_LOOKAHEAD_SECS: u64 = 30;

/// A single dominant file bigger than the threshold with more than this
/// left disables further starts in its pipeline.
pub const DOMINANT_FILE_REMAINDER: u64 = 5 * 1024 * 1024;

/// File-attribute uploads queued beyond this jam new upload dispatch.
pub const MAX_QUEUED_FA: usize = 30;

/// Concurrent direct-read slots across all nodes.
pub const MAX_DR_SLOTS: usize = 16;

/// Direct-read temp URLs stay valid this long after receipt.
pub const DR_URL_TTL_DS: Ds = 6000;

/// Bandwidth overquota pause when the server gives no retry-in.
pub const DEFAULT_BW_OVERQUOTA_BACKOFF_SECS: u64 = 3600;

/// Deferral for EXTRA-queue filesystem notifications, coalescing the
/// create-temp / delete-original / rename-temp rewrite pattern.
pub const EXTRA_SCANNING_DELAY_DS: Ds = 150;

/// A local file must hold size+mtime this long before it uploads.
pub const NAGLE_DS: Ds = 30;

/// Window for the recent-version upload throttle.
pub const RECENT_VERSION_INTERVAL_SECS: i64 = 1800;

/// Version count beyond which the throttle kicks in.
pub const RECENT_VERSION_LIMIT: u64 = 10;

/// Base delay for a full rescan after notification failure; scaled by
/// tree size as `base + nodes / 128`.
pub const RESCAN_BASE_DELAY_DS: Ds = 300;

/// Telemetry event: a share key was replaced during steady state.
pub const EVENT_SHARE_KEY_REPLACED: u32 = 99428;
