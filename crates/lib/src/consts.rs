//! Crate-wide constants.

/// Timeout applied to each source-archive download attempt.
pub const FETCH_TIMEOUT_SECS: u64 = 60;

/// Timeout applied to version-drift probe requests.
pub const PROBE_TIMEOUT_SECS: u64 = 30;

/// Marker file recording which patches were applied to a source tree.
pub const PATCH_MARKER: &str = ".relpy-patched";

/// Number of trailing log lines captured as error detail for a failed step.
pub const LOG_TAIL_LINES: usize = 20;

/// User agent sent with download and probe requests.
pub const USER_AGENT: &str = concat!("relpy/", env!("CARGO_PKG_VERSION"));
