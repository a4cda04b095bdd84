//! Default configuration values for the provisioner
//!
//! These constants keep launch, polling, and shutdown budgets consistent
//! between the controller and its tests.

/// Default AWS region for kernel instances
pub const DEFAULT_REGION: &str = "us-east-2";

/// Default launch budget: from launch initiation to confirmed connectivity
/// (10 minutes; EC2 boots plus kernel startup routinely take several)
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 600;

/// Default interval between lifecycle polling attempts
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum number of state queries when confirming a shutdown
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 10;

/// Default per-request timeout for a single EC2 API round trip.
/// Distinct from the overall launch budget.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Default shutdown wait recommendation (seconds). EC2 termination takes
/// longer than typical local-process teardown.
pub const DEFAULT_SHUTDOWN_WAIT_SECS: u64 = 15;

/// Default root volume size for kernel instances (GiB)
pub const DEFAULT_ROOT_VOLUME_SIZE_GIB: i32 = 55;
