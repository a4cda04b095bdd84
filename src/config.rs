//! Provisioner configuration and the instance launch specification

use std::time::Duration;

use tracing::warn;

use crate::defaults::{
    DEFAULT_LAUNCH_TIMEOUT_SECS, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_REGION, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_ROOT_VOLUME_SIZE_GIB,
    DEFAULT_SHUTDOWN_WAIT_SECS,
};

/// Environment override for the shutdown wait recommendation (seconds).
pub const ENV_SHUTDOWN_WAIT: &str = "EC2_PROVISIONER_SHUTDOWN_WAIT_SECS";

/// Environment override pointing the controller at a pre-existing instance
/// (recovery/debug path: no create call is issued).
pub const ENV_EXISTING_INSTANCE_ID: &str = "EC2_PROVISIONER_EXISTING_INSTANCE_ID";

/// Timing budgets and regional settings for one controller.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// AWS region for the kernel instance
    pub region: String,
    /// Maximum wall-clock budget from launch initiation to confirmed
    /// connectivity
    pub launch_timeout: Duration,
    /// Fixed interval between polling attempts
    pub poll_interval: Duration,
    /// Maximum state queries when confirming a shutdown
    pub max_poll_attempts: u32,
    /// Per-request timeout for a single EC2 round trip, distinct from
    /// `launch_timeout`
    pub request_timeout: Duration,
    /// Shutdown wait recommendation passed back to the owning scheduler
    pub shutdown_wait: Duration,
    /// Adopt this instance id instead of creating one (recovery/debug)
    pub existing_instance_id: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            launch_timeout: Duration::from_secs(DEFAULT_LAUNCH_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_wait: Duration::from_secs(DEFAULT_SHUTDOWN_WAIT_SECS),
            existing_instance_id: None,
        }
    }
}

impl ProvisionerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_SHUTDOWN_WAIT) {
            match raw.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => {
                    config.shutdown_wait = Duration::from_secs_f64(secs);
                }
                _ => warn!(
                    var = ENV_SHUTDOWN_WAIT,
                    value = %raw,
                    "Ignoring unparsable shutdown wait override"
                ),
            }
        }

        if let Ok(instance_id) = std::env::var(ENV_EXISTING_INSTANCE_ID) {
            if !instance_id.is_empty() {
                config.existing_instance_id = Some(instance_id);
            }
        }

        config
    }
}

/// Boot-time specification for the kernel's instance.
///
/// Assembled by the hosting service from its own configuration and the
/// rendered boot script; opaque to the lifecycle controller beyond the
/// kernel id used for tagging.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Kernel identifier; becomes the instance's discovery tag value
    pub kernel_id: String,
    /// AMI to boot
    pub ami_id: String,
    /// EC2 instance type (e.g. "t3.medium")
    pub instance_type: String,
    /// Rendered boot script payload (will be base64 encoded)
    pub user_data: String,
    /// Optional VPC subnet ID
    pub subnet_id: Option<String>,
    /// Optional security group ID
    pub security_group_id: Option<String>,
    /// Optional availability zone
    pub availability_zone: Option<String>,
    /// Root volume size in GiB
    pub volume_size_gib: i32,
    /// Validate the request without launching anything
    pub dry_run: bool,
}

impl LaunchSpec {
    /// Create a launch specification with required fields
    pub fn new(
        kernel_id: impl Into<String>,
        ami_id: impl Into<String>,
        instance_type: impl Into<String>,
        user_data: impl Into<String>,
    ) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            ami_id: ami_id.into(),
            instance_type: instance_type.into(),
            user_data: user_data.into(),
            subnet_id: None,
            security_group_id: None,
            availability_zone: None,
            volume_size_gib: DEFAULT_ROOT_VOLUME_SIZE_GIB,
            dry_run: false,
        }
    }

    /// Set the VPC subnet ID
    pub fn with_subnet(mut self, subnet_id: impl Into<String>) -> Self {
        self.subnet_id = Some(subnet_id.into());
        self
    }

    /// Set the security group ID
    pub fn with_security_group(mut self, security_group_id: impl Into<String>) -> Self {
        self.security_group_id = Some(security_group_id.into());
        self
    }

    /// Set the availability zone
    pub fn with_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }

    /// Set the root volume size in GiB
    pub fn with_volume_size(mut self, gib: i32) -> Self {
        self.volume_size_gib = gib;
        self
    }

    /// Validate without launching
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
