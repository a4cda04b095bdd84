//! Lifecycle states and the per-kernel resource record
//!
//! `KernelResource` is the single mutable record tracking one kernel's
//! remote compute association. It doubles as the state cache: lifecycle
//! observations only ever come from successful queries, so a transiently
//! failing provider never makes the controller regress to believing the
//! resource is absent.

use std::time::{Duration, Instant};

use aws_sdk_ec2::types::InstanceStateName;
use serde::{Deserialize, Serialize};

/// EC2 instance lifecycle states, as reported by DescribeInstances.
///
/// See <https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/ec2-instance-lifecycle.html>
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum InstanceLifecycle {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceLifecycle {
    /// States an instance moves through on its way up. A launch observed in
    /// one of these is still making progress.
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// States from which the instance will not return to running.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopping | Self::Stopped | Self::ShuttingDown | Self::Terminated
        )
    }

    /// Map the SDK's state name. Returns `None` for state names this
    /// controller does not track (the SDK enum is non-exhaustive).
    pub fn from_state_name(name: &InstanceStateName) -> Option<Self> {
        match name {
            InstanceStateName::Pending => Some(Self::Pending),
            InstanceStateName::Running => Some(Self::Running),
            InstanceStateName::Stopping => Some(Self::Stopping),
            InstanceStateName::Stopped => Some(Self::Stopped),
            InstanceStateName::ShuttingDown => Some(Self::ShuttingDown),
            InstanceStateName::Terminated => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// One kernel's remote compute association.
#[derive(Debug, Clone)]
pub struct KernelResource {
    /// Opaque stable kernel identifier; doubles as the discovery tag value.
    pub kernel_id: String,
    /// Provider-assigned instance id. Absent until the identity resolver
    /// confirms one; cleared on cleanup so a restarted controller
    /// re-resolves via the tag instead of losing track of the instance.
    pub instance_id: Option<String>,
    /// Last state observed by a successful query. Failed queries leave it
    /// untouched.
    pub last_known_state: Option<InstanceLifecycle>,
    /// Public DNS name. Empty until discovered; immutable once set for the
    /// life of the resource.
    pub assigned_host: String,
    /// Public IP, set together with the host.
    pub assigned_ip: Option<String>,
    /// When the current launch was initiated. Recorded once per launch and
    /// never reset by retries.
    pub start_time: Option<Instant>,
}

impl KernelResource {
    pub fn new(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            instance_id: None,
            last_known_state: None,
            assigned_host: String::new(),
            assigned_ip: None,
            start_time: None,
        }
    }

    /// Record a successfully observed lifecycle state.
    pub fn record_state(&mut self, state: InstanceLifecycle) {
        self.last_known_state = Some(state);
    }

    /// Record the assigned network location. The host is only ever set
    /// once; later observations cannot move a resource to a different
    /// address.
    pub fn record_endpoint(&mut self, public_dns: &str, public_ip: Option<&str>) {
        if self.assigned_host.is_empty() && !public_dns.is_empty() {
            self.assigned_host = public_dns.to_string();
            self.assigned_ip = public_ip.map(str::to_string);
        }
    }

    /// Elapsed time since the current launch was initiated.
    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }

    /// Forget the provider-side association so the next launch starts a
    /// fresh discovery cycle. The kernel id is retained.
    pub fn reset(&mut self) {
        self.instance_id = None;
        self.last_known_state = None;
        self.assigned_host.clear();
        self.assigned_ip = None;
        self.start_time = None;
    }
}

/// Persisted snapshot of a provisioner, sufficient for a restarted owner to
/// resume discovery of a still-running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerInfo {
    pub kernel_id: String,
    pub instance_id: Option<String>,
    pub last_known_state: Option<InstanceLifecycle>,
    /// Whatever blob the connection handshake produced; opaque here.
    pub connection_info: Option<serde_json::Value>,
}
