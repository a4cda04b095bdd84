//! Controller error taxonomy
//!
//! Transient remote failures never surface here: they are absorbed at the
//! EC2 facade and retried by the next scheduled poll. Only conditions that
//! end a launch reach the owning scheduler.

use thiserror::Error;

use crate::resource::InstanceLifecycle;

/// Fatal launch conditions surfaced by the lifecycle controller
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// The launch budget was exhausted before the kernel connected. A
    /// best-effort kill has already been issued; `reason` names the phase
    /// that stalled.
    #[error("kernel '{kernel_id}' launch timed out: {reason}")]
    LaunchTimeout { kernel_id: String, reason: String },

    /// The instance was observed in a terminal state while the launch was
    /// still awaiting connection - it failed to boot, and further waiting
    /// is pointless.
    #[error(
        "kernel '{kernel_id}': instance '{instance_id}' unexpectedly found in state '{state}' during startup"
    )]
    PrematureTerminal {
        kernel_id: String,
        instance_id: String,
        state: InstanceLifecycle,
    },

    /// The launch was cancelled. The partially-launched instance has been
    /// killed before this was raised, so cancellation never leaks a
    /// running instance.
    #[error("kernel '{kernel_id}' launch cancelled")]
    Cancelled { kernel_id: String },
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;
