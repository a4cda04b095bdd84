//! Collaborator seams for the remote kernel
//!
//! The controller establishes that the instance exists and is healthy; the
//! protocol the kernel speaks once it is up belongs to another layer. These
//! traits are the two capabilities the controller needs from that layer,
//! injected at construction.

use serde_json::Value;

/// Receives the kernel's connection information once the instance is up.
///
/// Implementations typically listen on a response address the boot script
/// knows about; the controller only cares whether the info has arrived yet.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionHandshake: Send + Sync {
    /// One attempt to receive connection info from the kernel on
    /// `assigned_host`. `None` means not ready yet; the caller retries on
    /// its own schedule.
    async fn try_receive(&self, kernel_id: &str, assigned_host: &str) -> Option<Value>;
}

/// Best-effort signal delivery over a side channel to the remote kernel.
///
/// The instance API has no equivalent of process signals, so interrupts and
/// kills that cannot be expressed as instance operations fall through here.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait RemoteSignaler: Send + Sync {
    /// Deliver `signum` to the kernel process on `assigned_host`. Returns
    /// whether delivery was acknowledged.
    async fn deliver(&self, assigned_host: &str, signum: i32) -> bool;
}
