//! Identity resolution: mapping a kernel id to its provider instance id
//!
//! Creation and identity are eventually consistent: a create call can
//! succeed while the instance is not yet visible to DescribeInstances, and
//! a restarted controller has no in-memory id at all. The instance carrying
//! a kernel is therefore discovered by tag, and resolution never fails
//! hard - "not found yet" and "provider unreachable" are both absence,
//! retried by the next poll.

use tracing::{debug, warn};

use crate::aws::ec2::{Ec2Api, InstanceDescription};

/// Per-launch resolver state.
///
/// Holds only the warn-once bookkeeping so the "not found" message appears
/// once per discovery cycle instead of once per poll.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    warned_not_found: bool,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the warn-once bookkeeping for a fresh discovery cycle.
    pub fn reset(&mut self) {
        self.warned_not_found = false;
    }

    /// Look up the instance tagged with `kernel_id`.
    ///
    /// Multiple matches are a warning condition, not a failure: the
    /// earliest-launched eligible instance wins, deterministically. With
    /// `exclude_terminal` set, matches already in a terminal state are
    /// skipped so a new launch never attaches to a stale instance that
    /// shares the tag.
    pub async fn resolve<C: Ec2Api>(
        &mut self,
        client: &C,
        kernel_id: &str,
        exclude_terminal: bool,
    ) -> Option<InstanceDescription> {
        let mut matches = client.describe_by_tag(kernel_id).await;

        if matches.is_empty() {
            if !self.warned_not_found {
                warn!(kernel_id = %kernel_id, "No instance found for kernel. Continuing...");
                self.warned_not_found = true;
            } else {
                debug!(kernel_id = %kernel_id, "Instance id not yet assigned - retrying...");
            }
            return None;
        }

        if matches.len() > 1 {
            warn!(
                kernel_id = %kernel_id,
                count = matches.len(),
                "Multiple instances share the kernel tag - using the earliest-launched"
            );
        }

        // Earliest launch time wins; instances without one sort last, ties
        // break on instance id so the pick stays deterministic.
        matches.sort_by_key(|m| (m.launch_time.is_none(), m.launch_time, m.instance_id.clone()));

        let picked = matches
            .into_iter()
            .find(|m| !(exclude_terminal && m.state.is_terminal()));

        match &picked {
            Some(m) => {
                debug!(
                    kernel_id = %kernel_id,
                    instance_id = %m.instance_id,
                    state = %m.state,
                    "Resolved kernel instance"
                );
            }
            None => {
                debug!(
                    kernel_id = %kernel_id,
                    "Only terminal-state matches for kernel; ignoring them"
                );
            }
        }

        picked
    }
}
