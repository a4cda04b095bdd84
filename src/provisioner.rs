//! The kernel lifecycle controller
//!
//! One `Ec2KernelProvisioner` owns the full lifecycle of one kernel's
//! instance: launch, identity discovery, connection confirmation, signal
//! routing, shutdown, and cleanup. The owning scheduler drives it
//! sequentially - operations for the same kernel never run concurrently.
//!
//! Phases move `Unprovisioned -> Launching -> Identified ->
//! AwaitingConnection -> Connected`, with `ShuttingDown`/`Terminated` on the
//! way down and `Failed` absorbing fatal launch conditions. Transient remote
//! failures never change phase; they are absorbed by the EC2 facade and the
//! state cache, and retried on the next poll.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aws::ec2::{Ec2Api, InstanceDescription};
use crate::aws::error::{classify_anyhow_error, AwsError};
use crate::config::{LaunchSpec, ProvisionerConfig};
use crate::connect::{ConnectionHandshake, RemoteSignaler};
use crate::error::{ProvisionerError, Result};
use crate::resolver::IdentityResolver;
use crate::resource::{InstanceLifecycle, KernelResource, ProvisionerInfo};

/// Conventional kill signal number; routed to [`Ec2KernelProvisioner::kill`].
pub const SIGKILL: i32 = 9;

/// Where a controller is in its resource's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// No resource associated
    #[default]
    Unprovisioned,
    /// Create issued, identity not yet confirmed
    Launching,
    /// Provider instance id confirmed
    Identified,
    /// Instance known, waiting for the kernel to hand over connection info
    AwaitingConnection,
    /// Kernel connected; the launch is complete
    Connected,
    /// Termination requested, terminal state not yet observed
    ShuttingDown,
    /// Terminal state observed
    Terminated,
    /// A fatal launch condition was surfaced
    Failed,
}

/// Result of a liveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Still launching or running
    Alive,
    /// Observed in a terminal state
    Exited,
}

/// Outcome of a kill or terminate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// A terminal state was observed after the terminate call
    ConfirmedTerminal,
    /// Termination was not confirmed within the attempt budget; reports
    /// whether the fallback remote kill signal was acknowledged
    SignalFallback { delivered: bool },
    /// No instance was ever associated; nothing to shut down
    NoResource,
}

/// Lifecycle controller for one kernel's EC2 instance.
pub struct Ec2KernelProvisioner<C, H, S> {
    config: ProvisionerConfig,
    spec: LaunchSpec,
    client: C,
    handshake: H,
    signaler: S,
    resource: KernelResource,
    resolver: IdentityResolver,
    connection_info: Option<Value>,
    phase: Phase,
}

impl<C, H, S> Ec2KernelProvisioner<C, H, S>
where
    C: Ec2Api,
    H: ConnectionHandshake,
    S: RemoteSignaler,
{
    pub fn new(
        config: ProvisionerConfig,
        spec: LaunchSpec,
        client: C,
        handshake: H,
        signaler: S,
    ) -> Self {
        let resource = KernelResource::new(spec.kernel_id.clone());
        Self {
            config,
            spec,
            client,
            handshake,
            signaler,
            resource,
            resolver: IdentityResolver::new(),
            connection_info: None,
            phase: Phase::Unprovisioned,
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.resource.kernel_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn resource(&self) -> &KernelResource {
        &self.resource
    }

    /// Whether a provider-side instance is currently associated.
    pub fn has_resource(&self) -> bool {
        self.resource.instance_id.is_some()
    }

    /// Connection info received from the kernel, once connected.
    pub fn connection_info(&self) -> Option<&Value> {
        self.connection_info.as_ref()
    }

    /// Start (or resume) a launch. Idempotent: a controller that already
    /// knows its instance id does not create another instance.
    ///
    /// With `existing_instance_id` configured the given instance is adopted
    /// directly - the recovery/debug path that points a controller at a
    /// pre-existing instance without a create call.
    pub async fn launch(&mut self) -> Result<()> {
        if self.resource.start_time.is_none() {
            self.resource.start_time = Some(Instant::now());
        }

        if let Some(existing) = self.config.existing_instance_id.clone() {
            info!(
                kernel_id = %self.resource.kernel_id,
                instance_id = %existing,
                "Adopting existing instance"
            );
            self.resource.instance_id = Some(existing);
            self.phase = Phase::Identified;
            return Ok(());
        }

        if self.resource.instance_id.is_some() {
            debug!(
                kernel_id = %self.resource.kernel_id,
                instance_id = ?self.resource.instance_id,
                "Launch already in progress"
            );
            return Ok(());
        }

        match self.client.create_instance(&self.spec).await {
            Ok(instance_id) => {
                // Identity is still established through the tag lookup, so a
                // first launch and a post-restart resume follow one path.
                info!(
                    kernel_id = %self.resource.kernel_id,
                    instance_id = %instance_id,
                    "Create accepted; awaiting discovery"
                );
                self.phase = Phase::Launching;
            }
            Err(e) => match classify_anyhow_error(&e) {
                AwsError::DryRunSucceeded => {
                    info!(
                        kernel_id = %self.resource.kernel_id,
                        "Dry run validated; no instance launched"
                    );
                }
                other => {
                    // Left for the launch budget: if discovery never
                    // succeeds, the timeout reports that no instance id was
                    // ever assigned.
                    warn!(
                        kernel_id = %self.resource.kernel_id,
                        error = %other,
                        "Create request failed; discovery will keep trying"
                    );
                    self.phase = Phase::Launching;
                }
            },
        }

        Ok(())
    }

    /// One liveness check. Resolves identity if it is not yet known and
    /// performs at most one further query; never raises on a remote
    /// failure, falling back to the cached state instead.
    pub async fn poll(&mut self) -> Liveness {
        let Some(instance_id) = self.resource.instance_id.clone() else {
            // Still in discovery: identity resolution only, nothing more.
            let kernel_id = self.resource.kernel_id.clone();
            if let Some(found) = self.resolver.resolve(&self.client, &kernel_id, false).await {
                self.adopt(found);
            }
            return Liveness::Alive;
        };

        let state = match self.client.describe_by_id(&instance_id).await {
            Some(description) => {
                let state = description.state;
                self.observe(&description);
                Some(state)
            }
            // Transient failure: the cache holds the last good observation.
            None => self.resource.last_known_state,
        };

        debug!(
            kernel_id = %self.resource.kernel_id,
            instance_id = %instance_id,
            state = ?state,
            "Polled instance"
        );

        match state {
            Some(state) if state.is_terminal() => Liveness::Exited,
            // An unknown state is not evidence of death.
            _ => Liveness::Alive,
        }
    }

    /// Wait for the kernel to come up and hand over its connection info.
    ///
    /// The only long suspension in the controller: it sleeps one poll
    /// interval between attempts and loops until connected, the launch
    /// budget runs out ([`ProvisionerError::LaunchTimeout`], preceded by a
    /// best-effort kill), the instance is seen in a terminal state
    /// ([`ProvisionerError::PrematureTerminal`]), or `cancel` fires
    /// (which also kills the instance, so a cancelled launch never leaks).
    pub async fn await_connection(&mut self, cancel: Option<&CancellationToken>) -> Result<()> {
        if self.phase == Phase::Connected {
            return Ok(());
        }
        self.phase = Phase::AwaitingConnection;
        // Timeout is measured from launch initiation; a caller that skipped
        // launch() still gets a bounded wait.
        if self.resource.start_time.is_none() {
            self.resource.start_time = Some(Instant::now());
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if self.sleep_one_interval(cancel).await.is_err() {
                warn!(
                    kernel_id = %self.resource.kernel_id,
                    "Launch cancelled; killing partially-launched instance"
                );
                self.kill().await;
                self.phase = Phase::Failed;
                return Err(ProvisionerError::Cancelled {
                    kernel_id: self.resource.kernel_id.clone(),
                });
            }

            self.check_launch_timeout().await?;

            if self.resource.instance_id.is_none() {
                // Establishing a new launch: never attach to a stale
                // terminal-state instance that shares the tag.
                let kernel_id = self.resource.kernel_id.clone();
                match self.resolver.resolve(&self.client, &kernel_id, true).await {
                    Some(found) => self.adopt(found),
                    None => continue,
                }
            }

            let Some(instance_id) = self.resource.instance_id.clone() else {
                continue;
            };

            let state = match self.client.describe_by_id(&instance_id).await {
                Some(description) => {
                    let state = description.state;
                    self.observe(&description);
                    Some(state)
                }
                None => self.resource.last_known_state,
            };

            if let Some(state) = state {
                if state.is_terminal() {
                    error!(
                        kernel_id = %self.resource.kernel_id,
                        instance_id = %instance_id,
                        state = %state,
                        "Instance died before the kernel connected"
                    );
                    self.phase = Phase::Failed;
                    return Err(ProvisionerError::PrematureTerminal {
                        kernel_id: self.resource.kernel_id.clone(),
                        instance_id,
                        state,
                    });
                }
            }

            debug!(
                attempt,
                kernel_id = %self.resource.kernel_id,
                instance_id = %instance_id,
                state = ?state,
                host = %self.resource.assigned_host,
                "Awaiting kernel connection"
            );

            if !self.resource.assigned_host.is_empty() {
                if let Some(info) = self
                    .handshake
                    .try_receive(&self.resource.kernel_id, &self.resource.assigned_host)
                    .await
                {
                    info!(
                        kernel_id = %self.resource.kernel_id,
                        instance_id = %instance_id,
                        host = %self.resource.assigned_host,
                        "Kernel connected"
                    );
                    self.connection_info = Some(info);
                    self.phase = Phase::Connected;
                    return Ok(());
                }
            }
        }
    }

    /// Route a signal. 0 is a liveness check, SIGKILL a forced shutdown;
    /// anything else goes over the remote side channel, best-effort,
    /// because the instance API cannot express process signals.
    pub async fn send_signal(&mut self, signum: i32) {
        if signum == 0 {
            self.poll().await;
        } else if signum == SIGKILL {
            self.kill().await;
        } else if !self.resource.assigned_host.is_empty() {
            debug!(
                kernel_id = %self.resource.kernel_id,
                signum,
                "Delivering signal over the side channel"
            );
            let delivered = self
                .signaler
                .deliver(&self.resource.assigned_host, signum)
                .await;
            if !delivered {
                warn!(
                    kernel_id = %self.resource.kernel_id,
                    signum,
                    "Signal delivery was not acknowledged"
                );
            }
        } else {
            debug!(
                kernel_id = %self.resource.kernel_id,
                signum,
                "No assigned host yet; dropping signal"
            );
        }
    }

    /// Force-terminate the instance: graceful terminate-then-confirm first,
    /// remote kill signal as fallback. Reports the outcome and never raises,
    /// including for an already-terminated resource.
    pub async fn kill(&mut self) -> ShutdownOutcome {
        let outcome = match self.resource.instance_id.clone() {
            None => ShutdownOutcome::NoResource,
            Some(instance_id) => match self.shutdown_resource(&instance_id).await {
                Some(state) => {
                    self.phase = Phase::Terminated;
                    debug!(
                        kernel_id = %self.resource.kernel_id,
                        instance_id = %instance_id,
                        state = %state,
                        "Shutdown confirmed"
                    );
                    ShutdownOutcome::ConfirmedTerminal
                }
                None => {
                    debug!(
                        kernel_id = %self.resource.kernel_id,
                        instance_id = %instance_id,
                        "Termination unconfirmed; killing via remote signal"
                    );
                    let delivered = if self.resource.assigned_host.is_empty() {
                        false
                    } else {
                        self.signaler
                            .deliver(&self.resource.assigned_host, SIGKILL)
                            .await
                    };
                    if !delivered {
                        warn!(
                            kernel_id = %self.resource.kernel_id,
                            instance_id = %instance_id,
                            "Remote kill signal was not acknowledged"
                        );
                    }
                    ShutdownOutcome::SignalFallback { delivered }
                }
            },
        };

        debug!(
            kernel_id = %self.resource.kernel_id,
            instance_id = ?self.resource.instance_id,
            state = ?self.resource.last_known_state,
            outcome = ?outcome,
            "Kill finished"
        );
        outcome
    }

    /// Normal teardown. Semantically the same trigger as [`Self::kill`];
    /// `restart` is informational at this layer and forwarded to the log
    /// only.
    pub async fn terminate(&mut self, restart: bool) -> ShutdownOutcome {
        debug!(
            kernel_id = %self.resource.kernel_id,
            instance_id = ?self.resource.instance_id,
            restart,
            "Terminate requested"
        );
        self.kill().await
    }

    /// Drop the in-memory association with the provider-side resource so a
    /// subsequent launch starts a fresh discovery cycle. Idempotent and
    /// safe to call when nothing was ever launched.
    pub fn cleanup(&mut self, restart: bool) {
        if self.resource.instance_id.is_none() && self.phase == Phase::Unprovisioned {
            debug!(kernel_id = %self.resource.kernel_id, restart, "Nothing to clean up");
            return;
        }

        debug!(
            kernel_id = %self.resource.kernel_id,
            instance_id = ?self.resource.instance_id,
            restart,
            "Clearing instance association"
        );
        self.resource.reset();
        self.connection_info = None;
        self.resolver.reset();
        self.phase = Phase::Unprovisioned;
    }

    /// Snapshot for persistence, so a restarted owner can resume discovery
    /// of a still-running instance.
    pub fn get_info(&self) -> ProvisionerInfo {
        ProvisionerInfo {
            kernel_id: self.resource.kernel_id.clone(),
            instance_id: self.resource.instance_id.clone(),
            last_known_state: self.resource.last_known_state,
            connection_info: self.connection_info.clone(),
        }
    }

    /// Restore a previously persisted snapshot.
    pub fn load_info(&mut self, info: ProvisionerInfo) {
        self.resource.kernel_id = info.kernel_id;
        self.resource.instance_id = info.instance_id;
        self.resource.last_known_state = info.last_known_state;
        self.connection_info = info.connection_info;
        if self.resource.instance_id.is_some() {
            self.phase = Phase::Identified;
        }
    }

    /// Shutdown wait hint for the owning scheduler. EC2 termination takes
    /// longer than typical process teardown, so the recommendation is
    /// raised to at least the configured wait.
    pub fn recommended_shutdown_wait(&self, recommended: Duration) -> Duration {
        if recommended < self.config.shutdown_wait {
            debug!(
                kernel_id = %self.resource.kernel_id,
                adjusted_secs = self.config.shutdown_wait.as_secs(),
                "Shutdown wait time adjusted"
            );
            self.config.shutdown_wait
        } else {
            recommended
        }
    }

    /// Terminate and poll until a terminal state is observed, bounded by
    /// the attempt budget. Only an observed terminal state counts as
    /// confirmed; exhausting the budget reports unconfirmed, never success.
    async fn shutdown_resource(&mut self, instance_id: &str) -> Option<InstanceLifecycle> {
        self.phase = Phase::ShuttingDown;
        self.client.terminate(instance_id).await;

        for attempt in 1..=self.config.max_poll_attempts {
            if let Some(description) = self.client.describe_by_id(instance_id).await {
                let state = description.state;
                self.observe(&description);
                if state.is_terminal() {
                    info!(
                        kernel_id = %self.resource.kernel_id,
                        instance_id = %instance_id,
                        state = %state,
                        attempt,
                        "Instance shutdown confirmed"
                    );
                    return Some(state);
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            kernel_id = %self.resource.kernel_id,
            instance_id = %instance_id,
            attempts = self.config.max_poll_attempts,
            "Shutdown not confirmed within the attempt budget"
        );
        None
    }

    /// Adopt a freshly resolved instance identity.
    fn adopt(&mut self, description: InstanceDescription) {
        let elapsed_secs = self
            .resource
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or_default();
        info!(
            kernel_id = %self.resource.kernel_id,
            instance_id = %description.instance_id,
            state = %description.state,
            elapsed_secs,
            "Instance id assigned for kernel"
        );
        self.resource.instance_id = Some(description.instance_id.clone());
        self.observe(&description);
        if matches!(self.phase, Phase::Unprovisioned | Phase::Launching) {
            self.phase = Phase::Identified;
        }
    }

    /// Feed one successful observation into the state cache.
    fn observe(&mut self, description: &InstanceDescription) {
        self.resource.record_state(description.state);
        self.resource
            .record_endpoint(&description.public_dns, description.public_ip.as_deref());
    }

    /// Fixed-interval suspension between polling attempts. `Err` means the
    /// launch was cancelled mid-sleep.
    async fn sleep_one_interval(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> std::result::Result<(), ()> {
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => Ok(()),
                    _ = token.cancelled() => Err(()),
                }
            }
            None => {
                tokio::time::sleep(self.config.poll_interval).await;
                Ok(())
            }
        }
    }

    /// Raise `LaunchTimeout` once the budget is exhausted, naming the phase
    /// that stalled and best-effort killing the partial launch first.
    async fn check_launch_timeout(&mut self) -> Result<()> {
        let elapsed = match self.resource.elapsed() {
            Some(elapsed) => elapsed,
            None => return Ok(()),
        };
        if elapsed <= self.config.launch_timeout {
            return Ok(());
        }

        let timeout_secs = self.config.launch_timeout.as_secs();
        let reason = match &self.resource.instance_id {
            None => format!(
                "no instance id was ever assigned for the kernel within {timeout_secs}s; \
                 check the server log for more information"
            ),
            Some(instance_id)
                if self.resource.last_known_state == Some(InstanceLifecycle::Running) =>
            {
                format!(
                    "instance '{instance_id}' is running, but the kernel's connection info \
                     was not received within {timeout_secs}s; check the instance's boot log"
                )
            }
            Some(instance_id) => {
                let state = self
                    .resource
                    .last_known_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "instance '{instance_id}' did not reach running within {timeout_secs}s \
                     (last state: {state}); check capacity and configuration"
                )
            }
        };

        warn!(
            kernel_id = %self.resource.kernel_id,
            elapsed_secs = elapsed.as_secs(),
            reason = %reason,
            "Launch timeout exceeded; killing partially-launched instance"
        );
        self.kill().await;
        self.phase = Phase::Failed;
        Err(ProvisionerError::LaunchTimeout {
            kernel_id: self.resource.kernel_id.clone(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::ec2::MockEc2Api;
    use crate::connect::{MockConnectionHandshake, MockRemoteSignaler};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const HOST: &str = "ec2-1-2-3-4.us-east-2.compute.amazonaws.com";

    fn test_config() -> ProvisionerConfig {
        ProvisionerConfig {
            region: "us-east-2".to_string(),
            launch_timeout: Duration::from_millis(80),
            poll_interval: Duration::from_millis(5),
            max_poll_attempts: 3,
            request_timeout: Duration::from_secs(1),
            shutdown_wait: Duration::from_secs(15),
            existing_instance_id: None,
        }
    }

    fn test_spec() -> LaunchSpec {
        LaunchSpec::new("kernel-1", "ami-0123456789abcdef0", "t3.medium", "#!/bin/sh\n")
    }

    fn desc(instance_id: &str, state: InstanceLifecycle, dns: &str) -> InstanceDescription {
        InstanceDescription {
            instance_id: instance_id.to_string(),
            state,
            public_dns: dns.to_string(),
            public_ip: if dns.is_empty() {
                None
            } else {
                Some("1.2.3.4".to_string())
            },
            launch_time: None,
        }
    }

    fn provisioner(
        config: ProvisionerConfig,
        client: MockEc2Api,
        handshake: MockConnectionHandshake,
        signaler: MockRemoteSignaler,
    ) -> Ec2KernelProvisioner<MockEc2Api, MockConnectionHandshake, MockRemoteSignaler> {
        Ec2KernelProvisioner::new(config, test_spec(), client, handshake, signaler)
    }

    fn identified(
        config: ProvisionerConfig,
        client: MockEc2Api,
        handshake: MockConnectionHandshake,
        signaler: MockRemoteSignaler,
        instance_id: &str,
    ) -> Ec2KernelProvisioner<MockEc2Api, MockConnectionHandshake, MockRemoteSignaler> {
        let mut p = provisioner(config, client, handshake, signaler);
        p.load_info(ProvisionerInfo {
            kernel_id: "kernel-1".to_string(),
            instance_id: Some(instance_id.to_string()),
            last_known_state: None,
            connection_info: None,
        });
        p
    }

    #[tokio::test]
    async fn launch_adopts_existing_instance_without_creating() {
        let mut config = test_config();
        config.existing_instance_id = Some("i-existing".to_string());

        // No create_instance expectation: a create call would panic.
        let client = MockEc2Api::new();
        let mut p = provisioner(
            config,
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );

        p.launch().await.unwrap();
        assert_eq!(p.phase(), Phase::Identified);
        assert_eq!(p.resource().instance_id.as_deref(), Some("i-existing"));

        // Idempotent.
        p.launch().await.unwrap();
        assert_eq!(p.phase(), Phase::Identified);
    }

    #[tokio::test]
    async fn launch_issues_exactly_one_create() {
        let mut client = MockEc2Api::new();
        client
            .expect_create_instance()
            .times(1)
            .returning(|_| Ok("i-0new".to_string()));
        client.expect_describe_by_tag().returning(|_| Vec::new());

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );

        p.launch().await.unwrap();
        assert_eq!(p.phase(), Phase::Launching);

        // The create response id is not adopted; identity comes from the
        // tag lookup.
        assert!(p.resource().instance_id.is_none());

        // Once discovery confirms an id, relaunching does not create again.
        p.poll().await;
        p.load_info(ProvisionerInfo {
            kernel_id: "kernel-1".to_string(),
            instance_id: Some("i-0new".to_string()),
            last_known_state: None,
            connection_info: None,
        });
        p.launch().await.unwrap();
    }

    #[tokio::test]
    async fn dry_run_validates_without_launching() {
        let mut client = MockEc2Api::new();
        client.expect_create_instance().times(1).returning(|_| {
            Err(anyhow::anyhow!(
                "DryRunOperation: Request would have succeeded, but DryRun flag is set."
            ))
        });

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        p.launch().await.unwrap();
        assert_eq!(p.phase(), Phase::Unprovisioned);
    }

    #[tokio::test]
    async fn poll_without_identity_only_resolves_by_tag() {
        let mut client = MockEc2Api::new();
        client
            .expect_describe_by_tag()
            .times(1)
            .returning(|_| Vec::new());
        client.expect_describe_by_id().never();

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        assert_eq!(p.poll().await, Liveness::Alive);
        assert!(p.resource().instance_id.is_none());
    }

    #[tokio::test]
    async fn poll_reports_liveness_from_observed_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_mock = calls.clone();

        let mut client = MockEc2Api::new();
        client.expect_describe_by_id().returning(move |_| {
            match calls_in_mock.fetch_add(1, Ordering::SeqCst) {
                0 => Some(desc("i-0abc", InstanceLifecycle::Pending, "")),
                1 => Some(desc("i-0abc", InstanceLifecycle::Running, HOST)),
                // Transient failure: the cached running state carries the
                // poll.
                2 => None,
                _ => Some(desc("i-0abc", InstanceLifecycle::Terminated, HOST)),
            }
        });

        let mut p = identified(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
            "i-0abc",
        );

        assert_eq!(p.poll().await, Liveness::Alive); // pending
        assert_eq!(p.poll().await, Liveness::Alive); // running
        assert_eq!(p.poll().await, Liveness::Alive); // query failed, cache says running
        assert_eq!(p.poll().await, Liveness::Exited); // terminated
        assert_eq!(p.resource().assigned_host, HOST);
    }

    #[tokio::test]
    async fn await_connection_reaches_connected() {
        let mut client = MockEc2Api::new();
        client
            .expect_describe_by_tag()
            .times(1)
            .returning(|_| vec![desc("i-0abc", InstanceLifecycle::Pending, "")]);

        let describe_calls = Arc::new(AtomicUsize::new(0));
        let describe_in_mock = describe_calls.clone();
        client.expect_describe_by_id().returning(move |_| {
            match describe_in_mock.fetch_add(1, Ordering::SeqCst) {
                0 => Some(desc("i-0abc", InstanceLifecycle::Pending, "")),
                _ => Some(desc("i-0abc", InstanceLifecycle::Running, HOST)),
            }
        });

        let mut handshake = MockConnectionHandshake::new();
        let receive_calls = Arc::new(AtomicUsize::new(0));
        let receive_in_mock = receive_calls.clone();
        handshake
            .expect_try_receive()
            .with(eq("kernel-1"), eq(HOST))
            .returning(move |_, _| match receive_in_mock.fetch_add(1, Ordering::SeqCst) {
                0 => None,
                _ => Some(serde_json::json!({"shell_port": 46001})),
            });

        let mut p = provisioner(
            test_config(),
            client,
            handshake,
            MockRemoteSignaler::new(),
        );
        p.resource.start_time = Some(Instant::now());

        p.await_connection(None).await.unwrap();
        assert_eq!(p.phase(), Phase::Connected);

        let info = p.get_info();
        assert_eq!(info.instance_id.as_deref(), Some("i-0abc"));
        assert_eq!(info.last_known_state, Some(InstanceLifecycle::Running));
        assert!(info.connection_info.is_some());
    }

    #[tokio::test]
    async fn await_connection_times_out_within_budget_when_nothing_appears() {
        let mut client = MockEc2Api::new();
        client
            .expect_create_instance()
            .returning(|_| Ok("i-0new".to_string()));
        client.expect_describe_by_tag().returning(|_| Vec::new());
        client.expect_describe_by_id().never();

        let config = test_config();
        let launch_timeout = config.launch_timeout;
        let poll_interval = config.poll_interval;

        let mut p = provisioner(
            config,
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        p.launch().await.unwrap();

        let started = Instant::now();
        let err = p.await_connection(None).await.unwrap_err();
        let elapsed = started.elapsed();

        match &err {
            ProvisionerError::LaunchTimeout { reason, .. } => {
                assert!(
                    reason.contains("no instance id"),
                    "reason names the stalled phase: {reason}"
                );
            }
            other => panic!("expected LaunchTimeout, got {other:?}"),
        }
        assert_eq!(p.phase(), Phase::Failed);

        // Bounded by the budget plus a few poll intervals of slack.
        assert!(
            elapsed < launch_timeout + poll_interval * 10,
            "timed out too late: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn launch_timeout_kills_the_partial_launch_first() {
        let mut client = MockEc2Api::new();
        client
            .expect_create_instance()
            .returning(|_| Ok("i-0slow".to_string()));
        client
            .expect_describe_by_tag()
            .returning(|_| vec![desc("i-0slow", InstanceLifecycle::Pending, "")]);
        client
            .expect_describe_by_id()
            .returning(|_| Some(desc("i-0slow", InstanceLifecycle::Pending, "")));
        // The kill attempt must reach the client before the error surfaces.
        client
            .expect_terminate()
            .times(1..)
            .returning(|_| true);

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        p.launch().await.unwrap();

        let err = p.await_connection(None).await.unwrap_err();
        match &err {
            ProvisionerError::LaunchTimeout { reason, .. } => {
                assert!(
                    reason.contains("did not reach running"),
                    "reason names the stalled phase: {reason}"
                );
            }
            other => panic!("expected LaunchTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_connection_fails_fast_on_premature_terminal() {
        let mut client = MockEc2Api::new();
        client
            .expect_describe_by_tag()
            .times(1)
            .returning(|_| vec![desc("i-0abc", InstanceLifecycle::Pending, "")]);
        client
            .expect_describe_by_id()
            .times(1)
            .returning(|_| Some(desc("i-0abc", InstanceLifecycle::Terminated, "")));
        // No kill for a resource that is already dead.
        client.expect_terminate().never();

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        p.resource.start_time = Some(Instant::now());

        let err = p.await_connection(None).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionerError::PrematureTerminal {
                state: InstanceLifecycle::Terminated,
                ..
            }
        ));
        assert_eq!(p.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn fresh_launch_never_adopts_a_terminated_instance_with_the_same_tag() {
        let mut client = MockEc2Api::new();
        client
            .expect_create_instance()
            .returning(|_| Ok("i-0new".to_string()));
        // Only a stale terminated instance carries the tag; it must never
        // be adopted, so no by-id query ever happens.
        client
            .expect_describe_by_tag()
            .returning(|_| vec![desc("i-0stale", InstanceLifecycle::Terminated, "")]);
        client.expect_describe_by_id().never();

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        p.cleanup(false);
        p.launch().await.unwrap();

        let err = p.await_connection(None).await.unwrap_err();
        match err {
            ProvisionerError::LaunchTimeout { reason, .. } => {
                assert!(reason.contains("no instance id"));
            }
            other => panic!("expected LaunchTimeout, got {other:?}"),
        }
        assert!(p.resource().instance_id.is_none());
    }

    #[tokio::test]
    async fn cancellation_kills_before_propagating() {
        let mut client = MockEc2Api::new();
        client
            .expect_describe_by_tag()
            .returning(|_| vec![desc("i-0abc", InstanceLifecycle::Pending, "")]);
        client
            .expect_describe_by_id()
            .returning(|_| Some(desc("i-0abc", InstanceLifecycle::Pending, "")));
        client.expect_terminate().times(1..).returning(|_| true);

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        p.resource.start_time = Some(Instant::now());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = p.await_connection(Some(&cancel)).await.unwrap_err();
        assert!(matches!(err, ProvisionerError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn kill_confirms_a_terminal_state() {
        let mut client = MockEc2Api::new();
        client
            .expect_terminate()
            .with(eq("i-0abc"))
            .times(1)
            .returning(|_| true);
        client
            .expect_describe_by_id()
            .returning(|_| Some(desc("i-0abc", InstanceLifecycle::ShuttingDown, HOST)));

        // Confirmed shutdown never touches the signaler.
        let signaler = MockRemoteSignaler::new();

        let mut p = identified(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            signaler,
            "i-0abc",
        );

        assert_eq!(p.kill().await, ShutdownOutcome::ConfirmedTerminal);
        assert_eq!(p.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn unconfirmed_shutdown_falls_back_to_the_remote_signal() {
        let config = test_config();
        let attempts = config.max_poll_attempts as usize;

        let mut client = MockEc2Api::new();
        client.expect_terminate().times(1).returning(|_| true);
        // The instance keeps reporting running until the attempt budget is
        // exhausted.
        client
            .expect_describe_by_id()
            .times(attempts + 1)
            .returning(|_| Some(desc("i-0abc", InstanceLifecycle::Running, HOST)));

        let mut signaler = MockRemoteSignaler::new();
        signaler
            .expect_deliver()
            .with(eq(HOST), eq(SIGKILL))
            .times(1)
            .returning(|_, _| true);

        let mut p = identified(
            config,
            client,
            MockConnectionHandshake::new(),
            signaler,
            "i-0abc",
        );
        // Learn the host so the fallback has somewhere to go.
        p.poll().await;

        assert_eq!(
            p.kill().await,
            ShutdownOutcome::SignalFallback { delivered: true }
        );
    }

    #[tokio::test]
    async fn kill_without_a_resource_is_a_no_op() {
        let client = MockEc2Api::new();
        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        assert_eq!(p.kill().await, ShutdownOutcome::NoResource);
        assert_eq!(p.terminate(true).await, ShutdownOutcome::NoResource);
    }

    #[tokio::test]
    async fn send_signal_routes_liveness_checks_and_interrupts() {
        let mut client = MockEc2Api::new();
        // signum 0 -> poll -> one by-id query.
        client
            .expect_describe_by_id()
            .times(1)
            .returning(|_| Some(desc("i-0abc", InstanceLifecycle::Running, HOST)));

        let mut signaler = MockRemoteSignaler::new();
        signaler
            .expect_deliver()
            .with(eq(HOST), eq(2))
            .times(1)
            .returning(|_, _| true);

        let mut p = identified(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            signaler,
            "i-0abc",
        );

        p.send_signal(0).await; // liveness check, learns the host
        p.send_signal(2).await; // interrupt over the side channel
    }

    #[tokio::test]
    async fn signals_before_a_host_is_known_are_dropped() {
        let client = MockEc2Api::new();
        let signaler = MockRemoteSignaler::new(); // a delivery would panic

        let mut p = provisioner(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            signaler,
        );
        p.send_signal(2).await;
    }

    #[tokio::test]
    async fn cleanup_twice_is_a_no_op_the_second_time() {
        let client = MockEc2Api::new();
        let mut p = identified(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
            "i-0abc",
        );

        p.cleanup(false);
        assert!(p.resource().instance_id.is_none());
        assert!(p.resource().last_known_state.is_none());
        assert_eq!(p.phase(), Phase::Unprovisioned);

        // Second cleanup takes the early-return path; nothing changes.
        p.cleanup(true);
        assert!(p.resource().instance_id.is_none());
        assert_eq!(p.phase(), Phase::Unprovisioned);
    }

    #[tokio::test]
    async fn info_round_trip_restores_identity() {
        let client = MockEc2Api::new();
        let mut p = identified(
            test_config(),
            client,
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
            "i-0abc",
        );
        let info = p.get_info();

        let mut restored = provisioner(
            test_config(),
            MockEc2Api::new(),
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        restored.load_info(info);

        assert_eq!(restored.resource().instance_id.as_deref(), Some("i-0abc"));
        assert_eq!(restored.phase(), Phase::Identified);
        assert!(restored.has_resource());
    }

    #[test]
    fn shutdown_wait_is_raised_to_the_configured_minimum() {
        let p = provisioner(
            test_config(),
            MockEc2Api::new(),
            MockConnectionHandshake::new(),
            MockRemoteSignaler::new(),
        );
        assert_eq!(
            p.recommended_shutdown_wait(Duration::from_secs(5)),
            Duration::from_secs(15)
        );
        assert_eq!(
            p.recommended_shutdown_wait(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }
}
