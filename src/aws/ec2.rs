//! EC2 instance management
//!
//! Thin facade over the EC2 API. Each operation is a single round trip with
//! a short per-request timeout; the only internal retry is for throttled
//! create calls. Queries never raise: transport failures are classified,
//! logged distinctly (unreachable vs not-found), and normalized to absence,
//! because the controller treats every query as potentially transient and
//! owns the retry policy itself.

use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, InstanceNetworkInterfaceSpecification, InstanceType,
    Placement, ResourceType, VolumeType,
};
use backon::{ExponentialBuilder, Retryable};
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aws::error::{classify_anyhow_error, AwsError};
use crate::aws::tags::{kernel_id_filter, kernel_tag_spec};
use crate::config::{LaunchSpec, ProvisionerConfig};
use crate::resource::InstanceLifecycle;

/// One instance observation from DescribeInstances.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceLifecycle,
    /// Public DNS name; empty while EC2 has not assigned one
    pub public_dns: String,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

/// EC2 operations used by the lifecycle controller.
///
/// Abstracted as a trait so the orchestration logic can be unit tested
/// without hitting real AWS.
#[allow(async_fn_in_trait)] // Internal use only, Send+Sync bounds on trait are sufficient
#[cfg_attr(test, mockall::automock)]
pub trait Ec2Api: Send + Sync {
    /// Create the kernel's instance. Returns the provider instance id.
    async fn create_instance(&self, spec: &LaunchSpec) -> Result<String>;

    /// Describe one instance by id. `None` means not found or the query
    /// failed transiently; the caller decides whether to retry.
    async fn describe_by_id(&self, instance_id: &str) -> Option<InstanceDescription>;

    /// Describe all instances carrying the kernel-id tag. Empty on failure.
    async fn describe_by_tag(&self, kernel_id: &str) -> Vec<InstanceDescription>;

    /// Request termination. Returns whether the request was accepted; an
    /// already-gone instance counts as accepted.
    async fn terminate(&self, instance_id: &str) -> bool;
}

/// EC2 client for managing kernel instances
#[derive(Clone)]
pub struct Ec2Client {
    client: aws_sdk_ec2::Client,
    request_timeout: Duration,
}

impl Ec2Client {
    /// Create a new EC2 client (loads AWS config from the environment)
    pub async fn new(config: &ProvisionerConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        Self {
            client: aws_sdk_ec2::Client::new(&sdk_config),
            request_timeout: config.request_timeout,
        }
    }

    /// Create a client around an already-constructed SDK client
    pub fn from_client(client: aws_sdk_ec2::Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    /// Launch the kernel's instance.
    ///
    /// Retries on AWS rate limiting; all other failures surface to the
    /// caller, which decides whether the launch budget absorbs them.
    pub async fn create_instance(&self, spec: &LaunchSpec) -> Result<String> {
        info!(
            kernel_id = %spec.kernel_id,
            instance_type = %spec.instance_type,
            ami = %spec.ami_id,
            dry_run = spec.dry_run,
            "Launching instance"
        );

        let user_data_b64 =
            base64::engine::general_purpose::STANDARD.encode(spec.user_data.as_bytes());

        (|| async { self.do_create_instance(spec, &user_data_b64).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(2))
                    .with_max_delay(Duration::from_secs(30))
                    .with_max_times(8),
            )
            .when(|e| matches!(classify_anyhow_error(e), AwsError::Throttled { .. }))
            .notify(|e, dur| {
                warn!(delay = ?dur, error = %e, "AWS rate limited, backing off...");
            })
            .await
    }

    /// Internal method to perform the actual RunInstances call
    async fn do_create_instance(&self, spec: &LaunchSpec, user_data_b64: &str) -> Result<String> {
        let instance_type: InstanceType = spec
            .instance_type
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid instance type: {}", spec.instance_type))?;

        let mut request = self
            .client
            .run_instances()
            .image_id(&spec.ami_id)
            .instance_type(instance_type)
            .min_count(1)
            .max_count(1)
            .user_data(user_data_b64)
            .dry_run(spec.dry_run)
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/sda1")
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(spec.volume_size_gib)
                            .volume_type(VolumeType::Gp3)
                            .delete_on_termination(true)
                            .encrypted(true)
                            .build(),
                    )
                    .build(),
            )
            .network_interfaces(
                InstanceNetworkInterfaceSpecification::builder()
                    .device_index(0)
                    .associate_public_ip_address(true)
                    .set_subnet_id(spec.subnet_id.clone())
                    .set_groups(spec.security_group_id.clone().map(|g| vec![g]))
                    .build(),
            )
            // The kernel-id tag goes on every resource the launch creates,
            // so cleanup can find them all.
            .tag_specifications(kernel_tag_spec(ResourceType::Instance, &spec.kernel_id))
            .tag_specifications(kernel_tag_spec(ResourceType::Volume, &spec.kernel_id))
            .tag_specifications(kernel_tag_spec(
                ResourceType::NetworkInterface,
                &spec.kernel_id,
            ));

        if let Some(zone) = &spec.availability_zone {
            request = request.placement(Placement::builder().availability_zone(zone).build());
        }

        let response = request.send().await.context("Failed to launch instance")?;

        let instance = response
            .instances()
            .first()
            .context("No instance returned")?;

        let instance_id = instance
            .instance_id()
            .context("No instance ID")?
            .to_string();

        info!(instance_id = %instance_id, kernel_id = %spec.kernel_id, "Instance launched");

        Ok(instance_id)
    }

    /// Describe one instance by id; absence covers both "gone" and
    /// "query failed".
    pub async fn describe_by_id(&self, instance_id: &str) -> Option<InstanceDescription> {
        debug!(instance_id = %instance_id, "Querying instance state");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.client
                .describe_instances()
                .instance_ids(instance_id)
                .send(),
        )
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log_query_failure(&anyhow::Error::from(e), instance_id);
                return None;
            }
            Err(_) => {
                warn!(
                    target_id = %instance_id,
                    timeout = ?self.request_timeout,
                    "Instance query timed out; treating state as unknown"
                );
                return None;
            }
        };

        let description = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(describe_instance);

        if description.is_none() {
            debug!(instance_id = %instance_id, "Instance not present in describe response");
        }
        description
    }

    /// Describe all instances carrying the kernel-id tag.
    pub async fn describe_by_tag(&self, kernel_id: &str) -> Vec<InstanceDescription> {
        let result = tokio::time::timeout(
            self.request_timeout,
            self.client
                .describe_instances()
                .filters(kernel_id_filter(kernel_id))
                .send(),
        )
        .await;

        match result {
            Ok(Ok(response)) => response
                .reservations()
                .iter()
                .flat_map(|r| r.instances())
                .filter_map(describe_instance)
                .collect(),
            Ok(Err(e)) => {
                log_query_failure(&anyhow::Error::from(e), kernel_id);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    kernel_id = %kernel_id,
                    timeout = ?self.request_timeout,
                    "Tag query timed out; treating result as unknown"
                );
                Vec::new()
            }
        }
    }

    /// Request termination of one instance.
    pub async fn terminate(&self, instance_id: &str) -> bool {
        info!(instance_id = %instance_id, "Terminating instance");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.client
                .terminate_instances()
                .instance_ids(instance_id)
                .send(),
        )
        .await;

        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                let err = anyhow::Error::from(e);
                if classify_anyhow_error(&err).is_not_found() {
                    debug!(instance_id = %instance_id, "Instance already gone");
                    true
                } else {
                    warn!(instance_id = %instance_id, error = ?err, "Termination request failed");
                    false
                }
            }
            Err(_) => {
                warn!(
                    instance_id = %instance_id,
                    timeout = ?self.request_timeout,
                    "Termination request timed out"
                );
                false
            }
        }
    }
}

impl Ec2Api for Ec2Client {
    async fn create_instance(&self, spec: &LaunchSpec) -> Result<String> {
        Ec2Client::create_instance(self, spec).await
    }

    async fn describe_by_id(&self, instance_id: &str) -> Option<InstanceDescription> {
        Ec2Client::describe_by_id(self, instance_id).await
    }

    async fn describe_by_tag(&self, kernel_id: &str) -> Vec<InstanceDescription> {
        Ec2Client::describe_by_tag(self, kernel_id).await
    }

    async fn terminate(&self, instance_id: &str) -> bool {
        Ec2Client::terminate(self, instance_id).await
    }
}

/// Distinguish "provider unreachable" from "not found" in the logs, so
/// operators can tell the difference; the return value is absence either
/// way.
fn log_query_failure(err: &anyhow::Error, target: &str) {
    match classify_anyhow_error(err) {
        AwsError::Unreachable { message } => {
            warn!(
                target_id = %target,
                error = %message,
                "EC2 endpoint unreachable; is the network up? Continuing..."
            );
        }
        AwsError::NotFound { .. } => {
            debug!(target_id = %target, "Instance not found. Continuing...");
        }
        other => {
            warn!(target_id = %target, error = %other, "Query failed. Continuing...");
        }
    }
}

/// Project the SDK instance shape into this crate's observation record.
fn describe_instance(instance: &aws_sdk_ec2::types::Instance) -> Option<InstanceDescription> {
    let instance_id = instance.instance_id()?.to_string();
    let state = instance
        .state()
        .and_then(|s| s.name())
        .and_then(InstanceLifecycle::from_state_name)?;

    let launch_time = instance
        .launch_time()
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));

    Some(InstanceDescription {
        instance_id,
        state,
        public_dns: instance.public_dns_name().unwrap_or_default().to_string(),
        public_ip: instance.public_ip_address().map(str::to_string),
        launch_time,
    })
}
