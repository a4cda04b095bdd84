//! ec2-kernel-provisioner - lifecycle controller for EC2-hosted kernels
//!
//! This crate manages the remote compute side of a single execution kernel:
//! it launches a transient EC2 instance to host the kernel, discovers the
//! instance's identity by tag, monitors its lifecycle state under a bounded
//! launch budget, and tears the instance down when the kernel goes away.
//!
//! The EC2 API is slow and eventually consistent: instance creation takes
//! tens of seconds, state queries fail transiently, and a restarted
//! controller must recover the instance identity it lost. The controller
//! absorbs all of that behind a small set of operations
//! ([`provisioner::Ec2KernelProvisioner`]) driven sequentially by an owning
//! scheduler, one controller per kernel.

pub mod aws;
pub mod config;
pub mod connect;
pub mod defaults;
pub mod error;
pub mod provisioner;
pub mod resolver;
pub mod resource;

pub use config::{LaunchSpec, ProvisionerConfig};
pub use error::ProvisionerError;
pub use provisioner::{Ec2KernelProvisioner, Liveness, Phase, ShutdownOutcome};
pub use resource::{InstanceLifecycle, KernelResource, ProvisionerInfo};
