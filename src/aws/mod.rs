//! AWS EC2 facade for the lifecycle controller

pub mod ec2;
pub mod error;
pub mod tags;

pub use ec2::{Ec2Api, Ec2Client, InstanceDescription};
pub use error::AwsError;
