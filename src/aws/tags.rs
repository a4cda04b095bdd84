//! AWS resource tag constants
//!
//! Every resource launched for a kernel (instance, root volume, network
//! interface) carries the kernel-id tag, so the instance's identity can be
//! re-resolved by tag lookup after a controller restart.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `kernel-provisioner:tool` | Static identifier ("ec2-kernel-provisioner") |
//! | `kernel-provisioner:kernel-id` | The kernel's stable identifier |
//! | `kernel-provisioner:created-at` | RFC 3339 creation timestamp |

use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};

/// Tag key for tool identification
pub const TAG_TOOL: &str = "kernel-provisioner:tool";

/// Tag value for tool identification
pub const TAG_TOOL_VALUE: &str = "ec2-kernel-provisioner";

/// Tag key carrying the kernel id - the discovery tag
pub const TAG_KERNEL_ID: &str = "kernel-provisioner:kernel-id";

/// Tag key for creation timestamp (RFC 3339 format)
pub const TAG_CREATED_AT: &str = "kernel-provisioner:created-at";

/// Helper to format creation timestamp for tags
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339()
}

/// Helper to parse creation timestamp from tags
pub fn parse_created_at(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

/// Build a TagSpecification with the standard kernel tags for one resource
/// type.
pub fn kernel_tag_spec(resource_type: ResourceType, kernel_id: &str) -> TagSpecification {
    let created_at = format_created_at(chrono::Utc::now());
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key(TAG_TOOL).value(TAG_TOOL_VALUE).build())
        .tags(Tag::builder().key(TAG_KERNEL_ID).value(kernel_id).build())
        .tags(
            Tag::builder()
                .key(TAG_CREATED_AT)
                .value(&created_at)
                .build(),
        )
        .tags(
            Tag::builder()
                .key("Name")
                .value(format!("kernel-{kernel_id}"))
                .build(),
        )
        .build()
}

/// Filter matching instances tagged with the given kernel id
pub fn kernel_id_filter(kernel_id: &str) -> Filter {
    Filter::builder()
        .name(format!("tag:{TAG_KERNEL_ID}"))
        .values(kernel_id)
        .build()
}
