//! AWS error classification
//!
//! Typed errors for AWS SDK operations using the `.code()` method instead
//! of string matching on Debug format. The lifecycle controller treats
//! every query as potentially transient, so the facade needs to know which
//! failures mean "gone", which mean "unreachable", and which mean "back
//! off".

use thiserror::Error;

/// AWS error categories for retry and normalization logic
#[derive(Debug, Error)]
pub enum AwsError {
    /// Resource was not found (already gone, or not yet visible)
    #[error("resource not found: {message}")]
    NotFound { message: String },

    /// Rate limit exceeded (retryable with backoff)
    #[error("rate limit exceeded: {message}")]
    Throttled { message: String },

    /// The endpoint could not be reached at all (connection refused, DNS
    /// failure, request timeout). Logged distinctly from NotFound so
    /// operators can tell "not yet created" from "provider unreachable".
    #[error("provider unreachable: {message}")]
    Unreachable { message: String },

    /// A dry-run request that would have succeeded
    #[error("dry run succeeded")]
    DryRunSucceeded,

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AwsError::Throttled { .. } | AwsError::Unreachable { .. }
        )
    }

    /// Check if this is a transport-level failure
    pub fn is_unreachable(&self) -> bool {
        matches!(self, AwsError::Unreachable { .. })
    }
}

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidInstanceID.Malformed",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// DryRun flag was set and the request would have succeeded
const DRY_RUN_CODE: &str = "DryRunOperation";

/// Classify an AWS SDK error using the error code.
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound { message },
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled { message },
        Some(DRY_RUN_CODE) => AwsError::DryRunSucceeded,
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify an error from an `anyhow::Error` by extracting the AWS error code.
///
/// Walks the error chain using `ProvideErrorMetadata` to extract `.code()`
/// and `.message()` from any of the EC2 operation errors this crate issues.
/// Transport-level `SdkError` variants become [`AwsError::Unreachable`].
/// Falls back to string matching on the Debug representation if no typed
/// error is found.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<aws_sdk_ec2::error::SdkError<
            aws_sdk_ec2::operation::run_instances::RunInstancesError,
        >>() {
            return classify_sdk_error(e);
        }
        if let Some(e) = cause.downcast_ref::<aws_sdk_ec2::error::SdkError<
            aws_sdk_ec2::operation::describe_instances::DescribeInstancesError,
        >>() {
            return classify_sdk_error(e);
        }
        if let Some(e) = cause.downcast_ref::<aws_sdk_ec2::error::SdkError<
            aws_sdk_ec2::operation::terminate_instances::TerminateInstancesError,
        >>() {
            return classify_sdk_error(e);
        }
        // The facade wraps each round trip in a client-side timeout.
        if cause.is::<tokio::time::error::Elapsed>() {
            return AwsError::Unreachable {
                message: "request timed out".to_string(),
            };
        }
    }

    // Fallback: extract what we can from the debug representation
    let debug_str = format!("{:?}", error);
    if let Some(code) = extract_error_code(&debug_str) {
        return classify_aws_error(Some(&code), Some(&debug_str));
    }
    if looks_like_transport_failure(&debug_str) {
        return AwsError::Unreachable {
            message: error.to_string(),
        };
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

/// Classify one typed SdkError, separating transport failures from
/// service-level errors.
fn classify_sdk_error<E>(error: &aws_sdk_ec2::error::SdkError<E>) -> AwsError
where
    E: aws_sdk_ec2::error::ProvideErrorMetadata + std::error::Error + 'static,
{
    use aws_sdk_ec2::error::SdkError;

    match error {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => AwsError::Unreachable {
            message: error.to_string(),
        },
        _ => {
            let meta = aws_sdk_ec2::error::ProvideErrorMetadata::meta(error);
            classify_aws_error(meta.code(), meta.message())
        }
    }
}

/// All known AWS error codes for extraction from debug strings
const ALL_KNOWN_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidInstanceID.Malformed",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "DryRunOperation",
];

/// Extract an AWS error code from a debug string representation
fn extract_error_code(debug_str: &str) -> Option<String> {
    for code in ALL_KNOWN_CODES {
        if debug_str.contains(code) {
            return Some((*code).to_string());
        }
    }

    // Try to extract any code from the `code: Some("...")` pattern
    if let Some(start) = debug_str.find("code: Some(\"") {
        let rest = &debug_str[start + 12..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }

    None
}

/// Heuristic for transport failures that never carried an AWS error code
fn looks_like_transport_failure(debug_str: &str) -> bool {
    ["DispatchFailure", "connection refused", "dns error", "timed out"]
        .iter()
        .any(|needle| debug_str.contains(needle))
}
