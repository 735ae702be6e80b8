//! AWS error-code inspection
//!
//! `mk` operations are re-runnable: creating something that already exists is
//! reported and skipped instead of failing the whole command.

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use tracing::info;

/// Error codes AWS services use for "that resource is already there"
pub const ALREADY_EXISTS: &[&str] = &[
    "EntityAlreadyExists",
    "InvalidKeyPair.Duplicate",
    "InvalidGroup.Duplicate",
    "InvalidPermission.Duplicate",
    "ResourceAlreadyExistsException",
    "RepositoryAlreadyExistsException",
    "DuplicateTargetGroupName",
    "DuplicateLoadBalancerName",
    "DBSubnetGroupAlreadyExists",
    "DBInstanceAlreadyExists",
    "BucketAlreadyOwnedByYou",
];

/// Anything that can report a service error code.
pub trait ErrorCode {
    fn error_code(&self) -> Option<&str>;
}

impl<E: ProvideErrorMetadata, R> ErrorCode for SdkError<E, R> {
    fn error_code(&self) -> Option<&str> {
        self.code()
    }
}

pub fn is_code<E: ErrorCode + ?Sized>(err: &E, code: &str) -> bool {
    err.error_code() == Some(code)
}

pub fn is_already_exists<E: ErrorCode + ?Sized>(err: &E) -> bool {
    err.error_code()
        .map(|code| ALREADY_EXISTS.contains(&code))
        .unwrap_or(false)
}

/// Turn an already-exists failure into `Ok(None)`; other errors pass through.
pub fn tolerate_existing<T, E: ErrorCode>(result: Result<T, E>) -> Result<Option<T>, E> {
    tolerate_when(result, is_already_exists)
}

/// Like [`tolerate_existing`] for a single call-specific code.
pub fn tolerate_code<T, E: ErrorCode>(result: Result<T, E>, code: &str) -> Result<Option<T>, E> {
    tolerate_when(result, |err| is_code(err, code))
}

fn tolerate_when<T, E: ErrorCode>(
    result: Result<T, E>,
    existing: impl Fn(&E) -> bool,
) -> Result<Option<T>, E> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if existing(&err) => {
            info!(code = err.error_code().unwrap_or_default(), "already exists, skipping");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
