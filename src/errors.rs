use thiserror::Error;

/// Malformed spec input. Surfaced to the caller and never retried.
#[derive(Debug, Error)]
#[error("invalid: {0}")]
pub struct Invalid(pub String);

pub fn is_invalid(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Invalid>().is_some()
}

/// Unrecoverable configuration corruption. The record is marked failed and
/// not retried.
#[derive(Debug, Error)]
#[error("fatal: {0}")]
pub struct Fatal(pub String);

pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Fatal>().is_some()
}
