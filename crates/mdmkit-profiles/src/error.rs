//! Error type of the profile engine.

use crate::commander::CommandError;
use crate::storage::DatabaseError;

/// Failure that aborts a preprocessing, reconcile or verification call.
///
/// Per-host problems never surface here: they are recorded as a `failed`
/// status with a detail on the host-profile row.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("invalid variable pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("command error: {0}")]
    Command(#[from] CommandError),
}
