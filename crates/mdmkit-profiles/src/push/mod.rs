//! Push notifications that wake devices to fetch queued commands.

pub mod apns;

use std::collections::HashMap;

use async_trait::async_trait;

pub use apns::ApnsPusher;

/// Errors that prevent a push batch from producing per-device results.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Push details could not be loaded.
    #[error("push database error: {0}")]
    Database(#[from] crate::storage::DatabaseError),

    /// The push service could not be reached at all.
    #[error("push request error: {0}")]
    Request(String),
}

/// Outcome of the push to one enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    pub id: String,
    /// `None` when the push was accepted.
    pub error: Option<String>,
}

/// Sends MDM wake-up pushes to enrollments.
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Push to every enrollment. The result has one entry per ID.
    async fn push(&self, enrollment_ids: &[String])
    -> Result<HashMap<String, PushResponse>, PushError>;
}
