//! mdmkit Profile Engine
//!
//! Delivery of configuration profiles to managed Apple devices:
//! - Fleet variable substitution with per-host certificate material
//! - Signed InstallProfile / RemoveProfile commands with APNs wake-ups
//! - Concurrent dispatch with a single outcome consumer
//! - Verification of installed profiles and command results
//! - `SQLite` storage for hosts, profiles, delivery state and the command queue

pub mod authorities;
pub mod commander;
pub mod dispatcher;
pub mod error;
pub mod preprocessor;
pub mod push;
pub mod reconciler;
pub mod storage;
pub mod types;
pub mod variables;
pub mod verifier;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_support;

pub use commander::{CommandError, Commander, ProfileSigner, PushDeliveryError, SigningError};
pub use dispatcher::{DispatchObserver, DispatchSummary, dispatch_targets};
pub use error::ProfileError;
pub use preprocessor::{PreprocessSettings, ProfilePreprocessor};
pub use reconciler::reconcile_profiles;
pub use storage::MdmDatabase;
pub use verifier::{
    CommandResult, ErrorChainItem, RetryPolicy, VerificationOutcome, format_error_chain,
    handle_command_result, handle_install_result, record_remove_result, verify_host_profiles,
};
