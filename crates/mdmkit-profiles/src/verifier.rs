//! Delivery verification.
//!
//! Two inputs move a host-profile row past `pending`: the result of the
//! install/remove command, and the installed-profile list the host reports on
//! check-in. Missing or failed installs are re-enqueued until the retry
//! budget is spent, then marked failed.

use std::collections::HashMap;
use std::time::Duration;

use mdmkit_core::Config;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commander::{INSTALL_PROFILE, REMOVE_PROFILE};
use crate::error::ProfileError;
use crate::storage::{Host, HostProfileUpdate, MdmDatabase};
use crate::types::{DeliveryStatus, ExpectedProfile, InstalledProfile, OperationType};

/// Retry budget and grace period applied by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub grace_period: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            grace_period: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub const fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.profiles.max_retries,
            grace_period: config.grace_period(),
        }
    }
}

/// Profile identifiers moved by one verification pass, each sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub verified: Vec<String>,
    pub failed: Vec<String>,
    pub retried: Vec<String>,
}

/// Compare the profiles a host reports against the ones it should have.
///
/// A profile counts as installed when it is reported with an install date no
/// older than its earliest acceptable install date. Profiles that are not
/// installed are left alone while the host is inside the grace period;
/// outside it they are retried or, once the budget is spent, failed.
pub async fn verify_host_profiles(
    db: &MdmDatabase,
    policy: &RetryPolicy,
    host: &Host,
    installed: &[InstalledProfile],
) -> Result<VerificationOutcome, ProfileError> {
    let expected: Vec<ExpectedProfile> = db
        .expected_profiles_for_host(&host.uuid)
        .await?
        .into_iter()
        .map(|row| ExpectedProfile {
            identifier: row.identifier,
            name: row.name,
            earliest_install_date: row.earliest_install_date,
            grace_period: policy.grace_period,
        })
        .collect();
    if expected.is_empty() {
        return Ok(VerificationOutcome::default());
    }

    let installed: HashMap<&str, &InstalledProfile> = installed
        .iter()
        .map(|p| (p.identifier.as_str(), p))
        .collect();
    let retries = db.retry_counts(&host.uuid).await?;

    let mut outcome = VerificationOutcome::default();
    for profile in expected {
        let is_installed = installed
            .get(profile.identifier.as_str())
            .is_some_and(|p| p.install_date >= profile.earliest_install_date);
        if is_installed {
            outcome.verified.push(profile.identifier);
            continue;
        }

        if profile.is_within_grace_period(host.detail_updated_at) {
            debug!(
                host_uuid = %host.uuid,
                profile_identifier = %profile.identifier,
                "profile not reported yet, still within grace period"
            );
            continue;
        }

        let attempts = retries.get(&profile.identifier).copied().unwrap_or(0);
        if attempts < policy.max_retries {
            outcome.retried.push(profile.identifier);
        } else {
            outcome.failed.push(profile.identifier);
        }
    }

    outcome.verified.sort();
    outcome.failed.sort();
    outcome.retried.sort();

    db.update_host_profiles_verification(
        &host.uuid,
        &outcome.verified,
        &outcome.failed,
        &outcome.retried,
    )
    .await?;

    if !outcome.failed.is_empty() || !outcome.retried.is_empty() {
        info!(
            host_uuid = %host.uuid,
            verified = outcome.verified.len(),
            failed = ?outcome.failed,
            retried = ?outcome.retried,
            "profile verification found missing profiles"
        );
    }
    Ok(outcome)
}

/// Apply the result of an `InstallProfile` command.
///
/// A failure is retried while the row still has budget; otherwise the status
/// and detail are recorded as reported.
pub async fn handle_install_result(
    db: &MdmDatabase,
    policy: &RetryPolicy,
    host_uuid: &str,
    command_uuid: &str,
    status: Option<DeliveryStatus>,
    detail: &str,
) -> Result<(), ProfileError> {
    let Some(row) = db.host_profile_by_command(host_uuid, command_uuid).await? else {
        debug!(
            host_uuid = %host_uuid,
            command_uuid = %command_uuid,
            "install result for unknown host profile, ignoring"
        );
        return Ok(());
    };

    if status == Some(DeliveryStatus::Failed) {
        let retries = u32::try_from(row.retries).unwrap_or(0);
        if retries < policy.max_retries {
            db.retry_host_profile(host_uuid, &row.profile_identifier)
                .await?;
            info!(
                host_uuid = %host_uuid,
                profile_identifier = %row.profile_identifier,
                retries = retries + 1,
                detail = %detail,
                "profile install failed, retrying"
            );
            return Ok(());
        }
        warn!(
            host_uuid = %host_uuid,
            profile_identifier = %row.profile_identifier,
            detail = %detail,
            "profile install failed, retries exhausted"
        );
    }

    db.update_or_delete_host_profile(&HostProfileUpdate {
        host_uuid,
        command_uuid,
        status,
        detail,
        operation_type: OperationType::Install,
        variables_updated_at: None,
    })
    .await?;
    Ok(())
}

/// Apply the result of a `RemoveProfile` command.
pub async fn record_remove_result(
    db: &MdmDatabase,
    host_uuid: &str,
    command_uuid: &str,
    status: Option<DeliveryStatus>,
    detail: &str,
) -> Result<(), ProfileError> {
    db.update_or_delete_host_profile(&HostProfileUpdate {
        host_uuid,
        command_uuid,
        status,
        detail,
        operation_type: OperationType::Remove,
        variables_updated_at: None,
    })
    .await?;
    Ok(())
}

/// One entry of the error chain a device attaches to a failed command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorChainItem {
    pub error_code: i64,
    pub error_domain: String,
    pub localized_description: String,
    #[serde(rename = "USEnglishDescription", default)]
    pub us_english_description: Option<String>,
}

/// Command result as reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandResult {
    /// Enrollment ID of the reporting channel.
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "CommandUUID")]
    pub command_uuid: String,
    pub status: String,
    #[serde(default)]
    pub error_chain: Vec<ErrorChainItem>,
}

/// Render an error chain as one `"{domain} ({code}): {message}"` line per
/// entry, preferring the US English description.
pub fn format_error_chain(chain: &[ErrorChainItem]) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    for item in chain {
        let message = item
            .us_english_description
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&item.localized_description);
        let _ = writeln!(out, "{} ({}): {message}", item.error_domain, item.error_code);
    }
    out
}

/// Route a device command result to the install or remove handler.
///
/// Results for commands that are not profile commands, or whose status does
/// not map to a delivery status, are ignored.
pub async fn handle_command_result(
    db: &MdmDatabase,
    policy: &RetryPolicy,
    host_uuid: &str,
    result: &CommandResult,
) -> Result<(), ProfileError> {
    let Some(request_type) = db.command_request_type(&result.command_uuid).await? else {
        debug!(
            command_uuid = %result.command_uuid,
            "result for unknown command, ignoring"
        );
        return Ok(());
    };

    let status = DeliveryStatus::from_command_status(&result.status);
    if matches!(
        status,
        Some(DeliveryStatus::Verifying | DeliveryStatus::Failed)
    ) {
        db.deactivate_queued_command(&result.udid, &result.command_uuid)
            .await?;
    }
    let Some(status) = status else {
        debug!(
            command_uuid = %result.command_uuid,
            status = %result.status,
            "command status has no delivery status, ignoring"
        );
        return Ok(());
    };

    let detail = format_error_chain(&result.error_chain);
    match request_type.as_str() {
        INSTALL_PROFILE => {
            handle_install_result(db, policy, host_uuid, &result.command_uuid, Some(status), &detail)
                .await
        }
        REMOVE_PROFILE => {
            record_remove_result(db, host_uuid, &result.command_uuid, Some(status), &detail).await
        }
        other => {
            debug!(
                command_uuid = %result.command_uuid,
                request_type = %other,
                "not a profile command, ignoring"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "verifier_tests.rs"]
mod tests;
