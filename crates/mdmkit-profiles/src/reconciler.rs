//! One reconciliation cycle: collect the host-profile rows waiting to be
//! enqueued, group them into targets, materialize variables and dispatch.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::commander::{CommandError, Commander};
use crate::dispatcher::{DispatchObserver, DispatchSummary, dispatch_targets};
use crate::error::ProfileError;
use crate::preprocessor::ProfilePreprocessor;
use crate::storage::MdmDatabase;
use crate::types::{
    DeliveryStatus, DispatchTarget, HostProfileKey, HostProfileRecord, OperationType, Scope,
};

const MISSING_USER_CHANNEL_DETAIL: &str = "This setting couldn't be enforced because the user channel doesn't exist for this host. \
     Currently, Fleet creates the user channel for hosts that automatically enroll.";

/// Puts the rows of a command back in the backlog when it could not be
/// enqueued.
struct ResetOnFailure<'a> {
    db: &'a MdmDatabase,
}

#[async_trait]
impl DispatchObserver for ResetOnFailure<'_> {
    async fn on_enqueued(&mut self, command_uuid: &str) {
        debug!(command_uuid = %command_uuid, "profile command enqueued");
    }

    async fn on_enqueue_failed(&mut self, command_uuid: &str, err: &CommandError) {
        error!(command_uuid = %command_uuid, error = %err, "failed to enqueue profile command");
        match self.db.reset_host_profiles_for_command(command_uuid).await {
            Ok(rows) => debug!(command_uuid = %command_uuid, rows, "host profiles reset for retry"),
            Err(e) => error!(command_uuid = %command_uuid, error = %e, "failed to reset host profiles"),
        }
    }
}

fn new_target(identifier: &str) -> DispatchTarget {
    DispatchTarget {
        command_uuid: uuid::Uuid::new_v4().to_string(),
        profile_identifier: identifier.to_string(),
        enrollment_ids: Vec::new(),
    }
}

/// Enqueue every host-profile row that has no status yet.
///
/// Rows are marked pending before any command is sent, so a fast device
/// result always finds its row. Commands that fail to enqueue have their
/// rows reset for the next cycle.
pub async fn reconcile_profiles(
    db: &MdmDatabase,
    preprocessor: &ProfilePreprocessor,
    commander: &Commander,
    concurrency: usize,
) -> Result<DispatchSummary, ProfileError> {
    let rows = db.host_profiles_to_enqueue().await?;
    if rows.is_empty() {
        return Ok(DispatchSummary::default());
    }

    let user_enrollments = db.user_enrollment_hosts().await?;
    let user_channel_by_host: HashMap<&str, &str> = user_enrollments
        .iter()
        .map(|(enrollment, host)| (host.as_str(), enrollment.as_str()))
        .collect();

    let mut installs: HashMap<String, DispatchTarget> = HashMap::new();
    let mut removes: HashMap<String, DispatchTarget> = HashMap::new();
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let mut record = row.into_record()?;
        let enrollment_id = match record.scope {
            Scope::System => Some(record.host_uuid.clone()),
            Scope::User => user_channel_by_host
                .get(record.host_uuid.as_str())
                .map(ToString::to_string),
        };

        let targets = match record.operation_type {
            OperationType::Install => &mut installs,
            OperationType::Remove => &mut removes,
        };

        let Some(enrollment_id) = enrollment_id else {
            match record.operation_type {
                OperationType::Install => {
                    warn!(
                        host_uuid = %record.host_uuid,
                        profile_uuid = %record.profile_uuid,
                        "host has no user enrollment, failing profile installation"
                    );
                    record.status = Some(DeliveryStatus::Failed);
                    record.detail = MISSING_USER_CHANNEL_DETAIL.to_string();
                    record.command_uuid = String::new();
                    records.push(record);
                }
                OperationType::Remove => {
                    warn!(
                        host_uuid = %record.host_uuid,
                        profile_uuid = %record.profile_uuid,
                        "host has no user enrollment, dropping user-scoped removal"
                    );
                    db.delete_host_profile(&record.host_uuid, &record.profile_uuid)
                        .await?;
                }
            }
            continue;
        };

        let target = targets
            .entry(record.profile_uuid.clone())
            .or_insert_with(|| new_target(&record.profile_identifier));
        target.enrollment_ids.push(enrollment_id);
        record.command_uuid.clone_from(&target.command_uuid);
        record.status = Some(DeliveryStatus::Pending);
        record.detail.clear();
        records.push(record);
    }

    db.upsert_host_profiles(&records).await?;

    let mut host_profiles: HashMap<HostProfileKey, HostProfileRecord> = records
        .into_iter()
        .filter(|r| {
            r.operation_type == OperationType::Install && r.status == Some(DeliveryStatus::Pending)
        })
        .map(|r| (r.key(), r))
        .collect();

    let mut profile_uuids: Vec<String> = installs.keys().cloned().collect();
    profile_uuids.sort();
    let mut contents = db.profile_contents(&profile_uuids).await?;

    preprocessor
        .preprocess_targets(
            &mut installs,
            &mut contents,
            &mut host_profiles,
            &user_enrollments,
        )
        .await?;

    info!(
        installs = installs.len(),
        removes = removes.len(),
        "dispatching profile commands"
    );
    let mut observer = ResetOnFailure { db };
    Ok(dispatch_targets(commander, installs, removes, &contents, concurrency, &mut observer).await)
}
