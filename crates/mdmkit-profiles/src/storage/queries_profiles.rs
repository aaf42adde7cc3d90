//! Profile, delivery-state and managed certificate queries.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mdmkit_core::db::unix_timestamp;

use super::db::MdmDatabase;
use super::models::{ExpectedProfileRow, HostProfileRow, ManagedCertificateRow};
use super::DatabaseError;
use crate::types::{DeliveryStatus, HostProfileRecord, ManagedCertificate, OperationType, Scope};

/// Parameters for storing a profile template.
pub struct NewProfileParams<'a> {
    pub profile_uuid: &'a str,
    pub identifier: &'a str,
    pub name: &'a str,
    pub scope: Scope,
    pub contents: &'a str,
    pub uploaded_at: i64,
}

/// Status change for the host-profile row addressed by a command UUID.
pub struct HostProfileUpdate<'a> {
    pub host_uuid: &'a str,
    pub command_uuid: &'a str,
    pub status: Option<DeliveryStatus>,
    pub detail: &'a str,
    pub operation_type: OperationType,
    /// Left untouched when `None`.
    pub variables_updated_at: Option<i64>,
}

impl MdmDatabase {
    // =========================================================================
    // Profile templates
    // =========================================================================

    pub async fn insert_profile(&self, params: &NewProfileParams<'_>) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO mdm_profiles (profile_uuid, identifier, name, scope, contents, uploaded_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(params.profile_uuid)
        .bind(params.identifier)
        .bind(params.name)
        .bind(params.scope.as_str())
        .bind(params.contents)
        .bind(params.uploaded_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Bodies of the given profiles keyed by profile UUID. Unknown UUIDs are
    /// left out of the map.
    pub async fn profile_contents(
        &self,
        profile_uuids: &[String],
    ) -> Result<HashMap<String, String>, DatabaseError> {
        let mut contents = HashMap::with_capacity(profile_uuids.len());
        for uuid in profile_uuids {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT contents FROM mdm_profiles WHERE profile_uuid = ?")
                    .bind(uuid)
                    .fetch_optional(self.pool())
                    .await?;
            if let Some((body,)) = row {
                contents.insert(uuid.clone(), body);
            }
        }
        Ok(contents)
    }

    // =========================================================================
    // Host profile delivery state
    // =========================================================================

    /// Insert or replace host-profile rows in one transaction. The retry
    /// counter of existing rows is preserved.
    pub async fn upsert_host_profiles(
        &self,
        records: &[HostProfileRecord],
    ) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }

        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO host_mdm_profiles (host_uuid, profile_uuid, profile_identifier, profile_name, operation_type,
                     status, detail, command_uuid, ignore_error, variables_updated_at, scope, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(host_uuid, profile_uuid) DO UPDATE SET
                     profile_identifier = excluded.profile_identifier,
                     profile_name = excluded.profile_name,
                     operation_type = excluded.operation_type,
                     status = excluded.status,
                     detail = excluded.detail,
                     command_uuid = excluded.command_uuid,
                     ignore_error = excluded.ignore_error,
                     variables_updated_at = excluded.variables_updated_at,
                     scope = excluded.scope,
                     updated_at = excluded.updated_at",
            )
            .bind(&record.host_uuid)
            .bind(&record.profile_uuid)
            .bind(&record.profile_identifier)
            .bind(&record.profile_name)
            .bind(record.operation_type.as_str())
            .bind(record.status.map(DeliveryStatus::as_str))
            .bind(&record.detail)
            .bind(&record.command_uuid)
            .bind(i64::from(record.ignore_error))
            .bind(record.variables_updated_at)
            .bind(record.scope.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn get_host_profile(
        &self,
        host_uuid: &str,
        profile_uuid: &str,
    ) -> Result<Option<HostProfileRow>, DatabaseError> {
        let row = sqlx::query_as::<_, HostProfileRow>(
            "SELECT * FROM host_mdm_profiles WHERE host_uuid = ? AND profile_uuid = ?",
        )
        .bind(host_uuid)
        .bind(profile_uuid)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn list_host_profiles(
        &self,
        host_uuid: &str,
    ) -> Result<Vec<HostProfileRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, HostProfileRow>(
            "SELECT * FROM host_mdm_profiles WHERE host_uuid = ? ORDER BY profile_uuid",
        )
        .bind(host_uuid)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Rows without a status, i.e. waiting to be (re)enqueued.
    pub async fn host_profiles_to_enqueue(&self) -> Result<Vec<HostProfileRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, HostProfileRow>(
            "SELECT * FROM host_mdm_profiles WHERE status IS NULL ORDER BY profile_uuid, host_uuid",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    pub async fn host_profile_by_command(
        &self,
        host_uuid: &str,
        command_uuid: &str,
    ) -> Result<Option<HostProfileRow>, DatabaseError> {
        let row = sqlx::query_as::<_, HostProfileRow>(
            "SELECT * FROM host_mdm_profiles WHERE host_uuid = ? AND command_uuid = ?",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    /// Apply a command outcome to the row it addresses.
    ///
    /// Acknowledged removals and tolerated removal failures delete the row.
    /// Failed removals are prefixed with "Failed to remove: ". Acknowledged
    /// installs on iOS and iPadOS hosts go straight to verified.
    pub async fn update_or_delete_host_profile(
        &self,
        update: &HostProfileUpdate<'_>,
    ) -> Result<(), DatabaseError> {
        if update.operation_type == OperationType::Remove {
            if let Some(status) = update.status {
                let ignore_error = if status == DeliveryStatus::Failed {
                    let row: Option<(i64,)> = sqlx::query_as(
                        "SELECT ignore_error FROM host_mdm_profiles WHERE host_uuid = ? AND command_uuid = ?",
                    )
                    .bind(update.host_uuid)
                    .bind(update.command_uuid)
                    .fetch_optional(self.pool())
                    .await?;
                    row.is_some_and(|(v,)| v != 0)
                } else {
                    false
                };

                if ignore_error
                    || matches!(status, DeliveryStatus::Verifying | DeliveryStatus::Verified)
                {
                    sqlx::query(
                        "DELETE FROM host_mdm_profiles WHERE host_uuid = ? AND command_uuid = ?",
                    )
                    .bind(update.host_uuid)
                    .bind(update.command_uuid)
                    .execute(self.pool())
                    .await?;
                    return Ok(());
                }
            }
        }

        let detail = if update.operation_type == OperationType::Remove
            && update.status == Some(DeliveryStatus::Failed)
        {
            format!("Failed to remove: {}", update.detail)
        } else {
            update.detail.to_string()
        };

        let mut status = update.status;
        if update.operation_type == OperationType::Install
            && status == Some(DeliveryStatus::Verifying)
        {
            let platform: Option<(String,)> =
                sqlx::query_as("SELECT platform FROM hosts WHERE uuid = ? LIMIT 1")
                    .bind(update.host_uuid)
                    .fetch_optional(self.pool())
                    .await?;
            if platform.is_some_and(|(p,)| p == "ios" || p == "ipados") {
                status = Some(DeliveryStatus::Verified);
            }
        }

        sqlx::query(
            "UPDATE host_mdm_profiles
             SET status = ?, operation_type = ?, detail = ?,
                 variables_updated_at = COALESCE(?, variables_updated_at), updated_at = ?
             WHERE host_uuid = ? AND command_uuid = ?",
        )
        .bind(status.map(DeliveryStatus::as_str))
        .bind(update.operation_type.as_str())
        .bind(detail)
        .bind(update.variables_updated_at)
        .bind(unix_timestamp())
        .bind(update.host_uuid)
        .bind(update.command_uuid)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Clear the status of an install row so it is enqueued again, and count
    /// the attempt.
    pub async fn retry_host_profile(
        &self,
        host_uuid: &str,
        profile_identifier: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE host_mdm_profiles SET status = NULL, detail = '', retries = retries + 1, updated_at = ?
             WHERE host_uuid = ? AND profile_identifier = ? AND operation_type = 'install'",
        )
        .bind(unix_timestamp())
        .bind(host_uuid)
        .bind(profile_identifier)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Put the pending rows of a command back in the enqueue backlog.
    pub async fn reset_host_profiles_for_command(
        &self,
        command_uuid: &str,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE host_mdm_profiles SET status = NULL, updated_at = ?
             WHERE command_uuid = ? AND status = 'pending'",
        )
        .bind(unix_timestamp())
        .bind(command_uuid)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_host_profile(
        &self,
        host_uuid: &str,
        profile_uuid: &str,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM host_mdm_profiles WHERE host_uuid = ? AND profile_uuid = ?")
                .bind(host_uuid)
                .bind(profile_uuid)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Install rows the host should report, with the earliest acceptable
    /// install date of each.
    pub async fn expected_profiles_for_host(
        &self,
        host_uuid: &str,
    ) -> Result<Vec<ExpectedProfileRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ExpectedProfileRow>(
            "SELECT hmp.profile_identifier AS identifier,
                    hmp.profile_name AS name,
                    MAX(COALESCE(mp.uploaded_at, 0), COALESCE(hmp.variables_updated_at, 0)) AS earliest_install_date
             FROM host_mdm_profiles hmp
             LEFT JOIN mdm_profiles mp ON mp.profile_uuid = hmp.profile_uuid
             WHERE hmp.host_uuid = ?
               AND hmp.operation_type = 'install'
               AND hmp.status IN ('pending', 'verifying', 'verified')
             ORDER BY hmp.profile_identifier",
        )
        .bind(host_uuid)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Retry counters of the host's install rows keyed by profile identifier.
    pub async fn retry_counts(&self, host_uuid: &str) -> Result<HashMap<String, u32>, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT profile_identifier, retries FROM host_mdm_profiles
             WHERE host_uuid = ? AND operation_type = 'install'",
        )
        .bind(host_uuid)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(identifier, retries)| (identifier, u32::try_from(retries).unwrap_or(0)))
            .collect())
    }

    /// Apply the outcome of one verification pass in a single transaction.
    pub async fn update_host_profiles_verification(
        &self,
        host_uuid: &str,
        verified: &[String],
        to_fail: &[String],
        to_retry: &[String],
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        for identifier in verified {
            sqlx::query(
                "UPDATE host_mdm_profiles SET status = 'verified', detail = '', updated_at = ?
                 WHERE host_uuid = ? AND profile_identifier = ? AND operation_type = 'install'
                   AND status IN ('pending', 'verifying')",
            )
            .bind(now)
            .bind(host_uuid)
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        }

        for identifier in to_fail {
            sqlx::query(
                "UPDATE host_mdm_profiles SET detail = 'Failed, was ' || status, status = 'failed', updated_at = ?
                 WHERE host_uuid = ? AND profile_identifier = ? AND operation_type = 'install'
                   AND status IN ('pending', 'verifying', 'verified')",
            )
            .bind(now)
            .bind(host_uuid)
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        }

        for identifier in to_retry {
            sqlx::query(
                "UPDATE host_mdm_profiles SET status = NULL, detail = '', retries = retries + 1, updated_at = ?
                 WHERE host_uuid = ? AND profile_identifier = ? AND operation_type = 'install'",
            )
            .bind(now)
            .bind(host_uuid)
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Managed certificates and SCEP challenges
    // =========================================================================

    pub async fn insert_managed_certificates(
        &self,
        certificates: &[ManagedCertificate],
    ) -> Result<(), DatabaseError> {
        if certificates.is_empty() {
            return Ok(());
        }

        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        for cert in certificates {
            sqlx::query(
                "INSERT INTO managed_certificates (host_uuid, profile_uuid, ca_name, type, challenge_retrieved_at,
                     not_valid_before, not_valid_after, serial, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&cert.host_uuid)
            .bind(&cert.profile_uuid)
            .bind(&cert.ca_name)
            .bind(cert.kind.as_str())
            .bind(cert.challenge_retrieved_at)
            .bind(cert.not_valid_before)
            .bind(cert.not_valid_after)
            .bind(cert.serial.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn managed_certificates(
        &self,
        host_uuid: &str,
    ) -> Result<Vec<ManagedCertificateRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ManagedCertificateRow>(
            "SELECT * FROM managed_certificates WHERE host_uuid = ? ORDER BY id",
        )
        .bind(host_uuid)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Generate and store a one-time SCEP challenge.
    pub async fn new_scep_challenge(&self) -> Result<String, DatabaseError> {
        let challenge = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 24]>());

        sqlx::query("INSERT INTO scep_challenges (challenge, created_at) VALUES (?, ?)")
            .bind(&challenge)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        Ok(challenge)
    }

    /// Consume a SCEP challenge. Returns false when it is unknown or was
    /// already used.
    pub async fn consume_scep_challenge(&self, challenge: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM scep_challenges WHERE challenge = ?")
            .bind(challenge)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
