//! Enrollment and command queue queries.

use std::collections::HashMap;

use mdmkit_core::db::unix_timestamp;

use super::db::MdmDatabase;
use super::models::{Enrollment, QueuedCommand};
use super::DatabaseError;
use crate::types::CommandSubtype;

/// Parameters for registering an enrollment.
pub struct EnrollmentParams<'a> {
    pub id: &'a str,
    pub host_uuid: &'a str,
    /// `Device` or `User`.
    pub enrollment_type: &'a str,
    pub push_token: &'a str,
    pub push_magic: &'a str,
    pub topic: &'a str,
}

/// A command ready to be queued.
pub struct NewCommand<'a> {
    pub command_uuid: &'a str,
    pub request_type: &'a str,
    pub subtype: CommandSubtype,
    pub payload: &'a [u8],
}

impl MdmDatabase {
    // =========================================================================
    // Enrollments
    // =========================================================================

    pub async fn upsert_enrollment(&self, params: &EnrollmentParams<'_>) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO enrollments (id, host_uuid, type, push_token, push_magic, topic, enabled) VALUES (?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT(id) DO UPDATE SET host_uuid = excluded.host_uuid, type = excluded.type,
             push_token = excluded.push_token, push_magic = excluded.push_magic, topic = excluded.topic, enabled = 1",
        )
        .bind(params.id)
        .bind(params.host_uuid)
        .bind(params.enrollment_type)
        .bind(params.push_token)
        .bind(params.push_magic)
        .bind(params.topic)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// User-channel enrollment IDs mapped to the UUID of their host.
    pub async fn user_enrollment_hosts(&self) -> Result<HashMap<String, String>, DatabaseError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, host_uuid FROM enrollments WHERE type = 'User' AND enabled = 1")
                .fetch_all(self.pool())
                .await?;

        Ok(rows.into_iter().collect())
    }

    /// Push details of the enabled enrollments among `ids`.
    pub async fn enrollment_push_info(
        &self,
        ids: &[String],
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut enrollments = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query_as::<_, Enrollment>(
                "SELECT * FROM enrollments WHERE id = ? AND enabled = 1",
            )
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
            enrollments.extend(row);
        }
        Ok(enrollments)
    }

    // =========================================================================
    // Command queue
    // =========================================================================

    /// Store a command and queue it for every enrollment in one transaction.
    /// Fails as a whole if any enrollment is unknown.
    pub async fn enqueue_command(
        &self,
        enrollment_ids: &[String],
        command: &NewCommand<'_>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO commands (command_uuid, request_type, subtype, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(command.command_uuid)
        .bind(command.request_type)
        .bind(command.subtype.as_str())
        .bind(command.payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for id in enrollment_ids {
            sqlx::query(
                "INSERT INTO enrollment_queue (enrollment_id, command_uuid, active, created_at) VALUES (?, ?, 1, ?)",
            )
            .bind(id)
            .bind(command.command_uuid)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn command_request_type(
        &self,
        command_uuid: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT request_type FROM commands WHERE command_uuid = ?")
                .bind(command_uuid)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|(t,)| t))
    }

    /// Active commands for an enrollment, oldest first.
    pub async fn queued_commands(
        &self,
        enrollment_id: &str,
    ) -> Result<Vec<QueuedCommand>, DatabaseError> {
        let rows = sqlx::query_as::<_, QueuedCommand>(
            "SELECT c.command_uuid, c.request_type, c.subtype, c.payload, c.created_at
             FROM enrollment_queue q JOIN commands c ON c.command_uuid = q.command_uuid
             WHERE q.enrollment_id = ? AND q.active = 1
             ORDER BY q.created_at, q.rowid",
        )
        .bind(enrollment_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Mark a queued command as answered by the enrollment.
    pub async fn deactivate_queued_command(
        &self,
        enrollment_id: &str,
        command_uuid: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE enrollment_queue SET active = 0 WHERE enrollment_id = ? AND command_uuid = ?",
        )
        .bind(enrollment_id)
        .bind(command_uuid)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
