//! Host and identity queries.

use mdmkit_core::db::unix_timestamp;

use super::db::MdmDatabase;
use super::models::{Host, HostEndUser, HostIdpUserRow};
use super::DatabaseError;

/// Email source for addresses that come from the identity provider.
pub const IDP_EMAIL_SOURCE: &str = "mdm_idp_accounts";

/// Parameters for registering a host.
pub struct NewHostParams<'a> {
    pub uuid: &'a str,
    pub hardware_serial: &'a str,
    pub platform: &'a str,
    pub detail_updated_at: i64,
}

impl MdmDatabase {
    // =========================================================================
    // Hosts
    // =========================================================================

    /// Register a host. Returns the new host ID.
    pub async fn insert_host(&self, params: &NewHostParams<'_>) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO hosts (uuid, hardware_serial, platform, detail_updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(params.uuid)
        .bind(params.hardware_serial)
        .bind(params.platform)
        .bind(params.detail_updated_at)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All hosts registered under a UUID. More than one row means the UUID
    /// is ambiguous.
    pub async fn list_hosts_by_uuid(&self, uuid: &str) -> Result<Vec<Host>, DatabaseError> {
        let hosts = sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE uuid = ? ORDER BY id")
            .bind(uuid)
            .fetch_all(self.pool())
            .await?;

        Ok(hosts)
    }

    pub async fn get_host_by_uuid(&self, uuid: &str) -> Result<Host, DatabaseError> {
        sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE uuid = ? ORDER BY id LIMIT 1")
            .bind(uuid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("host {uuid}")))
    }

    /// Record that the host refreshed its details.
    pub async fn set_host_detail_updated_at(
        &self,
        uuid: &str,
        detail_updated_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE hosts SET detail_updated_at = ? WHERE uuid = ?")
            .bind(detail_updated_at)
            .bind(uuid)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    // =========================================================================
    // Identity attributes
    // =========================================================================

    pub async fn add_host_email(
        &self,
        host_id: i64,
        email: &str,
        source: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO host_emails (host_id, email, source, created_at) VALUES (?, ?, ?, ?)")
            .bind(host_id)
            .bind(email)
            .bind(source)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Emails of a host from the given source, oldest first.
    pub async fn host_emails(
        &self,
        host_uuid: &str,
        source: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT e.email FROM host_emails e JOIN hosts h ON h.id = e.host_id WHERE h.uuid = ? AND e.source = ? ORDER BY e.id",
        )
        .bind(host_uuid)
        .bind(source)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(email,)| email).collect())
    }

    pub async fn upsert_host_end_user(
        &self,
        host_id: i64,
        user: &HostEndUser,
    ) -> Result<(), DatabaseError> {
        let groups_json = serde_json::to_string(&user.groups)
            .map_err(|e| DatabaseError::Query(format!("encode IdP groups: {e}")))?;

        sqlx::query(
            "INSERT INTO host_idp_users (host_id, username, full_name, department, groups_json) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(host_id) DO UPDATE SET username = excluded.username, full_name = excluded.full_name,
             department = excluded.department, groups_json = excluded.groups_json",
        )
        .bind(host_id)
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(&user.department)
        .bind(groups_json)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn host_end_user(&self, host_id: i64) -> Result<Option<HostEndUser>, DatabaseError> {
        let row = sqlx::query_as::<_, HostIdpUserRow>(
            "SELECT username, full_name, department, groups_json FROM host_idp_users WHERE host_id = ?",
        )
        .bind(host_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(HostEndUser::try_from).transpose()
    }
}
