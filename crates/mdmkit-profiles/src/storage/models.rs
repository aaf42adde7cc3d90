//! Data models for mdmkit storage.

use serde::{Deserialize, Serialize};

use super::DatabaseError;
use crate::types::{CaKind, CommandSubtype, DeliveryStatus, HostProfileRecord, OperationType, Scope};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Host {
    pub id: i64,
    pub uuid: String,
    pub hardware_serial: String,
    pub platform: String,
    pub detail_updated_at: i64,
}

impl Host {
    /// iOS and iPadOS hosts never send the installed-profiles report.
    pub fn is_ios_or_ipados(&self) -> bool {
        matches!(self.platform.as_str(), "ios" | "ipados")
    }
}

/// Identity-provider attributes of a host's end user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndUser {
    pub username: String,
    pub full_name: String,
    pub department: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct HostIdpUserRow {
    pub username: String,
    pub full_name: String,
    pub department: String,
    pub groups_json: String,
}

impl TryFrom<HostIdpUserRow> for HostEndUser {
    type Error = DatabaseError;

    fn try_from(row: HostIdpUserRow) -> Result<Self, Self::Error> {
        let groups = serde_json::from_str(&row.groups_json)
            .map_err(|e| DatabaseError::Query(format!("invalid IdP groups: {e}")))?;
        Ok(Self {
            username: row.username,
            full_name: row.full_name,
            department: row.department,
            groups,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HostProfileRow {
    pub host_uuid: String,
    pub profile_uuid: String,
    pub profile_identifier: String,
    pub profile_name: String,
    pub operation_type: String,
    pub status: Option<String>,
    pub detail: String,
    pub command_uuid: String,
    pub retries: i64,
    pub ignore_error: i64,
    pub variables_updated_at: Option<i64>,
    pub scope: String,
    pub updated_at: i64,
}

impl HostProfileRow {
    pub fn status(&self) -> Result<Option<DeliveryStatus>, DatabaseError> {
        self.status
            .as_deref()
            .map(str::parse::<DeliveryStatus>)
            .transpose()
            .map_err(|e| DatabaseError::Query(format!("{e}")))
    }

    pub fn operation(&self) -> Result<OperationType, DatabaseError> {
        self.operation_type
            .parse()
            .map_err(|e| DatabaseError::Query(format!("{e}")))
    }

    /// Converts the stored row back into an upsert payload.
    pub fn into_record(self) -> Result<HostProfileRecord, DatabaseError> {
        let status = self.status()?;
        let operation_type = self.operation()?;
        let scope: Scope = self
            .scope
            .parse()
            .map_err(|e| DatabaseError::Query(format!("{e}")))?;
        Ok(HostProfileRecord {
            host_uuid: self.host_uuid,
            profile_uuid: self.profile_uuid,
            profile_identifier: self.profile_identifier,
            profile_name: self.profile_name,
            operation_type,
            status,
            detail: self.detail,
            command_uuid: self.command_uuid,
            variables_updated_at: self.variables_updated_at,
            scope,
            ignore_error: self.ignore_error != 0,
        })
    }
}

/// Expected-profile projection used by the verifier.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExpectedProfileRow {
    pub identifier: String,
    pub name: String,
    pub earliest_install_date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ManagedCertificateRow {
    pub id: i64,
    pub host_uuid: String,
    pub profile_uuid: String,
    pub ca_name: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub challenge_retrieved_at: Option<i64>,
    pub not_valid_before: Option<i64>,
    pub not_valid_after: Option<i64>,
    pub serial: Option<String>,
    pub created_at: i64,
}

impl ManagedCertificateRow {
    pub fn ca_kind(&self) -> Result<CaKind, DatabaseError> {
        self.kind
            .parse()
            .map_err(|e| DatabaseError::Query(format!("{e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Enrollment {
    pub id: String,
    pub host_uuid: String,
    #[sqlx(rename = "type")]
    pub enrollment_type: String,
    pub push_token: String,
    pub push_magic: String,
    pub topic: String,
    pub enabled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedCommand {
    pub command_uuid: String,
    pub request_type: String,
    pub subtype: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
}

impl QueuedCommand {
    pub fn subtype(&self) -> Result<CommandSubtype, DatabaseError> {
        self.subtype
            .parse()
            .map_err(|e| DatabaseError::Query(format!("{e}")))
    }
}
