//! Domain types shared by the preprocessor, dispatcher and verifier.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether a host-profile row tracks an install or a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Install,
    Remove,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Remove => "remove",
        }
    }
}

/// Delivery status of a host-profile row. A row without status (`None`)
/// is waiting to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Verifying,
    Verified,
    Failed,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }

    /// Maps an MDM command result status onto a delivery status.
    pub fn from_command_status(status: &str) -> Option<Self> {
        match status {
            "Acknowledged" => Some(Self::Verifying),
            "Error" | "CommandFormatError" => Some(Self::Failed),
            "Idle" | "NotNow" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Installation channel of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    System,
    User,
}

impl Scope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
        }
    }
}

/// How the stored payload of a queued command is turned into what the
/// device receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandSubtype {
    /// The payload is the complete command.
    #[default]
    None,
    /// The payload is a raw profile whose `$FLEET_SECRET_*` references are
    /// expanded, signed and wrapped when the command is delivered.
    ProfileWithSecrets,
}

impl CommandSubtype {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::ProfileWithSecrets => "ProfileWithSecrets",
        }
    }
}

/// Error for values read back from text columns that do not parse.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! impl_text_enum {
    ($ty:ident, $kind:literal, [$($variant:ident),+]) => {
        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == Self::$variant.as_str() {
                        return Ok(Self::$variant);
                    }
                )+
                Err(ParseEnumError { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_text_enum!(OperationType, "operation type", [Install, Remove]);
impl_text_enum!(DeliveryStatus, "delivery status", [Pending, Verifying, Verified, Failed]);
impl_text_enum!(Scope, "scope", [System, User]);
impl_text_enum!(CommandSubtype, "command subtype", [None, ProfileWithSecrets]);

/// Composite key of a host-profile row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostProfileKey {
    pub host_uuid: String,
    pub profile_uuid: String,
}

impl HostProfileKey {
    pub fn new(host_uuid: impl Into<String>, profile_uuid: impl Into<String>) -> Self {
        Self {
            host_uuid: host_uuid.into(),
            profile_uuid: profile_uuid.into(),
        }
    }
}

/// Upsert payload for a host-profile row.
///
/// `retries` is not part of the payload: it only changes through the retry
/// transitions of the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfileRecord {
    pub host_uuid: String,
    pub profile_uuid: String,
    pub profile_identifier: String,
    pub profile_name: String,
    pub operation_type: OperationType,
    pub status: Option<DeliveryStatus>,
    pub detail: String,
    pub command_uuid: String,
    pub variables_updated_at: Option<i64>,
    pub scope: Scope,
    pub ignore_error: bool,
}

impl HostProfileRecord {
    pub fn key(&self) -> HostProfileKey {
        HostProfileKey::new(&self.host_uuid, &self.profile_uuid)
    }
}

/// A logical install or remove operation for one profile, addressed to every
/// enrollment that shares the same content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub command_uuid: String,
    pub profile_identifier: String,
    pub enrollment_ids: Vec<String>,
}

/// Certificate authority integration that produced a managed certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaKind {
    Ndes,
    DigiCert,
    CustomScepProxy,
    Smallstep,
}

impl CaKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ndes => "ndes",
            Self::DigiCert => "digicert",
            Self::CustomScepProxy => "custom_scep_proxy",
            Self::Smallstep => "smallstep",
        }
    }
}

impl_text_enum!(CaKind, "certificate authority type", [Ndes, DigiCert, CustomScepProxy, Smallstep]);

/// Audit record of a certificate materialized into a host profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedCertificate {
    pub host_uuid: String,
    pub profile_uuid: String,
    pub ca_name: String,
    pub kind: CaKind,
    pub challenge_retrieved_at: Option<i64>,
    pub not_valid_before: Option<i64>,
    pub not_valid_after: Option<i64>,
    pub serial: Option<String>,
}

/// A profile the host is expected to report as installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedProfile {
    pub identifier: String,
    pub name: String,
    pub earliest_install_date: i64,
    pub grace_period: Duration,
}

impl ExpectedProfile {
    /// True while the host's last detail refresh happened before the grace
    /// deadline of this profile.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn is_within_grace_period(&self, host_detail_updated_at: i64) -> bool {
        host_detail_updated_at < self.earliest_install_date + self.grace_period.as_secs() as i64
    }
}

/// A profile reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledProfile {
    pub identifier: String,
    pub display_name: String,
    pub install_date: i64,
}
