//! Certificate authority registry and client contracts.
//!
//! The preprocessor only needs a challenge or an issued certificate from
//! each integration. [`ScepChallengeClient`] and [`DigiCertClient`] are the
//! seams; [`HttpScepChallengeClient`] is the reqwest-backed implementation
//! of the former.

pub mod scep_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use scep_client::HttpScepChallengeClient;

/// NDES SCEP proxy settings. At most one per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdesScepProxyCa {
    pub url: String,
    pub admin_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigiCertCa {
    pub name: String,
    pub url: String,
    pub api_token: String,
    pub profile_id: String,
    /// May reference the IdP email and hardware serial variables.
    pub certificate_common_name: String,
    #[serde(default)]
    pub certificate_user_principal_names: Vec<String>,
    pub certificate_seat_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomScepProxyCa {
    pub name: String,
    pub url: String,
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmallstepScepProxyCa {
    pub name: String,
    pub url: String,
    pub challenge_url: String,
    pub username: String,
    pub password: String,
}

/// Every configured certificate authority, grouped by integration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupedCertificateAuthorities {
    pub ndes_scep_proxy: Option<NdesScepProxyCa>,
    pub digicert: Vec<DigiCertCa>,
    pub custom_scep_proxy: Vec<CustomScepProxyCa>,
    pub smallstep: Vec<SmallstepScepProxyCa>,
}

impl GroupedCertificateAuthorities {
    pub fn digicert(&self, name: &str) -> Option<&DigiCertCa> {
        self.digicert.iter().find(|ca| ca.name == name)
    }

    pub fn custom_scep_proxy(&self, name: &str) -> Option<&CustomScepProxyCa> {
        self.custom_scep_proxy.iter().find(|ca| ca.name == name)
    }

    pub fn smallstep(&self, name: &str) -> Option<&SmallstepScepProxyCa> {
        self.smallstep.iter().find(|ca| ca.name == name)
    }
}

/// Classified failure of a SCEP challenge request.
#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    /// The admin URL or credentials were rejected.
    #[error("invalid admin URL or credentials: {0}")]
    InvalidCredentials(String),

    /// NDES has no room for another cached password.
    #[error("the password cache is full; please increase the number of cached passwords in NDES")]
    PasswordCacheFull,

    /// The account may not enroll with SCEP.
    #[error("this account does not have sufficient permissions to enroll with SCEP")]
    InsufficientPermissions,

    #[error("{0}")]
    Other(String),
}

/// Fetches one-time SCEP challenges.
#[async_trait]
pub trait ScepChallengeClient: Send + Sync {
    async fn ndes_challenge(&self, ca: &NdesScepProxyCa) -> Result<String, ChallengeError>;

    async fn smallstep_challenge(&self, ca: &SmallstepScepProxyCa) -> Result<String, ChallengeError>;
}

/// Certificate issued by DigiCert for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigiCertCertificate {
    /// PKCS#12 bundle.
    pub pfx_data: Vec<u8>,
    pub password: String,
    pub not_valid_before: i64,
    pub not_valid_after: i64,
    pub serial_number: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DigiCertError(pub String);

/// Issues certificates from a DigiCert CA. The CA fields arrive with host
/// variables already substituted.
#[async_trait]
pub trait DigiCertClient: Send + Sync {
    async fn issue_certificate(&self, ca: &DigiCertCa) -> Result<DigiCertCertificate, DigiCertError>;
}
