//! HTTP client for NDES and Smallstep SCEP challenges.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use mdmkit_core::db::unix_timestamp;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::{ChallengeError, NdesScepProxyCa, ScepChallengeClient, SmallstepScepProxyCa};

static NDES_CHALLENGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)The enrollment challenge password is: <B> (?P<password>\S*)")
        .expect("static regex is valid")
});

const NDES_PASSWORD_CACHE_FULL: &str = "The password cache is full.";
const NDES_INSUFFICIENT_PERMISSIONS: &str =
    "You do not have sufficient permission to enroll with SCEP.";

/// Number of leading bytes inspected when guessing UTF-16 LE.
const UTF16_SAMPLE_SIZE: usize = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SmallstepChallengeRequest {
    webhook: SmallstepWebhook,
    event: SmallstepEvent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SmallstepWebhook {
    id: u32,
    webhook_event: &'static str,
    event_timestamp: i64,
    name: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SmallstepEvent {
    scep_server_url: String,
    payload_identifier: String,
    payload_types: Vec<&'static str>,
}

/// Reqwest-backed [`ScepChallengeClient`].
#[derive(Debug, Clone)]
pub struct HttpScepChallengeClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpScepChallengeClient {
    /// Wrap a pre-built HTTP client. `timeout` bounds every challenge
    /// request.
    pub const fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub const fn from_config(http: reqwest::Client, config: &mdmkit_core::Config) -> Self {
        Self::new(http, config.ca_timeout())
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    pub(crate) fn for_testing() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build test HTTP client");

        Self {
            http,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ScepChallengeClient for HttpScepChallengeClient {
    async fn ndes_challenge(&self, ca: &NdesScepProxyCa) -> Result<String, ChallengeError> {
        let response = self
            .http
            .get(&ca.admin_url)
            .basic_auth(&ca.username, Some(&ca.password))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ChallengeError::Other(format!("sending request: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ChallengeError::InvalidCredentials(format!(
                "unexpected status code: {}; could not retrieve the enrollment challenge password",
                status.as_u16()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ChallengeError::Other(format!("reading response body: {e}")))?;
        let html = decode_html(&body);

        match parse_ndes_challenge(&html) {
            Some(challenge) => Ok(challenge),
            None if html.contains(NDES_PASSWORD_CACHE_FULL) => Err(ChallengeError::PasswordCacheFull),
            None if html.contains(NDES_INSUFFICIENT_PERMISSIONS) => {
                Err(ChallengeError::InsufficientPermissions)
            }
            None => Err(ChallengeError::InvalidCredentials(
                "could not retrieve the enrollment challenge password".to_string(),
            )),
        }
    }

    async fn smallstep_challenge(&self, ca: &SmallstepScepProxyCa) -> Result<String, ChallengeError> {
        let request = SmallstepChallengeRequest {
            webhook: SmallstepWebhook {
                id: 1,
                webhook_event: "SCEPChallenge",
                event_timestamp: unix_timestamp(),
                name: "SCEPChallenge",
            },
            event: SmallstepEvent {
                scep_server_url: ca.url.clone(),
                payload_identifier: uuid::Uuid::new_v4().to_string(),
                payload_types: vec!["com.apple.security.scep"],
            },
        };

        let response = self
            .http
            .post(&ca.challenge_url)
            .basic_auth(&ca.username, Some(&ca.password))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChallengeError::Other(format!("sending request: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ChallengeError::Other(format!(
                "getting Smallstep SCEP challenge: status code {}",
                status.as_u16()
            )));
        }

        let challenge = response
            .text()
            .await
            .map_err(|e| ChallengeError::Other(format!("reading response body: {e}")))?;
        debug!(ca = %ca.name, "retrieved Smallstep SCEP challenge");
        Ok(challenge)
    }
}

fn parse_ndes_challenge(html: &str) -> Option<String> {
    NDES_CHALLENGE_RE
        .captures(html)
        .and_then(|caps| caps.name("password"))
        .map(|m| m.as_str().to_string())
        .filter(|challenge| !challenge.is_empty())
}

/// Decode an NDES admin page. Windows servers answer in UTF-16 LE, usually
/// without a BOM or charset; everything else is read as UTF-8.
fn decode_html(body: &[u8]) -> String {
    if looks_like_utf16le(body) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let units = units.strip_prefix(&[0xFEFF]).unwrap_or(&units[..]);
        return String::from_utf16_lossy(units);
    }
    String::from_utf8_lossy(body).into_owned()
}

fn looks_like_utf16le(body: &[u8]) -> bool {
    if body.len() < 4 {
        return false;
    }
    if body.starts_with(&[0xFF, 0xFE]) || body.starts_with(&[b'<', 0x00]) {
        return true;
    }

    let sample = &body[..body.len().min(UTF16_SAMPLE_SIZE)];
    let checked = sample.len() / 2;
    let nulls = sample.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    // At least 90% of the odd bytes must be NUL.
    checked > 0 && nulls * 10 >= checked * 9
}
