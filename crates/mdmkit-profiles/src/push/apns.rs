//! APNs client for MDM pushes.
//!
//! Each enrollment gets a `POST {api}/3/device/{push_token}` with the
//! `{"mdm": push_magic}` payload. A rejected push becomes a per-ID error
//! carrying the APNs `reason`.

use std::collections::HashMap;

use async_trait::async_trait;
use mdmkit_core::Config;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PushError, PushResponse, Pusher};
use crate::storage::MdmDatabase;

#[derive(Debug, Serialize)]
struct MdmPushPayload<'a> {
    mdm: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    reason: String,
}

/// Reqwest-backed [`Pusher`] that reads push details from the datastore.
#[derive(Clone)]
pub struct ApnsPusher {
    http: reqwest::Client,
    db: MdmDatabase,
    api_url: String,
    provider_token: Option<String>,
}

impl ApnsPusher {
    pub fn new(
        http: reqwest::Client,
        db: MdmDatabase,
        api_url: impl Into<String>,
        provider_token: Option<String>,
    ) -> Self {
        Self {
            http,
            db,
            api_url: api_url.into(),
            provider_token,
        }
    }

    pub fn from_config(http: reqwest::Client, db: MdmDatabase, config: &Config) -> Self {
        Self::new(
            http,
            db,
            config.push.apns_url.trim_end_matches('/'),
            config.push.provider_token.clone(),
        )
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    pub(crate) fn for_testing(db: MdmDatabase, api_url: &str) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build test HTTP client");

        Self::new(http, db, api_url, Some("test-provider-token".to_string()))
    }

    /// Send one push. Returns the failure reason, if any.
    async fn push_one(&self, token: &str, topic: &str, push_magic: &str) -> Option<String> {
        let mut request = self
            .http
            .post(format!("{}/3/device/{token}", self.api_url))
            .header("apns-topic", topic)
            .header("apns-push-type", "mdm")
            .json(&MdmPushPayload { mdm: push_magic });
        if let Some(provider_token) = &self.provider_token {
            request = request.header("authorization", format!("bearer {provider_token}"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Some(format!("request failed: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            return None;
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<ApnsErrorBody>(&body)
            .map(|b| b.reason)
            .unwrap_or_else(|_| format!("status {}", status.as_u16()));
        Some(reason)
    }
}

#[async_trait]
impl Pusher for ApnsPusher {
    async fn push(
        &self,
        enrollment_ids: &[String],
    ) -> Result<HashMap<String, PushResponse>, PushError> {
        let enrollments = self.db.enrollment_push_info(enrollment_ids).await?;

        let mut responses: HashMap<String, PushResponse> = enrollment_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    PushResponse {
                        id: id.clone(),
                        error: Some("no push info".to_string()),
                    },
                )
            })
            .collect();

        for enrollment in enrollments {
            let error = self
                .push_one(&enrollment.push_token, &enrollment.topic, &enrollment.push_magic)
                .await;
            if let Some(reason) = &error {
                warn!(enrollment_id = %enrollment.id, reason = %reason, "APNs push rejected");
            } else {
                debug!(enrollment_id = %enrollment.id, "APNs push sent");
            }
            responses.insert(
                enrollment.id.clone(),
                PushResponse {
                    id: enrollment.id,
                    error,
                },
            );
        }

        Ok(responses)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use axum::Router;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    use super::*;
    use crate::storage::EnrollmentParams;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn apns_stub(
        Path(token): Path<String>,
        headers: HeaderMap,
        body: axum::Json<serde_json::Value>,
    ) -> (StatusCode, String) {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");
        if header("apns-push-type") != "mdm"
            || header("apns-topic") != "com.apple.mgmt.test"
            || header("authorization") != "bearer test-provider-token"
            || body["mdm"] != "magic-1"
        {
            return (StatusCode::BAD_REQUEST, r#"{"reason":"BadRequest"}"#.to_string());
        }
        if token == "expired-token" {
            return (StatusCode::GONE, r#"{"reason":"Unregistered"}"#.to_string());
        }
        (StatusCode::OK, String::new())
    }

    async fn seed(db: &MdmDatabase, id: &str, token: &str) {
        db.upsert_enrollment(&EnrollmentParams {
            id,
            host_uuid: id,
            enrollment_type: "Device",
            push_token: token,
            push_magic: "magic-1",
            topic: "com.apple.mgmt.test",
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn push_reports_per_enrollment_outcomes() {
        let base = serve(Router::new().route("/3/device/{token}", post(apns_stub))).await;
        let db = MdmDatabase::open_in_memory().await.unwrap();
        seed(&db, "host-ok", "good-token").await;
        seed(&db, "host-gone", "expired-token").await;

        let pusher = ApnsPusher::for_testing(db, &base);
        let ids = vec![
            "host-ok".to_string(),
            "host-gone".to_string(),
            "host-unknown".to_string(),
        ];
        let responses = pusher.push(&ids).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(responses["host-ok"].error, None);
        assert_eq!(responses["host-gone"].error.as_deref(), Some("Unregistered"));
        assert_eq!(responses["host-unknown"].error.as_deref(), Some("no push info"));
    }
}
