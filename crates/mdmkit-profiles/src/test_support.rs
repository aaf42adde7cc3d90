//! Fakes for the collaborator traits and small seeding helpers.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::authorities::{
    ChallengeError, DigiCertCa, DigiCertCertificate, DigiCertClient, DigiCertError,
    NdesScepProxyCa, ScepChallengeClient, SmallstepScepProxyCa,
};
use crate::commander::{CommandError, ProfileSigner, SigningError};
use crate::dispatcher::DispatchObserver;
use crate::push::{PushError, PushResponse, Pusher};
use crate::storage::{EnrollmentParams, MdmDatabase, NewHostParams, NewProfileParams};
use crate::types::{DeliveryStatus, HostProfileRecord, OperationType, Scope};

/// Prefixes the body with `SIGNED:`.
pub struct FakeSigner;

impl ProfileSigner for FakeSigner {
    fn sign(&self, profile: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut signed = b"SIGNED:".to_vec();
        signed.extend_from_slice(profile);
        Ok(signed)
    }
}

/// Records pushed IDs and rejects the configured ones. An unreachable
/// pusher fails every batch outright.
#[derive(Default)]
pub struct FakePusher {
    failing: HashSet<String>,
    unreachable: bool,
    pushed: Mutex<Vec<String>>,
}

impl FakePusher {
    pub fn failing<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            failing: ids.into_iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Pusher for FakePusher {
    async fn push(
        &self,
        enrollment_ids: &[String],
    ) -> Result<HashMap<String, PushResponse>, PushError> {
        if self.unreachable {
            return Err(PushError::Request("connection refused".to_string()));
        }
        self.pushed.lock().unwrap().extend(enrollment_ids.iter().cloned());
        Ok(enrollment_ids
            .iter()
            .map(|id| {
                let error = self.failing.contains(id).then(|| "BadDeviceToken".to_string());
                (id.clone(), PushResponse { id: id.clone(), error })
            })
            .collect())
    }
}

/// Hands out numbered challenges. The NDES call with the index given to
/// [`FakeScep::ndes_failing_on`] fails with the given error.
#[derive(Default)]
pub struct FakeScep {
    calls: AtomicUsize,
    ndes_failure: Option<(usize, fn() -> ChallengeError)>,
}

impl FakeScep {
    pub fn ndes_failing_on(call: usize, err: fn() -> ChallengeError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            ndes_failure: Some((call, err)),
        }
    }
}

#[async_trait]
impl ScepChallengeClient for FakeScep {
    async fn ndes_challenge(&self, _ca: &NdesScepProxyCa) -> Result<String, ChallengeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.ndes_failure {
            Some((call, err)) if call == n => Err(err()),
            _ => Ok(format!("ndes-challenge-{n}")),
        }
    }

    async fn smallstep_challenge(&self, _ca: &SmallstepScepProxyCa) -> Result<String, ChallengeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("step-challenge-{n}"))
    }
}

/// Issues a certificate whose serial is the common name. Common names
/// containing `FAIL` are rejected.
#[derive(Default)]
pub struct FakeDigiCert {
    pub requests: Mutex<Vec<DigiCertCa>>,
}

#[async_trait]
impl DigiCertClient for FakeDigiCert {
    async fn issue_certificate(&self, ca: &DigiCertCa) -> Result<DigiCertCertificate, DigiCertError> {
        self.requests.lock().unwrap().push(ca.clone());
        if ca.certificate_common_name.contains("FAIL") {
            return Err(DigiCertError("profile is disabled".to_string()));
        }
        Ok(DigiCertCertificate {
            pfx_data: ca.certificate_common_name.as_bytes().to_vec(),
            password: "pfx-password".to_string(),
            not_valid_before: 100,
            not_valid_after: 200,
            serial_number: ca.certificate_common_name.clone(),
        })
    }
}

/// Keeps every observed outcome; errors are stored as their display string.
#[derive(Default)]
pub struct RecordingObserver {
    pub enqueued: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[async_trait]
impl DispatchObserver for RecordingObserver {
    async fn on_enqueued(&mut self, command_uuid: &str) {
        self.enqueued.push(command_uuid.to_string());
    }

    async fn on_enqueue_failed(&mut self, command_uuid: &str, err: &CommandError) {
        self.failed.push((command_uuid.to_string(), err.to_string()));
    }
}

/// Device enrollment whose ID and host UUID are both `id`.
pub async fn seed_enrollment(db: &MdmDatabase, id: &str) {
    db.upsert_enrollment(&EnrollmentParams {
        id,
        host_uuid: id,
        enrollment_type: "Device",
        push_token: "token",
        push_magic: "magic",
        topic: "com.apple.mgmt.test",
    })
    .await
    .unwrap();
}

pub async fn seed_host(db: &MdmDatabase, uuid: &str, serial: &str, detail_updated_at: i64) -> i64 {
    db.insert_host(&NewHostParams {
        uuid,
        hardware_serial: serial,
        platform: "darwin",
        detail_updated_at,
    })
    .await
    .unwrap()
}

pub async fn seed_profile(db: &MdmDatabase, uuid: &str, contents: &str, uploaded_at: i64) {
    db.insert_profile(&NewProfileParams {
        profile_uuid: uuid,
        identifier: &format!("com.example.{uuid}"),
        name: uuid,
        scope: Scope::System,
        contents,
        uploaded_at,
    })
    .await
    .unwrap();
}

/// Install row for `host`/`profile` with identifier `com.example.{profile}`.
pub fn install_record(host: &str, profile: &str, status: Option<DeliveryStatus>) -> HostProfileRecord {
    HostProfileRecord {
        host_uuid: host.to_string(),
        profile_uuid: profile.to_string(),
        profile_identifier: format!("com.example.{profile}"),
        profile_name: profile.to_string(),
        operation_type: OperationType::Install,
        status,
        detail: String::new(),
        command_uuid: format!("cmd-{profile}"),
        variables_updated_at: None,
        scope: Scope::System,
        ignore_error: false,
    }
}
