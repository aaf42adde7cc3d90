//! Signed InstallProfile / RemoveProfile commands.
//!
//! A command is enqueued for all of its enrollments at once and the devices
//! are then woken with a push. Enqueue failures are fatal for the command;
//! push failures for a subset of devices come back as [`PushDeliveryError`]
//! while the command stays queued for everyone. Profiles referencing server
//! secrets are queued raw and finished at delivery time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::push::{PushError, Pusher};
use crate::storage::{DatabaseError, MdmDatabase, NewCommand};
use crate::types::CommandSubtype;
use crate::variables::xml_escape;

pub const INSTALL_PROFILE: &str = "InstallProfile";
pub const REMOVE_PROFILE: &str = "RemoveProfile";

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SigningError(pub String);

/// Signs profile bodies before they are sent to devices.
pub trait ProfileSigner: Send + Sync {
    /// Returns the signed (CMS) form of `profile`.
    fn sign(&self, profile: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Per-enrollment push failures of an otherwise enqueued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDeliveryError {
    pub errors: HashMap<String, String>,
}

impl PushDeliveryError {
    /// Enrollment IDs that failed, sorted.
    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.errors.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Display for PushDeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("APNS delivery failed with the following errors:")?;
        for id in self.failed_ids() {
            write!(f, "\nUUID: {id}, Error: {}", self.errors[&id])?;
        }
        Ok(())
    }
}

impl std::error::Error for PushDeliveryError {}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("signing profile: {0}")]
    Signing(#[from] SigningError),

    #[error("enqueueing command: {0}")]
    Database(#[from] DatabaseError),

    /// The push service failed as a whole. When returned from an install or
    /// remove, the command is already queued.
    #[error("sending push notifications: {0}")]
    Push(#[from] PushError),

    #[error(transparent)]
    Delivery(#[from] PushDeliveryError),

    #[error("no contents for profile {0}")]
    MissingContents(String),
}

/// Builds, enqueues and pushes profile commands.
#[derive(Clone)]
pub struct Commander {
    db: MdmDatabase,
    signer: Arc<dyn ProfileSigner>,
    pusher: Arc<dyn Pusher>,
}

impl Commander {
    pub fn new(db: MdmDatabase, signer: Arc<dyn ProfileSigner>, pusher: Arc<dyn Pusher>) -> Self {
        Self { db, signer, pusher }
    }

    /// Sign `profile` and send it as an `InstallProfile` command.
    pub async fn install_profile(
        &self,
        enrollment_ids: &[String],
        profile: &str,
        command_uuid: &str,
    ) -> Result<(), CommandError> {
        let signed = self.signer.sign(profile.as_bytes())?;
        let payload = install_profile_plist(command_uuid, &STANDARD.encode(signed));
        self.enqueue_and_push(
            enrollment_ids,
            command_uuid,
            INSTALL_PROFILE,
            CommandSubtype::None,
            payload.as_bytes(),
        )
        .await
    }

    /// Queue a profile that references server secrets.
    ///
    /// The body is stored unsigned and unexpanded; secrets are substituted
    /// and the profile signed when the command is delivered, so they never
    /// reach the queue in plaintext.
    pub async fn install_profile_with_secrets(
        &self,
        enrollment_ids: &[String],
        profile: &str,
        command_uuid: &str,
    ) -> Result<(), CommandError> {
        self.enqueue_and_push(
            enrollment_ids,
            command_uuid,
            INSTALL_PROFILE,
            CommandSubtype::ProfileWithSecrets,
            profile.as_bytes(),
        )
        .await
    }

    /// Send a `RemoveProfile` command for the profile identifier.
    pub async fn remove_profile(
        &self,
        enrollment_ids: &[String],
        identifier: &str,
        command_uuid: &str,
    ) -> Result<(), CommandError> {
        let payload = remove_profile_plist(command_uuid, identifier);
        self.enqueue_and_push(
            enrollment_ids,
            command_uuid,
            REMOVE_PROFILE,
            CommandSubtype::None,
            payload.as_bytes(),
        )
        .await
    }

    async fn enqueue_and_push(
        &self,
        enrollment_ids: &[String],
        command_uuid: &str,
        request_type: &str,
        subtype: CommandSubtype,
        payload: &[u8],
    ) -> Result<(), CommandError> {
        self.db
            .enqueue_command(
                enrollment_ids,
                &NewCommand {
                    command_uuid,
                    request_type,
                    subtype,
                    payload,
                },
            )
            .await?;
        debug!(
            command_uuid = %command_uuid,
            request_type = %request_type,
            subtype = %subtype,
            enrollments = enrollment_ids.len(),
            "command enqueued"
        );

        self.send_notifications(enrollment_ids).await
    }

    /// Push to every enrollment and collect the per-ID failures.
    pub async fn send_notifications(&self, enrollment_ids: &[String]) -> Result<(), CommandError> {
        let responses = self.pusher.push(enrollment_ids).await?;
        let errors: HashMap<String, String> = responses
            .into_values()
            .filter_map(|r| r.error.map(|e| (r.id, e)))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PushDeliveryError { errors }.into())
        }
    }
}

const PLIST_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
"#;

fn install_profile_plist(command_uuid: &str, signed_b64: &str) -> String {
    format!(
        "{PLIST_HEADER}\t<key>CommandUUID</key>\n\t<string>{}</string>\n\t<key>Command</key>\n\t<dict>\n\
         \t\t<key>RequestType</key>\n\t\t<string>{INSTALL_PROFILE}</string>\n\
         \t\t<key>Payload</key>\n\t\t<data>{signed_b64}</data>\n\t</dict>\n</dict>\n</plist>\n",
        xml_escape(command_uuid)
    )
}

fn remove_profile_plist(command_uuid: &str, identifier: &str) -> String {
    format!(
        "{PLIST_HEADER}\t<key>CommandUUID</key>\n\t<string>{}</string>\n\t<key>Command</key>\n\t<dict>\n\
         \t\t<key>RequestType</key>\n\t\t<string>{REMOVE_PROFILE}</string>\n\
         \t\t<key>Identifier</key>\n\t\t<string>{}</string>\n\t</dict>\n</dict>\n</plist>\n",
        xml_escape(command_uuid),
        xml_escape(identifier)
    )
}
