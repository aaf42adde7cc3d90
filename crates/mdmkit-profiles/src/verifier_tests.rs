use super::*;
use crate::storage::{EnrollmentParams, NewCommand};
use crate::test_support::{install_record, seed_host, seed_profile};
use crate::types::{CommandSubtype, Scope};

const HOUR: i64 = 60 * 60;
const UPLOADED: i64 = 1_000_000;

async fn test_db() -> MdmDatabase {
    MdmDatabase::open_in_memory().await.unwrap()
}

fn installed(identifier: &str, install_date: i64) -> InstalledProfile {
    InstalledProfile {
        identifier: identifier.to_string(),
        display_name: identifier.to_string(),
        install_date,
    }
}

async fn status_of(db: &MdmDatabase, host: &str, profile: &str) -> (Option<DeliveryStatus>, String, i64) {
    let row = db.get_host_profile(host, profile).await.unwrap().unwrap();
    (row.status().unwrap(), row.detail, row.retries)
}

/// Host `host-1` whose last detail refresh was at `detail_updated_at`, with
/// one pending install of profile `p1`.
async fn setup(detail_updated_at: i64) -> (MdmDatabase, Host) {
    let db = test_db().await;
    seed_host(&db, "host-1", "SERIAL1", detail_updated_at).await;
    seed_profile(&db, "p1", "<plist/>", UPLOADED).await;
    db.upsert_host_profiles(&[install_record("host-1", "p1", Some(DeliveryStatus::Pending))])
        .await
        .unwrap();
    let host = db.get_host_by_uuid("host-1").await.unwrap();
    (db, host)
}

// === verify_host_profiles ===

#[tokio::test]
async fn reported_profile_is_verified() {
    let (db, host) = setup(UPLOADED + 10).await;

    let outcome = verify_host_profiles(
        &db,
        &RetryPolicy::default(),
        &host,
        &[installed("com.example.p1", UPLOADED + 5)],
    )
    .await
    .unwrap();

    assert_eq!(outcome.verified, vec!["com.example.p1"]);
    assert_eq!(status_of(&db, "host-1", "p1").await.0, Some(DeliveryStatus::Verified));
}

#[tokio::test]
async fn missing_profile_within_grace_is_left_alone() {
    let (db, host) = setup(UPLOADED + HOUR - 1).await;

    let outcome = verify_host_profiles(&db, &RetryPolicy::default(), &host, &[])
        .await
        .unwrap();

    assert_eq!(outcome, VerificationOutcome::default());
    assert_eq!(
        status_of(&db, "host-1", "p1").await,
        (Some(DeliveryStatus::Pending), String::new(), 0)
    );
}

#[tokio::test]
async fn stale_install_date_counts_as_missing() {
    let (db, host) = setup(UPLOADED + 2 * HOUR).await;

    let outcome = verify_host_profiles(
        &db,
        &RetryPolicy::default(),
        &host,
        &[installed("com.example.p1", UPLOADED - 1)],
    )
    .await
    .unwrap();

    assert!(outcome.verified.is_empty());
    assert_eq!(outcome.retried, vec!["com.example.p1"]);
}

#[tokio::test]
async fn missing_profile_is_retried_then_failed() {
    let (db, host) = setup(UPLOADED + 2 * HOUR).await;
    let policy = RetryPolicy::default();

    let first = verify_host_profiles(&db, &policy, &host, &[]).await.unwrap();
    assert_eq!(first.retried, vec!["com.example.p1"]);
    assert_eq!(status_of(&db, "host-1", "p1").await, (None, String::new(), 1));

    // The next cycle re-enqueues the row as pending.
    let mut record = install_record("host-1", "p1", Some(DeliveryStatus::Pending));
    record.command_uuid = "cmd-retry".to_string();
    db.upsert_host_profiles(&[record]).await.unwrap();

    let second = verify_host_profiles(&db, &policy, &host, &[]).await.unwrap();
    assert_eq!(second.failed, vec!["com.example.p1"]);
    assert_eq!(
        status_of(&db, "host-1", "p1").await,
        (Some(DeliveryStatus::Failed), "Failed, was pending".to_string(), 1)
    );

    // Failed rows are no longer expected.
    let third = verify_host_profiles(&db, &policy, &host, &[]).await.unwrap();
    assert_eq!(third, VerificationOutcome::default());
}

#[tokio::test]
async fn zero_retry_budget_fails_immediately() {
    let (db, host) = setup(UPLOADED + 2 * HOUR).await;
    let policy = RetryPolicy {
        max_retries: 0,
        grace_period: Duration::from_secs(3600),
    };

    let outcome = verify_host_profiles(&db, &policy, &host, &[]).await.unwrap();

    assert_eq!(outcome.failed, vec!["com.example.p1"]);
    assert!(outcome.retried.is_empty());
}

#[tokio::test]
async fn variables_update_moves_the_baseline() {
    let (db, host) = setup(UPLOADED + 2 * HOUR).await;
    let mut record = install_record("host-1", "p1", Some(DeliveryStatus::Verifying));
    record.variables_updated_at = Some(UPLOADED + HOUR + HOUR / 2);
    db.upsert_host_profiles(&[record]).await.unwrap();

    // Installed after the upload but before the variables were refreshed,
    // and the host is still inside the grace period of the new baseline.
    let outcome = verify_host_profiles(
        &db,
        &RetryPolicy::default(),
        &host,
        &[installed("com.example.p1", UPLOADED + 10)],
    )
    .await
    .unwrap();

    assert_eq!(outcome, VerificationOutcome::default());
    assert_eq!(status_of(&db, "host-1", "p1").await.0, Some(DeliveryStatus::Verifying));
}

#[tokio::test]
async fn verified_profile_that_disappears_fails() {
    let (db, host) = setup(UPLOADED + 2 * HOUR).await;
    db.upsert_host_profiles(&[install_record("host-1", "p1", Some(DeliveryStatus::Verified))])
        .await
        .unwrap();
    db.retry_host_profile("host-1", "com.example.p1").await.unwrap();
    db.upsert_host_profiles(&[install_record("host-1", "p1", Some(DeliveryStatus::Verified))])
        .await
        .unwrap();

    let outcome = verify_host_profiles(&db, &RetryPolicy::default(), &host, &[])
        .await
        .unwrap();

    assert_eq!(outcome.failed, vec!["com.example.p1"]);
    assert_eq!(status_of(&db, "host-1", "p1").await.1, "Failed, was verified");
}

// === handle_install_result ===

#[tokio::test]
async fn failed_install_is_retried_within_budget() {
    let (db, _) = setup(0).await;
    let policy = RetryPolicy::default();

    handle_install_result(&db, &policy, "host-1", "cmd-p1", Some(DeliveryStatus::Failed), "boom")
        .await
        .unwrap();
    assert_eq!(status_of(&db, "host-1", "p1").await, (None, String::new(), 1));

    db.upsert_host_profiles(&[install_record("host-1", "p1", Some(DeliveryStatus::Pending))])
        .await
        .unwrap();
    handle_install_result(&db, &policy, "host-1", "cmd-p1", Some(DeliveryStatus::Failed), "boom again")
        .await
        .unwrap();
    assert_eq!(
        status_of(&db, "host-1", "p1").await,
        (Some(DeliveryStatus::Failed), "boom again".to_string(), 1)
    );
}

#[tokio::test]
async fn acknowledged_install_is_verifying() {
    let (db, _) = setup(0).await;

    handle_install_result(
        &db,
        &RetryPolicy::default(),
        "host-1",
        "cmd-p1",
        Some(DeliveryStatus::Verifying),
        "",
    )
    .await
    .unwrap();

    assert_eq!(status_of(&db, "host-1", "p1").await.0, Some(DeliveryStatus::Verifying));
}

#[tokio::test]
async fn install_result_for_unknown_command_is_ignored() {
    let (db, _) = setup(0).await;

    handle_install_result(
        &db,
        &RetryPolicy::default(),
        "host-1",
        "cmd-other",
        Some(DeliveryStatus::Failed),
        "boom",
    )
    .await
    .unwrap();

    assert_eq!(
        status_of(&db, "host-1", "p1").await,
        (Some(DeliveryStatus::Pending), String::new(), 0)
    );
}

// === Command results ===

#[test]
fn error_chain_prefers_us_english() {
    let chain = vec![
        ErrorChainItem {
            error_code: 4,
            error_domain: "MCProfileErrorDomain".to_string(),
            localized_description: "Profil introuvable".to_string(),
            us_english_description: Some("Profile not found".to_string()),
        },
        ErrorChainItem {
            error_code: 12,
            error_domain: "MDMErrorDomain".to_string(),
            localized_description: "Invalid payload".to_string(),
            us_english_description: None,
        },
    ];

    assert_eq!(
        format_error_chain(&chain),
        "MCProfileErrorDomain (4): Profile not found\nMDMErrorDomain (12): Invalid payload\n"
    );
    assert_eq!(format_error_chain(&[]), "");
}

#[test]
fn command_result_reads_device_field_names() {
    let result: CommandResult = serde_json::from_str(
        r#"{
            "UDID": "host-1",
            "CommandUUID": "cmd-1",
            "Status": "Error",
            "ErrorChain": [{
                "ErrorCode": 4,
                "ErrorDomain": "MCProfileErrorDomain",
                "LocalizedDescription": "Missing",
                "USEnglishDescription": "Missing payload"
            }]
        }"#,
    )
    .unwrap();

    assert_eq!(result.udid, "host-1");
    assert_eq!(result.command_uuid, "cmd-1");
    assert_eq!(result.error_chain[0].us_english_description.as_deref(), Some("Missing payload"));
}

async fn enqueue(db: &MdmDatabase, command_uuid: &str, request_type: &str) {
    db.upsert_enrollment(&EnrollmentParams {
        id: "host-1",
        host_uuid: "host-1",
        enrollment_type: "Device",
        push_token: "token",
        push_magic: "magic",
        topic: "com.apple.mgmt",
    })
    .await
    .unwrap();
    db.enqueue_command(
        &["host-1".to_string()],
        &NewCommand {
            command_uuid,
            request_type,
            subtype: CommandSubtype::None,
            payload: b"<plist/>",
        },
    )
    .await
    .unwrap();
}

fn result(command_uuid: &str, status: &str) -> CommandResult {
    CommandResult {
        udid: "host-1".to_string(),
        command_uuid: command_uuid.to_string(),
        status: status.to_string(),
        error_chain: vec![ErrorChainItem {
            error_code: 4,
            error_domain: "MCProfileErrorDomain".to_string(),
            localized_description: "The profile is not installed.".to_string(),
            us_english_description: None,
        }],
    }
}

#[tokio::test]
async fn install_error_result_is_routed_and_dequeued() {
    let (db, _) = setup(0).await;
    enqueue(&db, "cmd-p1", INSTALL_PROFILE).await;
    let policy = RetryPolicy {
        max_retries: 0,
        grace_period: Duration::from_secs(3600),
    };

    handle_command_result(&db, &policy, "host-1", &result("cmd-p1", "Error"))
        .await
        .unwrap();

    let (status, detail, _) = status_of(&db, "host-1", "p1").await;
    assert_eq!(status, Some(DeliveryStatus::Failed));
    assert_eq!(detail, "MCProfileErrorDomain (4): The profile is not installed.\n");
    assert!(db.queued_commands("host-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn not_now_keeps_command_queued() {
    let (db, _) = setup(0).await;
    enqueue(&db, "cmd-p1", INSTALL_PROFILE).await;

    handle_command_result(&db, &RetryPolicy::default(), "host-1", &result("cmd-p1", "NotNow"))
        .await
        .unwrap();

    assert_eq!(db.queued_commands("host-1").await.unwrap().len(), 1);
    assert_eq!(status_of(&db, "host-1", "p1").await.0, Some(DeliveryStatus::Pending));
}

#[tokio::test]
async fn remove_results_delete_or_record() {
    let db = test_db().await;
    let mut remove = install_record("host-1", "p1", Some(DeliveryStatus::Pending));
    remove.operation_type = OperationType::Remove;
    remove.scope = Scope::System;
    let mut failing = remove.clone();
    failing.profile_uuid = "p2".to_string();
    failing.command_uuid = "cmd-p2".to_string();
    db.upsert_host_profiles(&[remove, failing]).await.unwrap();
    enqueue(&db, "cmd-p1", REMOVE_PROFILE).await;
    db.enqueue_command(
        &["host-1".to_string()],
        &NewCommand {
            command_uuid: "cmd-p2",
            request_type: REMOVE_PROFILE,
            subtype: CommandSubtype::None,
            payload: b"<plist/>",
        },
    )
    .await
    .unwrap();

    let policy = RetryPolicy::default();
    handle_command_result(&db, &policy, "host-1", &result("cmd-p1", "Acknowledged"))
        .await
        .unwrap();
    handle_command_result(&db, &policy, "host-1", &result("cmd-p2", "Error"))
        .await
        .unwrap();

    assert!(db.get_host_profile("host-1", "p1").await.unwrap().is_none());
    let (status, detail, _) = status_of(&db, "host-1", "p2").await;
    assert_eq!(status, Some(DeliveryStatus::Failed));
    assert_eq!(
        detail,
        "Failed to remove: MCProfileErrorDomain (4): The profile is not installed.\n"
    );
}

#[tokio::test]
async fn unknown_command_and_status_are_ignored() {
    let (db, _) = setup(0).await;
    enqueue(&db, "cmd-p1", INSTALL_PROFILE).await;
    let policy = RetryPolicy::default();

    handle_command_result(&db, &policy, "host-1", &result("cmd-nope", "Error"))
        .await
        .unwrap();
    handle_command_result(&db, &policy, "host-1", &result("cmd-p1", "Bogus"))
        .await
        .unwrap();

    assert_eq!(
        status_of(&db, "host-1", "p1").await,
        (Some(DeliveryStatus::Pending), String::new(), 0)
    );
    assert_eq!(db.queued_commands("host-1").await.unwrap().len(), 1);
}
