//! E2E tests for federation delivery scenarios
//!
//! Drives the full path: trigger -> build + sign -> PENDING log record ->
//! queue -> signed POST to a stub remote inbox -> terminal log status.

mod common;

use std::time::Duration;

use common::{StubRemote, TestServer, wait_for_status};
use inkfed::data::ActivityType;
use inkfed::federation::{generate_digest, parse_signature_header, verify_signature};

#[tokio::test]
async fn follow_is_signed_delivered_and_logged_exactly_once() {
    let server = TestServer::new().await;
    let alice_id = server.create_test_actor("alice").await;
    let remote = StubRemote::spawn("bob", 202).await;

    let follow_uri = server
        .state
        .delivery
        .send_follow(&alice_id, &remote.actor_url())
        .await
        .expect("follow should be accepted for delivery");
    assert!(follow_uri.contains("/users/alice/activities/follow/"));

    let records = server
        .state
        .db
        .list_delivery_logs(None, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(records.len(), 1, "exactly one log record per submission");
    let log_id = records[0].id.clone();

    let record = wait_for_status(&server.state, &log_id, "delivered", Duration::from_secs(10)).await;
    assert_eq!(record.attempt_count, 1);
    assert!(record.last_error.is_none());
    assert!(record.queue_job_id.is_some());

    // Exactly one request arrived at the remote inbox.
    assert_eq!(remote.hits(), 1);
    let captured = remote.captured().remove(0);

    // Sign-then-freeze: the transmitted bytes are the stored payload, and
    // the Digest header covers exactly those bytes.
    assert_eq!(captured.body, record.payload);
    let digest = captured
        .headers
        .get("digest")
        .expect("digest header")
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(digest, generate_digest(&captured.body));

    // The signature names alice's key and verifies against her public key.
    let signature_header = captured
        .headers
        .get("signature")
        .expect("signature header")
        .to_str()
        .unwrap()
        .to_string();
    let parsed = parse_signature_header(&signature_header).unwrap();
    assert_eq!(
        parsed.key_id,
        "https://test.example.com/users/alice#main-key"
    );

    let keypair = server
        .state
        .db
        .get_actor_keypair(&alice_id)
        .await
        .unwrap()
        .expect("alice has a key pair");
    verify_signature(
        "POST",
        "/inbox",
        &captured.headers,
        Some(&captured.body),
        &keypair.public_key_pem,
    )
    .expect("delivered request should verify against the sender's public key");

    // The payload is the Follow activity that was built.
    let activity: serde_json::Value = serde_json::from_slice(&captured.body).unwrap();
    assert_eq!(activity["type"], "Follow");
    assert_eq!(activity["id"], follow_uri.as_str());
    assert_eq!(activity["object"], remote.actor_url());
}

#[tokio::test]
async fn retryable_failures_exhaust_the_attempt_ceiling() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;
    let remote = StubRemote::spawn("bob", 500).await;

    let activity = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Like",
        "id": "https://test.example.com/users/alice/activities/like/1",
        "actor": "https://test.example.com/users/alice",
        "object": "https://remote.example/art/7",
    });

    let submissions = server
        .state
        .delivery
        .deliver_activity(
            &alice_id,
            &[remote.inbox_url()],
            &activity,
            ActivityType::Like,
        )
        .await
        .unwrap();
    assert_eq!(submissions.len(), 1);
    let log_id = submissions[0].log_id.clone();

    let record = wait_for_status(&server.state, &log_id, "failed", Duration::from_secs(10)).await;

    // Attempt count capped at the configured ceiling, one record total.
    assert_eq!(record.attempt_count, 4);
    assert_eq!(remote.hits(), 4);
    assert!(record.last_error.as_deref().unwrap().contains("HTTP 500"));

    let all = server
        .state
        .db
        .list_delivery_logs(None, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    // The stored payload bytes never changed across retries.
    assert_eq!(record.payload, serde_json::to_vec(&activity).unwrap());
}

#[tokio::test]
async fn permanent_rejection_fails_without_retries() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;
    let remote = StubRemote::spawn("bob", 410).await;

    let activity = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Like",
        "id": "https://test.example.com/users/alice/activities/like/2",
        "actor": "https://test.example.com/users/alice",
        "object": "https://remote.example/art/8",
    });

    let submissions = server
        .state
        .delivery
        .deliver_activity(
            &alice_id,
            &[remote.inbox_url()],
            &activity,
            ActivityType::Like,
        )
        .await
        .unwrap();
    let log_id = submissions[0].log_id.clone();

    let record = wait_for_status(&server.state, &log_id, "failed", Duration::from_secs(10)).await;

    assert_eq!(record.attempt_count, 1, "4xx must not be retried");
    assert_eq!(remote.hits(), 1);
    assert!(record.last_error.as_deref().unwrap().contains("410"));
}

#[tokio::test]
async fn rate_limiting_is_treated_as_retryable() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;
    let remote = StubRemote::spawn("bob", 429).await;

    let activity = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Follow",
        "id": "https://test.example.com/users/alice/activities/follow/9",
        "actor": "https://test.example.com/users/alice",
        "object": remote.actor_url(),
    });

    let submissions = server
        .state
        .delivery
        .deliver_activity(
            &alice_id,
            &[remote.inbox_url()],
            &activity,
            ActivityType::Follow,
        )
        .await
        .unwrap();
    let log_id = submissions[0].log_id.clone();

    let record = wait_for_status(&server.state, &log_id, "failed", Duration::from_secs(10)).await;
    assert_eq!(record.attempt_count, 4, "429 retries until the ceiling");
    assert_eq!(remote.hits(), 4);
}

#[tokio::test]
async fn shared_inbox_targets_are_deduplicated() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;
    let remote = StubRemote::spawn("bob", 202).await;

    let activity = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://test.example.com/users/alice/activities/create/1",
        "actor": "https://test.example.com/users/alice",
        "object": { "type": "Note", "content": "<p>new sketch</p>" },
    });

    let submissions = server
        .state
        .delivery
        .deliver_activity(
            &alice_id,
            &[remote.inbox_url(), remote.inbox_url()],
            &activity,
            ActivityType::CreateComment,
        )
        .await
        .unwrap();

    assert_eq!(submissions.len(), 1, "identical inbox URLs collapse to one job");
}

#[tokio::test]
async fn direct_message_downgrades_when_capability_check_fails() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;
    let remote = StubRemote::spawn("hana", 202).await;

    // The stub remote serves no NodeInfo (and the capability probe goes to
    // https://127.0.0.1, which answers nothing), so encrypted transport is
    // reported unsupported and the message falls back to plaintext.
    let results = server
        .state
        .delivery
        .deliver_direct_message(
            &alice_id,
            "https://test.example.com/users/alice/messages/1",
            &[remote.actor_url()],
            "hello hana",
            Some("3ncrypt3d-r3nd1t10n"),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].delivered);
    assert!(!results[0].encrypted);

    let records = server
        .state
        .db
        .list_delivery_logs(None, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record =
        wait_for_status(&server.state, &records[0].id, "delivered", Duration::from_secs(10)).await;

    let activity: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(activity["object"]["content"], "hello hana");
    assert_eq!(activity["object"]["encryptedTransport"], false);
}

#[tokio::test]
async fn unresolvable_dm_recipient_is_reported_not_raised() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;

    // Nothing listens on port 1; resolution fails fast.
    let results = server
        .state
        .delivery
        .deliver_direct_message(
            &alice_id,
            "https://test.example.com/users/alice/messages/2",
            &["http://127.0.0.1:1/users/ghost".to_string()],
            "anyone there?",
            None,
        )
        .await
        .expect("one unreachable recipient must not error the batch");

    assert_eq!(results.len(), 1);
    assert!(!results[0].delivered);
    assert!(!results[0].encrypted);

    // No job was created for the unresolvable recipient.
    let records = server
        .state
        .db
        .list_delivery_logs(None, None, 10, 0)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn discovery_failure_surfaces_as_error_to_the_trigger() {
    let server = TestServer::with_fast_retries().await;
    let alice_id = server.create_test_actor("alice").await;

    // The triggering action gets an error it can log as a warning; no
    // delivery record is created because no job could be built.
    let result = server
        .state
        .delivery
        .send_follow(&alice_id, "http://127.0.0.1:1/users/ghost")
        .await;
    assert!(result.is_err());

    let records = server
        .state
        .db
        .list_delivery_logs(None, None, 10, 0)
        .await
        .unwrap();
    assert!(records.is_empty());
}
