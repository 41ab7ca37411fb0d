//! E2E tests for .well-known endpoints (WebFinger, NodeInfo)

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn webfinger_returns_jrd_for_local_actor() {
    let server = TestServer::new().await;
    server.create_test_actor("alice").await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@test.example.com"))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], "acct:alice@test.example.com");

    let links = json["links"].as_array().expect("links array");
    let self_link = links
        .iter()
        .find(|link| link["rel"] == "self")
        .expect("self link");
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(
        self_link["href"],
        "https://test.example.com/users/alice"
    );
}

#[tokio::test]
async fn webfinger_returns_404_for_unknown_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:nobody@test.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn webfinger_does_not_answer_for_foreign_domains() {
    let server = TestServer::new().await;
    server.create_test_actor("alice").await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@other.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn webfinger_rejects_non_acct_resources() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=https://test.example.com/users/alice"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn nodeinfo_discovery_links_to_document() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let json: Value = response.json().await.unwrap();
    let links = json["links"].as_array().expect("links array");
    assert!(
        links.iter().any(|link| {
            link["rel"]
                .as_str()
                .is_some_and(|rel| rel.contains("nodeinfo.diaspora.software/ns/schema/2"))
        }),
        "discovery document should link a 2.x schema"
    );
}

#[tokio::test]
async fn nodeinfo_document_advertises_encrypted_dm_capability() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/nodeinfo/2.1"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["software"]["name"], "inkfed");

    let features = json["metadata"]["features"]
        .as_array()
        .expect("features array");
    assert!(features.iter().any(|f| f == "encrypted_direct_messages"));
}

#[tokio::test]
async fn host_meta_points_at_webfinger() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body = response.text().await.unwrap();
    assert!(body.contains("/.well-known/webfinger?resource="));
}

#[tokio::test]
async fn health_endpoint_responds() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}
