//! Common test utilities for E2E tests

use std::sync::{Arc, Mutex};

use inkfed::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with default federation settings
    pub async fn new() -> Self {
        Self::with_federation(config::FederationConfig::default()).await
    }

    /// Create a test server with a fast retry schedule, so delivery tests
    /// run attempts back-to-back instead of sleeping minutes.
    pub async fn with_fast_retries() -> Self {
        Self::with_federation(config::FederationConfig {
            request_timeout_seconds: 5,
            retry_schedule_seconds: vec![0],
            ..config::FederationConfig::default()
        })
        .await
    }

    /// Create a new test server instance with explicit federation settings
    pub async fn with_federation(federation: config::FederationConfig) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            federation,
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config.clone()).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router and spawn server in background
        let app = inkfed::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Full URL for a path on the test server
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Register a local test actor and return its ID
    pub async fn create_test_actor(&self, username: &str) -> String {
        let profile = self
            .state
            .register_local_actor(username, Some("Test User"))
            .await
            .unwrap();
        profile.id
    }
}

/// One request captured by a stub inbox
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
}

/// Stub remote instance: serves an ActivityPub actor document and an
/// inbox with a fixed response status, capturing delivered requests.
pub struct StubRemote {
    base_url: String,
    username: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl StubRemote {
    /// Spawn a stub remote whose inbox answers every POST with `inbox_status`
    pub async fn spawn(username: &str, inbox_status: u16) -> Self {
        use axum::{
            Json, Router,
            body::Bytes,
            http::HeaderMap,
            routing::{get, post},
        };

        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = requests.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let actor_url = format!("{}/users/{}", base_url, username);
        let inbox_url = format!("{}/inbox", base_url);
        let actor_document = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": actor_url,
            "type": "Person",
            "preferredUsername": username,
            "inbox": inbox_url,
            "publicKey": {
                "id": format!("{}#main-key", actor_url),
                "owner": actor_url,
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nstub\n-----END PUBLIC KEY-----\n"
            }
        });

        let app = Router::new()
            .route(
                "/users/:name",
                get(move || {
                    let doc = actor_document.clone();
                    async move { Json(doc) }
                }),
            )
            .route(
                "/inbox",
                post(move |headers: HeaderMap, body: Bytes| {
                    let captured = captured.clone();
                    async move {
                        captured.lock().unwrap().push(CapturedRequest {
                            headers,
                            body: body.to_vec(),
                        });
                        axum::http::StatusCode::from_u16(inbox_status).unwrap()
                    }
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            username: username.to_string(),
            requests,
        }
    }

    /// Actor URL served by this stub
    pub fn actor_url(&self) -> String {
        format!("{}/users/{}", self.base_url, self.username)
    }

    /// Inbox URL served by this stub
    pub fn inbox_url(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    /// Number of inbox requests received so far
    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Snapshot of captured inbox requests
    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Poll the delivery log until the record reaches `status` or the timeout
/// expires. Panics on timeout.
pub async fn wait_for_status(
    state: &AppState,
    log_id: &str,
    status: &str,
    timeout: std::time::Duration,
) -> inkfed::data::DeliveryLogRecord {
    let deadline = std::time::Instant::now() + timeout;

    loop {
        let record = state
            .db
            .get_delivery_log(log_id)
            .await
            .unwrap()
            .expect("delivery log record should exist");

        if record.status == status {
            return record;
        }

        if std::time::Instant::now() > deadline {
            panic!(
                "record {} never reached status {:?} (currently {:?}, {} attempts)",
                log_id, status, record.status, record.attempt_count
            );
        }

        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}
