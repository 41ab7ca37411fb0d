//! Inkfed - ActivityPub federation delivery for a federated
//! illustration-sharing platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                       │
//! │  - .well-known discovery (WebFinger, NodeInfo)              │
//! │  - Admin delivery operations                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Layer                          │
//! │  - Delivery orchestration + retry queue                     │
//! │  - HTTP Signatures, actor resolution, capabilities          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                             │
//! │  - SQLite (sqlx): delivery log, profiles, actor keys        │
//! │  - In-memory TTL caches: remote actors, capabilities        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The platform's business logic (artworks, likes, comments, messaging)
//! lives elsewhere and only *triggers* deliveries through
//! [`federation::ActivityDelivery`]. Delivery is fire-and-forget from the
//! trigger's perspective but durably tracked in the delivery log.
//!
//! # Modules
//!
//! - `api`: HTTP handlers for discovery and admin operations
//! - `service`: operator-facing business logic
//! - `federation`: signing, discovery, delivery, retry queue
//! - `data`: database and cache layer
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool, caches, and HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Remote actor cache
    pub actor_cache: Arc<data::RemoteActorCache>,

    /// Capability check cache
    pub capability_cache: Arc<data::CapabilityCache>,

    /// Cache-backed remote actor resolution
    pub actor_resolver: federation::ActorResolver,

    /// NodeInfo capability discovery
    pub capabilities: federation::CapabilityDiscovery,

    /// Delivery queue (in-process worker pool)
    pub queue: Arc<dyn federation::DeliveryQueue>,

    /// Activity delivery orchestration
    pub delivery: federation::ActivityDelivery,

    /// Operator delivery operations
    pub admin_ops: service::AdminDeliveryOps,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Initialize HTTP client and caches
    /// 3. Wire resolver, capability discovery, queue and delivery services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. HTTP client with bounded timeout for all outbound calls
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("Inkfed/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(config.federation.request_timeout_seconds))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 3. Caches
        let actor_cache = Arc::new(data::RemoteActorCache::new(Some(Duration::from_secs(
            config.federation.actor_cache_ttl_seconds,
        ))));
        let capability_cache = Arc::new(data::CapabilityCache::new(Some(Duration::from_secs(
            config.federation.capability_cache_ttl_seconds,
        ))));

        // 4. Federation services
        let actor_resolver =
            federation::ActorResolver::new(actor_cache.clone(), http_client.clone());
        let capabilities =
            federation::CapabilityDiscovery::new(capability_cache.clone(), http_client.clone());

        let worker = Arc::new(federation::DeliveryWorker::new(
            db.clone(),
            http_client.clone(),
            config.server.base_url(),
            config.federation.max_attempts,
        ));
        let queue: Arc<dyn federation::DeliveryQueue> = Arc::new(
            federation::LocalDeliveryQueue::new(
                worker,
                federation::RetryPolicy::from_config(&config.federation),
                config.federation.max_concurrent_deliveries,
            ),
        );

        let delivery = federation::ActivityDelivery::new(
            db.clone(),
            queue.clone(),
            actor_resolver.clone(),
            capabilities.clone(),
            config.server.base_url(),
        );

        let admin_ops = service::AdminDeliveryOps::new(
            db.clone(),
            queue.clone(),
            config.federation.retry_batch_limit,
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            actor_cache,
            capability_cache,
            actor_resolver,
            capabilities,
            queue,
            delivery,
            admin_ops,
        })
    }

    /// Register a local actor with the delivery subsystem.
    ///
    /// Called by the platform at actor-creation time. Creates the profile
    /// row and the actor's signing key pair; both calls are idempotent, so
    /// re-registration never rotates keys.
    pub async fn register_local_actor(
        &self,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<data::Profile, error::AppError> {
        if let Some(existing) = self.db.get_local_profile_by_username(username).await? {
            federation::ensure_actor_keypair(&self.db, &existing.id).await?;
            return Ok(existing);
        }

        let profile = data::Profile {
            id: data::EntityId::new().0,
            username: username.to_string(),
            display_name: display_name.map(str::to_string),
            domain: String::new(),
            created_at: chrono::Utc::now(),
        };
        self.db.upsert_profile(&profile).await?;
        federation::ensure_actor_keypair(&self.db, &profile.id).await?;

        tracing::info!(username = %username, actor_id = %profile.id, "Local actor registered");

        Ok(profile)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .nest("/admin", api::admin_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
