//! Remote actor resolution
//!
//! Fetches and caches remote actor documents (inbox URL + public key).
//! Entries refresh lazily on TTL expiry; a signature verification mismatch
//! triggers exactly one forced re-fetch (key rotation) before final
//! failure.

use std::net::IpAddr;
use std::sync::Arc;

use crate::data::{RemoteActor, RemoteActorCache};
use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Extract and validate remote actor domain from an actor URL or key ID URL.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Parse a remote actor document into a cacheable entry.
///
/// Fails when `inbox` or `publicKey.publicKeyPem` is missing: an entry
/// without both is unusable for delivery and verification alike.
fn parse_remote_actor(actor_url: &str, document: &serde_json::Value) -> Result<RemoteActor, AppError> {
    let inbox_url = document
        .get("inbox")
        .and_then(|inbox| inbox.as_str())
        .ok_or_else(|| AppError::Federation("Missing inbox in actor document".to_string()))?;

    let public_key_pem = document
        .get("publicKey")
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(|pem| pem.as_str())
        .ok_or_else(|| {
            AppError::Federation("Missing publicKey.publicKeyPem in actor document".to_string())
        })?;

    Ok(RemoteActor {
        actor_url: actor_url.to_string(),
        inbox_url: inbox_url.to_string(),
        public_key_pem: public_key_pem.to_string(),
        fetched_at: std::time::Instant::now(),
    })
}

/// Cache-backed remote actor resolution
#[derive(Clone)]
pub struct ActorResolver {
    cache: Arc<RemoteActorCache>,
    http_client: Arc<reqwest::Client>,
}

impl ActorResolver {
    /// Create new resolver
    pub fn new(cache: Arc<RemoteActorCache>, http_client: Arc<reqwest::Client>) -> Self {
        Self { cache, http_client }
    }

    /// Resolve an actor URL to its inbox and public key.
    ///
    /// Cache hit within TTL returns the cached entry; otherwise the actor
    /// document is fetched and the cache refreshed.
    pub async fn resolve(&self, actor_url: &str) -> Result<RemoteActor, AppError> {
        use crate::metrics::ACTOR_RESOLUTIONS_TOTAL;

        if let Some(actor) = self.cache.get(actor_url).await {
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["cache"]).inc();
            return Ok(actor);
        }

        ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["remote"]).inc();
        self.fetch_and_cache(actor_url).await
    }

    /// Force a re-fetch, bypassing and replacing any cached entry.
    ///
    /// The one legitimate out-of-band invalidation: a verification failure
    /// against a cached key, which may mean the remote rotated keys.
    pub async fn resolve_fresh(&self, actor_url: &str) -> Result<RemoteActor, AppError> {
        self.cache.invalidate(actor_url).await;
        self.fetch_and_cache(actor_url).await
    }

    async fn fetch_and_cache(&self, actor_url: &str) -> Result<RemoteActor, AppError> {
        let response = self
            .http_client
            .get(actor_url)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch actor: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch actor {}: HTTP {}",
                actor_url,
                response.status()
            )));
        }

        let document: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

        let actor = parse_remote_actor(actor_url, &document)?;
        self.cache.insert(actor.clone()).await;

        tracing::debug!(actor_url = %actor_url, inbox_url = %actor.inbox_url, "Resolved remote actor");

        Ok(actor)
    }

    /// Verify an inbound signed request.
    ///
    /// Extracts the keyId, resolves the signing actor (guarding against
    /// local/private destinations before fetching), and verifies the
    /// signature. A failure against a cached key forces a single re-fetch
    /// before declaring final failure, so remote key rotation does not
    /// permanently break verification.
    ///
    /// # Returns
    /// The verified actor URL.
    pub async fn verify_signed_request(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<String, AppError> {
        use super::signature::{extract_signature_key_id, verify_signature};

        let key_id = extract_signature_key_id(headers)?;

        // Validate the origin and reject internal destinations before any
        // fetch this verification might trigger.
        let domain = extract_actor_domain(&key_id)?;
        let actor_url = key_id.split('#').next().unwrap_or(&key_id).to_string();
        let parsed_actor_url = url::Url::parse(&actor_url)
            .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;
        let port = parsed_actor_url
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;
        validate_resolved_host_ips(&domain, port).await?;

        let was_cached = self.cache.get(&actor_url).await.is_some();
        let actor = self.resolve(&actor_url).await?;

        match verify_signature(method, path, headers, body, &actor.public_key_pem) {
            Ok(()) => return Ok(actor_url),
            Err(error) if !was_cached => return Err(error),
            Err(_) => {}
        }

        // Cached key failed; the remote may have rotated keys. One forced
        // re-fetch, then the result is final.
        tracing::debug!(actor_url = %actor_url, "Cached key failed verification, re-fetching actor");
        let refreshed = self.resolve_fresh(&actor_url).await?;
        verify_signature(method, path, headers, body, &refreshed.public_key_pem)?;

        Ok(actor_url)
    }
}
