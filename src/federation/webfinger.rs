//! WebFinger protocol implementation
//!
//! The only actor-discovery entry point from a bare handle. Strict about
//! domain matching: local handles are served from the profile store and
//! never queried remotely; remote handles are always queried remotely and
//! never guessed.

use serde::{Deserialize, Serialize};

use crate::data::Database;
use crate::error::AppError;

/// Media type of ActivityPub actor documents in `self` links
const ACTIVITY_JSON: &str = "application/activity+json";

/// A parsed `user@domain` handle
///
/// `domain` of `None` means the handle refers to a local actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub username: String,
    pub domain: Option<String>,
}

impl Handle {
    /// Treat a handle on our own domain as local.
    pub fn normalize_local(mut self, local_domain: &str) -> Self {
        if self
            .domain
            .as_deref()
            .is_some_and(|domain| domain.eq_ignore_ascii_case(local_domain))
        {
            self.domain = None;
        }
        self
    }
}

/// Parse an account handle
///
/// Accepts `user`, `@user`, `user@domain` and `@user@domain`.
///
/// # Errors
/// Validation error for empty usernames or more than one domain segment
/// (e.g. `a@b@c`).
pub fn parse_handle(handle: &str) -> Result<Handle, AppError> {
    let trimmed = handle.trim().trim_start_matches('@');

    let mut parts = trimmed.split('@');
    let username = parts.next().unwrap_or_default();
    let domain = parts.next();

    if parts.next().is_some() {
        return Err(AppError::Validation(format!(
            "Malformed handle: {}",
            handle
        )));
    }

    if username.is_empty() {
        return Err(AppError::Validation(format!(
            "Handle has no username: {}",
            handle
        )));
    }

    if domain.is_some_and(str::is_empty) {
        return Err(AppError::Validation(format!(
            "Handle has an empty domain: {}",
            handle
        )));
    }

    Ok(Handle {
        username: username.to_string(),
        domain: domain.map(str::to_string),
    })
}

/// Parse an `acct:user@domain` resource URI
///
/// # Errors
/// Validation error when the `acct:` scheme is missing or the remainder is
/// not a valid handle.
pub fn parse_acct_uri(resource: &str) -> Result<Handle, AppError> {
    let rest = resource.strip_prefix("acct:").ok_or_else(|| {
        AppError::Validation(format!("Resource must use the acct scheme: {}", resource))
    })?;

    parse_handle(rest)
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Actor URL for a local username
pub fn local_actor_url(base_url: &str, username: &str) -> String {
    format!("{}/users/{}", base_url.trim_end_matches('/'), username)
}

/// Build the JRD document for a local actor.
fn build_local_response(username: &str, domain: &str, base_url: &str) -> WebFingerResponse {
    let actor_url = local_actor_url(base_url, username);

    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url.clone()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url),
            },
        ],
    }
}

/// Generate the WebFinger response for a local account.
///
/// # Arguments
/// * `db` - Profile store
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `base_url` - Instance base URL (includes protocol)
///
/// # Errors
/// NotFound if no local actor with that username exists.
pub async fn create_local_response(
    db: &Database,
    username: &str,
    domain: &str,
    base_url: &str,
) -> Result<WebFingerResponse, AppError> {
    let profile = db
        .get_local_profile_by_username(username)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(build_local_response(&profile.username, domain, base_url))
}

/// Query a remote instance's WebFinger endpoint for a handle.
///
/// Remote handles only: resolving local handles over the network would
/// leak local-only resolution semantics to remote queries.
///
/// # Errors
/// Validation error for local handles; Federation error for non-2xx
/// responses, so callers can distinguish "actor not found" from
/// "instance unreachable".
pub async fn query_remote(
    handle: &Handle,
    http_client: &reqwest::Client,
) -> Result<WebFingerResponse, AppError> {
    use crate::metrics::WEBFINGER_QUERIES_TOTAL;

    let domain = handle.domain.as_deref().ok_or_else(|| {
        AppError::Validation("Cannot query WebFinger for a local handle".to_string())
    })?;

    let resource = format!("acct:{}@{}", handle.username, domain);
    let url = format!(
        "https://{}/.well-known/webfinger?resource={}",
        domain,
        urlencoding::encode(&resource)
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await
        .map_err(|e| {
            WEBFINGER_QUERIES_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            AppError::Federation(format!("WebFinger query to {} failed: {}", domain, e))
        })?;

    if !response.status().is_success() {
        WEBFINGER_QUERIES_TOTAL
            .with_label_values(&["outbound", "error"])
            .inc();
        return Err(AppError::Federation(format!(
            "WebFinger query to {} failed: HTTP {}",
            domain,
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response.json().await.map_err(|e| {
        AppError::Federation(format!("Invalid WebFinger response from {}: {}", domain, e))
    })?;

    WEBFINGER_QUERIES_TOTAL
        .with_label_values(&["outbound", "ok"])
        .inc();

    Ok(jrd)
}

/// Extract the ActivityPub actor URL from a JRD document.
///
/// Scans `links` for `rel=self` with the activity+json type. `None` means
/// the subject cannot federate; callers must not guess an actor URL.
pub fn extract_actor_url(response: &WebFingerResponse) -> Option<String> {
    response
        .links
        .iter()
        .find(|link| {
            link.rel == "self" && link.link_type.as_deref() == Some(ACTIVITY_JSON)
        })
        .and_then(|link| link.href.clone())
}
