//! Capability discovery via NodeInfo
//!
//! Checks whether peer instances advertise optional protocol extensions
//! before using them. Results degrade toward the safe path: an
//! unreachable or ambiguous peer is treated as "unsupported", which only
//! downgrades optional transports (e.g. an encrypted DM becomes a plain
//! one); it never drops a mandatory activity.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::data::CapabilityCache;
use crate::error::AppError;

/// Capability flag for encrypted direct-message transport, as advertised
/// in NodeInfo `metadata.features`.
pub const CAP_ENCRYPTED_DM: &str = "encrypted_direct_messages";

/// Concurrent capability checks per batch
const MAX_CONCURRENT_CHECKS: usize = 10;

/// Result of a batch encryption-support check
#[derive(Debug, Clone)]
pub struct EncryptionSupport {
    /// Whether every queried domain supports encrypted transport
    pub all_supported: bool,
    pub supported_domains: Vec<String>,
    pub unsupported_domains: Vec<String>,
}

/// Pick the NodeInfo document URL from the discovery links.
///
/// Accepts any 2.x schema revision.
fn nodeinfo_document_url(links: &serde_json::Value) -> Option<String> {
    links
        .get("links")?
        .as_array()?
        .iter()
        .find(|link| {
            link.get("rel")
                .and_then(|rel| rel.as_str())
                .is_some_and(|rel| rel.contains("nodeinfo.diaspora.software/ns/schema/2"))
        })?
        .get("href")?
        .as_str()
        .map(str::to_string)
}

/// Whether a NodeInfo document declares a capability in `metadata.features`.
fn features_include(document: &serde_json::Value, capability: &str) -> bool {
    document
        .get("metadata")
        .and_then(|metadata| metadata.get("features"))
        .and_then(|features| features.as_array())
        .is_some_and(|features| {
            features
                .iter()
                .any(|feature| feature.as_str() == Some(capability))
        })
}

/// NodeInfo-based capability discovery
#[derive(Clone)]
pub struct CapabilityDiscovery {
    cache: Arc<CapabilityCache>,
    http_client: Arc<reqwest::Client>,
}

impl CapabilityDiscovery {
    /// Create new discovery service
    pub fn new(cache: Arc<CapabilityCache>, http_client: Arc<reqwest::Client>) -> Self {
        Self { cache, http_client }
    }

    /// Check whether a remote domain advertises a capability.
    ///
    /// Never errors: any failure along the discovery path (unreachable
    /// host, non-2xx, malformed document) yields `false`. Results are
    /// cached per `(domain, capability)`.
    pub async fn check_capability(&self, domain: &str, capability: &str) -> bool {
        use crate::metrics::CAPABILITY_CHECKS_TOTAL;

        if let Some(cached) = self.cache.get(domain, capability).await {
            return cached;
        }

        let supported = match self.fetch_capability(domain, capability).await {
            Ok(supported) => supported,
            Err(error) => {
                tracing::debug!(
                    domain = %domain,
                    capability = %capability,
                    %error,
                    "Capability check failed, treating as unsupported"
                );
                false
            }
        };

        CAPABILITY_CHECKS_TOTAL
            .with_label_values(&[if supported { "supported" } else { "unsupported" }])
            .inc();

        self.cache.insert(domain, capability, supported).await;
        supported
    }

    async fn fetch_capability(&self, domain: &str, capability: &str) -> Result<bool, AppError> {
        let discovery_url = format!("https://{}/.well-known/nodeinfo", domain);
        let links: serde_json::Value = self
            .http_client
            .get(&discovery_url)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::HttpClient)?
            .json()
            .await?;

        let Some(document_url) = nodeinfo_document_url(&links) else {
            return Ok(false);
        };

        let document: serde_json::Value = self
            .http_client
            .get(&document_url)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::HttpClient)?
            .json()
            .await?;

        Ok(features_include(&document, capability))
    }

    /// Check encrypted-DM support for a set of domains.
    ///
    /// Domains are checked independently with bounded concurrency; one
    /// unreachable domain never fails the batch.
    pub async fn check_encryption_support(&self, domains: &[String]) -> EncryptionSupport {
        let results: Vec<(String, bool)> = stream::iter(domains.iter().cloned())
            .map(|domain| {
                let discovery = self.clone();
                async move {
                    let supported = discovery.check_capability(&domain, CAP_ENCRYPTED_DM).await;
                    (domain, supported)
                }
            })
            .buffer_unordered(MAX_CONCURRENT_CHECKS)
            .collect()
            .await;

        let mut supported_domains = Vec::new();
        let mut unsupported_domains = Vec::new();
        for (domain, supported) in results {
            if supported {
                supported_domains.push(domain);
            } else {
                unsupported_domains.push(domain);
            }
        }

        EncryptionSupport {
            all_supported: unsupported_domains.is_empty() && !domains.is_empty(),
            supported_domains,
            unsupported_domains,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn discovery_with_short_timeout() -> CapabilityDiscovery {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("client");
        CapabilityDiscovery::new(Arc::new(CapabilityCache::new(None)), Arc::new(client))
    }

    #[test]
    fn nodeinfo_document_url_picks_2x_schema_link() {
        let links = serde_json::json!({
            "links": [
                {
                    "rel": "http://nodeinfo.diaspora.software/ns/schema/1.0",
                    "href": "https://remote.example/nodeinfo/1.0"
                },
                {
                    "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                    "href": "https://remote.example/nodeinfo/2.1"
                }
            ]
        });

        assert_eq!(
            nodeinfo_document_url(&links).as_deref(),
            Some("https://remote.example/nodeinfo/2.1")
        );
    }

    #[test]
    fn nodeinfo_document_url_handles_missing_links() {
        assert_eq!(nodeinfo_document_url(&serde_json::json!({})), None);
        assert_eq!(
            nodeinfo_document_url(&serde_json::json!({"links": []})),
            None
        );
    }

    #[test]
    fn features_include_matches_declared_capability() {
        let document = serde_json::json!({
            "version": "2.1",
            "metadata": {
                "features": ["encrypted_direct_messages", "emoji_reactions"]
            }
        });

        assert!(features_include(&document, CAP_ENCRYPTED_DM));
        assert!(!features_include(&document, "quote_posts"));
    }

    #[test]
    fn features_include_is_false_without_metadata() {
        let document = serde_json::json!({"version": "2.0"});
        assert!(!features_include(&document, CAP_ENCRYPTED_DM));
    }

    #[tokio::test]
    async fn unreachable_domain_is_reported_unsupported_not_an_error() {
        let discovery = discovery_with_short_timeout();

        let support = discovery
            .check_encryption_support(&["down.invalid".to_string()])
            .await;

        assert!(!support.all_supported);
        assert_eq!(support.unsupported_domains, vec!["down.invalid".to_string()]);
        assert!(support.supported_domains.is_empty());
    }

    #[tokio::test]
    async fn empty_domain_list_is_not_all_supported() {
        let discovery = discovery_with_short_timeout();
        let support = discovery.check_encryption_support(&[]).await;
        assert!(!support.all_supported);
    }

    #[tokio::test]
    async fn failed_checks_are_cached() {
        let discovery = discovery_with_short_timeout();

        assert!(!discovery.check_capability("down.invalid", CAP_ENCRYPTED_DM).await);
        assert_eq!(
            discovery.cache.get("down.invalid", CAP_ENCRYPTED_DM).await,
            Some(false)
        );
    }
}
