//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Delivery Metrics
    pub static ref DELIVERIES_SUBMITTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_deliveries_submitted_total", "Delivery requests accepted and queued"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_delivery_attempts_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPT_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "inkfed_delivery_attempt_duration_seconds",
            "Inbox POST duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");

    // Discovery Metrics
    pub static ref WEBFINGER_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_webfinger_queries_total", "WebFinger queries by direction and status"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref ACTOR_RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_actor_resolutions_total", "Remote actor resolutions by source"),
        &["source"]
    ).expect("metric can be created");
    pub static ref CAPABILITY_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_capability_checks_total", "Capability checks by result"),
        &["result"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("inkfed_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(DELIVERIES_SUBMITTED_TOTAL.clone()))
        .expect("DELIVERIES_SUBMITTED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPT_DURATION_SECONDS.clone()))
        .expect("DELIVERY_ATTEMPT_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(WEBFINGER_QUERIES_TOTAL.clone()))
        .expect("WEBFINGER_QUERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTOR_RESOLUTIONS_TOTAL.clone()))
        .expect("ACTOR_RESOLUTIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CAPABILITY_CHECKS_TOTAL.clone()))
        .expect("CAPABILITY_CHECKS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_SIZE.clone()))
        .expect("CACHE_SIZE can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
