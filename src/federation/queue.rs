//! Delivery queue and retry policy
//!
//! The queue is the durable fire-and-forget boundary: triggering actions
//! submit a job and return, workers execute attempts independently. Any
//! attempt is safely re-executable because the authoritative payload and
//! attempt count live on the delivery log record, not in the job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use crate::config::FederationConfig;
use crate::data::{Database, DeliveryStatus, EntityId};
use crate::error::AppError;

/// Retry schedule with a bounded attempt ceiling.
///
/// The schedule is fixed rather than randomized: targets are discrete
/// remote inboxes, not a shared pool, so operator predictability wins
/// over jitter. Short-then-long absorbs transient blips quickly without
/// hammering an instance that is genuinely down.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
    /// Total attempts per job, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&[60, 300, 1800, 7200], 4)
    }
}

impl RetryPolicy {
    /// Create a policy from a schedule in seconds.
    ///
    /// An empty schedule falls back to the default; the ceiling is at
    /// least one attempt.
    pub fn new(schedule_seconds: &[u64], max_attempts: u32) -> Self {
        let schedule: Vec<Duration> = if schedule_seconds.is_empty() {
            vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(1800),
                Duration::from_secs(7200),
            ]
        } else {
            schedule_seconds
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect()
        };

        Self {
            schedule,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Build from the federation config section.
    pub fn from_config(config: &FederationConfig) -> Self {
        Self::new(&config.retry_schedule_seconds, config.max_attempts)
    }

    /// Delay associated with attempt `n` (0-indexed), clamped to the last
    /// schedule entry. The worker waits this long after a retryable
    /// failure of attempt `n` before executing attempt `n + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.schedule.len() - 1);
        self.schedule[index]
    }
}

/// In-flight unit of work: one activity to one inbox.
///
/// Carries the correlation id back to the delivery log record; the record
/// holds the frozen payload bytes and the authoritative attempt count.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    /// Delivery log record this job executes
    pub log_id: String,
    /// Local sender actor ID
    pub sender_id: String,
    /// Target inbox URL
    pub inbox_url: String,
    /// Activity family tag, for logging
    pub activity_type: String,
}

/// External at-least-once delivery queue seam.
///
/// `submit` returns the queue's job id for cross-referencing on the log
/// record. A broker-backed implementation can replace
/// [`LocalDeliveryQueue`] behind this trait.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn submit(&self, job: DeliveryJob) -> Result<String, AppError>;
}

/// Outcome of one executed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Inbox accepted the activity; record is DELIVERED
    Delivered,
    /// Permanent rejection or attempt ceiling reached; record is FAILED
    Failed,
    /// Retryable failure; `attempts` is the count recorded so far
    Retry { attempts: i64 },
    /// Record vanished or was no longer PENDING; nothing to do
    Skipped,
}

/// HTTP response classification per the delivery error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseClass {
    Success,
    /// 4xx other than 429: the remote rejected the activity for good
    Permanent,
    /// 5xx, 429 and everything else worth another attempt
    Retryable,
}

fn classify_status(status: reqwest::StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        ResponseClass::Permanent
    } else {
        ResponseClass::Retryable
    }
}

/// Executes delivery attempts against remote inboxes.
///
/// Loads the record, signs the frozen payload bytes with a fresh `Date`
/// and POSTs them; the outcome is written back through conditional status
/// updates. Every error on this path becomes log state, never a panic or
/// an unhandled propagation that could take down unrelated jobs.
pub struct DeliveryWorker {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    base_url: String,
    max_attempts: u32,
}

impl DeliveryWorker {
    /// Create new worker
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        base_url: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            http_client,
            base_url,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Execute a single delivery attempt for a job.
    ///
    /// # Errors
    /// Only storage errors propagate; delivery failures are converted into
    /// record state and returned as an [`AttemptOutcome`].
    pub async fn execute_attempt(&self, job: &DeliveryJob) -> Result<AttemptOutcome, AppError> {
        use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_ATTEMPT_DURATION_SECONDS};

        let Some(record) = self.db.get_delivery_log(&job.log_id).await? else {
            tracing::warn!(log_id = %job.log_id, "Delivery job references missing log record");
            return Ok(AttemptOutcome::Skipped);
        };

        if record.delivery_status() != Some(DeliveryStatus::Pending) {
            tracing::debug!(
                log_id = %job.log_id,
                status = %record.status,
                "Skipping job for non-pending record"
            );
            return Ok(AttemptOutcome::Skipped);
        }

        let Some(profile) = self.db.get_profile(&job.sender_id).await? else {
            return self
                .fail_permanently(&record.id, "Sender profile not found")
                .await;
        };
        let Some(keypair) = self.db.get_actor_keypair(&job.sender_id).await? else {
            return self
                .fail_permanently(&record.id, "Sender has no signing key pair")
                .await;
        };

        let key_id = format!(
            "{}/users/{}#main-key",
            self.base_url.trim_end_matches('/'),
            profile.username
        );

        // Sign the frozen payload bytes with a fresh Date header. The
        // bytes never change across retries; only the envelope does.
        let signed = match super::signature::sign_request(
            "POST",
            &record.inbox_url,
            Some(&record.payload),
            &keypair.private_key_pem,
            &key_id,
        ) {
            Ok(signed) => signed,
            Err(error) => {
                return self
                    .fail_permanently(&record.id, &format!("Signing failed: {}", error))
                    .await;
            }
        };

        let mut request = self
            .http_client
            .post(&record.inbox_url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let started = std::time::Instant::now();
        let response = request.body(record.payload.clone()).send().await;
        let elapsed = started.elapsed().as_secs_f64();

        match response {
            Ok(response) => {
                let status = response.status();
                match classify_status(status) {
                    ResponseClass::Success => {
                        DELIVERY_ATTEMPTS_TOTAL
                            .with_label_values(&["delivered"])
                            .inc();
                        DELIVERY_ATTEMPT_DURATION_SECONDS
                            .with_label_values(&["delivered"])
                            .observe(elapsed);

                        if self.db.mark_delivered(&record.id, Utc::now()).await? {
                            tracing::info!(
                                log_id = %record.id,
                                inbox_url = %record.inbox_url,
                                activity_type = %record.activity_type,
                                "Delivered activity"
                            );
                            Ok(AttemptOutcome::Delivered)
                        } else {
                            Ok(AttemptOutcome::Skipped)
                        }
                    }
                    ResponseClass::Permanent => {
                        DELIVERY_ATTEMPT_DURATION_SECONDS
                            .with_label_values(&["permanent"])
                            .observe(elapsed);
                        self.fail_permanently(
                            &record.id,
                            &format!(
                                "Inbox {} rejected activity: HTTP {}",
                                record.inbox_url, status
                            ),
                        )
                        .await
                    }
                    ResponseClass::Retryable => {
                        DELIVERY_ATTEMPT_DURATION_SECONDS
                            .with_label_values(&["retryable"])
                            .observe(elapsed);
                        self.record_retryable(
                            &record.id,
                            &format!("Inbox {} returned HTTP {}", record.inbox_url, status),
                        )
                        .await
                    }
                }
            }
            Err(error) => {
                // Network errors and timeouts are always worth retrying.
                DELIVERY_ATTEMPT_DURATION_SECONDS
                    .with_label_values(&["retryable"])
                    .observe(elapsed);
                self.record_retryable(
                    &record.id,
                    &format!("Failed to deliver to {}: {}", record.inbox_url, error),
                )
                .await
            }
        }
    }

    async fn fail_permanently(&self, log_id: &str, error: &str) -> Result<AttemptOutcome, AppError> {
        use crate::metrics::DELIVERY_ATTEMPTS_TOTAL;

        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&["permanent"])
            .inc();

        if self.db.mark_failed(log_id, error, Utc::now()).await? {
            tracing::warn!(log_id = %log_id, error = %error, "Delivery failed permanently");
        }
        Ok(AttemptOutcome::Failed)
    }

    async fn record_retryable(&self, log_id: &str, error: &str) -> Result<AttemptOutcome, AppError> {
        use crate::metrics::DELIVERY_ATTEMPTS_TOTAL;

        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&["retryable"])
            .inc();

        let Some(attempts) = self
            .db
            .record_failed_attempt(log_id, error, Utc::now())
            .await?
        else {
            return Ok(AttemptOutcome::Skipped);
        };

        if attempts >= i64::from(self.max_attempts) {
            self.db.finalize_failed(log_id, Utc::now()).await?;
            tracing::warn!(
                log_id = %log_id,
                attempts,
                error = %error,
                "Delivery attempts exhausted"
            );
            return Ok(AttemptOutcome::Failed);
        }

        tracing::debug!(log_id = %log_id, attempts, error = %error, "Delivery attempt failed, will retry");
        Ok(AttemptOutcome::Retry { attempts })
    }
}

/// In-process delivery queue backed by tokio tasks.
///
/// Jobs execute independently on a semaphore-bounded pool; retries of a
/// single job are strictly sequential. Used by the binary and the test
/// suites; a broker-backed queue replaces this behind [`DeliveryQueue`]
/// in multi-instance deployments.
pub struct LocalDeliveryQueue {
    worker: Arc<DeliveryWorker>,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
}

impl LocalDeliveryQueue {
    /// Create new queue
    pub fn new(worker: Arc<DeliveryWorker>, policy: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            worker,
            policy,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl DeliveryQueue for LocalDeliveryQueue {
    async fn submit(&self, job: DeliveryJob) -> Result<String, AppError> {
        let queue_job_id = EntityId::new().0;
        let worker = self.worker.clone();
        let policy = self.policy.clone();
        let semaphore = self.semaphore.clone();

        tracing::debug!(
            queue_job_id = %queue_job_id,
            log_id = %job.log_id,
            inbox_url = %job.inbox_url,
            activity_type = %job.activity_type,
            "Queued delivery job"
        );

        tokio::spawn(async move {
            loop {
                // Hold a permit only while an attempt executes, not across
                // backoff sleeps.
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let outcome = worker.execute_attempt(&job).await;
                drop(permit);

                match outcome {
                    Ok(AttemptOutcome::Retry { attempts }) => {
                        let last_attempt_index = u32::try_from((attempts - 1).max(0)).unwrap_or(0);
                        tokio::time::sleep(policy.delay_for_attempt(last_attempt_index)).await;
                    }
                    Ok(_) => break,
                    Err(error) => {
                        // Storage failure: leave the record as-is for the
                        // operator and stop this job without touching others.
                        tracing::error!(
                            log_id = %job.log_id,
                            %error,
                            "Delivery job aborted on storage error"
                        );
                        break;
                    }
                }
            }
        });

        Ok(queue_job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_schedule_matches_reference_policy() {
        let policy = RetryPolicy::default();

        let expected_ms = [60_000u128, 300_000, 1_800_000, 7_200_000, 7_200_000];
        for (attempt, expected) in expected_ms.iter().enumerate() {
            assert_eq!(
                policy.delay_for_attempt(attempt as u32).as_millis(),
                *expected,
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn delay_clamps_to_last_entry() {
        let policy = RetryPolicy::new(&[1, 2], 10);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(2));
    }

    #[test]
    fn empty_schedule_falls_back_to_default() {
        let policy = RetryPolicy::new(&[], 4);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(7200));
    }

    #[test]
    fn classify_status_follows_error_taxonomy() {
        use reqwest::StatusCode;

        assert_eq!(classify_status(StatusCode::OK), ResponseClass::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED), ResponseClass::Success);

        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            ResponseClass::Permanent
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            ResponseClass::Permanent
        );
        assert_eq!(classify_status(StatusCode::GONE), ResponseClass::Permanent);

        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ResponseClass::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ResponseClass::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            ResponseClass::Retryable
        );
    }
}
