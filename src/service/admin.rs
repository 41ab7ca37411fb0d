//! Admin delivery operations
//!
//! Operator-facing queries and mutations over the delivery log: list and
//! filter, stats, single retry, bounded bulk retry. Besides the queue
//! worker itself, these are the only mutation entry points for delivery
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data::{
    ActivityType, Database, DeliveryLogRecord, DeliveryStats, DeliveryStatus,
};
use crate::error::AppError;
use crate::federation::{DeliveryJob, DeliveryQueue};

/// Default page size for delivery listings
const DEFAULT_PAGE_LIMIT: u32 = 20;
/// Maximum page size for delivery listings
const MAX_PAGE_LIMIT: u32 = 100;

/// Listing filter for delivery records
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub status: Option<DeliveryStatus>,
    pub activity_type: Option<ActivityType>,
    /// 1-based page number
    pub page: u32,
    pub limit: u32,
}

/// Sender identity joined from the profile store
#[derive(Debug, Clone, Serialize)]
pub struct SenderIdentity {
    pub id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub domain: Option<String>,
}

/// One row of a delivery listing.
///
/// The activity payload is deliberately absent: it is large and
/// sensitive, and only exposed through single-record fetches.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryListItem {
    pub id: String,
    pub sender: SenderIdentity,
    pub inbox_url: String,
    pub activity_type: String,
    pub status: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub queue_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A page of delivery records
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryListPage {
    pub items: Vec<DeliveryListItem>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}

/// Full single-record view, payload included
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryDetail {
    pub id: String,
    pub sender: SenderIdentity,
    pub inbox_url: String,
    pub activity_type: String,
    /// Stored activity document, decoded from the frozen payload bytes
    pub payload: serde_json::Value,
    pub status: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub queue_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a bulk retry
#[derive(Debug, Clone, Serialize)]
pub struct RetryAllOutcome {
    /// FAILED records seen by this invocation (bounded by the batch cap)
    pub total_failed: u64,
    /// Records successfully re-queued
    pub queued: u64,
}

/// Operator delivery operations service
#[derive(Clone)]
pub struct AdminDeliveryOps {
    db: Arc<Database>,
    queue: Arc<dyn DeliveryQueue>,
    retry_batch_limit: u32,
}

impl AdminDeliveryOps {
    /// Create new admin ops service
    pub fn new(db: Arc<Database>, queue: Arc<dyn DeliveryQueue>, retry_batch_limit: u32) -> Self {
        Self {
            db,
            queue,
            retry_batch_limit: retry_batch_limit.max(1),
        }
    }

    async fn sender_identity(
        &self,
        cache: &mut HashMap<String, SenderIdentity>,
        sender_id: &str,
    ) -> Result<SenderIdentity, AppError> {
        if let Some(identity) = cache.get(sender_id) {
            return Ok(identity.clone());
        }

        let identity = match self.db.get_profile(sender_id).await? {
            Some(profile) => SenderIdentity {
                id: profile.id,
                username: Some(profile.username),
                display_name: profile.display_name,
                domain: Some(profile.domain),
            },
            None => SenderIdentity {
                id: sender_id.to_string(),
                username: None,
                display_name: None,
                domain: None,
            },
        };

        cache.insert(sender_id.to_string(), identity.clone());
        Ok(identity)
    }

    /// List delivery records, newest first, enriched with sender identity.
    pub async fn get_deliveries(
        &self,
        filter: DeliveryFilter,
    ) -> Result<DeliveryListPage, AppError> {
        let page = filter.page.max(1);
        let limit = match filter.limit {
            0 => DEFAULT_PAGE_LIMIT,
            limit => limit.min(MAX_PAGE_LIMIT),
        };
        let offset = i64::from(page - 1) * i64::from(limit);

        let summaries = self
            .db
            .list_delivery_logs(filter.status, filter.activity_type, i64::from(limit), offset)
            .await?;
        let total = self
            .db
            .count_delivery_logs(filter.status, filter.activity_type)
            .await?;

        let mut identities = HashMap::new();
        let mut items = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let sender = self
                .sender_identity(&mut identities, &summary.sender_id)
                .await?;
            items.push(DeliveryListItem {
                id: summary.id,
                sender,
                inbox_url: summary.inbox_url,
                activity_type: summary.activity_type,
                status: summary.status,
                attempt_count: summary.attempt_count,
                last_error: summary.last_error,
                queue_job_id: summary.queue_job_id,
                created_at: summary.created_at,
                updated_at: summary.updated_at,
            });
        }

        Ok(DeliveryListPage {
            items,
            page,
            limit,
            total,
        })
    }

    /// Fetch one record with its full payload.
    ///
    /// # Errors
    /// NotFound if the record does not exist.
    pub async fn get_delivery(&self, id: &str) -> Result<DeliveryDetail, AppError> {
        let record = self
            .db
            .get_delivery_log(id)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut identities = HashMap::new();
        let sender = self
            .sender_identity(&mut identities, &record.sender_id)
            .await?;

        // Payloads are JSON at accept time; a decode failure here means
        // stored bytes were corrupted and is worth surfacing verbatim.
        let payload = serde_json::from_slice(&record.payload).unwrap_or_else(
            |_| serde_json::json!({ "raw": String::from_utf8_lossy(&record.payload) }),
        );

        Ok(DeliveryDetail {
            id: record.id,
            sender,
            inbox_url: record.inbox_url,
            activity_type: record.activity_type,
            payload,
            status: record.status,
            attempt_count: record.attempt_count,
            last_error: record.last_error,
            queue_job_id: record.queue_job_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Aggregate counts for the operator dashboard.
    pub async fn get_delivery_stats(&self) -> Result<DeliveryStats, AppError> {
        self.db.delivery_stats().await
    }

    /// Re-arm a FAILED delivery and submit a fresh job over the original,
    /// unmodified stored payload.
    ///
    /// # Errors
    /// NotFound if the record does not exist; BadRequest unless its
    /// current status is FAILED (a pending or delivered record cannot be
    /// "retried").
    ///
    /// # Returns
    /// The record as re-armed (status PENDING, attempt count 0), read
    /// before the fresh job executes.
    pub async fn retry_delivery(&self, id: &str) -> Result<DeliveryDetail, AppError> {
        let record = self
            .db
            .get_delivery_log(id)
            .await?
            .ok_or(AppError::NotFound)?;

        if record.delivery_status() != Some(DeliveryStatus::Failed) {
            return Err(AppError::BadRequest(format!(
                "Only failed deliveries can be retried (current status: {})",
                record.status
            )));
        }

        // Conditional on FAILED: loses gracefully against a concurrent
        // retry of the same record.
        if !self.db.reset_for_retry(id, Utc::now()).await? {
            return Err(AppError::BadRequest(
                "Delivery is no longer in a failed state".to_string(),
            ));
        }

        // Snapshot the re-armed state for the response before the fresh
        // job starts mutating it.
        let rearmed = self.get_delivery(id).await?;

        self.submit_job(&record).await?;

        tracing::info!(log_id = %id, inbox_url = %record.inbox_url, "Delivery re-queued by operator");

        Ok(rearmed)
    }

    async fn submit_job(&self, record: &DeliveryLogRecord) -> Result<(), AppError> {
        let job = DeliveryJob {
            log_id: record.id.clone(),
            sender_id: record.sender_id.clone(),
            inbox_url: record.inbox_url.clone(),
            activity_type: record.activity_type.clone(),
        };

        let queue_job_id = self.queue.submit(job).await?;
        self.db
            .set_delivery_queue_job_id(&record.id, &queue_job_id)
            .await?;

        Ok(())
    }

    /// Re-queue FAILED deliveries in bulk, bounded by the batch cap.
    ///
    /// Individual failures are logged and skipped; the batch never aborts
    /// halfway.
    pub async fn retry_all_failed(&self) -> Result<RetryAllOutcome, AppError> {
        let ids = self
            .db
            .list_failed_delivery_ids(i64::from(self.retry_batch_limit))
            .await?;

        let total_failed = ids.len() as u64;
        let mut queued = 0u64;

        for id in ids {
            match self.retry_delivery(&id).await {
                Ok(_) => queued += 1,
                Err(error) => {
                    tracing::warn!(log_id = %id, %error, "Bulk retry skipped a record");
                }
            }
        }

        tracing::info!(total_failed, queued, "Bulk retry completed");

        Ok(RetryAllOutcome {
            total_failed,
            queued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Queue stub that records submissions without executing anything.
    struct RecordingQueue {
        submitted: Mutex<Vec<DeliveryJob>>,
    }

    impl RecordingQueue {
        fn new() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn submissions(&self) -> usize {
            self.submitted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliveryQueue for RecordingQueue {
        async fn submit(&self, job: DeliveryJob) -> Result<String, AppError> {
            self.submitted.lock().unwrap().push(job);
            Ok(crate::data::EntityId::new().0)
        }
    }

    async fn test_ops(
        retry_batch_limit: u32,
    ) -> (AdminDeliveryOps, Arc<Database>, Arc<RecordingQueue>, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .expect("connect"),
        );
        let queue = Arc::new(RecordingQueue::new());
        let ops = AdminDeliveryOps::new(db.clone(), queue.clone(), retry_batch_limit);
        (ops, db, queue, temp_dir)
    }

    fn sample_record() -> DeliveryLogRecord {
        DeliveryLogRecord::new(
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "https://remote.example/users/hana/inbox",
            ActivityType::Like,
            br#"{"type":"Like","object":"https://remote.example/art/7"}"#.to_vec(),
        )
    }

    #[tokio::test]
    async fn retry_rejects_pending_and_delivered_records() {
        let (ops, db, queue, _guard) = test_ops(100).await;

        let pending = sample_record();
        db.insert_delivery_log(&pending).await.unwrap();

        match ops.retry_delivery(&pending.id).await {
            Err(AppError::BadRequest(msg)) => assert!(msg.contains("failed")),
            other => panic!("expected bad request for pending record, got: {other:?}"),
        }

        db.mark_delivered(&pending.id, Utc::now()).await.unwrap();
        match ops.retry_delivery(&pending.id).await {
            Err(AppError::BadRequest(_)) => {}
            other => panic!("expected bad request for delivered record, got: {other:?}"),
        }

        // No mutation happened either time.
        let stored = db.get_delivery_log(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "delivered");
        assert_eq!(queue.submissions(), 0);
    }

    #[tokio::test]
    async fn retry_rearms_failed_record_and_requeues_original_payload() {
        let (ops, db, queue, _guard) = test_ops(100).await;

        let record = sample_record();
        db.insert_delivery_log(&record).await.unwrap();
        db.mark_failed(&record.id, "HTTP 503", Utc::now())
            .await
            .unwrap();

        let rearmed = ops.retry_delivery(&record.id).await.expect("retry");
        assert_eq!(rearmed.status, "pending");
        assert_eq!(rearmed.attempt_count, 0);
        assert!(rearmed.last_error.is_none());

        // The stored payload bytes are the original ones, untouched.
        let stored = db.get_delivery_log(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, record.payload);
        assert!(stored.queue_job_id.is_some());
        assert_eq!(queue.submissions(), 1);
    }

    #[tokio::test]
    async fn retry_missing_record_is_not_found() {
        let (ops, _db, _queue, _guard) = test_ops(100).await;

        match ops.retry_delivery("01NOPE0000000000000000000X").await {
            Err(AppError::NotFound) => {}
            other => panic!("expected not found, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_all_failed_is_bounded_by_the_batch_cap() {
        let (ops, db, queue, _guard) = test_ops(3).await;

        for _ in 0..5 {
            let record = sample_record();
            db.insert_delivery_log(&record).await.unwrap();
            db.mark_failed(&record.id, "HTTP 500", Utc::now())
                .await
                .unwrap();
        }

        let outcome = ops.retry_all_failed().await.expect("bulk retry");
        assert_eq!(outcome.total_failed, 3);
        assert_eq!(outcome.queued, 3);
        assert_eq!(queue.submissions(), 3);

        // The remaining two are still failed and retryable later.
        let stats = ops.get_delivery_stats().await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.pending, 3);
    }

    #[tokio::test]
    async fn listing_excludes_payload_and_paginates() {
        let (ops, db, _queue, _guard) = test_ops(100).await;

        for _ in 0..7 {
            db.insert_delivery_log(&sample_record()).await.unwrap();
        }

        let page = ops
            .get_deliveries(DeliveryFilter {
                page: 1,
                limit: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.total, 7);

        let page2 = ops
            .get_deliveries(DeliveryFilter {
                page: 2,
                limit: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 2);
    }

    #[tokio::test]
    async fn detail_includes_decoded_payload() {
        let (ops, db, _queue, _guard) = test_ops(100).await;

        let record = sample_record();
        db.insert_delivery_log(&record).await.unwrap();

        let detail = ops.get_delivery(&record.id).await.unwrap();
        assert_eq!(detail.payload["type"], "Like");
        assert_eq!(
            detail.payload["object"],
            "https://remote.example/art/7"
        );
    }
}
