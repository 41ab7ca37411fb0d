//! SQLite database operations
//!
//! All database access goes through this module.
//! Delivery log status transitions are single conditional statements so a
//! worker callback and a concurrent operator retry cannot race each other
//! into a lost update.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actor key pairs
    // =========================================================================

    /// Get the signing key pair for a local actor
    pub async fn get_actor_keypair(&self, actor_id: &str) -> Result<Option<ActorKeyPair>, AppError> {
        let keypair =
            sqlx::query_as::<_, ActorKeyPair>("SELECT * FROM actor_keys WHERE actor_id = ?")
                .bind(actor_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(keypair)
    }

    /// Insert a key pair only if the actor has none yet.
    ///
    /// This is atomic at the SQL statement level and prevents races where
    /// two initializers both try to create the first pair for an actor:
    /// the loser keeps the winner's keys, and no signature that remote
    /// peers have already verified is invalidated.
    ///
    /// # Returns
    /// `true` if inserted, `false` if a pair already existed.
    pub async fn insert_actor_keypair_if_absent(
        &self,
        keypair: &ActorKeyPair,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO actor_keys (actor_id, public_key_pem, private_key_pem, created_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM actor_keys WHERE actor_id = ?)
            "#,
        )
        .bind(&keypair.actor_id)
        .bind(&keypair.public_key_pem)
        .bind(&keypair.private_key_pem)
        .bind(keypair.created_at)
        .bind(&keypair.actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    /// Get a profile by actor ID
    pub async fn get_profile(&self, id: &str) -> Result<Option<Profile>, AppError> {
        let profile = sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(profile)
    }

    /// Get a local profile by username (local actors have an empty domain)
    pub async fn get_local_profile_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Profile>, AppError> {
        let profile = sqlx::query_as::<_, Profile>(
            "SELECT * FROM profiles WHERE username = ? AND domain = ''",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    /// Create or update a profile
    pub async fn upsert_profile(&self, profile: &Profile) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, username, display_name, domain, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                display_name = excluded.display_name,
                domain = excluded.domain
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.username)
        .bind(&profile.display_name)
        .bind(&profile.domain)
        .bind(profile.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Delivery log
    // =========================================================================

    /// Insert a fresh delivery log record
    pub async fn insert_delivery_log(&self, record: &DeliveryLogRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_logs (
                id, sender_id, inbox_url, activity_type, payload, status,
                attempt_count, last_error, queue_job_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.sender_id)
        .bind(&record.inbox_url)
        .bind(&record.activity_type)
        .bind(&record.payload)
        .bind(&record.status)
        .bind(record.attempt_count)
        .bind(&record.last_error)
        .bind(&record.queue_job_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a delivery log record by ID, including payload
    pub async fn get_delivery_log(&self, id: &str) -> Result<Option<DeliveryLogRecord>, AppError> {
        let record =
            sqlx::query_as::<_, DeliveryLogRecord>("SELECT * FROM delivery_logs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Store the external queue job ID on a record
    pub async fn set_delivery_queue_job_id(
        &self,
        id: &str,
        queue_job_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_logs SET queue_job_id = ?, updated_at = ? WHERE id = ?")
            .bind(queue_job_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Transition a record to DELIVERED, counting the successful attempt.
    ///
    /// Conditional on the record still being PENDING.
    ///
    /// # Returns
    /// `true` if the transition happened.
    pub async fn mark_delivered(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = 'delivered', attempt_count = attempt_count + 1,
                last_error = NULL, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a retryable attempt failure: increment the attempt count and
    /// store the error, leaving the record PENDING.
    ///
    /// # Returns
    /// The new attempt count, or None if the record was no longer PENDING.
    pub async fn record_failed_attempt(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET attempt_count = attempt_count + 1, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }

        let attempt_count = sqlx::query_scalar::<_, i64>(
            "SELECT attempt_count FROM delivery_logs WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(attempt_count))
    }

    /// Transition a record to FAILED after a permanent rejection,
    /// counting the attempt.
    ///
    /// # Returns
    /// `true` if the transition happened.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = 'failed', attempt_count = attempt_count + 1,
                last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition a record to FAILED without counting a new attempt.
    ///
    /// Used when the attempt ceiling has been reached (the final attempt was
    /// already counted by [`record_failed_attempt`]) and when queue
    /// submission itself fails.
    pub async fn finalize_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = 'failed', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Re-arm a FAILED record for operator retry.
    ///
    /// Resets status to PENDING, attempt count to 0 and clears the last
    /// error. Conditional on the record being FAILED: this is the one
    /// intentional exception to terminal statuses.
    ///
    /// # Returns
    /// `true` if the record was re-armed.
    pub async fn reset_for_retry(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = 'pending', attempt_count = 0, last_error = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// List delivery log summaries (payload excluded), newest first.
    ///
    /// # Arguments
    /// * `status` - Optional status filter
    /// * `activity_type` - Optional activity type filter
    /// * `limit` / `offset` - Pagination window
    pub async fn list_delivery_logs(
        &self,
        status: Option<DeliveryStatus>,
        activity_type: Option<ActivityType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeliveryLogSummary>, AppError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, sender_id, inbox_url, activity_type, status, attempt_count, \
             last_error, queue_job_id, created_at, updated_at FROM delivery_logs WHERE 1 = 1",
        );

        if let Some(status) = status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(activity_type) = activity_type {
            builder
                .push(" AND activity_type = ")
                .push_bind(activity_type.as_str());
        }

        builder
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let summaries = builder
            .build_query_as::<DeliveryLogSummary>()
            .fetch_all(&self.pool)
            .await?;

        Ok(summaries)
    }

    /// Count delivery log records matching the same filters as
    /// [`list_delivery_logs`]
    pub async fn count_delivery_logs(
        &self,
        status: Option<DeliveryStatus>,
        activity_type: Option<ActivityType>,
    ) -> Result<i64, AppError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM delivery_logs WHERE 1 = 1");

        if let Some(status) = status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(activity_type) = activity_type {
            builder
                .push(" AND activity_type = ")
                .push_bind(activity_type.as_str());
        }

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;

        Ok(count)
    }

    /// Aggregate delivery counts for the operator dashboard
    pub async fn delivery_stats(&self) -> Result<DeliveryStats, AppError> {
        let status_rows =
            sqlx::query("SELECT status, COUNT(*) AS total FROM delivery_logs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut pending = 0i64;
        let mut delivered = 0i64;
        let mut failed = 0i64;
        for row in status_rows {
            let status: String = row.get("status");
            let total: i64 = row.get("total");
            match DeliveryStatus::parse(&status) {
                Some(DeliveryStatus::Pending) => pending = total,
                Some(DeliveryStatus::Delivered) => delivered = total,
                Some(DeliveryStatus::Failed) => failed = total,
                None => {}
            }
        }

        let type_rows = sqlx::query(
            "SELECT activity_type, COUNT(*) AS total FROM delivery_logs \
             GROUP BY activity_type ORDER BY activity_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_type = type_rows
            .into_iter()
            .map(|row| ActivityTypeCount {
                activity_type: row.get("activity_type"),
                total: row.get("total"),
            })
            .collect();

        Ok(DeliveryStats {
            pending,
            delivered,
            failed,
            total: pending + delivered + failed,
            by_type,
        })
    }

    /// IDs of FAILED records, oldest first, bounded by `limit`.
    ///
    /// Used by retry-all-failed; the bound is the overload guard.
    pub async fn list_failed_delivery_ids(&self, limit: i64) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM delivery_logs WHERE status = 'failed' \
             ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
