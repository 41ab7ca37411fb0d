//! Activity delivery orchestration
//!
//! Builds activity documents, freezes their bytes, records a PENDING audit
//! entry before any network I/O and hands jobs to the delivery queue.
//! Federation is an enhancement of the local action, not a transactional
//! requirement: callers treat a failed submission as a warning, the local
//! side effect has already happened.

use std::sync::Arc;

use crate::data::{ActivityType, Database, DeliveryLogRecord, EntityId};
use crate::error::AppError;

use super::actor::ActorResolver;
use super::capability::{CAP_ENCRYPTED_DM, CapabilityDiscovery};
use super::queue::{DeliveryJob, DeliveryQueue};
use super::webfinger::local_actor_url;

/// Receipt for one accepted (or rejected) delivery submission
#[derive(Debug, Clone)]
pub struct DeliverySubmission {
    /// Delivery log record created for this inbox
    pub log_id: String,
    /// Target inbox URL
    pub inbox_url: String,
    /// Queue job ID, when submission succeeded
    pub queue_job_id: Option<String>,
    /// Whether the job reached the queue
    pub accepted: bool,
}

/// Per-recipient outcome of a direct-message delivery
///
/// A multi-recipient DM can partially succeed, so the caller gets one
/// entry per recipient instead of a single boolean.
#[derive(Debug, Clone)]
pub struct DirectMessageResult {
    /// Recipient actor URL
    pub recipient: String,
    /// Whether the message was accepted for delivery
    pub delivered: bool,
    /// Whether the encrypted transport was used
    pub encrypted: bool,
}

/// Deduplicate identical inbox URLs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inbox_urls: &[String]) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_url in inbox_urls {
        if seen.insert(inbox_url.as_str()) {
            targets.push(inbox_url.clone());
        }
    }

    targets
}

fn domain_of(actor_url: &str) -> Option<String> {
    url::Url::parse(actor_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

/// Activity delivery service
///
/// Orchestrates build -> freeze -> log -> enqueue for every outbound
/// activity family.
#[derive(Clone)]
pub struct ActivityDelivery {
    db: Arc<Database>,
    queue: Arc<dyn DeliveryQueue>,
    resolver: ActorResolver,
    capabilities: CapabilityDiscovery,
    /// Local instance base URL (includes protocol)
    base_url: String,
}

impl ActivityDelivery {
    /// Create new delivery service
    pub fn new(
        db: Arc<Database>,
        queue: Arc<dyn DeliveryQueue>,
        resolver: ActorResolver,
        capabilities: CapabilityDiscovery,
        base_url: String,
    ) -> Self {
        Self {
            db,
            queue,
            resolver,
            capabilities,
            base_url,
        }
    }

    /// Actor URL for a local sender
    async fn sender_actor_url(&self, sender_id: &str) -> Result<String, AppError> {
        let profile = self
            .db
            .get_profile(sender_id)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(local_actor_url(&self.base_url, &profile.username))
    }

    /// Fresh activity URI under the sender's actor URL
    fn activity_uri(actor_url: &str, kind: &str) -> String {
        format!("{}/activities/{}/{}", actor_url, kind, EntityId::new().0)
    }

    /// Accept an activity for delivery to a set of inboxes.
    ///
    /// The activity is serialized exactly once; the resulting bytes are
    /// what every attempt signs and transmits (sign-then-freeze — the
    /// payload is never re-serialized after acceptance). A PENDING log
    /// record is written per inbox before any network I/O, so a crash
    /// mid-delivery still leaves an auditable, retryable record.
    ///
    /// Duplicate suppression of the *logical* activity (e.g. a double
    /// Like from a client retry) is the caller's responsibility; this
    /// service guarantees one eventually-terminal log status per accepted
    /// submission.
    pub async fn deliver_activity(
        &self,
        sender_id: &str,
        target_inboxes: &[String],
        activity: &serde_json::Value,
        activity_type: ActivityType,
    ) -> Result<Vec<DeliverySubmission>, AppError> {
        use crate::metrics::DELIVERIES_SUBMITTED_TOTAL;

        let payload = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let targets = unique_inbox_targets(target_inboxes);
        let mut submissions = Vec::with_capacity(targets.len());

        for inbox_url in targets {
            let record =
                DeliveryLogRecord::new(sender_id, &inbox_url, activity_type, payload.clone());
            self.db.insert_delivery_log(&record).await?;

            let job = DeliveryJob {
                log_id: record.id.clone(),
                sender_id: sender_id.to_string(),
                inbox_url: inbox_url.clone(),
                activity_type: activity_type.as_str().to_string(),
            };

            match self.queue.submit(job).await {
                Ok(queue_job_id) => {
                    self.db
                        .set_delivery_queue_job_id(&record.id, &queue_job_id)
                        .await?;
                    DELIVERIES_SUBMITTED_TOTAL
                        .with_label_values(&[activity_type.as_str()])
                        .inc();
                    submissions.push(DeliverySubmission {
                        log_id: record.id,
                        inbox_url,
                        queue_job_id: Some(queue_job_id),
                        accepted: true,
                    });
                }
                Err(error) => {
                    // The record exists and is visible to operators; mark
                    // it failed so it can be retried from the admin surface.
                    tracing::warn!(
                        log_id = %record.id,
                        inbox_url = %inbox_url,
                        %error,
                        "Queue submission failed"
                    );
                    self.db
                        .mark_failed(
                            &record.id,
                            &format!("Queue submission failed: {}", error),
                            chrono::Utc::now(),
                        )
                        .await?;
                    submissions.push(DeliverySubmission {
                        log_id: record.id,
                        inbox_url,
                        queue_job_id: None,
                        accepted: false,
                    });
                }
            }
        }

        Ok(submissions)
    }

    /// Send a Follow to a remote actor.
    ///
    /// # Returns
    /// The Follow activity URI, for the later Undo.
    pub async fn send_follow(
        &self,
        sender_id: &str,
        target_actor_url: &str,
    ) -> Result<String, AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let target = self.resolver.resolve(target_actor_url).await?;

        let follow_uri = Self::activity_uri(&actor_url, "follow");
        let activity = builder::follow(&follow_uri, &actor_url, target_actor_url);

        self.deliver_activity(
            sender_id,
            std::slice::from_ref(&target.inbox_url),
            &activity,
            ActivityType::Follow,
        )
        .await?;

        tracing::info!(
            follow_uri = %follow_uri,
            target = %target_actor_url,
            "Queued Follow"
        );

        Ok(follow_uri)
    }

    /// Undo a previously sent Follow.
    pub async fn send_undo_follow(
        &self,
        sender_id: &str,
        follow_activity_uri: &str,
        target_actor_url: &str,
    ) -> Result<(), AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let target = self.resolver.resolve(target_actor_url).await?;

        let undo_uri = Self::activity_uri(&actor_url, "undo");
        let object = serde_json::json!({
            "type": "Follow",
            "id": follow_activity_uri,
            "actor": actor_url,
            "object": target_actor_url,
        });
        let activity = builder::undo(&undo_uri, &actor_url, object);

        self.deliver_activity(
            sender_id,
            std::slice::from_ref(&target.inbox_url),
            &activity,
            ActivityType::UndoFollow,
        )
        .await?;

        Ok(())
    }

    /// Send a Like for a remote artwork or comment.
    ///
    /// # Returns
    /// The Like activity URI, for the later Undo.
    pub async fn send_like(
        &self,
        sender_id: &str,
        object_uri: &str,
        target_actor_url: &str,
    ) -> Result<String, AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let target = self.resolver.resolve(target_actor_url).await?;

        let like_uri = Self::activity_uri(&actor_url, "like");
        let activity = builder::like(&like_uri, &actor_url, object_uri);

        self.deliver_activity(
            sender_id,
            std::slice::from_ref(&target.inbox_url),
            &activity,
            ActivityType::Like,
        )
        .await?;

        Ok(like_uri)
    }

    /// Undo a previously sent Like.
    pub async fn send_undo_like(
        &self,
        sender_id: &str,
        like_activity_uri: &str,
        object_uri: &str,
        target_actor_url: &str,
    ) -> Result<(), AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let target = self.resolver.resolve(target_actor_url).await?;

        let undo_uri = Self::activity_uri(&actor_url, "undo");
        let object = serde_json::json!({
            "type": "Like",
            "id": like_activity_uri,
            "actor": actor_url,
            "object": object_uri,
        });
        let activity = builder::undo(&undo_uri, &actor_url, object);

        self.deliver_activity(
            sender_id,
            std::slice::from_ref(&target.inbox_url),
            &activity,
            ActivityType::UndoLike,
        )
        .await?;

        Ok(())
    }

    /// Send an EmojiReact for a remote object.
    ///
    /// # Returns
    /// The EmojiReact activity URI, for the later Undo.
    pub async fn send_emoji_react(
        &self,
        sender_id: &str,
        object_uri: &str,
        emoji: &str,
        target_actor_url: &str,
    ) -> Result<String, AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let target = self.resolver.resolve(target_actor_url).await?;

        let react_uri = Self::activity_uri(&actor_url, "react");
        let activity = builder::emoji_react(&react_uri, &actor_url, object_uri, emoji);

        self.deliver_activity(
            sender_id,
            std::slice::from_ref(&target.inbox_url),
            &activity,
            ActivityType::EmojiReact,
        )
        .await?;

        Ok(react_uri)
    }

    /// Undo a previously sent EmojiReact.
    pub async fn send_undo_emoji_react(
        &self,
        sender_id: &str,
        react_activity_uri: &str,
        object_uri: &str,
        emoji: &str,
        target_actor_url: &str,
    ) -> Result<(), AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let target = self.resolver.resolve(target_actor_url).await?;

        let undo_uri = Self::activity_uri(&actor_url, "undo");
        let object = serde_json::json!({
            "type": "EmojiReact",
            "id": react_activity_uri,
            "actor": actor_url,
            "object": object_uri,
            "content": emoji,
        });
        let activity = builder::undo(&undo_uri, &actor_url, object);

        self.deliver_activity(
            sender_id,
            std::slice::from_ref(&target.inbox_url),
            &activity,
            ActivityType::UndoEmojiReact,
        )
        .await?;

        Ok(())
    }

    /// Send a comment on an artwork as Create(Note) to the given inboxes.
    pub async fn send_comment(
        &self,
        sender_id: &str,
        comment_uri: &str,
        content: &str,
        in_reply_to_uri: &str,
        target_inboxes: &[String],
    ) -> Result<Vec<DeliverySubmission>, AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;

        let note = builder::comment_note(comment_uri, &actor_url, content, in_reply_to_uri);
        let create_uri = Self::activity_uri(&actor_url, "create");
        let activity = builder::create(&create_uri, &actor_url, note);

        self.deliver_activity(
            sender_id,
            target_inboxes,
            &activity,
            ActivityType::CreateComment,
        )
        .await
    }

    /// Deliver a direct message to a set of recipients.
    ///
    /// Consults capability discovery per recipient domain to pick the
    /// transport: recipients on domains that advertise encrypted-DM
    /// support (and only when `encrypted_content` is provided) receive
    /// the encrypted rendition, everyone else the plain one. Encryption
    /// itself is the secrets collaborator's job; this service only routes
    /// the prepared renditions.
    ///
    /// One unreachable recipient never fails the batch; the caller gets a
    /// per-recipient result list.
    pub async fn deliver_direct_message(
        &self,
        sender_id: &str,
        message_uri: &str,
        recipients: &[String],
        plain_content: &str,
        encrypted_content: Option<&str>,
    ) -> Result<Vec<DirectMessageResult>, AppError> {
        let actor_url = self.sender_actor_url(sender_id).await?;
        let mut results = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            let target = match self.resolver.resolve(recipient).await {
                Ok(target) => target,
                Err(error) => {
                    // Discovery failure: warn and report, never block the
                    // other recipients.
                    tracing::warn!(recipient = %recipient, %error, "Cannot resolve DM recipient");
                    results.push(DirectMessageResult {
                        recipient: recipient.clone(),
                        delivered: false,
                        encrypted: false,
                    });
                    continue;
                }
            };

            let encrypted = match (encrypted_content, domain_of(recipient)) {
                (Some(_), Some(domain)) => {
                    self.capabilities
                        .check_capability(&domain, CAP_ENCRYPTED_DM)
                        .await
                }
                _ => false,
            };
            let content = if encrypted {
                encrypted_content.unwrap_or(plain_content)
            } else {
                plain_content
            };

            let create_uri = Self::activity_uri(&actor_url, "create");
            let activity = builder::direct_message(
                &create_uri,
                message_uri,
                &actor_url,
                recipient,
                content,
                encrypted,
            );

            let submissions = self
                .deliver_activity(
                    sender_id,
                    std::slice::from_ref(&target.inbox_url),
                    &activity,
                    ActivityType::DirectMessage,
                )
                .await?;

            results.push(DirectMessageResult {
                recipient: recipient.clone(),
                delivered: submissions.iter().all(|s| s.accepted) && !submissions.is_empty(),
                encrypted,
            });
        }

        Ok(results)
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an EmojiReact activity
    ///
    /// # Arguments
    /// * `emoji` - Reaction content (e.g. "🎨" or a shortcode)
    pub fn emoji_react(id: &str, actor: &str, object: &str, emoji: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "EmojiReact",
            "id": id,
            "actor": actor,
            "object": object,
            "content": emoji
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity wrapping an object
    pub fn create(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Note object for a comment on an artwork
    pub fn comment_note(id: &str, attributed_to: &str, content: &str, in_reply_to: &str) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "inReplyTo": in_reply_to,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a direct-message Create(Note) addressed to a single recipient
    ///
    /// `encrypted` marks the transport; when set, `content` carries the
    /// ciphertext rendition prepared by the secrets collaborator.
    pub fn direct_message(
        id: &str,
        note_id: &str,
        actor: &str,
        recipient: &str,
        content: &str,
        encrypted: bool,
    ) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "to": [recipient],
            "object": {
                "type": "Note",
                "id": note_id,
                "attributedTo": actor,
                "to": [recipient],
                "content": content,
                "encryptedTransport": encrypted,
                "published": chrono::Utc::now().to_rfc3339()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_inbox_targets_keeps_distinct_personal_inboxes_on_same_domain() {
        let targets = unique_inbox_targets(&[
            "https://pics.example/users/rin/inbox".to_string(),
            "https://pics.example/users/hana/inbox".to_string(),
            "https://other.example/inbox".to_string(),
        ]);

        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn unique_inbox_targets_deduplicates_identical_shared_inbox_urls() {
        let targets = unique_inbox_targets(&[
            "https://pics.example/inbox".to_string(),
            "https://pics.example/inbox".to_string(),
            "https://other.example/inbox".to_string(),
        ]);

        assert_eq!(
            targets,
            vec![
                "https://pics.example/inbox".to_string(),
                "https://other.example/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn domain_of_extracts_host() {
        assert_eq!(
            domain_of("https://pics.example/users/rin").as_deref(),
            Some("pics.example")
        );
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn follow_builder_sets_type_actor_and_object() {
        let activity = builder::follow(
            "https://local.example/users/rin/activities/follow/1",
            "https://local.example/users/rin",
            "https://remote.example/users/hana",
        );

        assert_eq!(activity["type"], "Follow");
        assert_eq!(activity["actor"], "https://local.example/users/rin");
        assert_eq!(activity["object"], "https://remote.example/users/hana");
    }

    #[test]
    fn undo_builder_wraps_original_activity() {
        let object = serde_json::json!({
            "type": "Like",
            "id": "https://local.example/users/rin/activities/like/1",
        });
        let activity = builder::undo(
            "https://local.example/users/rin/activities/undo/1",
            "https://local.example/users/rin",
            object,
        );

        assert_eq!(activity["type"], "Undo");
        assert_eq!(activity["object"]["type"], "Like");
    }

    #[test]
    fn emoji_react_builder_carries_content() {
        let activity = builder::emoji_react(
            "https://local.example/users/rin/activities/react/1",
            "https://local.example/users/rin",
            "https://remote.example/art/77",
            "🎨",
        );

        assert_eq!(activity["type"], "EmojiReact");
        assert_eq!(activity["content"], "🎨");
    }

    #[test]
    fn direct_message_builder_addresses_single_recipient() {
        let activity = builder::direct_message(
            "https://local.example/users/rin/activities/create/1",
            "https://local.example/users/rin/messages/1",
            "https://local.example/users/rin",
            "https://remote.example/users/hana",
            "hello",
            false,
        );

        assert_eq!(activity["type"], "Create");
        assert_eq!(
            activity["to"],
            serde_json::json!(["https://remote.example/users/hana"])
        );
        assert_eq!(activity["object"]["encryptedTransport"], false);
    }

    #[test]
    fn comment_note_builder_sets_reply_target() {
        let note = builder::comment_note(
            "https://local.example/users/rin/comments/1",
            "https://local.example/users/rin",
            "<p>lovely colors</p>",
            "https://remote.example/art/77",
        );

        assert_eq!(note["type"], "Note");
        assert_eq!(note["inReplyTo"], "https://remote.example/art/77");
    }
}
