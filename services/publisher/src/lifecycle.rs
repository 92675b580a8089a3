//! Card lifecycle controller.
//!
//! The controller is the only component that writes a card's status and retry
//! fields. Regenerations of the same card are serialized in-process by a
//! per-card mutex; across processes the repository's conditional writes catch
//! the race instead.

use crate::error::{PublishError, Result};
use crate::generator::ArtifactGenerator;
use crate::model::{truncate_error, CardStatus, GeneratedArtifact};
use crate::repository::{CardRepository, GenerationCommit, RetryFailure};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const PREVIEW_SOURCES: &[CardStatus] = &[CardStatus::Draft, CardStatus::Preview];
const PAID_SOURCES: &[CardStatus] = &[CardStatus::Paid];
const PUBLISH_SOURCES: &[CardStatus] = &[CardStatus::Paid, CardStatus::Published];

/// Statuses a card must be in for a regeneration targeting `desired`
fn allowed_sources(desired: CardStatus) -> Option<&'static [CardStatus]> {
    match desired {
        CardStatus::Preview => Some(PREVIEW_SOURCES),
        CardStatus::Paid => Some(PAID_SOURCES),
        CardStatus::Published => Some(PUBLISH_SOURCES),
        CardStatus::Draft | CardStatus::Archived => None,
    }
}

/// How a regeneration treats the card's publish time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishStamp {
    Keep,
    /// Stamp only on PAID -> PUBLISHED; an already published card is refused
    OnTransition,
    Always,
}

/// Result of writing retry bookkeeping after a failed publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureRecord {
    Scheduled {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// The attempt cap was reached; automatic retries have stopped
    Exhausted { attempts: u32 },
    /// The card changed since it was read; nothing was written
    Superseded,
}

/// What happened when a payment was confirmed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Published { artifact: GeneratedArtifact },
    RetryScheduled {
        next_retry_at: Option<DateTime<Utc>>,
        error: String,
    },
}

#[derive(Default)]
struct CardLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl CardLocks {
    async fn acquire(&self, card_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock();
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(card_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Owns card status transitions and retry bookkeeping
pub struct LifecycleController {
    repository: Arc<dyn CardRepository>,
    generator: Arc<ArtifactGenerator>,
    retry_policy: RetryPolicy,
    locks: CardLocks,
}

impl LifecycleController {
    pub fn new(
        repository: Arc<dyn CardRepository>,
        generator: Arc<ArtifactGenerator>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            generator,
            retry_policy,
            locks: CardLocks::default(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Render the card, store the artifact and move the card to `desired`
    pub async fn regenerate(
        &self,
        card_id: Uuid,
        desired: CardStatus,
        mark_published: bool,
    ) -> Result<GeneratedArtifact> {
        self.regenerate_at(card_id, desired, mark_published, Utc::now())
            .await
    }

    #[instrument(skip(self))]
    pub async fn regenerate_at(
        &self,
        card_id: Uuid,
        desired: CardStatus,
        mark_published: bool,
        now: DateTime<Utc>,
    ) -> Result<GeneratedArtifact> {
        let stamp = if mark_published {
            PublishStamp::Always
        } else {
            PublishStamp::Keep
        };
        self.render(card_id, desired, stamp, now).await
    }

    /// Move a PAID card to PUBLISHED and stamp the publish time.
    ///
    /// The status is checked under the card lock, so a card published by a
    /// concurrent caller fails with `InvalidStatus` and keeps its timestamp.
    #[instrument(skip(self))]
    pub async fn publish_paid_at(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<GeneratedArtifact> {
        self.render(card_id, CardStatus::Published, PublishStamp::OnTransition, now)
            .await
    }

    async fn render(
        &self,
        card_id: Uuid,
        desired: CardStatus,
        stamp: PublishStamp,
        now: DateTime<Utc>,
    ) -> Result<GeneratedArtifact> {
        let _guard = self.locks.acquire(card_id).await;

        let snapshot = self
            .repository
            .load_snapshot(card_id)
            .await?
            .ok_or(PublishError::CardNotFound(card_id))?;

        if snapshot.units.is_empty() {
            return Err(PublishError::NotRenderable);
        }

        let expected = match (desired, stamp) {
            (CardStatus::Published, PublishStamp::OnTransition) => PAID_SOURCES,
            _ => allowed_sources(desired).ok_or_else(|| PublishError::InvalidStatus {
                actual: snapshot.card.status,
                expected: Vec::new(),
            })?,
        };
        if !expected.contains(&snapshot.card.status) {
            return Err(PublishError::InvalidStatus {
                actual: snapshot.card.status,
                expected: expected.to_vec(),
            });
        }

        let artifact = match self.generator.generate(&snapshot, now).await {
            Ok(artifact) => artifact,
            Err(e) => {
                metrics::counter!("publisher.generations.failed").increment(1);
                return Err(e);
            }
        };

        let card = self
            .repository
            .complete_generation(
                card_id,
                GenerationCommit {
                    expected: expected.to_vec(),
                    new_status: desired,
                    artifact_url: artifact.url.clone(),
                    published_at: (stamp != PublishStamp::Keep).then_some(now),
                    now,
                },
            )
            .await?;

        if desired == CardStatus::Published {
            metrics::counter!("publisher.cards.published").increment(1);
        }
        info!(
            status = %card.status,
            artifact_url = %artifact.url,
            published_at = ?card.published_at,
            "Card regenerated"
        );

        Ok(artifact)
    }

    /// Manual preview: DRAFT/PREVIEW become PREVIEW; PAID/PUBLISHED re-render in place
    #[instrument(skip(self))]
    pub async fn generate_preview(&self, card_id: Uuid) -> Result<GeneratedArtifact> {
        let card = self
            .repository
            .get_card(card_id)
            .await?
            .ok_or(PublishError::CardNotFound(card_id))?;

        let desired = match card.status {
            CardStatus::Draft | CardStatus::Preview => CardStatus::Preview,
            CardStatus::Paid => CardStatus::Paid,
            CardStatus::Published => CardStatus::Published,
            CardStatus::Archived => {
                return Err(PublishError::InvalidStatus {
                    actual: card.status,
                    expected: vec![
                        CardStatus::Draft,
                        CardStatus::Preview,
                        CardStatus::Paid,
                        CardStatus::Published,
                    ],
                })
            }
        };

        self.regenerate(card_id, desired, false).await
    }

    /// Manual publish: PAID -> PUBLISHED stamps the publish time; PUBLISHED re-renders only
    #[instrument(skip(self))]
    pub async fn publish(&self, card_id: Uuid) -> Result<GeneratedArtifact> {
        let card = self
            .repository
            .get_card(card_id)
            .await?
            .ok_or(PublishError::CardNotFound(card_id))?;

        if !PUBLISH_SOURCES.contains(&card.status) {
            return Err(PublishError::InvalidStatus {
                actual: card.status,
                expected: PUBLISH_SOURCES.to_vec(),
            });
        }

        match self.publish_paid_at(card_id, Utc::now()).await {
            // Already published: re-render and keep the first timestamp
            Err(PublishError::InvalidStatus {
                actual: CardStatus::Published,
                ..
            }) => self.regenerate(card_id, CardStatus::Published, false).await,
            result => result,
        }
    }

    /// Called once the payment collaborator confirms the charge
    #[instrument(skip(self))]
    pub async fn confirm_payment(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<PaymentOutcome> {
        let units = self.repository.list_units(card_id).await?;
        if units.is_empty() {
            return Err(PublishError::NotRenderable);
        }

        let card = self.repository.mark_paid(card_id, now).await?;

        match self.publish_paid_at(card_id, now).await {
            Ok(artifact) => Ok(PaymentOutcome::Published { artifact }),
            Err(e) => {
                warn!(error = %e, "Publish after payment failed, scheduling retry");
                let record = self
                    .record_failure(card_id, card.retry.attempts, &e, now)
                    .await?;
                let next_retry_at = match record {
                    FailureRecord::Scheduled { next_retry_at, .. } => Some(next_retry_at),
                    FailureRecord::Exhausted { .. } | FailureRecord::Superseded => None,
                };
                Ok(PaymentOutcome::RetryScheduled {
                    next_retry_at,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Write retry bookkeeping for a failed automatic publish.
    ///
    /// `previous_attempts` is the attempt count the caller observed; the write
    /// only applies if the stored count still matches and the card is still PAID.
    #[instrument(skip(self, error))]
    pub async fn record_failure(
        &self,
        card_id: Uuid,
        previous_attempts: u32,
        error: &PublishError,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord> {
        let _guard = self.locks.acquire(card_id).await;

        let attempts = previous_attempts.saturating_add(1);
        let next_retry_at = self.retry_policy.next_retry_at(attempts, now);

        let written = self
            .repository
            .record_retry_failure(
                card_id,
                RetryFailure {
                    expected_attempts: previous_attempts,
                    attempts,
                    next_retry_at,
                    last_error: truncate_error(&error.to_string()),
                    now,
                },
            )
            .await?;

        if !written {
            return Ok(FailureRecord::Superseded);
        }

        Ok(match next_retry_at {
            Some(next_retry_at) => FailureRecord::Scheduled {
                attempts,
                next_retry_at,
            },
            None => {
                let stopped = PublishError::RetryCapExceeded { attempts };
                warn!(
                    card_id = %card_id,
                    attempts = attempts,
                    last_error = %error,
                    "{stopped}; card needs manual follow-up"
                );
                metrics::counter!("publisher.retry.exhausted").increment(1);
                FailureRecord::Exhausted { attempts }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::model::{Card, NewCard, Tier, UnitContent};
    use crate::object_store::MockObjectStore;
    use crate::repository::InMemoryCardRepository;
    use crate::test_support::FlakyStore;
    use chrono::Duration;

    fn new_card() -> Card {
        Card::new_draft(
            NewCard {
                sender_name: "Sam".to_string(),
                recipient_name: "Alex".to_string(),
                title: "Congrats".to_string(),
                occasion: "graduation".to_string(),
                tier: Tier::Quick,
                theme: Default::default(),
                message: "Proud of you".to_string(),
                section_messages: vec![],
                music_style: Default::default(),
                custom_audio_url: None,
                features: Default::default(),
            },
            Utc::now(),
        )
    }

    struct Fixture {
        repo: Arc<InMemoryCardRepository>,
        store: Arc<FlakyStore>,
        controller: LifecycleController,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryCardRepository::new());
        let store = Arc::new(FlakyStore::default());
        let generator = Arc::new(ArtifactGenerator::new(store.clone(), 500));
        let controller = LifecycleController::new(
            repo.clone(),
            generator,
            RetryPolicy::from_config(&RetryConfig::default()),
        );
        Fixture {
            repo,
            store,
            controller,
        }
    }

    async fn card_with_text(repo: &InMemoryCardRepository) -> Uuid {
        let card = repo.create_card(new_card()).await.unwrap();
        repo.append_unit(
            card.id,
            Uuid::new_v4(),
            UnitContent::TextPanel {
                text: "hello".to_string(),
            },
            6,
            Utc::now(),
        )
        .await
        .unwrap();
        card.id
    }

    #[tokio::test]
    async fn test_empty_card_is_not_renderable_and_writes_nothing() {
        let repo = Arc::new(InMemoryCardRepository::new());
        let mut store = MockObjectStore::new();
        store.expect_put().times(0);
        let generator = Arc::new(ArtifactGenerator::new(Arc::new(store), 500));
        let controller = LifecycleController::new(
            repo.clone(),
            generator,
            RetryPolicy::from_config(&RetryConfig::default()),
        );

        let card = repo.create_card(new_card()).await.unwrap();
        assert!(matches!(
            controller.generate_preview(card.id).await,
            Err(PublishError::NotRenderable)
        ));

        repo.mark_paid(card.id, Utc::now()).await.unwrap();
        assert!(matches!(
            controller.publish(card.id).await,
            Err(PublishError::NotRenderable)
        ));

        let stored = repo.get_card(card.id).await.unwrap().unwrap();
        assert!(stored.artifact_url.is_none());
        assert_eq!(stored.status, CardStatus::Paid);
    }

    #[tokio::test]
    async fn test_preview_moves_draft_to_preview() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;

        let artifact = f.controller.generate_preview(card_id).await.unwrap();
        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Preview);
        assert_eq!(stored.artifact_url.as_deref(), Some(artifact.url.as_str()));
        assert!(stored.published_at.is_none());

        // Stored bytes are the rendered document
        let bytes = f.store.get_stored(&artifact.key).unwrap();
        assert_eq!(bytes, artifact.document);
    }

    #[tokio::test]
    async fn test_publish_requires_paid() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;

        let err = f.controller.publish(card_id).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::InvalidStatus {
                actual: CardStatus::Draft,
                ..
            }
        ));
        assert_eq!(f.store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_sets_timestamp_only_when_marked() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        f.repo.mark_paid(card_id, Utc::now()).await.unwrap();

        let first = Utc::now() - Duration::minutes(10);
        f.controller
            .regenerate_at(card_id, CardStatus::Published, true, first)
            .await
            .unwrap();
        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Published);
        assert_eq!(stored.published_at, Some(first));

        // Republishing without the flag keeps the original timestamp
        f.controller.publish(card_id).await.unwrap();
        f.controller.publish(card_id).await.unwrap();
        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.published_at, Some(first));

        // An explicit request moves it
        let later = Utc::now();
        f.controller
            .regenerate_at(card_id, CardStatus::Published, true, later)
            .await
            .unwrap();
        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.published_at, Some(later));
    }

    #[tokio::test]
    async fn test_preview_of_paid_card_keeps_status() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        f.repo.mark_paid(card_id, Utc::now()).await.unwrap();

        f.controller.generate_preview(card_id).await.unwrap();
        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Paid);
        assert!(stored.artifact_url.is_some());
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_card_untouched() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        f.repo.mark_paid(card_id, Utc::now()).await.unwrap();
        f.store.set_failing(true);

        let err = f.controller.publish(card_id).await.unwrap_err();
        assert!(matches!(err, PublishError::StorageWriteFailed(_)));

        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Paid);
        assert!(stored.artifact_url.is_none());
        assert_eq!(stored.retry.attempts, 0);
    }

    #[tokio::test]
    async fn test_confirm_payment_publishes_immediately() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        let now = Utc::now();

        let outcome = f.controller.confirm_payment(card_id, now).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Published { .. }));

        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Published);
        assert_eq!(stored.published_at, Some(now));
    }

    #[tokio::test]
    async fn test_confirm_payment_schedules_first_retry_on_failure() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        let now = Utc::now();
        f.store.set_failing(true);

        let outcome = f.controller.confirm_payment(card_id, now).await.unwrap();
        match outcome {
            PaymentOutcome::RetryScheduled { next_retry_at, .. } => {
                assert_eq!(next_retry_at, Some(now + Duration::minutes(5)));
            }
            other => panic!("Expected RetryScheduled, got {:?}", other),
        }

        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Paid);
        assert_eq!(stored.retry.attempts, 1);
        assert!(stored.retry.last_error.unwrap().contains("Storage write failed"));
    }

    #[tokio::test]
    async fn test_record_failure_stops_at_cap() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        f.repo.mark_paid(card_id, Utc::now()).await.unwrap();
        let now = Utc::now();
        let err = PublishError::StorageWriteFailed("down".to_string());

        for previous in 0..7 {
            let record = f
                .controller
                .record_failure(card_id, previous, &err, now)
                .await
                .unwrap();
            assert!(matches!(record, FailureRecord::Scheduled { .. }));
        }

        let record = f.controller.record_failure(card_id, 7, &err, now).await.unwrap();
        assert_eq!(record, FailureRecord::Exhausted { attempts: 8 });

        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.retry.attempts, 8);
        assert!(stored.retry.next_retry_at.is_none());
        assert_eq!(stored.status, CardStatus::Paid);

        // Stale callers do not overwrite
        let record = f.controller.record_failure(card_id, 3, &err, now).await.unwrap();
        assert_eq!(record, FailureRecord::Superseded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_publishes_of_same_card_serialize() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        f.repo.mark_paid(card_id, Utc::now()).await.unwrap();
        let controller = Arc::new(f.controller);

        let a = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.publish(card_id).await })
        };
        let b = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.publish(card_id).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        // Whichever ran second saw PUBLISHED and re-rendered without error
        let generated: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().generated_at)
            .collect();
        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CardStatus::Published);
        assert_eq!(f.store.put_count(), 2);

        // Only the PAID -> PUBLISHED render stamps the publish time
        assert_eq!(stored.published_at, generated.iter().min().copied());
    }

    #[tokio::test]
    async fn test_publish_paid_refuses_published_card() {
        let f = fixture();
        let card_id = card_with_text(&f.repo).await;
        f.repo.mark_paid(card_id, Utc::now()).await.unwrap();

        let first = Utc::now() - Duration::minutes(5);
        f.controller.publish_paid_at(card_id, first).await.unwrap();

        let err = f
            .controller
            .publish_paid_at(card_id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::InvalidStatus {
                actual: CardStatus::Published,
                ..
            }
        ));

        let stored = f.repo.get_card(card_id).await.unwrap().unwrap();
        assert_eq!(stored.published_at, Some(first));
        assert_eq!(f.store.put_count(), 1);
    }
}
