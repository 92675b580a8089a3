//! Card/metadata repository.
//!
//! Every lifecycle write is a conditional update against the stored row, so a
//! direct publish and a scheduled retry cannot overwrite each other.

use crate::error::{PublishError, Result};
use crate::model::{
    Card, CardSnapshot, CardStatus, GiftCard, RenderableUnit, UnitContent,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Lifecycle write applied after a successful generation
#[derive(Debug, Clone)]
pub struct GenerationCommit {
    /// The stored status must be one of these for the write to apply
    pub expected: Vec<CardStatus>,
    pub new_status: CardStatus,
    pub artifact_url: String,
    /// Set the published timestamp to this value; `None` leaves it untouched
    pub published_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Retry bookkeeping write applied after a failed automatic publish
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// The stored attempt count must still equal this value
    pub expected_attempts: u32,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub now: DateTime<Utc>,
}

/// A card claimed for a retry attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRetry {
    pub card_id: Uuid,
    pub attempts: u32,
    /// The next-retry-due value the card had before it was claimed
    pub due_at: DateTime<Utc>,
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    async fn create_card(&self, card: Card) -> Result<Card>;

    async fn get_card(&self, card_id: Uuid) -> Result<Option<Card>>;

    async fn get_card_by_slug(&self, slug: &str) -> Result<Option<Card>>;

    /// Card plus its units in position order and its gift card
    async fn load_snapshot(&self, card_id: Uuid) -> Result<Option<CardSnapshot>>;

    async fn list_units(&self, card_id: Uuid) -> Result<Vec<RenderableUnit>>;

    /// Append a unit at the next position, refusing once `max_units` is reached
    async fn append_unit(
        &self,
        card_id: Uuid,
        unit_id: Uuid,
        content: UnitContent,
        max_units: usize,
        now: DateTime<Utc>,
    ) -> Result<RenderableUnit>;

    /// Delete a unit and renumber the survivors to 0..N-1
    async fn delete_unit(&self, card_id: Uuid, unit_id: Uuid) -> Result<Vec<RenderableUnit>>;

    /// Apply a permutation: `ordered_ids` must list every unit of the card exactly once
    async fn reorder_units(&self, card_id: Uuid, ordered_ids: &[Uuid]) -> Result<Vec<RenderableUnit>>;

    async fn attach_gift_card(&self, card_id: Uuid, gift_card: GiftCard) -> Result<()>;

    /// DRAFT/PREVIEW -> PAID
    async fn mark_paid(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Card>;

    /// Bump the view counter; first-viewed is set only once
    async fn record_view(&self, slug: &str, now: DateTime<Utc>) -> Result<Option<Card>>;

    async fn complete_generation(&self, card_id: Uuid, commit: GenerationCommit) -> Result<Card>;

    /// Returns `false` when the card changed underneath the caller and nothing was written
    async fn record_retry_failure(&self, card_id: Uuid, failure: RetryFailure) -> Result<bool>;

    /// Claim up to `limit` PAID cards due at or before `now`, oldest-due first,
    /// pushing their next-retry-due forward by `lease`
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<ClaimedRetry>>;
}

/// Set positions to 0..N-1 following slice order
pub(crate) fn renumber(units: &mut [RenderableUnit]) {
    for (index, unit) in units.iter_mut().enumerate() {
        unit.position = index as u32;
    }
}

/// Whether `ordered_ids` is a permutation of `existing`
pub(crate) fn is_permutation(existing: &[Uuid], ordered_ids: &[Uuid]) -> bool {
    if existing.len() != ordered_ids.len() {
        return false;
    }
    let requested: HashSet<&Uuid> = ordered_ids.iter().collect();
    requested.len() == ordered_ids.len() && existing.iter().all(|id| requested.contains(id))
}

#[derive(Default)]
struct MemoryState {
    cards: HashMap<Uuid, Card>,
    units: HashMap<Uuid, Vec<RenderableUnit>>,
    gift_cards: HashMap<Uuid, GiftCard>,
}

impl MemoryState {
    fn card_mut(&mut self, card_id: Uuid) -> Result<&mut Card> {
        self.cards
            .get_mut(&card_id)
            .ok_or(PublishError::CardNotFound(card_id))
    }
}

/// Process-local repository used by single-node deployments and tests
#[derive(Default)]
pub struct InMemoryCardRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryCardRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CardRepository for InMemoryCardRepository {
    async fn create_card(&self, card: Card) -> Result<Card> {
        let mut state = self.state.lock();
        if state.cards.values().any(|c| c.slug == card.slug) {
            return Err(PublishError::InvalidInput(format!(
                "Slug {} already in use",
                card.slug
            )));
        }
        state.units.insert(card.id, Vec::new());
        state.cards.insert(card.id, card.clone());
        Ok(card)
    }

    async fn get_card(&self, card_id: Uuid) -> Result<Option<Card>> {
        Ok(self.state.lock().cards.get(&card_id).cloned())
    }

    async fn get_card_by_slug(&self, slug: &str) -> Result<Option<Card>> {
        Ok(self
            .state
            .lock()
            .cards
            .values()
            .find(|c| c.slug == slug)
            .cloned())
    }

    async fn load_snapshot(&self, card_id: Uuid) -> Result<Option<CardSnapshot>> {
        let state = self.state.lock();
        let Some(card) = state.cards.get(&card_id).cloned() else {
            return Ok(None);
        };
        let mut units = state.units.get(&card_id).cloned().unwrap_or_default();
        units.sort_by_key(|u| u.position);

        Ok(Some(CardSnapshot {
            card,
            units,
            gift_card: state.gift_cards.get(&card_id).cloned(),
        }))
    }

    async fn list_units(&self, card_id: Uuid) -> Result<Vec<RenderableUnit>> {
        let state = self.state.lock();
        if !state.cards.contains_key(&card_id) {
            return Err(PublishError::CardNotFound(card_id));
        }
        Ok(state.units.get(&card_id).cloned().unwrap_or_default())
    }

    async fn append_unit(
        &self,
        card_id: Uuid,
        unit_id: Uuid,
        content: UnitContent,
        max_units: usize,
        now: DateTime<Utc>,
    ) -> Result<RenderableUnit> {
        let mut state = self.state.lock();
        state.card_mut(card_id)?.updated_at = now;

        let units = state.units.entry(card_id).or_default();
        if units.len() >= max_units {
            return Err(PublishError::UnitLimitReached { max: max_units });
        }

        let unit = RenderableUnit {
            id: unit_id,
            card_id,
            position: units.len() as u32,
            content,
            created_at: now,
        };
        units.push(unit.clone());
        Ok(unit)
    }

    async fn delete_unit(&self, card_id: Uuid, unit_id: Uuid) -> Result<Vec<RenderableUnit>> {
        let mut state = self.state.lock();
        state.card_mut(card_id)?;

        let units = state.units.entry(card_id).or_default();
        let index = units
            .iter()
            .position(|u| u.id == unit_id)
            .ok_or(PublishError::UnitNotFound(unit_id))?;
        units.remove(index);
        renumber(units);
        Ok(units.clone())
    }

    async fn reorder_units(&self, card_id: Uuid, ordered_ids: &[Uuid]) -> Result<Vec<RenderableUnit>> {
        let mut state = self.state.lock();
        state.card_mut(card_id)?;

        let units = state.units.entry(card_id).or_default();
        let existing: Vec<Uuid> = units.iter().map(|u| u.id).collect();
        if !is_permutation(&existing, ordered_ids) {
            return Err(PublishError::InvalidReorder);
        }

        let mut by_id: HashMap<Uuid, RenderableUnit> = units.drain(..).map(|u| (u.id, u)).collect();
        let mut reordered: Vec<RenderableUnit> = ordered_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        renumber(&mut reordered);
        *units = reordered;
        Ok(units.clone())
    }

    async fn attach_gift_card(&self, card_id: Uuid, gift_card: GiftCard) -> Result<()> {
        let mut state = self.state.lock();
        state.card_mut(card_id)?;
        state.gift_cards.insert(card_id, gift_card);
        Ok(())
    }

    async fn mark_paid(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Card> {
        let mut state = self.state.lock();
        let card = state.card_mut(card_id)?;
        if !matches!(card.status, CardStatus::Draft | CardStatus::Preview) {
            return Err(PublishError::InvalidStatus {
                actual: card.status,
                expected: vec![CardStatus::Draft, CardStatus::Preview],
            });
        }
        card.status = CardStatus::Paid;
        card.updated_at = now;
        Ok(card.clone())
    }

    async fn record_view(&self, slug: &str, now: DateTime<Utc>) -> Result<Option<Card>> {
        let mut state = self.state.lock();
        let Some(card) = state.cards.values_mut().find(|c| c.slug == slug) else {
            return Ok(None);
        };
        card.view_count += 1;
        if card.first_viewed_at.is_none() {
            card.first_viewed_at = Some(now);
        }
        Ok(Some(card.clone()))
    }

    async fn complete_generation(&self, card_id: Uuid, commit: GenerationCommit) -> Result<Card> {
        let mut state = self.state.lock();
        let card = state.card_mut(card_id)?;
        if !commit.expected.contains(&card.status) {
            return Err(PublishError::InvalidStatus {
                actual: card.status,
                expected: commit.expected,
            });
        }

        card.status = commit.new_status;
        card.artifact_url = Some(commit.artifact_url);
        if let Some(published_at) = commit.published_at {
            card.published_at = Some(published_at);
        }
        // A card still waiting in PAID keeps its retry schedule
        if commit.new_status != CardStatus::Paid {
            card.retry.next_retry_at = None;
            card.retry.last_error = None;
        }
        card.updated_at = commit.now;
        Ok(card.clone())
    }

    async fn record_retry_failure(&self, card_id: Uuid, failure: RetryFailure) -> Result<bool> {
        let mut state = self.state.lock();
        let card = state.card_mut(card_id)?;
        if card.status != CardStatus::Paid || card.retry.attempts != failure.expected_attempts {
            return Ok(false);
        }

        card.retry.attempts = failure.attempts;
        card.retry.next_retry_at = failure.next_retry_at;
        card.retry.last_error = Some(failure.last_error);
        card.updated_at = failure.now;
        Ok(true)
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<ClaimedRetry>> {
        let mut state = self.state.lock();

        let mut due: Vec<ClaimedRetry> = state
            .cards
            .values()
            .filter(|c| c.status == CardStatus::Paid)
            .filter_map(|c| {
                c.retry
                    .next_retry_at
                    .filter(|at| *at <= now)
                    .map(|due_at| ClaimedRetry {
                        card_id: c.id,
                        attempts: c.retry.attempts,
                        due_at,
                    })
            })
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.card_id.cmp(&b.card_id)));
        due.truncate(limit as usize);

        for claim in &due {
            if let Some(card) = state.cards.get_mut(&claim.card_id) {
                card.retry.next_retry_at = Some(now + lease);
            }
        }

        Ok(due)
    }
}
