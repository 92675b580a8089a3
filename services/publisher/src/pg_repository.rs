use crate::config::DatabaseConfig;
use crate::error::{PublishError, Result};
use crate::model::{
    Card, CardSnapshot, CardStatus, GiftCard, PhotoUnit, RenderableUnit, RetryState, UnitContent,
};
use crate::repository::{is_permutation, CardRepository, ClaimedRetry, GenerationCommit, RetryFailure};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const CARD_COLUMNS: &str = r#"
    id, slug, sender_name, recipient_name, title, occasion, tier, theme,
    message, section_messages, music_style, custom_audio_url, features,
    status, artifact_url, published_at, first_viewed_at, view_count,
    retry_attempts, next_retry_at, last_error, created_at, updated_at
"#;

const UNIT_COLUMNS: &str = r#"
    id, card_id, position, kind, original_url, processed_url,
    preview_data_uri, width, height, caption, text_content, created_at
"#;

#[derive(Debug, FromRow)]
struct CardRow {
    id: Uuid,
    slug: String,
    sender_name: String,
    recipient_name: String,
    title: String,
    occasion: String,
    tier: String,
    theme: String,
    message: String,
    section_messages: serde_json::Value,
    music_style: String,
    custom_audio_url: Option<String>,
    features: serde_json::Value,
    status: String,
    artifact_url: Option<String>,
    published_at: Option<DateTime<Utc>>,
    first_viewed_at: Option<DateTime<Utc>>,
    view_count: i64,
    retry_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CardRow> for Card {
    type Error = anyhow::Error;

    fn try_from(row: CardRow) -> anyhow::Result<Self> {
        Ok(Card {
            id: row.id,
            slug: row.slug,
            sender_name: row.sender_name,
            recipient_name: row.recipient_name,
            title: row.title,
            occasion: row.occasion,
            tier: row.tier.parse()?,
            theme: row.theme.parse()?,
            message: row.message,
            section_messages: serde_json::from_value(row.section_messages)
                .context("Malformed section_messages column")?,
            music_style: row.music_style.parse()?,
            custom_audio_url: row.custom_audio_url,
            features: serde_json::from_value(row.features).context("Malformed features column")?,
            status: row.status.parse()?,
            artifact_url: row.artifact_url,
            published_at: row.published_at,
            first_viewed_at: row.first_viewed_at,
            view_count: row.view_count,
            retry: RetryState {
                attempts: row.retry_attempts.max(0) as u32,
                next_retry_at: row.next_retry_at,
                last_error: row.last_error,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct UnitRow {
    id: Uuid,
    card_id: Uuid,
    position: i32,
    kind: String,
    original_url: Option<String>,
    processed_url: Option<String>,
    preview_data_uri: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    caption: Option<String>,
    text_content: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UnitRow> for RenderableUnit {
    type Error = anyhow::Error;

    fn try_from(row: UnitRow) -> anyhow::Result<Self> {
        let content = match row.kind.as_str() {
            "photo" => UnitContent::Photo(PhotoUnit {
                original_url: row
                    .original_url
                    .ok_or_else(|| anyhow!("Photo unit {} has no original_url", row.id))?,
                processed_url: row.processed_url,
                preview_data_uri: row.preview_data_uri,
                width: row.width.unwrap_or(0).max(0) as u32,
                height: row.height.unwrap_or(0).max(0) as u32,
                caption: row.caption,
            }),
            "text_panel" => UnitContent::TextPanel {
                text: row.text_content.unwrap_or_default(),
            },
            other => return Err(anyhow!("Unknown unit kind: {other}")),
        };

        Ok(RenderableUnit {
            id: row.id,
            card_id: row.card_id,
            position: row.position.max(0) as u32,
            content,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct GiftCardRow {
    brand: String,
    amount_cents: i64,
    currency: String,
    redemption_url: Option<String>,
    redemption_code: Option<String>,
    status: String,
}

impl TryFrom<GiftCardRow> for GiftCard {
    type Error = anyhow::Error;

    fn try_from(row: GiftCardRow) -> anyhow::Result<Self> {
        Ok(GiftCard {
            brand: row.brand,
            amount_cents: row.amount_cents,
            currency: row.currency,
            redemption_url: row.redemption_url,
            redemption_code: row.redemption_code,
            status: row.status.parse()?,
        })
    }
}

fn status_strings(statuses: &[CardStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// PostgreSQL-backed card repository
pub struct PgCardRepository {
    pool: PgPool,
}

impl PgCardRepository {
    /// Create a new repository with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is required for the PostgreSQL repository")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the card row for the rest of the transaction
    async fn lock_card(tx: &mut Transaction<'_, Postgres>, card_id: Uuid) -> Result<()> {
        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM cards WHERE id = $1 FOR UPDATE")
            .bind(card_id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock card")?;

        locked.map(|_| ()).ok_or(PublishError::CardNotFound(card_id))
    }

    async fn units_in_tx(tx: &mut Transaction<'_, Postgres>, card_id: Uuid) -> Result<Vec<RenderableUnit>> {
        let rows = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {UNIT_COLUMNS} FROM card_units WHERE card_id = $1 ORDER BY position ASC"
        ))
        .bind(card_id)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to query card units")?;

        rows.into_iter()
            .map(|row| RenderableUnit::try_from(row).map_err(PublishError::from))
            .collect()
    }

    /// Explain why a conditional update touched no row
    async fn status_mismatch(&self, card_id: Uuid, expected: Vec<CardStatus>) -> PublishError {
        match self.get_card(card_id).await {
            Ok(Some(card)) => PublishError::InvalidStatus {
                actual: card.status,
                expected,
            },
            Ok(None) => PublishError::CardNotFound(card_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl CardRepository for PgCardRepository {
    #[instrument(skip(self, card), fields(card_id = %card.id, slug = %card.slug))]
    async fn create_card(&self, card: Card) -> Result<Card> {
        sqlx::query(
            r#"
            INSERT INTO cards (
                id, slug, sender_name, recipient_name, title, occasion, tier, theme,
                message, section_messages, music_style, custom_audio_url, features,
                status, view_count, retry_attempts, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8,
                $9, $10, $11, $12, $13,
                $14, 0, 0, $15, $16
            )
            "#,
        )
        .bind(card.id)
        .bind(&card.slug)
        .bind(&card.sender_name)
        .bind(&card.recipient_name)
        .bind(&card.title)
        .bind(&card.occasion)
        .bind(card.tier.as_str())
        .bind(card.theme.as_str())
        .bind(&card.message)
        .bind(serde_json::to_value(&card.section_messages).context("Failed to encode section messages")?)
        .bind(card.music_style.as_str())
        .bind(&card.custom_audio_url)
        .bind(serde_json::to_value(card.features).context("Failed to encode features")?)
        .bind(card.status.as_str())
        .bind(card.created_at)
        .bind(card.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert card")?;

        debug!("Card created");
        Ok(card)
    }

    async fn get_card(&self, card_id: Uuid) -> Result<Option<Card>> {
        let row = sqlx::query_as::<_, CardRow>(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = $1"))
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query card")?;

        Ok(row.map(Card::try_from).transpose()?)
    }

    async fn get_card_by_slug(&self, slug: &str) -> Result<Option<Card>> {
        let row = sqlx::query_as::<_, CardRow>(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE slug = $1"))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query card by slug")?;

        Ok(row.map(Card::try_from).transpose()?)
    }

    #[instrument(skip(self))]
    async fn load_snapshot(&self, card_id: Uuid) -> Result<Option<CardSnapshot>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let row = sqlx::query_as::<_, CardRow>(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE id = $1 FOR SHARE"
        ))
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to query card")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let card = Card::try_from(row)?;
        let units = Self::units_in_tx(&mut tx, card_id).await?;

        let gift_card = sqlx::query_as::<_, GiftCardRow>(
            r#"
            SELECT brand, amount_cents, currency, redemption_url, redemption_code, status
            FROM gift_cards
            WHERE card_id = $1
            "#,
        )
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to query gift card")?
        .map(GiftCard::try_from)
        .transpose()?;

        tx.commit().await.context("Failed to commit transaction")?;

        Ok(Some(CardSnapshot {
            card,
            units,
            gift_card,
        }))
    }

    async fn list_units(&self, card_id: Uuid) -> Result<Vec<RenderableUnit>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let units = Self::units_in_tx(&mut tx, card_id).await?;
        tx.commit().await.context("Failed to commit transaction")?;
        Ok(units)
    }

    #[instrument(skip(self, content), fields(kind = content.kind()))]
    async fn append_unit(
        &self,
        card_id: Uuid,
        unit_id: Uuid,
        content: UnitContent,
        max_units: usize,
        now: DateTime<Utc>,
    ) -> Result<RenderableUnit> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::lock_card(&mut tx, card_id).await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM card_units WHERE card_id = $1")
            .bind(card_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to count card units")?;

        if count as usize >= max_units {
            return Err(PublishError::UnitLimitReached { max: max_units });
        }

        let (original_url, processed_url, preview_data_uri, width, height, caption, text_content) =
            match &content {
                UnitContent::Photo(photo) => (
                    Some(photo.original_url.clone()),
                    photo.processed_url.clone(),
                    photo.preview_data_uri.clone(),
                    Some(photo.width as i32),
                    Some(photo.height as i32),
                    photo.caption.clone(),
                    None,
                ),
                UnitContent::TextPanel { text } => {
                    (None, None, None, None, None, None, Some(text.clone()))
                }
            };

        sqlx::query(
            r#"
            INSERT INTO card_units (
                id, card_id, position, kind, original_url, processed_url,
                preview_data_uri, width, height, caption, text_content, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            "#,
        )
        .bind(unit_id)
        .bind(card_id)
        .bind(count as i32)
        .bind(content.kind())
        .bind(original_url)
        .bind(processed_url)
        .bind(preview_data_uri)
        .bind(width)
        .bind(height)
        .bind(caption)
        .bind(text_content)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert card unit")?;

        sqlx::query("UPDATE cards SET updated_at = $2 WHERE id = $1")
            .bind(card_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to touch card")?;

        tx.commit().await.context("Failed to commit transaction")?;

        Ok(RenderableUnit {
            id: unit_id,
            card_id,
            position: count as u32,
            content,
            created_at: now,
        })
    }

    #[instrument(skip(self))]
    async fn delete_unit(&self, card_id: Uuid, unit_id: Uuid) -> Result<Vec<RenderableUnit>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::lock_card(&mut tx, card_id).await?;

        let deleted: Option<(i32,)> =
            sqlx::query_as("DELETE FROM card_units WHERE id = $1 AND card_id = $2 RETURNING position")
                .bind(unit_id)
                .bind(card_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to delete card unit")?;

        let (position,) = deleted.ok_or(PublishError::UnitNotFound(unit_id))?;

        sqlx::query("UPDATE card_units SET position = position - 1 WHERE card_id = $1 AND position > $2")
            .bind(card_id)
            .bind(position)
            .execute(&mut *tx)
            .await
            .context("Failed to renumber card units")?;

        let units = Self::units_in_tx(&mut tx, card_id).await?;
        tx.commit().await.context("Failed to commit transaction")?;

        Ok(units)
    }

    #[instrument(skip(self, ordered_ids), fields(unit_count = ordered_ids.len()))]
    async fn reorder_units(&self, card_id: Uuid, ordered_ids: &[Uuid]) -> Result<Vec<RenderableUnit>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::lock_card(&mut tx, card_id).await?;

        let existing: Vec<Uuid> = Self::units_in_tx(&mut tx, card_id)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();
        if !is_permutation(&existing, ordered_ids) {
            return Err(PublishError::InvalidReorder);
        }

        // The (card_id, position) constraint is deferred to commit
        for (position, unit_id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE card_units SET position = $3 WHERE id = $1 AND card_id = $2")
                .bind(unit_id)
                .bind(card_id)
                .bind(position as i32)
                .execute(&mut *tx)
                .await
                .context("Failed to update unit position")?;
        }

        let units = Self::units_in_tx(&mut tx, card_id).await?;
        tx.commit().await.context("Failed to commit transaction")?;

        Ok(units)
    }

    async fn attach_gift_card(&self, card_id: Uuid, gift_card: GiftCard) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO gift_cards (
                card_id, brand, amount_cents, currency, redemption_url, redemption_code, status
            )
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE EXISTS (SELECT 1 FROM cards WHERE id = $1)
            ON CONFLICT (card_id) DO UPDATE SET
                brand = EXCLUDED.brand,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                redemption_url = EXCLUDED.redemption_url,
                redemption_code = EXCLUDED.redemption_code,
                status = EXCLUDED.status
            "#,
        )
        .bind(card_id)
        .bind(&gift_card.brand)
        .bind(gift_card.amount_cents)
        .bind(&gift_card.currency)
        .bind(&gift_card.redemption_url)
        .bind(&gift_card.redemption_code)
        .bind(gift_card.status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to upsert gift card")?;

        if result.rows_affected() == 0 {
            return Err(PublishError::CardNotFound(card_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_paid(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Card> {
        let expected = vec![CardStatus::Draft, CardStatus::Preview];

        let row = sqlx::query_as::<_, CardRow>(&format!(
            r#"
            UPDATE cards SET status = 'paid', updated_at = $2
            WHERE id = $1 AND status = ANY($3)
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(card_id)
        .bind(now)
        .bind(status_strings(&expected))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark card paid")?;

        match row {
            Some(row) => Ok(Card::try_from(row)?),
            None => Err(self.status_mismatch(card_id, expected).await),
        }
    }

    async fn record_view(&self, slug: &str, now: DateTime<Utc>) -> Result<Option<Card>> {
        let row = sqlx::query_as::<_, CardRow>(&format!(
            r#"
            UPDATE cards SET
                view_count = view_count + 1,
                first_viewed_at = COALESCE(first_viewed_at, $2)
            WHERE slug = $1
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(slug)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record card view")?;

        Ok(row.map(Card::try_from).transpose()?)
    }

    #[instrument(skip(self, commit), fields(new_status = %commit.new_status))]
    async fn complete_generation(&self, card_id: Uuid, commit: GenerationCommit) -> Result<Card> {
        let row = sqlx::query_as::<_, CardRow>(&format!(
            r#"
            UPDATE cards SET
                status = $2,
                artifact_url = $3,
                published_at = COALESCE($4, published_at),
                next_retry_at = CASE WHEN $2 = 'paid' THEN next_retry_at ELSE NULL END,
                last_error = CASE WHEN $2 = 'paid' THEN last_error ELSE NULL END,
                updated_at = $5
            WHERE id = $1 AND status = ANY($6)
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(card_id)
        .bind(commit.new_status.as_str())
        .bind(&commit.artifact_url)
        .bind(commit.published_at)
        .bind(commit.now)
        .bind(status_strings(&commit.expected))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record generation")?;

        match row {
            Some(row) => Ok(Card::try_from(row)?),
            None => Err(self.status_mismatch(card_id, commit.expected).await),
        }
    }

    #[instrument(skip(self, failure), fields(attempts = failure.attempts))]
    async fn record_retry_failure(&self, card_id: Uuid, failure: RetryFailure) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cards SET
                retry_attempts = $3,
                next_retry_at = $4,
                last_error = $5,
                updated_at = $6
            WHERE id = $1 AND status = 'paid' AND retry_attempts = $2
            "#,
        )
        .bind(card_id)
        .bind(failure.expected_attempts as i32)
        .bind(failure.attempts as i32)
        .bind(failure.next_retry_at)
        .bind(&failure.last_error)
        .bind(failure.now)
        .execute(&self.pool)
        .await
        .context("Failed to record retry failure")?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<ClaimedRetry>> {
        let rows: Vec<(Uuid, i32, DateTime<Utc>)> = sqlx::query_as(
            r#"
            WITH due AS (
                SELECT id, retry_attempts, next_retry_at
                FROM cards
                WHERE status = 'paid'
                  AND next_retry_at IS NOT NULL
                  AND next_retry_at <= $1
                ORDER BY next_retry_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE cards c SET next_retry_at = $3
            FROM due
            WHERE c.id = due.id
            RETURNING c.id, due.retry_attempts, due.next_retry_at
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(now + lease)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim due retries")?;

        let mut claimed: Vec<ClaimedRetry> = rows
            .into_iter()
            .map(|(card_id, attempts, due_at)| ClaimedRetry {
                card_id,
                attempts: attempts.max(0) as u32,
                due_at,
            })
            .collect();
        // RETURNING order is unspecified
        claimed.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.card_id.cmp(&b.card_id)));

        debug!(claimed = claimed.len(), "Claimed due retries");
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_row(kind: &str) -> UnitRow {
        UnitRow {
            id: Uuid::new_v4(),
            card_id: Uuid::new_v4(),
            position: 2,
            kind: kind.to_string(),
            original_url: Some("https://cdn.example/o.png".to_string()),
            processed_url: Some("https://cdn.example/d.jpg".to_string()),
            preview_data_uri: None,
            width: Some(800),
            height: Some(600),
            caption: Some("Beach".to_string()),
            text_content: Some("Hello".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_unit_row_conversion() {
        let unit = RenderableUnit::try_from(unit_row("photo")).unwrap();
        assert_eq!(unit.position, 2);
        match unit.content {
            UnitContent::Photo(photo) => {
                assert_eq!(photo.width, 800);
                assert_eq!(photo.caption.as_deref(), Some("Beach"));
            }
            other => panic!("Expected photo, got {:?}", other),
        }

        let unit = RenderableUnit::try_from(unit_row("text_panel")).unwrap();
        assert_eq!(unit.content, UnitContent::TextPanel { text: "Hello".to_string() });

        assert!(RenderableUnit::try_from(unit_row("video")).is_err());
    }

    #[test]
    fn test_photo_row_without_original_is_rejected() {
        let mut row = unit_row("photo");
        row.original_url = None;
        assert!(RenderableUnit::try_from(row).is_err());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(
            status_strings(&[CardStatus::Draft, CardStatus::Preview]),
            vec!["draft".to_string(), "preview".to_string()]
        );
    }
}
