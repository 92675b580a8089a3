//! Card content editing: photos, text panels, ordering and views.

use crate::error::{PublishError, Result};
use crate::model::{Card, CardStatus, GiftCard, NewCard, PhotoUnit, RenderableUnit, UnitContent};
use crate::object_store::{
    content_type_for_extension, photo_display_key, photo_original_key, ObjectStore,
};
use crate::photo_ingest::{cap_chars, PhotoIngestor, NORMALIZED_CONTENT_TYPE};
use crate::repository::CardRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Photo upload as received from a client
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
    pub caption: Option<String>,
}

pub struct CardEditor {
    repository: Arc<dyn CardRepository>,
    store: Arc<dyn ObjectStore>,
    ingestor: PhotoIngestor,
}

impl CardEditor {
    pub fn new(
        repository: Arc<dyn CardRepository>,
        store: Arc<dyn ObjectStore>,
        ingestor: PhotoIngestor,
    ) -> Self {
        Self {
            repository,
            store,
            ingestor,
        }
    }

    #[instrument(skip(self, input), fields(tier = %input.tier.as_str()))]
    pub async fn create_card(&self, input: NewCard) -> Result<Card> {
        if input.recipient_name.trim().is_empty() {
            return Err(PublishError::InvalidInput("Recipient name is required".to_string()));
        }
        let card = self
            .repository
            .create_card(Card::new_draft(input, Utc::now()))
            .await?;
        info!(card_id = %card.id, slug = %card.slug, "Card created");
        Ok(card)
    }

    pub async fn get_card(&self, card_id: Uuid) -> Result<Card> {
        self.repository
            .get_card(card_id)
            .await?
            .ok_or(PublishError::CardNotFound(card_id))
    }

    #[instrument(skip(self, gift_card))]
    pub async fn attach_gift_card(&self, card_id: Uuid, gift_card: GiftCard) -> Result<()> {
        self.editable_card(card_id).await?;
        self.repository.attach_gift_card(card_id, gift_card).await
    }

    /// Ingest a photo, store both renditions and append it as the last unit
    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, size_bytes = upload.bytes.len()))]
    pub async fn add_photo(&self, card_id: Uuid, upload: PhotoUpload) -> Result<RenderableUnit> {
        let card = self.editable_card(card_id).await?;
        self.ensure_capacity(&card).await?;

        let PhotoUpload {
            bytes,
            file_name,
            mime_type,
            caption,
        } = upload;

        let photo = self
            .ingestor
            .ingest_async(bytes.clone(), file_name, mime_type)
            .await?;

        let unit_id = Uuid::new_v4();
        let original_key = photo_original_key(&card.slug, unit_id, &photo.original_extension);
        let original_url = self
            .store
            .put(
                &original_key,
                bytes,
                content_type_for_extension(&photo.original_extension),
            )
            .await
            .map_err(|e| PublishError::StorageWriteFailed(format!("{e:#}")))?;

        let display_key = photo_display_key(&card.slug, unit_id);
        let processed_url = match self
            .store
            .put(&display_key, photo.bytes, NORMALIZED_CONTENT_TYPE)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                self.discard(&[original_url]).await;
                return Err(PublishError::StorageWriteFailed(format!("{e:#}")));
            }
        };

        let caption = caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .map(|c| cap_chars(&c, self.ingestor.config().text_panel_max_chars));

        let content = UnitContent::Photo(PhotoUnit {
            original_url: original_url.clone(),
            processed_url: Some(processed_url.clone()),
            preview_data_uri: Some(photo.preview_data_uri),
            width: photo.width,
            height: photo.height,
            caption,
        });

        match self
            .repository
            .append_unit(card_id, unit_id, content, card.tier.max_units(), Utc::now())
            .await
        {
            Ok(unit) => {
                info!(card_id = %card_id, unit_id = %unit.id, position = unit.position, "Photo added");
                Ok(unit)
            }
            Err(e) => {
                self.discard(&[original_url, processed_url]).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self, text))]
    pub async fn add_text_panel(&self, card_id: Uuid, text: &str) -> Result<RenderableUnit> {
        let card = self.editable_card(card_id).await?;
        let text = self.ingestor.normalize_text(text)?;

        let unit = self
            .repository
            .append_unit(
                card_id,
                Uuid::new_v4(),
                UnitContent::TextPanel { text },
                card.tier.max_units(),
                Utc::now(),
            )
            .await?;
        info!(card_id = %card_id, unit_id = %unit.id, position = unit.position, "Text panel added");
        Ok(unit)
    }

    #[instrument(skip(self))]
    pub async fn delete_unit(&self, card_id: Uuid, unit_id: Uuid) -> Result<Vec<RenderableUnit>> {
        self.editable_card(card_id).await?;

        let removed = self
            .repository
            .list_units(card_id)
            .await?
            .into_iter()
            .find(|u| u.id == unit_id)
            .ok_or(PublishError::UnitNotFound(unit_id))?;

        let remaining = self.repository.delete_unit(card_id, unit_id).await?;

        if let UnitContent::Photo(photo) = removed.content {
            let mut refs = vec![photo.original_url];
            refs.extend(photo.processed_url);
            self.discard(&refs).await;
        }

        Ok(remaining)
    }

    #[instrument(skip(self, ordered_ids), fields(count = ordered_ids.len()))]
    pub async fn reorder_units(
        &self,
        card_id: Uuid,
        ordered_ids: &[Uuid],
    ) -> Result<Vec<RenderableUnit>> {
        self.editable_card(card_id).await?;
        self.repository.reorder_units(card_id, ordered_ids).await
    }

    #[instrument(skip(self))]
    pub async fn record_view(&self, slug: &str, now: DateTime<Utc>) -> Result<Card> {
        let card = self
            .repository
            .record_view(slug, now)
            .await?
            .ok_or_else(|| PublishError::SlugNotFound(slug.to_string()))?;
        metrics::counter!("publisher.cards.viewed").increment(1);
        Ok(card)
    }

    async fn editable_card(&self, card_id: Uuid) -> Result<Card> {
        let card = self.get_card(card_id).await?;
        if !card.status.is_editable() {
            return Err(PublishError::InvalidStatus {
                actual: card.status,
                expected: vec![CardStatus::Draft, CardStatus::Preview, CardStatus::Paid],
            });
        }
        Ok(card)
    }

    /// Fail fast before decoding when the card is already full
    async fn ensure_capacity(&self, card: &Card) -> Result<()> {
        let max = card.tier.max_units();
        if self.repository.list_units(card.id).await?.len() >= max {
            return Err(PublishError::UnitLimitReached { max });
        }
        Ok(())
    }

    /// Best-effort removal of blobs that no unit references
    async fn discard(&self, references: &[String]) {
        for reference in references {
            if let Err(e) = self.store.delete(reference).await {
                warn!(reference = %reference, error = %e, "Failed to delete orphaned object");
            }
        }
    }
}
