//! Card domain types shared by the repository, generator and lifecycle controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upper bound on the stored last-error message
pub const LAST_ERROR_MAX_CHARS: usize = 500;

/// Lifecycle status of a card
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Draft,
    Preview,
    Paid,
    Published,
    Archived,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Draft => "draft",
            CardStatus::Preview => "preview",
            CardStatus::Paid => "paid",
            CardStatus::Published => "published",
            CardStatus::Archived => "archived",
        }
    }

    /// Whether units may still be added, removed or reordered
    pub fn is_editable(&self) -> bool {
        matches!(self, CardStatus::Draft | CardStatus::Preview | CardStatus::Paid)
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CardStatus::Draft),
            "preview" => Ok(CardStatus::Preview),
            "paid" => Ok(CardStatus::Paid),
            "published" => Ok(CardStatus::Published),
            "archived" => Ok(CardStatus::Archived),
            other => Err(anyhow::anyhow!("Unknown card status: {other}")),
        }
    }
}

/// Pricing class of a card
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Quick,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Quick => "quick",
            Tier::Premium => "premium",
        }
    }

    /// Maximum number of renderable units a card of this tier may hold
    pub fn max_units(&self) -> usize {
        match self {
            Tier::Quick => 6,
            Tier::Premium => 24,
        }
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Tier::Quick),
            "premium" => Ok(Tier::Premium),
            other => Err(anyhow::anyhow!("Unknown tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Classic,
    Floral,
    Midnight,
    Confetti,
    Minimal,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Classic => "classic",
            Theme::Floral => "floral",
            Theme::Midnight => "midnight",
            Theme::Confetti => "confetti",
            Theme::Minimal => "minimal",
        }
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(Theme::Classic),
            "floral" => Ok(Theme::Floral),
            "midnight" => Ok(Theme::Midnight),
            "confetti" => Ok(Theme::Confetti),
            "minimal" => Ok(Theme::Minimal),
            other => Err(anyhow::anyhow!("Unknown theme: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MusicStyle {
    #[default]
    None,
    Upbeat,
    Calm,
    Romantic,
    Celebration,
}

impl MusicStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            MusicStyle::None => "none",
            MusicStyle::Upbeat => "upbeat",
            MusicStyle::Calm => "calm",
            MusicStyle::Romantic => "romantic",
            MusicStyle::Celebration => "celebration",
        }
    }
}

impl FromStr for MusicStyle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MusicStyle::None),
            "upbeat" => Ok(MusicStyle::Upbeat),
            "calm" => Ok(MusicStyle::Calm),
            "romantic" => Ok(MusicStyle::Romantic),
            "celebration" => Ok(MusicStyle::Celebration),
            other => Err(anyhow::anyhow!("Unknown music style: {other}")),
        }
    }
}

/// Client-side feature switches rendered into the artifact verbatim
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureToggles {
    pub confetti: bool,
    pub background_music: bool,
    pub envelope_intro: bool,
    pub show_sender: bool,
    pub allow_replies: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            confetti: false,
            background_music: false,
            envelope_intro: true,
            show_sender: true,
            allow_replies: false,
        }
    }
}

/// Automatic publish retry bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryState {
    /// Number of failed automatic publish attempts
    pub attempts: u32,
    /// When the next attempt is due; `None` means not scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Truncated message of the most recent failure
    pub last_error: Option<String>,
}

/// The central card entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub slug: String,
    pub sender_name: String,
    pub recipient_name: String,
    pub title: String,
    pub occasion: String,
    pub tier: Tier,
    pub theme: Theme,
    pub message: String,
    pub section_messages: Vec<String>,
    pub music_style: MusicStyle,
    pub custom_audio_url: Option<String>,
    pub features: FeatureToggles,
    pub status: CardStatus,
    pub artifact_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub first_viewed_at: Option<DateTime<Utc>>,
    pub view_count: i64,
    pub retry: RetryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a card is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCard {
    pub sender_name: String,
    pub recipient_name: String,
    pub title: String,
    #[serde(default)]
    pub occasion: String,
    pub tier: Tier,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub section_messages: Vec<String>,
    #[serde(default)]
    pub music_style: MusicStyle,
    pub custom_audio_url: Option<String>,
    #[serde(default)]
    pub features: FeatureToggles,
}

impl Card {
    /// Build a fresh draft from creation input
    pub fn new_draft(input: NewCard, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        let slug = make_slug(&input.recipient_name, id);

        Self {
            id,
            slug,
            sender_name: input.sender_name,
            recipient_name: input.recipient_name,
            title: input.title,
            occasion: input.occasion,
            tier: input.tier,
            theme: input.theme,
            message: input.message,
            section_messages: input.section_messages,
            music_style: input.music_style,
            custom_audio_url: input.custom_audio_url,
            features: input.features,
            status: CardStatus::Draft,
            artifact_url: None,
            published_at: None,
            first_viewed_at: None,
            view_count: 0,
            retry: RetryState::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Build a URL-safe slug from the recipient name plus a short id suffix
pub fn make_slug(recipient_name: &str, id: Uuid) -> String {
    let mut base = String::new();
    for c in recipient_name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            base.push(c.to_ascii_lowercase());
        } else if !base.is_empty() && !base.ends_with('-') {
            base.push('-');
        }
        if base.len() >= 32 {
            break;
        }
    }
    let base = base.trim_end_matches('-');
    let suffix = &id.simple().to_string()[..8];

    if base.is_empty() {
        format!("card-{suffix}")
    } else {
        format!("{base}-{suffix}")
    }
}

/// Photo fields of a renderable unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoUnit {
    pub original_url: String,
    pub processed_url: Option<String>,
    /// Inline `data:` URI of the processed bytes
    pub preview_data_uri: Option<String>,
    pub width: u32,
    pub height: u32,
    pub caption: Option<String>,
}

impl PhotoUnit {
    /// Best available image source: inline preview, then processed, then original
    pub fn best_source(&self) -> &str {
        self.preview_data_uri
            .as_deref()
            .or(self.processed_url.as_deref())
            .unwrap_or(&self.original_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitContent {
    Photo(PhotoUnit),
    TextPanel { text: String },
}

impl UnitContent {
    pub fn kind(&self) -> &'static str {
        match self {
            UnitContent::Photo(_) => "photo",
            UnitContent::TextPanel { .. } => "text_panel",
        }
    }
}

/// One positioned content slot of a card
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderableUnit {
    pub id: Uuid,
    pub card_id: Uuid,
    /// 0-based, contiguous and unique within the card
    pub position: u32,
    pub content: UnitContent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GiftCardStatus {
    Pending,
    Purchased,
    Failed,
}

impl GiftCardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftCardStatus::Pending => "pending",
            GiftCardStatus::Purchased => "purchased",
            GiftCardStatus::Failed => "failed",
        }
    }
}

impl FromStr for GiftCardStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GiftCardStatus::Pending),
            "purchased" => Ok(GiftCardStatus::Purchased),
            "failed" => Ok(GiftCardStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown gift card status: {other}")),
        }
    }
}

/// Gift card attached to a card with a gift slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GiftCard {
    pub brand: String,
    pub amount_cents: i64,
    pub currency: String,
    pub redemption_url: Option<String>,
    pub redemption_code: Option<String>,
    pub status: GiftCardStatus,
}

/// Everything the generator needs, read in one go
#[derive(Debug, Clone)]
pub struct CardSnapshot {
    pub card: Card,
    /// Sorted by position
    pub units: Vec<RenderableUnit>,
    pub gift_card: Option<GiftCard>,
}

/// A rendered document persisted to the object store
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedArtifact {
    pub card_id: Uuid,
    pub key: String,
    /// External reference returned by the object store
    pub url: String,
    pub size_bytes: usize,
    pub generated_at: DateTime<Utc>,
    #[serde(skip)]
    pub document: Vec<u8>,
}

/// Truncate an error message for storage, respecting char boundaries
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= LAST_ERROR_MAX_CHARS {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(LAST_ERROR_MAX_CHARS - 1).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo() -> PhotoUnit {
        PhotoUnit {
            original_url: "https://cdn.example/original.heic".to_string(),
            processed_url: Some("https://cdn.example/display.jpg".to_string()),
            preview_data_uri: Some("data:image/jpeg;base64,AAAA".to_string()),
            width: 800,
            height: 600,
            caption: None,
        }
    }

    #[test]
    fn test_best_source_prefers_inline_preview() {
        let mut unit = photo();
        assert_eq!(unit.best_source(), "data:image/jpeg;base64,AAAA");

        unit.preview_data_uri = None;
        assert_eq!(unit.best_source(), "https://cdn.example/display.jpg");

        unit.processed_url = None;
        assert_eq!(unit.best_source(), "https://cdn.example/original.heic");
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            CardStatus::Draft,
            CardStatus::Preview,
            CardStatus::Paid,
            CardStatus::Published,
            CardStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<CardStatus>().unwrap(), status);
        }
        assert!("shipped".parse::<CardStatus>().is_err());
    }

    #[test]
    fn test_make_slug() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(make_slug("Grandma Jo!", id), "grandma-jo-550e8400");
        assert_eq!(make_slug("  ", id), "card-550e8400");
        assert_eq!(make_slug("Zoë & Max", id), "zo-max-550e8400");
    }

    #[test]
    fn test_truncate_error() {
        assert_eq!(truncate_error("disk full"), "disk full");

        let long = "x".repeat(LAST_ERROR_MAX_CHARS + 50);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), LAST_ERROR_MAX_CHARS);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn test_tier_unit_caps() {
        assert_eq!(Tier::Quick.max_units(), 6);
        assert_eq!(Tier::Premium.max_units(), 24);
    }
}
