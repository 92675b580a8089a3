//! Card artifact rendering and persistence.

use crate::error::{PublishError, Result};
use crate::model::{
    CardSnapshot, GeneratedArtifact, GiftCard, GiftCardStatus, RenderableUnit, UnitContent,
};
use crate::object_store::{artifact_key, ObjectStore, HTML_CONTENT_TYPE};
use crate::photo_ingest::cap_chars;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Renders card snapshots to static HTML and stores them under the card's slug
pub struct ArtifactGenerator {
    store: Arc<dyn ObjectStore>,
    text_panel_max_chars: usize,
}

impl ArtifactGenerator {
    pub fn new(store: Arc<dyn ObjectStore>, text_panel_max_chars: usize) -> Self {
        Self {
            store,
            text_panel_max_chars,
        }
    }

    /// Render and persist; the previous artifact at the slug's key is replaced
    #[instrument(skip(self, snapshot), fields(card_id = %snapshot.card.id, slug = %snapshot.card.slug))]
    pub async fn generate(&self, snapshot: &CardSnapshot, now: DateTime<Utc>) -> Result<GeneratedArtifact> {
        let document = render_document(snapshot, self.text_panel_max_chars, now)?;
        let key = artifact_key(&snapshot.card.slug);
        let size_bytes = document.len();

        let url = self
            .store
            .put(&key, document.clone(), HTML_CONTENT_TYPE)
            .await
            .map_err(|e| PublishError::StorageWriteFailed(format!("{e:#}")))?;

        metrics::counter!("publisher.artifacts.generated").increment(1);
        debug!(key = %key, size_bytes = size_bytes, "Artifact stored");

        Ok(GeneratedArtifact {
            card_id: snapshot.card.id,
            key,
            url,
            size_bytes,
            generated_at: now,
            document,
        })
    }
}

/// Render a card snapshot to an HTML document.
///
/// Two renders of the same snapshot differ only in the `generated-at` meta tag.
pub fn render_document(
    snapshot: &CardSnapshot,
    text_panel_max_chars: usize,
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>> {
    if snapshot.units.is_empty() {
        return Err(PublishError::NotRenderable);
    }

    let card = &snapshot.card;
    let features = serde_json::to_string(&card.features)
        .map_err(|e| PublishError::GenerationFailed(format!("Failed to encode features: {e}")))?;

    let mut units: Vec<&RenderableUnit> = snapshot.units.iter().collect();
    units.sort_by_key(|u| u.position);

    let mut html = String::with_capacity(4096);
    render_head(&mut html, snapshot, generated_at).map_err(render_failed)?;

    write!(
        html,
        r#"<body data-theme="{}" data-tier="{}" data-occasion="{}" data-music="{}">
<main class="card">
<header>
<h1 class="title">{}</h1>
<p class="recipient">To {}</p>
<p class="sender">From {}</p>
</header>
<section class="message">{}</section>
"#,
        card.theme.as_str(),
        card.tier.as_str(),
        escape_html(&card.occasion),
        card.music_style.as_str(),
        escape_html(&card.title),
        escape_html(&card.recipient_name),
        escape_html(&card.sender_name),
        paragraphs(&card.message),
    )
    .map_err(render_failed)?;

    for (index, section) in card.section_messages.iter().enumerate() {
        writeln!(
            html,
            r#"<section class="section-message" data-index="{}">{}</section>"#,
            index,
            paragraphs(section)
        )
        .map_err(render_failed)?;
    }

    html.push_str("<div class=\"units\">\n");
    for unit in units {
        render_unit(&mut html, unit, text_panel_max_chars).map_err(render_failed)?;
    }
    html.push_str("</div>\n");

    if let Some(ref gift_card) = snapshot.gift_card {
        render_gift_card(&mut html, gift_card).map_err(render_failed)?;
    }

    if let Some(ref audio) = card.custom_audio_url {
        writeln!(
            html,
            r#"<audio class="custom-audio" src="{}" preload="none"></audio>"#,
            escape_html(audio)
        )
        .map_err(render_failed)?;
    }

    // Toggles are booleans only, nothing to escape inside the script element
    write!(
        html,
        r#"</main>
<script type="application/json" id="card-features">{features}</script>
</body>
</html>
"#
    )
    .map_err(render_failed)?;

    Ok(html.into_bytes())
}

fn render_failed(e: std::fmt::Error) -> PublishError {
    PublishError::GenerationFailed(format!("Failed to write document: {e}"))
}

fn render_head(html: &mut String, snapshot: &CardSnapshot, generated_at: DateTime<Utc>) -> std::fmt::Result {
    let card = &snapshot.card;
    write!(
        html,
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<meta name="card-slug" content="{}">
<meta name="generated-at" content="{}">
<meta property="og:title" content="{}">
<title>{}</title>
</head>
"#,
        escape_html(&card.slug),
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        escape_html(&card.title),
        escape_html(&card.title),
    )
}

fn render_unit(html: &mut String, unit: &RenderableUnit, text_panel_max_chars: usize) -> std::fmt::Result {
    match &unit.content {
        UnitContent::Photo(photo) => {
            let alt = photo.caption.as_deref().unwrap_or("");
            write!(
                html,
                r#"<section class="unit unit-photo" data-position="{}"><figure><img src="{}" width="{}" height="{}" alt="{}" loading="lazy">"#,
                unit.position,
                escape_html(photo.best_source()),
                photo.width,
                photo.height,
                escape_html(alt),
            )?;
            if let Some(ref caption) = photo.caption {
                write!(html, "<figcaption>{}</figcaption>", escape_html(caption))?;
            }
            html.push_str("</figure></section>\n");
        }
        UnitContent::TextPanel { text } => {
            writeln!(
                html,
                r#"<section class="unit unit-text" data-position="{}"><p>{}</p></section>"#,
                unit.position,
                escape_html(&cap_chars(text, text_panel_max_chars)),
            )?;
        }
    }
    Ok(())
}

fn render_gift_card(html: &mut String, gift_card: &GiftCard) -> std::fmt::Result {
    let amount = format!(
        "{}.{:02} {}",
        gift_card.amount_cents / 100,
        gift_card.amount_cents % 100,
        escape_html(&gift_card.currency)
    );

    match gift_card.status {
        GiftCardStatus::Purchased => {
            write!(
                html,
                r#"<section class="gift-card"><h2>A {} gift card for you</h2><p class="gift-amount">{}</p>"#,
                escape_html(&gift_card.brand),
                amount
            )?;
            if let Some(ref url) = gift_card.redemption_url {
                write!(
                    html,
                    r#"<a class="gift-redeem" href="{}" rel="noopener" target="_blank">Redeem your gift</a>"#,
                    escape_html(url)
                )?;
            }
            if let Some(ref code) = gift_card.redemption_code {
                write!(html, r#"<p class="gift-code"><code>{}</code></p>"#, escape_html(code))?;
            }
            html.push_str("</section>\n");
        }
        GiftCardStatus::Pending => {
            writeln!(
                html,
                r#"<section class="gift-card gift-pending"><p>A {} gift card ({}) is on its way.</p></section>"#,
                escape_html(&gift_card.brand),
                amount
            )?;
        }
        GiftCardStatus::Failed => {}
    }
    Ok(())
}

/// Split free text on blank lines into `<p>` elements
fn paragraphs(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("")
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
