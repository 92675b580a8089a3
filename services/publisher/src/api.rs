use crate::config::ApiConfig;
use crate::error::PublishError;
use crate::lifecycle::{LifecycleController, PaymentOutcome};
use crate::model::{Card, GeneratedArtifact, GiftCard, NewCard, RenderableUnit};
use crate::object_store::ObjectStore;
use crate::retry::{RetryBatchReport, RetryScheduler};
use crate::units::{CardEditor, PhotoUpload};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub editor: Arc<CardEditor>,
    pub controller: Arc<LifecycleController>,
    pub scheduler: Arc<RetryScheduler>,
    pub store: Arc<dyn ObjectStore>,
    /// Present when cards live in Postgres; used by the readiness probe
    pub db_pool: Option<PgPool>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Handler error wrapper so `?` works on [`PublishError`]
#[derive(Debug)]
pub struct ApiError(PublishError);

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        Self(e)
    }
}

fn status_for(error: &PublishError) -> StatusCode {
    match error {
        PublishError::CardNotFound(_)
        | PublishError::SlugNotFound(_)
        | PublishError::UnitNotFound(_) => StatusCode::NOT_FOUND,
        PublishError::NotRenderable
        | PublishError::InvalidReorder
        | PublishError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PublishError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        PublishError::InvalidStatus { .. }
        | PublishError::UnitLimitReached { .. }
        | PublishError::RetryCapExceeded { .. } => StatusCode::CONFLICT,
        PublishError::Unauthorized => StatusCode::UNAUTHORIZED,
        PublishError::StorageWriteFailed(_) => StatusCode::BAD_GATEWAY,
        PublishError::GenerationFailed(_) | PublishError::Repository(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "Request failed");
        }

        // Keep backend details out of client responses
        let message = match &self.0 {
            PublishError::Repository(_) => "Internal error".to_string(),
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Generated artifact in API responses
#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub card_id: Uuid,
    pub url: String,
    pub size_bytes: usize,
    pub generated_at: chrono::DateTime<Utc>,
    pub status: String,
}

impl ArtifactResponse {
    fn new(artifact: GeneratedArtifact, card: &Card) -> Self {
        Self {
            card_id: artifact.card_id,
            url: artifact.url,
            size_bytes: artifact.size_bytes,
            generated_at: artifact.generated_at,
            status: card.status.to_string(),
        }
    }
}

/// Text panel request
#[derive(Debug, Deserialize)]
pub struct TextPanelRequest {
    pub text: String,
}

/// Reorder request: every unit id of the card, in the desired order
#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub unit_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct UnitsResponse {
    pub units: Vec<RenderableUnit>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/cards", post(create_card))
        .route("/api/v1/cards/:card_id", get(get_card))
        .route("/api/v1/cards/:card_id/gift-card", put(attach_gift_card))
        .route("/api/v1/cards/:card_id/preview", post(generate_preview))
        .route("/api/v1/cards/:card_id/publish", post(publish_card))
        .route("/api/v1/cards/:card_id/payment-confirmed", post(payment_confirmed))
        .route("/api/v1/cards/:card_id/photos", post(add_photo))
        .route("/api/v1/cards/:card_id/text-panels", post(add_text_panel))
        .route("/api/v1/cards/:card_id/units/order", put(reorder_units))
        .route("/api/v1/cards/:card_id/units/:unit_id", delete(delete_unit))
        .route("/api/v1/cards/:card_id/artifact", get(get_artifact))
        .route("/api/v1/views/:slug", post(record_view))
        .route("/internal/retry-publish", post(retry_publish))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "keepsake-publisher"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = state.db_pool.as_ref() else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "in_memory"
            })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state, input))]
async fn create_card(
    State(state): State<AppState>,
    Json(input): Json<NewCard>,
) -> ApiResult<(StatusCode, Json<Card>)> {
    let card = state.editor.create_card(input).await?;
    Ok((StatusCode::CREATED, Json(card)))
}

#[instrument(skip(state))]
async fn get_card(State(state): State<AppState>, Path(card_id): Path<Uuid>) -> ApiResult<Json<Card>> {
    Ok(Json(state.editor.get_card(card_id).await?))
}

#[instrument(skip(state, gift_card))]
async fn attach_gift_card(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    Json(gift_card): Json<GiftCard>,
) -> ApiResult<StatusCode> {
    state.editor.attach_gift_card(card_id, gift_card).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
async fn generate_preview(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Json<ArtifactResponse>> {
    let artifact = state.controller.generate_preview(card_id).await?;
    let card = state.editor.get_card(card_id).await?;
    Ok(Json(ArtifactResponse::new(artifact, &card)))
}

#[instrument(skip(state))]
async fn publish_card(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Json<ArtifactResponse>> {
    let artifact = state.controller.publish(card_id).await?;
    let card = state.editor.get_card(card_id).await?;
    Ok(Json(ArtifactResponse::new(artifact, &card)))
}

#[instrument(skip(state))]
async fn payment_confirmed(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<PaymentOutcome>)> {
    let outcome = state.controller.confirm_payment(card_id, Utc::now()).await?;
    let status = match outcome {
        PaymentOutcome::Published { .. } => StatusCode::OK,
        PaymentOutcome::RetryScheduled { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[instrument(skip(state, headers, body), fields(size_bytes = body.len()))]
async fn add_photo(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<RenderableUnit>)> {
    let upload = PhotoUpload {
        bytes: body.to_vec(),
        file_name: header_str(&headers, "x-file-name")
            .unwrap_or("upload")
            .to_string(),
        mime_type: header_str(&headers, header::CONTENT_TYPE.as_str())
            .unwrap_or("application/octet-stream")
            .to_string(),
        caption: header_str(&headers, "x-caption").map(str::to_string),
    };
    let unit = state.editor.add_photo(card_id, upload).await?;
    Ok((StatusCode::CREATED, Json(unit)))
}

#[instrument(skip(state, request))]
async fn add_text_panel(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    Json(request): Json<TextPanelRequest>,
) -> ApiResult<(StatusCode, Json<RenderableUnit>)> {
    let unit = state.editor.add_text_panel(card_id, &request.text).await?;
    Ok((StatusCode::CREATED, Json(unit)))
}

#[instrument(skip(state))]
async fn delete_unit(
    State(state): State<AppState>,
    Path((card_id, unit_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<UnitsResponse>> {
    let units = state.editor.delete_unit(card_id, unit_id).await?;
    Ok(Json(UnitsResponse { units }))
}

#[instrument(skip(state, request))]
async fn reorder_units(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<Json<UnitsResponse>> {
    let units = state.editor.reorder_units(card_id, &request.unit_ids).await?;
    Ok(Json(UnitsResponse { units }))
}

/// Read the stored artifact back through the object store
#[instrument(skip(state))]
async fn get_artifact(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Response> {
    let card = state.editor.get_card(card_id).await?;
    let reference = card
        .artifact_url
        .ok_or_else(|| PublishError::InvalidInput("Card has no generated artifact yet".to_string()))?;

    let bytes = state
        .store
        .get(&reference)
        .await
        .map_err(PublishError::Repository)?;

    Ok((
        [(header::CONTENT_TYPE, crate::object_store::HTML_CONTENT_TYPE)],
        bytes,
    )
        .into_response())
}

#[instrument(skip(state))]
async fn record_view(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let card = state.editor.record_view(&slug, Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "slug": card.slug,
        "view_count": card.view_count,
        "first_viewed_at": card.first_viewed_at,
    })))
}

/// Extract the token from an `Authorization: Bearer ...` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

async fn retry_publish(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<RetryBatchReport>> {
    let report = state
        .scheduler
        .run_retry_batch(bearer_token(&headers), Utc::now())
        .await?;
    Ok(Json(report))
}

/// Start the API server, returning once `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting publisher API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, RetryConfig};
    use crate::generator::ArtifactGenerator;
    use crate::model::{CardStatus, Tier};
    use crate::photo_ingest::PhotoIngestor;
    use crate::repository::InMemoryCardRepository;
    use crate::retry::RetryPolicy;
    use crate::test_support::FlakyStore;
    use axum::http::HeaderValue;

    fn state(secret: Option<&str>) -> AppState {
        let repo = Arc::new(InMemoryCardRepository::new());
        let store = Arc::new(FlakyStore::default());
        let retry = RetryConfig {
            secret: secret.map(str::to_string),
            ..RetryConfig::default()
        };
        let controller = Arc::new(LifecycleController::new(
            repo.clone(),
            Arc::new(ArtifactGenerator::new(store.clone(), 500)),
            RetryPolicy::from_config(&retry),
        ));
        AppState {
            editor: Arc::new(CardEditor::new(
                repo.clone(),
                store.clone(),
                PhotoIngestor::new(IngestConfig::default()),
            )),
            scheduler: Arc::new(RetryScheduler::new(controller.clone(), repo, retry)),
            controller,
            store,
            db_pool: None,
        }
    }

    fn new_card() -> NewCard {
        NewCard {
            sender_name: "Sam".to_string(),
            recipient_name: "Alex".to_string(),
            title: "Welcome".to_string(),
            occasion: "new baby".to_string(),
            tier: Tier::Quick,
            theme: Default::default(),
            message: String::new(),
            section_messages: vec![],
            music_style: Default::default(),
            custom_audio_url: None,
            features: Default::default(),
        }
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&PublishError::NotRenderable), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&PublishError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&PublishError::UnsupportedFormat {
                message: "no".to_string(),
                restricted_format: true
            }),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            status_for(&PublishError::InvalidStatus {
                actual: CardStatus::Archived,
                expected: vec![]
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&PublishError::CardNotFound(Uuid::nil())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_retry_endpoint_requires_credential() {
        let state = state(Some("secret"));
        let result = retry_publish(State(state.clone()), HeaderMap::new()).await;
        let response = result.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let Json(report) = retry_publish(State(state), headers).await.unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_preview_flow_through_handlers() {
        let state = state(None);
        let (status, Json(card)) = create_card(State(state.clone()), Json(new_card()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let err = generate_preview(State(state.clone()), Path(card.id))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        add_text_panel(
            State(state.clone()),
            Path(card.id),
            Json(TextPanelRequest {
                text: "Welcome to the world".to_string(),
            }),
        )
        .await
        .unwrap();

        let Json(artifact) = generate_preview(State(state.clone()), Path(card.id))
            .await
            .unwrap();
        assert_eq!(artifact.status, "preview");

        let response = get_artifact(State(state), Path(card.id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_payment_confirmed_publishes_once() {
        let state = state(None);
        let card = state.editor.create_card(new_card()).await.unwrap();
        state.editor.add_text_panel(card.id, "hi").await.unwrap();

        let (status, Json(outcome)) = payment_confirmed(State(state.clone()), Path(card.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(matches!(outcome, PaymentOutcome::Published { .. }));

        let err = payment_confirmed(State(state), Path(card.id)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
