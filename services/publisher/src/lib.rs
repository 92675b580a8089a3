//! Keepsake Publisher
//!
//! Renders user-authored cards into static HTML documents and keeps each
//! card's public artifact consistent with its lifecycle status, retrying
//! failed publications with bounded exponential backoff.
//!
//! ## Components
//!
//! - **Photo Ingestor**: decodes uploads, fixes orientation, bounds the width
//!   and re-encodes to JPEG with an inline preview
//! - **Artifact Generator**: turns a card snapshot into an HTML document and
//!   stores it through the object store
//! - **Lifecycle Controller**: the only writer of a card's status and retry
//!   fields; regenerations of a card are serialized
//! - **Retry Scheduler**: externally triggered batch worker for cards stuck
//!   in `PAID`
//!
//! ## Architecture
//!
//! ```text
//! HTTP API                      Object Store              Repository
//! ┌──────────────┐             ┌──────────────┐          ┌──────────────┐
//! │ /photos      │──▶ Ingestor ─▶ cards/{slug}/ │          │ cards        │
//! │ /text-panels │             │   photos/    │          │ card_units   │
//! └──────────────┘             │   index.html │          │ gift_cards   │
//!                              └──────────────┘          └──────────────┘
//! ┌──────────────┐                    ▲                         ▲
//! │ /preview     │                    │                         │
//! │ /publish     │──▶ Lifecycle ──▶ Generator                   │
//! │ /payment-... │    Controller ───────────────────────────────┘
//! └──────────────┘        ▲
//! ┌──────────────┐        │
//! │ /internal/   │──▶ Retry Scheduler
//! │ retry-publish│
//! └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod model;
pub mod object_store;
pub mod pg_repository;
pub mod photo_ingest;
pub mod repository;
pub mod retry;
pub mod s3_store;
pub mod units;

#[cfg(test)]
mod test_support;

pub use api::{AppState, ErrorResponse};
pub use config::Config;
pub use error::{PublishError, Result};
pub use generator::ArtifactGenerator;
pub use lifecycle::{FailureRecord, LifecycleController, PaymentOutcome};
pub use model::{Card, CardSnapshot, CardStatus, GeneratedArtifact, RenderableUnit, UnitContent};
pub use object_store::{LocalObjectStore, ObjectStore};
pub use pg_repository::PgCardRepository;
pub use photo_ingest::{NormalizedPhoto, PhotoIngestor};
pub use repository::{CardRepository, InMemoryCardRepository};
pub use retry::{RetryBatchReport, RetryPolicy, RetryScheduler};
pub use s3_store::S3ObjectStore;
pub use units::{CardEditor, PhotoUpload};
