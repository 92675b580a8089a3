use crate::model::CardStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the publishing core.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Card {0} not found")]
    CardNotFound(Uuid),

    #[error("No card with slug {0}")]
    SlugNotFound(String),

    #[error("Unit {0} not found")]
    UnitNotFound(Uuid),

    #[error("Card has no photos or text panels to render")]
    NotRenderable,

    #[error("{message}")]
    UnsupportedFormat {
        message: String,
        /// The upload was recognised as a container the decoder cannot read (HEIC/HEIF)
        restricted_format: bool,
    },

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Automatic publishing stopped after {attempts} attempts")]
    RetryCapExceeded { attempts: u32 },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Card is {actual}, expected one of {expected:?}")]
    InvalidStatus {
        actual: CardStatus,
        expected: Vec<CardStatus>,
    },

    #[error("Card already holds the maximum of {max} units")]
    UnitLimitReached { max: usize },

    #[error("Reorder must list every unit of the card exactly once")]
    InvalidReorder,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Repository error: {0:#}")]
    Repository(#[from] anyhow::Error),
}

impl PublishError {
    /// Stable machine-readable code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::CardNotFound(_) => "CARD_NOT_FOUND",
            PublishError::SlugNotFound(_) => "CARD_NOT_FOUND",
            PublishError::UnitNotFound(_) => "UNIT_NOT_FOUND",
            PublishError::NotRenderable => "NOT_RENDERABLE",
            PublishError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            PublishError::StorageWriteFailed(_) => "STORAGE_WRITE_FAILED",
            PublishError::GenerationFailed(_) => "GENERATION_FAILED",
            PublishError::RetryCapExceeded { .. } => "RETRY_CAP_EXCEEDED",
            PublishError::Unauthorized => "UNAUTHORIZED",
            PublishError::InvalidStatus { .. } => "INVALID_STATUS",
            PublishError::UnitLimitReached { .. } => "UNIT_LIMIT_REACHED",
            PublishError::InvalidReorder => "INVALID_REORDER",
            PublishError::InvalidInput(_) => "INVALID_INPUT",
            PublishError::Repository(_) => "REPOSITORY_ERROR",
        }
    }
}

pub type Result<T, E = PublishError> = std::result::Result<T, E>;
