use crate::business_hours::BusinessHoursError;
use od_gateway::GatewayError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Never retried; surfaced verbatim
    #[error("{0}")]
    Validation(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("No queue exists for campaign {0}")]
    QueueNotFound(String),

    #[error("A queue already exists for campaign {0}")]
    QueueExists(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    BusinessHours(#[from] BusinessHoursError),

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Errors a caller should not retry without changing input
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) | Self::BusinessHours(_) | Self::QueueExists(_) => true,
            Self::Gateway(e) => e.is_validation(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CampaignNotFound(_) | Self::RecipientNotFound(_) | Self::QueueNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
