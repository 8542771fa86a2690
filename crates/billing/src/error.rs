//! Billing error types

use storefront_shared::LimitError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("No price reference configured for {plan} ({interval})")]
    MissingPriceRef { plan: String, interval: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Billing event {event_id} carries no planId metadata")]
    MissingPlanMetadata { event_id: String },

    #[error("Invalid billing event: {0}")]
    InvalidEvent(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers to decide between retry and manual reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Deploy-time defect; never retried
    Configuration,
    /// The event itself is unusable; never retried
    MalformedInput,
    /// Store unavailable or similar; the invoker should retry
    Transient,
    NotFound,
    Internal,
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::UnknownPlan(_)
            | BillingError::MissingPriceRef { .. }
            | BillingError::Config(_) => ErrorKind::Configuration,
            BillingError::MissingPlanMetadata { .. } | BillingError::InvalidEvent(_) => {
                ErrorKind::MalformedInput
            }
            BillingError::Database(_) => ErrorKind::Transient,
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<LimitError> for BillingError {
    fn from(err: LimitError) -> Self {
        BillingError::Internal(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
