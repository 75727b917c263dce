use axum::http::StatusCode;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::payment::{ErrorEnvelope, ErrorPayload};

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("blocked by risk assessment {assessment_id} (score {score:.4})")]
    RiskBlocked { assessment_id: Uuid, score: f64 },

    #[error("ledger imbalance in transaction {transaction_id}: {currency} debit - credit = {difference}")]
    LedgerImbalance {
        transaction_id: Uuid,
        currency: String,
        difference: Decimal,
    },

    #[error("idempotency key {0} was already used with a different request body")]
    IdempotencyConflict(String),

    #[error("idempotency key {0} is still being processed")]
    IdempotencyInFlight(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::StateConflict(_) => "STATE_CONFLICT",
            Self::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            Self::RiskBlocked { .. } => "RISK_BLOCKED",
            Self::LedgerImbalance { .. } => "LEDGER_IMBALANCE",
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_PAYLOAD",
            Self::IdempotencyInFlight(_) => "IDEMPOTENCY_REQUEST_IN_FLIGHT",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::StateConflict(_) => StatusCode::CONFLICT,
            Self::ExternalService(_) => StatusCode::BAD_GATEWAY,
            Self::RiskBlocked { .. } => StatusCode::FORBIDDEN,
            Self::IdempotencyConflict(_) | Self::IdempotencyInFlight(_) => StatusCode::CONFLICT,
            Self::LedgerImbalance { .. } | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            Self::RiskBlocked { assessment_id, .. } => Some(assessment_id.to_string()),
            Self::LedgerImbalance { transaction_id, .. } => Some(transaction_id.to_string()),
            _ => None,
        };
        ErrorEnvelope {
            error: ErrorPayload {
                code: self.code().to_string(),
                message: self.to_string(),
                details,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_code_and_message() {
        let err = CoreError::StateConflict("payment intent has expired".to_string());
        let env = err.envelope();
        assert_eq!(env.error.code, "STATE_CONFLICT");
        assert!(env.error.message.contains("expired"));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn storage_errors_are_server_errors() {
        let err = CoreError::from(anyhow::anyhow!("connection reset"));
        assert!(err.status_code().is_server_error());
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
