//! Domain error taxonomy and the standard response envelope.
//!
//! Every public operation returns `Result<T, EngineError>`; the facade folds
//! that into [`ResponseEnvelope`] so callers always see `{ok, data?, error?}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PoolExhausted,
    DbTransient,
    DbPermanent,
    SqlError,
    LlmUnavailable,
    LlmProtocol,
    PlanInfeasible,
    ExecutionBlocked,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::DbTransient => "DB_TRANSIENT",
            ErrorKind::DbPermanent => "DB_PERMANENT",
            ErrorKind::SqlError => "SQL_ERROR",
            ErrorKind::LlmUnavailable => "LLM_UNAVAILABLE",
            ErrorKind::LlmProtocol => "LLM_PROTOCOL",
            ErrorKind::PlanInfeasible => "PLAN_INFEASIBLE",
            ErrorKind::ExecutionBlocked => "EXECUTION_BLOCKED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("transient database error: {0}")]
    DbTransient(String),
    #[error("database error: {0}")]
    DbPermanent(String),
    #[error("sql error: {0}")]
    SqlError(String),
    #[error("language provider unavailable: {0}")]
    LlmUnavailable(String),
    #[error("language provider protocol error: {0}")]
    LlmProtocol(String),
    #[error("plan infeasible: {0}")]
    PlanInfeasible(String),
    #[error("execution blocked: {0}")]
    ExecutionBlocked(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            EngineError::DbTransient(_) => ErrorKind::DbTransient,
            EngineError::DbPermanent(_) => ErrorKind::DbPermanent,
            EngineError::SqlError(_) => ErrorKind::SqlError,
            EngineError::LlmUnavailable(_) => ErrorKind::LlmUnavailable,
            EngineError::LlmProtocol(_) => ErrorKind::LlmProtocol,
            EngineError::PlanInfeasible(_) => ErrorKind::PlanInfeasible,
            EngineError::ExecutionBlocked(_) => ErrorKind::ExecutionBlocked,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may retry the operation as-is.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::DbTransient(_) | EngineError::LlmUnavailable(_)
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Internal(format!("store: {e}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization: {e}"))
    }
}

/// Classify a sqlx error into the taxonomy. SQL-level failures keep the raw
/// engine message so the correction loop can feed it back to the agent.
impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => EngineError::SqlError(db.message().to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => EngineError::DbTransient(e.to_string()),
            sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => {
                EngineError::DbPermanent(e.to_string())
            }
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".to_string()),
            _ => EngineError::DbPermanent(e.to_string()),
        }
    }
}

/// Wire form of an error inside the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Standard `{ok, data?, error?}` envelope for every public operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> ResponseEnvelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &EngineError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
                retryable: err.retryable(),
                details: None,
            }),
        }
    }

    pub fn from_result(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::DbTransient("reset".into()).retryable());
        assert!(EngineError::LlmUnavailable("503".into()).retryable());
        assert!(!EngineError::SqlError("bad column".into()).retryable());
        assert!(!EngineError::PoolExhausted("full".into()).retryable());
        assert!(!EngineError::Cancelled.retryable());
    }

    #[test]
    fn envelope_shape() {
        let env = ResponseEnvelope::success(42);
        assert!(env.ok);
        assert_eq!(env.data, Some(42));
        assert!(env.error.is_none());

        let env: ResponseEnvelope<i32> =
            ResponseEnvelope::failure(&EngineError::NotFound("ds".into()));
        assert!(!env.ok);
        let body = env.error.unwrap();
        assert_eq!(body.kind, ErrorKind::NotFound);
        assert!(!body.retryable);
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let s = serde_json::to_string(&ErrorKind::PoolExhausted).unwrap();
        assert_eq!(s, "\"POOL_EXHAUSTED\"");
        assert_eq!(ErrorKind::PoolExhausted.as_str(), "POOL_EXHAUSTED");
    }
}
