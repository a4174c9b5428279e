//! Error types for the Foreman API
//!
//! Every failing request returns `{"error": {kind, message, task_id?,
//! expected_version?, current_version?}}` with the HTTP status implied by the
//! kind: 400 validation, 401 token, 404 missing, 409 version or
//! illegal-transition, 412 precondition, 503 store/queue unavailable.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use foreman_core::{
    ForemanError, QueueError, RegistryError, StoreError, TaskId, TransitionError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error kinds surfaced by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // 400
    ValidationFailed,
    InvalidInput,
    MissingField,

    // 401
    Unauthorized,
    TokenAlreadyUsed,
    TokenExpired,
    TokenRevoked,

    // 404
    EntityNotFound,

    // 409
    VersionConflict,
    IllegalTransition,
    StateConflict,
    ProjectNotReady,

    // 412
    DependencyNotSatisfied,
    MissingPrerequisite,

    // 5xx
    StoreUnavailable,
    QueueUnavailable,
    InternalError,
}

impl ErrorCode {
    /// The HTTP status code for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed | ErrorCode::InvalidInput | ErrorCode::MissingField => {
                StatusCode::BAD_REQUEST
            }

            ErrorCode::Unauthorized
            | ErrorCode::TokenAlreadyUsed
            | ErrorCode::TokenExpired
            | ErrorCode::TokenRevoked => StatusCode::UNAUTHORIZED,

            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            ErrorCode::VersionConflict
            | ErrorCode::IllegalTransition
            | ErrorCode::StateConflict
            | ErrorCode::ProjectNotReady => StatusCode::CONFLICT,

            ErrorCode::DependencyNotSatisfied | ErrorCode::MissingPrerequisite => {
                StatusCode::PRECONDITION_FAILED
            }

            ErrorCode::StoreUnavailable | ErrorCode::QueueUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR
// ============================================================================

/// Structured error returned by every failing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[derive(utoipa::ToSchema)]
pub struct ApiError {
    pub kind: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<i64>,
}

/// Wire envelope: `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(utoipa::ToSchema)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}

impl ApiError {
    pub fn new(kind: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            task_id: None,
            expected_version: None,
            current_version: None,
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_versions(mut self, expected: i64, current: i64) -> Self {
        self.expected_version = Some(expected);
        self.current_version = Some(current);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} {} not found", entity, id),
        )
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    pub fn project_not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProjectNotReady, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorEnvelope { error: self })).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM DOMAIN ERRORS
// ============================================================================

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::IllegalTransition { task_id, from, to } => Self::new(
                ErrorCode::IllegalTransition,
                format!("Illegal transition {} -> {}", from, to),
            )
            .with_task(task_id),
            TransitionError::VersionConflict {
                task_id,
                expected,
                actual,
            } => Self::new(
                ErrorCode::VersionConflict,
                format!("Expected version {}, found {}", expected, actual),
            )
            .with_task(task_id)
            .with_versions(expected, actual),
            TransitionError::DependencyNotSatisfied { task_id, unmet } => Self::new(
                ErrorCode::DependencyNotSatisfied,
                format!("{} dependencies are not done", unmet.len()),
            )
            .with_task(task_id),
            TransitionError::MissingPrerequisite {
                task_id,
                to,
                requirement,
            } => Self::new(
                ErrorCode::MissingPrerequisite,
                format!("Entering {} requires {}", to, requirement),
            )
            .with_task(task_id),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { reason } => {
                tracing::error!(reason = %reason, "Store unavailable");
                Self::new(ErrorCode::StoreUnavailable, "Store temporarily unavailable")
            }
            StoreError::VersionConflict { expected, actual } => Self::new(
                ErrorCode::VersionConflict,
                format!("Expected version {}, found {}", expected, actual),
            )
            .with_versions(expected, actual),
            StoreError::NotFound { entity, id } => Self::not_found(entity, id),
            StoreError::Constraint { reason } => Self::validation_failed(reason),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Unavailable { reason } => {
                tracing::error!(reason = %reason, "Queue unavailable");
                Self::new(ErrorCode::QueueUnavailable, "Queue temporarily unavailable")
            }
            other => Self::internal_error(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownToken => {
                Self::new(ErrorCode::Unauthorized, "Registration token not recognized")
            }
            RegistryError::TokenAlreadyUsed => {
                Self::new(ErrorCode::TokenAlreadyUsed, "Registration token already used")
            }
            RegistryError::TokenExpired => {
                Self::new(ErrorCode::TokenExpired, "Registration token expired")
            }
            RegistryError::TokenRevoked => {
                Self::new(ErrorCode::TokenRevoked, "Registration token revoked")
            }
            RegistryError::WorkerNotFound(id) => Self::not_found("worker", id),
            RegistryError::InvalidSecret => {
                Self::unauthorized("Worker secret does not match")
            }
            RegistryError::WorkerBusy(id) => Self::state_conflict(format!(
                "Worker {} is executing a task; pass force=true to remove anyway",
                id
            )),
            RegistryError::NoEligibleWorker => {
                Self::state_conflict("No idle worker satisfies the required capabilities")
            }
        }
    }
}

impl From<ForemanError> for ApiError {
    fn from(err: ForemanError) -> Self {
        match err {
            ForemanError::Transition(e) => e.into(),
            ForemanError::Store(e) => e.into(),
            ForemanError::Queue(e) => e.into(),
            ForemanError::Registry(e) => e.into(),
        }
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
