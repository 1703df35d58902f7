use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    services::transport::TransportError,
    state::{
        arbiter::{ArbiterError, BuzzRejection},
        presence::PresenceError,
        session::CommandError,
    },
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Application is running in degraded mode without storage.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
    /// A buzz attempt was refused by the arbiter.
    #[error("buzz rejected: {0}")]
    Rejected(#[from] BuzzRejection),
    /// The request clashes with another client.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The broadcast transport refused the operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
    }
}

impl From<CommandError> for ServiceError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Arbiter(err) => err.into(),
            CommandError::UnknownTeam(_) | CommandError::AnswerNotFound(_) => {
                ServiceError::NotFound(err.to_string())
            }
            CommandError::EmptyQuestionRef => ServiceError::InvalidInput(err.to_string()),
            CommandError::NoActiveInstance
            | CommandError::StaleInstance(_)
            | CommandError::AlreadyAnswered(_) => ServiceError::InvalidState(err.to_string()),
        }
    }
}

impl From<ArbiterError> for ServiceError {
    fn from(err: ArbiterError) -> Self {
        ServiceError::InvalidState(err.to_string())
    }
}

impl From<PresenceError> for ServiceError {
    fn from(err: PresenceError) -> Self {
        ServiceError::Conflict(err.to_string())
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Degraded => AppError::ServiceUnavailable("degraded mode".into()),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) | ServiceError::Conflict(message) => {
                AppError::Conflict(message)
            }
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
            ServiceError::Rejected(rejection) => AppError::Conflict(rejection.to_string()),
            ServiceError::Transport(err) => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn command_errors_map_to_http_statuses() {
        let unknown: AppError = ServiceError::from(CommandError::UnknownTeam(Uuid::nil())).into();
        assert!(matches!(unknown, AppError::NotFound(_)));

        let stale: AppError = ServiceError::from(CommandError::NoActiveInstance).into();
        assert_eq!(stale.into_response().status(), StatusCode::CONFLICT);

        let degraded: AppError = ServiceError::Degraded.into();
        assert_eq!(degraded.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn device_conflict_reads_already_connected_elsewhere() {
        let err: AppError = ServiceError::from(PresenceError::DeviceConflict {
            team_id: Uuid::nil(),
            bound_device: "tablet-a".into(),
        })
        .into();
        assert!(err.to_string().contains("already connected elsewhere"));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
