use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Flags the browser app reacts to (login modal, provider picker, paywall).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiHint {
    OpenLogin,
    OpenSelectProvider,
    OpenPaywall,
}

impl UiHint {
    fn key(self) -> &'static str {
        match self {
            UiHint::OpenLogin => "openLogin",
            UiHint::OpenSelectProvider => "openSelectProvider",
            UiHint::OpenPaywall => "openPaywall",
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Rejected {
        status: StatusCode,
        message: String,
        hint: UiHint,
    },

    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AppError::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn rejected(status: StatusCode, hint: UiHint, msg: impl Into<String>) -> Self {
        AppError::Rejected {
            status,
            message: msg.into(),
            hint,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Rejected { status, .. } => *status,
            AppError::NotConfigured(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let mut body = json!({
            "ok": false,
            "error": message,
            "message": message,
        });
        if let AppError::Rejected { hint, .. } = &self {
            body[hint.key()] = json!(true);
        }
        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Upstream(e.to_string())
    }
}

impl From<sled::Error> for AppError {
    fn from(e: sled::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_errors_carry_their_ui_hint() {
        let err = AppError::rejected(
            StatusCode::TOO_MANY_REQUESTS,
            UiHint::OpenLogin,
            "Log In to continue using the service",
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["openLogin"], true);
        assert_eq!(body["message"], "Log In to continue using the service");
    }

    #[test]
    fn missing_configuration_is_a_server_error() {
        let err = AppError::NotConfigured("DeepSeek API key");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "DeepSeek API key not configured");
    }
}
