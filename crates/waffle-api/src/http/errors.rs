//! RFC9457-style API error wrapper.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use waffle_config::ConfigError;

use crate::http::constants::{
    PROBLEM_BAD_REQUEST, PROBLEM_CONFIG_INVALID, PROBLEM_CONTENT_TYPE, PROBLEM_INTERNAL,
    PROBLEM_UNSUPPORTED_MEDIA,
};

/// Problem document returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    /// URI reference identifying the problem type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Short, human-readable summary of the issue.
    pub title: String,
    /// HTTP status code associated with the error.
    pub status: u16,
    /// Detailed diagnostic message when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Parameters that failed validation, if applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_params: Option<Vec<ProblemInvalidParam>>,
}

/// Invalid parameter pointer surfaced alongside a [`ProblemDetails`] payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemInvalidParam {
    /// JSON Pointer to the offending field.
    pub pointer: String,
    /// Explanation of the validation failure.
    pub message: String,
}

/// Structured API error with optional RFC9457 fields.
#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) kind: &'static str,
    title: &'static str,
    detail: Option<String>,
    invalid_params: Option<Vec<ProblemInvalidParam>>,
}

impl ApiError {
    const fn new(status: StatusCode, kind: &'static str, title: &'static str) -> Self {
        Self {
            status,
            kind,
            title,
            detail: None,
            invalid_params: None,
        }
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn with_invalid_params(mut self, params: Vec<ProblemInvalidParam>) -> Self {
        self.invalid_params = Some(params);
        self
    }

    pub(crate) fn internal(message: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            PROBLEM_INTERNAL,
            "internal server error",
        )
        .with_detail(message)
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, PROBLEM_BAD_REQUEST, "bad request").with_detail(message)
    }

    pub(crate) fn config_invalid(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            PROBLEM_CONFIG_INVALID,
            "configuration invalid",
        )
        .with_detail(detail)
    }

    pub(crate) fn unsupported_media(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PROBLEM_UNSUPPORTED_MEDIA,
            "unsupported media type",
        )
        .with_detail(detail)
    }
}

impl From<ConfigError> for ApiError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::InvalidValue { key, kind, value } => {
                Self::bad_request("value does not match the declared type")
                    .with_invalid_params(vec![ProblemInvalidParam {
                        pointer: format!("/{key}"),
                        message: format!("expected {kind}, got {value:?}"),
                    }])
            }
            ConfigError::UnknownType { .. }
            | ConfigError::InvalidSchema { .. }
            | ConfigError::SchemaDocument { .. }
            | ConfigError::InvalidSetting { .. } => Self::config_invalid(error.to_string()),
            ConfigError::Codec { .. } | ConfigError::Store { .. } | ConfigError::Sync { .. } => {
                Self::internal("configuration backend unavailable")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemDetails {
            kind: self.kind.to_string(),
            title: self.title.to_string(),
            status: self.status.as_u16(),
            detail: self.detail,
            invalid_params: self.invalid_params,
        };
        let mut response = (self.status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(PROBLEM_CONTENT_TYPE));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waffle_config::ConfigType;

    #[test]
    fn invalid_values_become_bad_requests_with_pointers() {
        let error = ApiError::from(ConfigError::InvalidValue {
            key: "MAX_USERS".to_string(),
            kind: ConfigType::Int,
            value: "ten".to_string(),
        });
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.kind, PROBLEM_BAD_REQUEST);
        let params = error.invalid_params.expect("params");
        assert_eq!(params[0].pointer, "/MAX_USERS");
        assert_eq!(params[0].message, "expected int, got \"ten\"");
    }

    #[test]
    fn setting_errors_map_to_config_invalid() {
        let error = ApiError::from(ConfigError::InvalidSetting {
            field: "WAFFLE_WATCHER_TYPE",
            value: Some("carrier-pigeon".to_string()),
            reason: "unsupported watcher type",
        });
        assert_eq!(error.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error.detail.as_deref(), Some("invalid waffle setting"));
    }

    #[test]
    fn responses_use_problem_content_type() {
        let response = ApiError::internal("boom").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some(PROBLEM_CONTENT_TYPE)
        );
    }
}
