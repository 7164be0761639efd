//! Editing endpoints for the live configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{FromRequest, Request, State},
    http::header::CONTENT_TYPE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use waffle_config::{ConfigResult, LiveConfig, RenderedEntry};

use crate::http::constants::{FORM_CONTENT_TYPE, JSON_CONTENT_TYPE};
use crate::http::errors::ApiError;
use crate::state::ApiState;

/// Body of `GET /waffle/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigView {
    /// Editable keys with their rendered values.
    pub entries: Vec<RenderedEntry>,
    /// Whether changes are propagated to sibling processes.
    pub multiprocess: bool,
}

/// Body of `POST /waffle/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Values that were written, keyed by name.
    pub applied: LiveConfig,
    /// Refreshed form rows.
    pub entries: Vec<RenderedEntry>,
}

/// Update payload accepted as either an urlencoded form or a JSON object.
#[derive(Debug)]
pub(crate) enum ConfigUpdate {
    /// Raw strings as posted by the editing form.
    Form(BTreeMap<String, String>),
    /// Typed values supplied by API clients.
    Json(BTreeMap<String, Value>),
}

impl<S> FromRequest<S> for ConfigUpdate
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type.starts_with(JSON_CONTENT_TYPE) {
            let Json(values) = Json::<BTreeMap<String, Value>>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
            Ok(Self::Json(values))
        } else if content_type.starts_with(FORM_CONTENT_TYPE) {
            let Form(values) = Form::<BTreeMap<String, String>>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
            Ok(Self::Form(values))
        } else {
            Err(ApiError::unsupported_media(
                "expected a form or JSON object body",
            ))
        }
    }
}

pub(crate) async fn get_config(State(state): State<Arc<ApiState>>) -> Json<ConfigView> {
    Json(ConfigView {
        entries: state.config.render().await,
        multiprocess: state.config.is_multiprocess(),
    })
}

pub(crate) async fn update_config(
    State(state): State<Arc<ApiState>>,
    update: ConfigUpdate,
) -> Result<Json<UpdateResponse>, ApiError> {
    match apply(&state, update).await {
        Ok((applied, entries)) => {
            state.telemetry.record_config_update(applied.len());
            info!(keys = applied.len(), "configuration update accepted");
            Ok(Json(UpdateResponse { applied, entries }))
        }
        Err(err) => {
            state.telemetry.inc_config_update_failure();
            warn!(error = %err, "configuration update rejected");
            Err(ApiError::from(err))
        }
    }
}

async fn apply(
    state: &ApiState,
    update: ConfigUpdate,
) -> ConfigResult<(LiveConfig, Vec<RenderedEntry>)> {
    match update {
        ConfigUpdate::Form(raw) => state.config.apply_form(raw).await,
        ConfigUpdate::Json(values) => {
            let applied = state.config.update_db(values).await?;
            Ok((applied, state.config.render().await))
        }
    }
}
