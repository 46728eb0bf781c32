//! Axum Handlers for the REST API
//!
//! Both endpoints forward to OpenAI with the server API key and relay the
//! upstream JSON unchanged on success.

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::state::AppState;

pub enum ApiError {
    BadRequest(String),
    MissingApiKey,
    /// The upstream answered with a non-success status.
    UpstreamStatus(StatusCode),
    Upstream(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::MissingApiKey => {
                error!("OPENAI_API_KEY environment variable is not set");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "API key not configured" })),
                )
                    .into_response()
            }
            ApiError::UpstreamStatus(status) => (
                status,
                Json(json!({ "error": "failed", "status": status.as_u16() })),
            )
                .into_response(),
            ApiError::Upstream(err) => {
                error!("Upstream request failed: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed", "details": format!("{err:#}") })),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Upstream(err.into())
    }
}

fn api_key(state: &AppState) -> Result<&str, ApiError> {
    state
        .config
        .openai_api_key
        .as_deref()
        .ok_or(ApiError::MissingApiKey)
}

/// True for Responses requests asking for JSON-schema structured output.
pub fn is_structured(body: &Value) -> bool {
    body.pointer("/text/format/type").and_then(Value::as_str) == Some("json_schema")
}

/// Mint an ephemeral realtime key for one client connection.
#[instrument(skip_all)]
pub async fn create_session(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let api_key = api_key(&state)?;
    let model = &state.config.realtime_model;

    let response = state
        .http
        .post(state.upstream_url("realtime/sessions"))
        .bearer_auth(api_key)
        .json(&json!({ "model": model }))
        .send()
        .await
        .context("Realtime session request failed")?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Upstream(anyhow::anyhow!(
            "Realtime session endpoint returned status {}",
            status.as_u16()
        )));
    }
    let body: Value = response
        .json()
        .await
        .context("Realtime session response was not valid JSON")?;

    info!(%model, "Ephemeral realtime session created");
    Ok(Json(body))
}

/// Proxy a Responses API request. Streaming is always disabled.
#[instrument(skip_all)]
pub async fn proxy_response(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let api_key = api_key(&state)?;
    let Some(fields) = body.as_object_mut() else {
        return Err(ApiError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };
    fields.insert("stream".to_string(), Value::Bool(false));

    let structured = is_structured(&body);
    debug!(
        structured,
        model = ?body.get("model"),
        "Proxying Responses request"
    );

    let result = state
        .http
        .post(state.upstream_url("responses"))
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await;
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            error!(
                body = %serde_json::to_string_pretty(&body).unwrap_or_default(),
                "responses proxy error"
            );
            return Err(ApiError::Upstream(e.into()));
        }
    };

    let status = response.status();
    if !status.is_success() {
        error!(status = status.as_u16(), structured, "Responses API returned an error");
        let status =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Err(ApiError::UpstreamStatus(status));
    }

    let parsed: Value = response
        .json()
        .await
        .context("Responses API returned invalid JSON")?;
    Ok(Json(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_requests_are_detected() {
        assert!(is_structured(&json!({
            "text": { "format": { "type": "json_schema", "name": "map" } }
        })));
        assert!(!is_structured(&json!({ "text": { "format": { "type": "text" } } })));
        assert!(!is_structured(&json!({ "input": "hi" })));
    }

    #[test]
    fn missing_key_maps_to_500() {
        let response = ApiError::MissingApiKey.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = ApiError::UpstreamStatus(StatusCode::TOO_MANY_REQUESTS).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
