//! HTTP endpoints around the chat core: history, contact form, logs, health.

use std::sync::LazyLock;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use regex::Regex;
use relay_core::{ChatSession, ContactQuery, QueryId, SessionId};
use relay_telemetry::{LogQuery, LogRecord};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::error::ChatError;
use crate::server::AppState;

pub const CONTACT_ACK: &str = "Thanks! A consultant will reach out via email.";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+@\S+\.\S+").unwrap());

/// Plain-text error responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::SessionNotFound(id) => Self::NotFound(format!("session {id} not found")),
            other => {
                error!(error = %other, "request failed");
                Self::Internal("Database error".into())
            }
        }
    }
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<ChatSession>>, ApiError> {
    Ok(Json(state.service.find_all().await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>, ApiError> {
    let id = SessionId::from_raw(id);
    match state.service.find(&id).await? {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::NotFound(format!("session {id} not found"))),
    }
}

pub async fn list_queries(State(state): State<AppState>) -> Result<Json<Vec<ContactQuery>>, ApiError> {
    let repo = state.queries.clone();
    let queries = tokio::task::spawn_blocking(move || repo.list())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| {
            error!(error = %e, "failed to list queries");
            ApiError::Internal("Database error".into())
        })?;
    Ok(Json(queries))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    pub query: String,
}

impl ContactForm {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.is_empty() || self.email.is_empty() || self.query.is_empty() {
            return Err(ApiError::BadRequest("All fields required".into()));
        }
        if !EMAIL_RE.is_match(&self.email) {
            return Err(ApiError::BadRequest("Invalid email format".into()));
        }
        Ok(())
    }
}

pub async fn submit_contact(
    State(state): State<AppState>,
    body: Result<Json<ContactForm>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(form) = body.map_err(|_| ApiError::BadRequest("Invalid request body".into()))?;
    form.validate()?;

    let query = ContactQuery {
        id: QueryId::new(),
        name: form.name,
        email: form.email,
        query: form.query,
        created_at: Utc::now(),
    };
    let query_id = query.id.clone();
    let repo = state.queries.clone();
    tokio::task::spawn_blocking(move || repo.insert(&query))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| {
            error!(error = %e, "failed to store contact query");
            ApiError::Internal("Database error".into())
        })?;

    info!(query_id = %query_id, "contact query stored");
    Ok(Json(json!({ "message": CONTACT_ACK })))
}

pub async fn query_logs(
    State(state): State<AppState>,
    Query(q): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let sink = state
        .log_sink
        .clone()
        .ok_or_else(|| ApiError::Unavailable("log persistence is disabled".into()))?;
    let records = tokio::task::spawn_blocking(move || sink.query(&q))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(records))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "connections": state.hub.count(),
    }))
}
