use crate::error::RagError;
use crate::rag::RagEngine;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const MISSING_FIELDS: &str = "Please provide both a URL and a question.";

/// Body of `POST /ask`
#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
}

/// Successful reply to `POST /ask`
#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
}

impl AskRequest {
    /// Both fields, or a validation error when either is absent or empty
    pub fn validate(self) -> Result<(String, String), RagError> {
        match (self.url, self.question) {
            (Some(url), Some(question)) if !url.is_empty() && !question.is_empty() => {
                Ok((url, question))
            }
            _ => Err(RagError::Validation(MISSING_FIELDS.to_string())),
        }
    }
}

/// Error body returned by the API; validation maps to 400, everything else to 500
#[derive(Debug)]
pub struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the HTTP application around a shared engine
pub fn router(engine: Arc<RagEngine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ask", post(ask))
        .with_state(engine)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn ask(
    State(engine): State<Arc<RagEngine>>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, ApiError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected /ask body: {}", rejection);
            return Err(RagError::Validation(MISSING_FIELDS.to_string()).into());
        }
    };
    let (url, question) = request.validate()?;

    info!("Question about {}: {}", url, question);

    match engine.answer(&url, &question).await {
        Ok(answer) => Ok(Json(AskResponse { answer })),
        Err(err) => {
            error!("Failed to answer question about {}: {}", url, err);
            Err(err.into())
        }
    }
}
