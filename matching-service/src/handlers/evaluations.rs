use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::AnchorRef;
use crate::startup::AppState;
use crate::workers::{enqueue, EvaluationJob};

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub team_id: Uuid,
    #[serde(default)]
    pub transaction_id: Option<Uuid>,
    #[serde(default)]
    pub document_id: Option<Uuid>,
}

impl EvaluateRequest {
    fn anchor(&self) -> Result<AnchorRef, AppError> {
        match (self.transaction_id, self.document_id) {
            (Some(id), None) => Ok(AnchorRef::Transaction(id)),
            (None, Some(id)) => Ok(AnchorRef::Document(id)),
            _ => Err(AppError::BadRequest(anyhow::anyhow!(
                "Exactly one of transaction_id or document_id is required"
            ))),
        }
    }
}

/// Queue an evaluation for the given anchor. The evaluation itself runs
/// on the worker pool; a full queue is reported so the caller can retry.
pub async fn request_evaluation(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let anchor = request.anchor()?;
    enqueue(&state.jobs, EvaluationJob::new(request.team_id, anchor))?;

    tracing::info!(
        team_id = %request.team_id,
        anchor = %anchor,
        "Evaluation queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "queued": true,
            "anchor": anchor,
        })),
    ))
}

/// List recent match decisions for a team, newest first.
pub async fn list_decisions(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let decisions = state.store.decisions_for_team(team_id).await?;
    Ok(Json(decisions))
}
