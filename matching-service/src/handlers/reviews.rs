//! Human review endpoints: confirming, dismissing and hand-picking
//! matches, and unlinking confirmed ones.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub team_id: Uuid,
    #[serde(default)]
    pub acted_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    pub team_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub team_id: Uuid,
    pub transaction_id: Uuid,
    #[serde(default)]
    pub acted_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnlinkRequest {
    pub team_id: Uuid,
}

/// Confirm the standing suggestion on a document.
pub async fn confirm_suggestion(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, AppError> {
    let decision = state
        .commands
        .confirm_suggestion(request.team_id, document_id, request.acted_by)
        .await?;
    Ok(Json(decision))
}

/// Dismiss the standing suggestion on a document.
pub async fn dismiss_suggestion(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<DismissRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .commands
        .dismiss_suggestion(request.team_id, document_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Link a document to a transaction picked by the reviewer.
pub async fn manual_match(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<ManualMatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let decision = state
        .commands
        .manual_match(
            request.team_id,
            document_id,
            request.transaction_id,
            request.acted_by,
        )
        .await?;
    Ok(Json(decision))
}

/// Remove a confirmed link.
pub async fn unlink(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<UnlinkRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.commands.unlink(request.team_id, document_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
