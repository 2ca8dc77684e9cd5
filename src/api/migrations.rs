use crate::api::AppState;
use crate::error::AppError;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MigrationsResponse {
    pub applied: Vec<String>,
    pub count: usize,
}

/// GET /v1/migrations - names recorded in the `migrations` table.
pub async fn get_migrations(
    State(state): State<AppState>,
) -> Result<Json<MigrationsResponse>, AppError> {
    let applied = state.db.applied_migrations().await?;
    Ok(Json(MigrationsResponse {
        count: applied.len(),
        applied,
    }))
}
