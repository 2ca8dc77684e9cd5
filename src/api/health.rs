use crate::api::AppState;
use crate::error::AppError;
use axum::{extract::State, Json};

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "env": state.config.env.as_str(),
    }))
}

/// Ready once a pooled connection can run a query.
pub async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.db.ping().await?;
    Ok(Json(serde_json::json!({"status": "ready"})))
}
