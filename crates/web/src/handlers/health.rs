use axum::extract::State;
use postproc_core::AppError;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Result<&'static str, AppError> {
    state.db.ping().await?;
    Ok("ok")
}
