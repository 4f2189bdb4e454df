use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

mod health;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/webhook", post(webhook::webhook))
        .route("/health", get(health::health))
}
