pub mod agents;
pub mod health;
pub mod stream;
pub mod tasks;

use axum::Router;

use crate::{ws, AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(agents::router())
        .merge(tasks::router())
        .merge(stream::router())
        .merge(ws::dispatcher::router())
        .with_state(state)
}
