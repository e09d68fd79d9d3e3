use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::{self, SharedLog};

pub fn build_router(log: SharedLog) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/streams/{stream}", get(handlers::describe_stream))
        .route("/streams/{stream}/records", post(handlers::put_record))
        .route(
            "/streams/{stream}/shards/{shard}/iterator",
            post(handlers::shard_iterator),
        )
        .route(
            "/streams/{stream}/shards/{shard}/split",
            post(handlers::split_shard),
        )
        .route("/records", get(handlers::get_records))
        .layer(TraceLayer::new_for_http())
        .with_state(log)
}
