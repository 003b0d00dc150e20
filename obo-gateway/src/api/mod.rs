pub mod diagnostics;
pub mod health;
pub mod metadata;

pub fn make_router<S>(state: crate::OgwState) -> axum::Router<S> {
    axum::Router::new()
        .route("/health", axum::routing::get(health::get_health))
        .route(
            "/.well-known/oauth-protected-resource",
            axum::routing::get(metadata::get_resource_metadata),
        )
        .route("/diagnostics/cache", axum::routing::get(diagnostics::get_cache_metrics))
        .with_state(state)
}
