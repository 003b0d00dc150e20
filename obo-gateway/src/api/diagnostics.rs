use axum::Json;
use axum::extract::State;

use crate::OgwState;
use crate::authorize::require_any_role;
use crate::cache::CacheMetrics;
use crate::extract::CurrentSession;
use crate::http::HttpError;
use crate::role::Role;

/// Delegation-cache counters; admin only.
pub(super) async fn get_cache_metrics(
    State(state): State<OgwState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<CacheMetrics>, HttpError> {
    if require_any_role(&session, &[Role::Admin]).is_err() {
        return Err(HttpError::forbidden().msg("admin role required"));
    }

    Ok(Json(state.cache.metrics()))
}
