use axum::Json;
use axum::extract::State;

use crate::OgwState;

#[derive(Serialize)]
pub(crate) struct Identity {
    /// This gateway's hostname
    hostname: String,
    /// Gateway service version
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'static str>,
}

/// Performs a health check
pub(super) async fn get_health(State(OgwState { conf_handle, .. }): State<OgwState>) -> Json<Identity> {
    let conf = conf_handle.get_conf();

    Json(Identity {
        hostname: conf.hostname.clone(),
        version: Some(env!("CARGO_PKG_VERSION")),
    })
}
