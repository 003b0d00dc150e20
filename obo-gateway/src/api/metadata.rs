//! Protected-resource metadata document (RFC 9728).
//!
//! Served at `/.well-known/oauth-protected-resource`; this is how clients
//! discover which authorization servers can issue tokens for this resource.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::State;

use crate::OgwState;

#[derive(Debug, Serialize)]
pub(crate) struct ResourceMetadata {
    resource: String,
    authorization_servers: Vec<String>,
    bearer_methods_supported: Vec<&'static str>,
    resource_signing_alg_values_supported: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    scopes_supported: Vec<String>,
}

pub(super) async fn get_resource_metadata(State(state): State<OgwState>) -> Json<ResourceMetadata> {
    let conf = state.conf_handle.get_conf();

    let authorization_servers = conf.idps.iter().map(|idp| idp.issuer.to_string()).collect();

    let algorithms: BTreeSet<&'static str> = conf
        .idps
        .iter()
        .flat_map(|idp| idp.algorithms.iter().map(|alg| alg.as_str()))
        .collect();

    Json(ResourceMetadata {
        resource: conf.resource.to_string(),
        authorization_servers,
        bearer_methods_supported: vec!["header"],
        resource_signing_alg_values_supported: algorithms.into_iter().collect(),
        scopes_supported: conf.scopes_supported.clone(),
    })
}
