//! Bearer-token middleware.
//!
//! Every route is authenticated except the few public ones.
//! Missing or invalid credentials short-circuit with 401 and a
//! `WWW-Authenticate` challenge pointing at the protected-resource
//! metadata; a valid token whose subject was rejected by role policy is 403.

use std::sync::Arc;

use axum::RequestPartsExt as _;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use crate::OgwState;
use crate::auth::AuthError;
use crate::http::{HttpError, invalid_token_challenge};

/// Transport-supplied correlation id; scopes the encrypted token cache.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Routes served without credentials.
///
/// Liveness probing must work for orchestrators that hold no token, and the
/// metadata document is how a client discovers where to obtain one in the
/// first place. Everything else requires a bearer.
fn is_public(method: &Method, path: &str) -> bool {
    *method == Method::GET && matches!(path, "/health" | "/.well-known/oauth-protected-resource")
}

pub async fn auth_middleware(
    State(state): State<OgwState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, HttpError> {
    if is_public(request.method(), request.uri().path()) {
        trace!("unauthenticated route");
        return Ok(next.run(request).await);
    }

    let conf = state.conf_handle.get_conf();
    let metadata_url = conf.resource_metadata_url();

    let (mut parts, body) = request.into_parts();

    let bearer = match parts.extract::<TypedHeader<Authorization<Bearer>>>().await {
        Ok(header) => header,
        Err(_) => {
            return Err(HttpError::unauthorized()
                .challenge(invalid_token_challenge("missing bearer token", &metadata_url))
                .msg("authorization header invalid or missing"));
        }
    };

    let session_id = parts
        .headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok());

    let session = match state.auth.authenticate(bearer.token(), session_id).await {
        Ok(session) => session,
        Err(error @ AuthError::Rejected) => {
            return Err(HttpError::forbidden().because(error));
        }
        Err(AuthError::Token(error)) => {
            let challenge = invalid_token_challenge(error.code(), &metadata_url);
            return Err(HttpError::unauthorized().challenge(challenge).because(error));
        }
    };

    // Defence in depth: the service already refused rejected subjects, but a
    // role revoked between requests must never keep working.
    if session.rejected {
        return Err(HttpError::forbidden().msg("subject was rejected by role policy"));
    }

    let mut request = Request::from_parts(parts, body);

    request.extensions_mut().insert(Arc::clone(&session));

    Ok(next.run(request).await)
}
