use std::sync::Arc;

use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::HttpError;
use crate::session::UserSession;

/// The authenticated session installed by the auth middleware.
#[derive(Clone)]
pub struct CurrentSession(pub Arc<UserSession>);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Extension::<Arc<UserSession>>::from_request_parts(parts, state)
            .await
            .map_err(|e| HttpError::internal().because(e))?
            .0;
        Ok(Self(session))
    }
}
