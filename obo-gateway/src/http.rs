//! HTTP error responses.

use core::fmt;
use core::panic::Location;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Error terminating request processing.
///
/// Carries the status, an optional static message, an optional
/// `WWW-Authenticate` challenge, and the underlying error chain. The
/// construction site is captured so log lines point at the failing handler
/// rather than at this module. The response body stays empty: detail
/// belongs in logs and the audit trail, never on the wire.
pub struct HttpError {
    pub status: StatusCode,
    pub location: &'static Location<'static>,
    pub message: Option<&'static str>,
    pub www_authenticate: Option<String>,
    pub cause: Option<anyhow::Error>,
}

impl HttpError {
    #[track_caller]
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            location: Location::caller(),
            message: None,
            www_authenticate: None,
            cause: None,
        }
    }

    #[track_caller]
    pub fn bad_request() -> Self {
        Self::with_status(StatusCode::BAD_REQUEST)
    }

    #[track_caller]
    pub fn unauthorized() -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED)
    }

    #[track_caller]
    pub fn forbidden() -> Self {
        Self::with_status(StatusCode::FORBIDDEN)
    }

    #[track_caller]
    pub fn not_found() -> Self {
        Self::with_status(StatusCode::NOT_FOUND)
    }

    #[track_caller]
    pub fn bad_gateway() -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY)
    }

    #[track_caller]
    pub fn internal() -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    #[must_use]
    pub fn msg(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }

    /// Attaches a `WWW-Authenticate` challenge to the response.
    #[must_use]
    pub fn challenge(mut self, challenge: String) -> Self {
        self.www_authenticate = Some(challenge);
        self
    }

    /// Records the underlying error. Rendered into the log line only.
    #[must_use]
    pub fn because(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// `Bearer` challenge for missing or invalid tokens (RFC 6750 §3), pointing
/// clients at the protected-resource metadata document (RFC 9728).
pub fn invalid_token_challenge(description: &str, resource_metadata: &str) -> String {
    format!(
        "Bearer error=\"invalid_token\", error_description=\"{}\", resource_metadata=\"{}\"",
        sanitize_quoted(description),
        sanitize_quoted(resource_metadata),
    )
}

fn sanitize_quoted(value: &str) -> String {
    value.chars().filter(|c| *c != '"' && *c != '\\' && !c.is_control()).collect()
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;

        if let Some(message) = self.message {
            write!(f, ": {message}")?;
        }

        if let Some(cause) = &self.cause {
            // Alternate formatting renders the whole context chain.
            write!(f, ": {cause:#}")?;
        }

        write!(f, " (at {})", self.location)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        // Client mistakes (bad tokens, missing scopes) are routine; only
        // 5xx responses indicate something wrong on our side.
        if self.status.is_server_error() {
            error!(error = %self);
        } else {
            warn!(error = %self);
        }

        let mut response = self.status.into_response();

        if let Some(challenge) = &self.www_authenticate
            && let Ok(value) = HeaderValue::from_str(challenge)
        {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_quoted_and_sanitised() {
        let challenge = invalid_token_challenge(
            "token \"expired\"\r\n",
            "https://gw.example.com/.well-known/oauth-protected-resource",
        );

        assert_eq!(
            challenge,
            "Bearer error=\"invalid_token\", error_description=\"token expired\", resource_metadata=\"https://gw.example.com/.well-known/oauth-protected-resource\"",
        );
    }

    #[test]
    fn response_carries_the_challenge_header() {
        let error = HttpError::unauthorized()
            .challenge(invalid_token_challenge("missing bearer token", "https://gw/.well-known/x"))
            .msg("authorization header missing");

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn display_renders_the_cause_chain() {
        let cause = anyhow::anyhow!("connection refused").context("failed to reach the IdP");
        let error = HttpError::bad_gateway().msg("token exchange failed").because(cause);

        let rendered = error.to_string();
        assert!(rendered.contains("token exchange failed"));
        assert!(rendered.contains("failed to reach the IdP"));
        assert!(rendered.contains("connection refused"));
        assert!(rendered.contains("http.rs"));
    }
}
