//! Authentication orchestration: validate, map roles, materialise the
//! session, audit the outcome.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::audit::{AuditEntry, AuditService, AuditSource};
use crate::role::map_roles;
use crate::session::{SessionManager, UserSession, lookup_claim, string_list};
use crate::token::{JwtValidator, TokenError, TrustedIdp};

#[derive(Debug, Error)]
pub enum AuthError {
    /// Token-level failure; HTTP 401 semantics.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The token is valid but the subject was rejected by role policy;
    /// HTTP 403 semantics.
    #[error("subject is not authorized for this resource server")]
    Rejected,
}

impl AuthError {
    pub const fn code(&self) -> &'static str {
        match self {
            AuthError::Token(error) => error.code(),
            AuthError::Rejected => "AUTHENTICATION_REJECTED",
        }
    }

    pub const fn status_hint(&self) -> u16 {
        match self {
            AuthError::Token(_) => 401,
            AuthError::Rejected => 403,
        }
    }
}

pub struct AuthenticationService {
    validator: JwtValidator,
    audit: Arc<AuditService>,
}

impl AuthenticationService {
    pub fn new(validator: JwtValidator, audit: Arc<AuditService>) -> Self {
        Self { validator, audit }
    }

    pub fn validator(&self) -> &JwtValidator {
        &self.validator
    }

    /// Authenticates a bearer token into a fresh [`UserSession`].
    ///
    /// A rejected subject still materialises a session internally (the audit
    /// entry needs it), but the caller only ever sees the typed error.
    /// Middleware must additionally re-check `session.rejected` on every
    /// request: a role revoked after an earlier successful authentication
    /// must not keep working.
    pub async fn authenticate(
        &self,
        token: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<UserSession>, AuthError> {
        let validated = match self.validator.validate(token).await {
            Ok(validated) => validated,
            Err(error) => {
                self.audit_failure(&error);
                return Err(AuthError::Token(error));
            }
        };

        let idp = Arc::clone(&validated.idp);

        let raw_roles = lookup_claim(&validated.claims, &idp.claim_mappings.roles)
            .map(string_list)
            .unwrap_or_default();

        let decision = map_roles(&raw_roles, &idp.role_mappings);

        let session = SessionManager::create_session(
            &validated.claims,
            decision,
            token,
            &idp.claim_mappings,
            session_id,
        );

        self.audit.record(
            AuditEntry::builder()
                .source(AuditSource::parse("auth:service").expect("static tag"))
                .user_id(session.user_id.as_str())
                .action("authenticate")
                .success(!session.rejected)
                .metadata(authenticate_metadata(&session, &idp))
                .build(),
        );

        if session.rejected {
            Err(AuthError::Rejected)
        } else {
            Ok(session)
        }
    }

    fn audit_failure(&self, error: &TokenError) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("code".to_owned(), Value::String(error.code().to_owned()));

        self.audit.record(
            AuditEntry::builder()
                .source(AuditSource::parse("auth:service").expect("static tag"))
                .user_id("unknown")
                .action("authenticate")
                .success(false)
                .error(format!("{error:#}"))
                .metadata(metadata)
                .build(),
        );
    }
}

fn authenticate_metadata(session: &UserSession, idp: &TrustedIdp) -> serde_json::Map<String, Value> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("issuer".to_owned(), Value::String(idp.issuer.to_string()));
    metadata.insert("role".to_owned(), Value::String(session.role.to_string()));
    metadata
}
