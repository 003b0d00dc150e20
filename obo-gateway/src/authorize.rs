//! Two-tier authorization and the tool-execution envelope.
//!
//! Visibility is the soft tier: a tool advertises itself only to sessions
//! its predicate accepts, and the predicate can never fail. Enforcement is
//! the hard tier: handlers start with explicit guard calls, and the
//! enforcement tier never trusts the visibility tier.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use core::fmt;
use futures::FutureExt as _;
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;

use crate::audit::{AuditEntry, AuditService, AuditSource};
use crate::delegation::{self, DelegationResult};
use crate::role::Role;
use crate::session::UserSession;

// ----- error codes ----- //

/// Closed union of failure codes carried by the response envelope. Modules
/// may surface their own codes through the `Custom` arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthenticated,
    InsufficientPermissions,
    InsufficientScope,
    InvalidInput,
    DelegationFailed,
    ModuleNotAvailable,
    InternalError,
    Custom(SmolStr),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::InsufficientScope => "INSUFFICIENT_SCOPE",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::DelegationFailed => "DELEGATION_FAILED",
            ErrorCode::ModuleNotAvailable => "MODULE_NOT_AVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Custom(code) => code.as_str(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl serde::Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

// ----- enforcement guards ----- //

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct AuthorizationError {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

pub fn require_auth(session: Option<&Arc<UserSession>>) -> Result<Arc<UserSession>, AuthorizationError> {
    match session {
        Some(session) if !session.rejected => Ok(Arc::clone(session)),
        Some(_) => Err(AuthorizationError {
            status: 403,
            code: ErrorCode::InsufficientPermissions,
            message: "subject was rejected by role policy".to_owned(),
            detail: None,
        }),
        None => Err(AuthorizationError {
            status: 401,
            code: ErrorCode::Unauthenticated,
            message: "authentication is required".to_owned(),
            detail: None,
        }),
    }
}

pub fn require_any_role(session: &UserSession, roles: &[Role]) -> Result<(), AuthorizationError> {
    if roles.contains(&session.role) {
        Ok(())
    } else {
        Err(AuthorizationError {
            status: 403,
            code: ErrorCode::InsufficientPermissions,
            message: "subject role is not sufficient for this tool".to_owned(),
            detail: Some(format!("requires one of: {}", format_roles(roles))),
        })
    }
}

pub fn require_all_scopes(session: &UserSession, scopes: &[&str]) -> Result<(), AuthorizationError> {
    let missing: Vec<&str> = scopes
        .iter()
        .copied()
        .filter(|scope| !session.has_scope(scope))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AuthorizationError {
            status: 403,
            code: ErrorCode::InsufficientScope,
            message: "token is missing required scopes".to_owned(),
            detail: Some(format!("missing: {}", missing.join(" "))),
        })
    }
}

fn format_roles(roles: &[Role]) -> String {
    roles.iter().map(|role| Role::as_str(*role)).collect::<Vec<_>>().join(", ")
}

/// `WWW-Authenticate` challenge for a scope failure raised inside a handler
/// (HTTP 403 semantics).
pub fn insufficient_scope_challenge(scopes: &[&str]) -> String {
    format!("Bearer error=\"insufficient_scope\", scope=\"{}\"", scopes.join(" "))
}

// ----- response envelope ----- //

/// The standard tool response shape.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T = Value> {
    Success { data: T },
    Failure { code: ErrorCode, message: String },
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Envelope::Success { data }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Envelope::Failure {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }
}

impl Envelope<Value> {
    /// Folds a delegation outcome into the envelope, mapping the registry's
    /// routing codes onto the closed union and passing module-declared codes
    /// through.
    pub fn from_delegation(result: DelegationResult) -> Self {
        if result.success {
            return Envelope::Success {
                data: result.data.unwrap_or(Value::Null),
            };
        }

        let code = match result.error.as_deref() {
            Some(delegation::MODULE_NOT_FOUND | delegation::MODULE_NOT_INITIALIZED) => ErrorCode::ModuleNotAvailable,
            Some(delegation::DELEGATION_ERROR) => ErrorCode::DelegationFailed,
            Some(code) if code.starts_with("TOKEN_EXCHANGE_") => ErrorCode::DelegationFailed,
            Some("INVALID_INPUT") => ErrorCode::InvalidInput,
            Some(custom) => ErrorCode::Custom(SmolStr::new(custom)),
            None => ErrorCode::DelegationFailed,
        };

        let message = match &code {
            ErrorCode::ModuleNotAvailable => "delegation module is not available".to_owned(),
            ErrorCode::DelegationFailed => "delegated operation failed".to_owned(),
            ErrorCode::InvalidInput => "invalid tool parameters".to_owned(),
            other => format!("delegated operation failed ({other})"),
        };

        Envelope::Failure { code, message }
    }
}

// ----- tool registration ----- //

pub type ToolHandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;
pub type ToolHandler = dyn Fn(Arc<UserSession>, Value) -> ToolHandlerFuture + Send + Sync;
type VisibilityPredicate = dyn Fn(&UserSession) -> bool + Send + Sync;

/// Errors a tool handler may bubble with `?`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct ToolRegistration {
    name: String,
    description: String,
    visible_to: Box<VisibilityPredicate>,
    handler: Box<ToolHandler>,
}

impl ToolRegistration {
    pub fn new<V, H, F>(name: impl Into<String>, description: impl Into<String>, visible_to: V, handler: H) -> Self
    where
        V: Fn(&UserSession) -> bool + Send + Sync + 'static,
        H: Fn(Arc<UserSession>, Value) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            visible_to: Box::new(visible_to),
            handler: Box::new(move |session, params| Box::pin(handler(session, params))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Soft tier: filters the advertised tool list. Never fails; any doubt
    /// (including a panicking predicate) reads as not visible.
    pub fn visible_to(&self, session: &UserSession) -> bool {
        if session.rejected {
            return false;
        }

        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.visible_to)(session))).unwrap_or(false)
    }

    /// Hard tier: runs the handler and folds every failure into the
    /// envelope. Authorization errors keep their code; anything else is
    /// audited in full and surfaced as a generic `INTERNAL_ERROR`.
    pub async fn execute(&self, session: Arc<UserSession>, params: Value, audit: &AuditService) -> Envelope {
        let user_id = session.user_id.clone();

        let outcome = std::panic::AssertUnwindSafe((self.handler)(session, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(data)) => Envelope::Success { data },
            Ok(Err(ToolError::Authorization(error))) => Envelope::Failure {
                message: error.message.clone(),
                code: error.code,
            },
            Ok(Err(ToolError::Internal(error))) => {
                self.audit_internal_error(audit, &user_id, format!("{error:#}"));
                internal_failure()
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());

                self.audit_internal_error(audit, &user_id, format!("handler panicked: {detail}"));
                internal_failure()
            }
        }
    }

    fn audit_internal_error(&self, audit: &AuditService, user_id: &str, detail: String) {
        audit.record(
            AuditEntry::builder()
                .source(AuditSource::parse("tool:executor").expect("static tag"))
                .user_id(user_id)
                .action(format!("tool:{}", self.name))
                .success(false)
                .error(detail)
                .build(),
        );
    }
}

/// Generic failure that leaks no internal detail to the client.
fn internal_failure() -> Envelope {
    Envelope::Failure {
        code: ErrorCode::InternalError,
        message: "an internal error occurred".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditQuery};
    use crate::role::RoleDecision;
    use crate::session::{ClaimMappings, SessionManager};

    fn session_with(role: Role, scopes: &str, rejected: bool) -> Arc<UserSession> {
        let payload = serde_json::json!({ "sub": "u1", "scope": scopes })
            .as_object()
            .expect("object literal")
            .clone();

        SessionManager::create_session(
            &payload,
            RoleDecision {
                primary: role,
                custom_roles: Default::default(),
                rejected,
            },
            "a.b.c",
            &ClaimMappings::default(),
            None,
        )
    }

    #[test]
    fn require_auth_distinguishes_missing_and_rejected() {
        assert_eq!(require_auth(None).expect_err("missing").status, 401);

        let rejected = session_with(Role::Unassigned, "", true);
        assert_eq!(require_auth(Some(&rejected)).expect_err("rejected").status, 403);

        let accepted = session_with(Role::User, "tools:read", false);
        require_auth(Some(&accepted)).expect("authenticated");
    }

    #[test]
    fn role_and_scope_guards() {
        let session = session_with(Role::User, "tools:read tools:write", false);

        require_any_role(&session, &[Role::Admin, Role::User]).expect("user is listed");
        let error = require_any_role(&session, &[Role::Admin]).expect_err("user is not admin");
        assert_eq!(error.code, ErrorCode::InsufficientPermissions);
        assert_eq!(error.status, 403);

        require_all_scopes(&session, &["tools:read", "tools:write"]).expect("all present");
        let error = require_all_scopes(&session, &["tools:read", "tools:admin"]).expect_err("missing scope");
        assert_eq!(error.code, ErrorCode::InsufficientScope);
        assert!(error.detail.expect("detail").contains("tools:admin"));
    }

    #[test]
    fn envelope_serialises_to_the_standard_shape() {
        let success = Envelope::success(serde_json::json!([1, 2]));
        assert_eq!(
            serde_json::to_value(&success).expect("serializable"),
            serde_json::json!({ "status": "success", "data": [1, 2] })
        );

        let failure: Envelope = Envelope::failure(ErrorCode::InvalidInput, "bad params");
        assert_eq!(
            serde_json::to_value(&failure).expect("serializable"),
            serde_json::json!({ "status": "failure", "code": "INVALID_INPUT", "message": "bad params" })
        );
    }

    #[test]
    fn delegation_outcomes_fold_onto_the_closed_union() {
        use crate::audit::AuditEntry;

        let trail = || {
            AuditEntry::builder()
                .source(AuditSource::parse("delegation:registry").expect("static tag"))
                .user_id("u1")
                .action("x")
                .success(false)
                .build()
        };

        let envelope = Envelope::from_delegation(DelegationResult::failure(delegation::MODULE_NOT_FOUND, trail()));
        assert!(matches!(
            envelope,
            Envelope::Failure {
                code: ErrorCode::ModuleNotAvailable,
                ..
            }
        ));

        let envelope = Envelope::from_delegation(DelegationResult::failure("SPN_NOT_ALLOWED", trail()));
        match envelope {
            Envelope::Failure { code, .. } => assert_eq!(code.as_str(), "SPN_NOT_ALLOWED"),
            Envelope::Success { .. } => panic!("failure expected"),
        }
    }

    #[test]
    fn visibility_never_panics_and_hides_from_rejected_sessions() {
        let tool = ToolRegistration::new(
            "sql-delegate",
            "Delegated SQL",
            |_session| panic!("buggy predicate"),
            |_session, _params| async { Ok(Value::Null) },
        );

        let session = session_with(Role::User, "", false);
        assert!(!tool.visible_to(&session));

        let honest = ToolRegistration::new(
            "sql-delegate",
            "Delegated SQL",
            |session: &UserSession| session.role == Role::Admin,
            |_session, _params| async { Ok(Value::Null) },
        );

        assert!(!honest.visible_to(&session_with(Role::User, "", false)));
        assert!(honest.visible_to(&session_with(Role::Admin, "", false)));
        assert!(!honest.visible_to(&session_with(Role::Unassigned, "", true)));
    }

    #[tokio::test]
    async fn execute_converts_authorization_errors_with_their_code() {
        let audit = AuditService::new(AuditConfig::default());

        let tool = ToolRegistration::new(
            "sql-delegate",
            "Delegated SQL",
            |_| true,
            |session: Arc<UserSession>, _params| async move {
                require_any_role(&session, &[Role::Admin])?;
                Ok(Value::Null)
            },
        );

        let envelope = tool
            .execute(session_with(Role::Guest, "", false), Value::Null, &audit)
            .await;

        match envelope {
            Envelope::Failure { code, .. } => assert_eq!(code, ErrorCode::InsufficientPermissions),
            Envelope::Success { .. } => panic!("guard must fail"),
        }

        // Authorization failures are not internal errors: nothing audited here.
        assert!(audit.query(&AuditQuery::default()).is_empty());
    }

    #[tokio::test]
    async fn internal_errors_are_audited_and_sanitised() {
        let audit = AuditService::new(AuditConfig::default());

        let tool = ToolRegistration::new(
            "sql-delegate",
            "Delegated SQL",
            |_| true,
            |_session, _params| async {
                Err(ToolError::Internal(anyhow::anyhow!(
                    "connection refused: postgres://user:hunter2@db"
                )))
            },
        );

        let envelope = tool
            .execute(session_with(Role::Admin, "", false), Value::Null, &audit)
            .await;

        match envelope {
            Envelope::Failure { code, message } => {
                assert_eq!(code, ErrorCode::InternalError);
                assert!(!message.contains("hunter2"));
            }
            Envelope::Success { .. } => panic!("failure expected"),
        }

        let logged = audit.query(&AuditQuery::default());
        assert_eq!(logged.len(), 1);
        assert!(logged[0].error.as_deref().expect("detail").contains("hunter2"));
    }

    #[tokio::test]
    async fn panicking_handler_degrades_to_internal_error() {
        let audit = AuditService::new(AuditConfig::default());

        let tool = ToolRegistration::new(
            "sql-delegate",
            "Delegated SQL",
            |_| true,
            |_session, _params| async { panic!("handler bug") },
        );

        let envelope = tool
            .execute(session_with(Role::Admin, "", false), Value::Null, &audit)
            .await;

        assert!(matches!(
            envelope,
            Envelope::Failure {
                code: ErrorCode::InternalError,
                ..
            }
        ));
        assert_eq!(audit.query(&AuditQuery::default()).len(), 1);
    }

    #[test]
    fn scope_challenge_shape() {
        assert_eq!(
            insufficient_scope_challenge(&["tools:read", "tools:write"]),
            "Bearer error=\"insufficient_scope\", scope=\"tools:read tools:write\""
        );
    }
}
