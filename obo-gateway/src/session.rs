//! Materialisation of validated claims into per-request sessions.
//!
//! A [`UserSession`] is created once per request, wrapped in an `Arc`, and
//! never mutated. Sessions are not persisted; the schema version and
//! [`migrate`] exist so that a session rehydrated from an external store in
//! the future can be upgraded incrementally.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::Value;

use crate::role::{Role, RoleDecision};

pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Claim carrying the original compact JWT, required for on-behalf-of
/// exchange downstream.
pub const ACCESS_TOKEN_CLAIM: &str = "access_token";

/// Per-IdP paths into the token payload for the mapped claims.
///
/// Paths are dot-separated (`resource_access.gateway.roles`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMappings {
    pub username: String,
    pub legacy_username: Option<String>,
    pub roles: String,
    pub scopes: String,
}

impl Default for ClaimMappings {
    fn default() -> Self {
        Self {
            username: "preferred_username".to_owned(),
            legacy_username: None,
            roles: "roles".to_owned(),
            scopes: "scope".to_owned(),
        }
    }
}

/// The authenticated subject of a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub schema_version: u32,
    pub user_id: String,
    pub username: String,
    pub legacy_username: Option<String>,
    pub role: Role,
    pub custom_roles: BTreeSet<String>,
    pub scopes: BTreeSet<String>,
    /// Full decoded payload, plus [`ACCESS_TOKEN_CLAIM`].
    pub claims: serde_json::Map<String, Value>,
    pub rejected: bool,
    /// Opaque transport-supplied correlation id, used for cache scoping.
    pub session_id: Option<String>,
}

impl UserSession {
    pub fn has_role(&self, role: Role) -> bool {
        self.role == role
    }

    pub fn has_custom_role(&self, role: &str) -> bool {
        self.custom_roles.contains(role)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// The raw compact JWT this session was authenticated with.
    pub fn access_token(&self) -> Option<&str> {
        self.claims.get(ACCESS_TOKEN_CLAIM).and_then(Value::as_str)
    }
}

/// Looks up a dot-separated path inside a token payload.
pub fn lookup_claim<'a>(payload: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = payload.get(segments.next()?)?;

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }

    Some(current)
}

/// Interprets a claim value as a list of strings.
///
/// Accepts a JSON array of strings or a single whitespace-delimited string
/// (the OAuth `scope` form).
pub fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Value::String(s) => s.split_whitespace().map(str::to_owned).collect(),
        _ => Vec::new(),
    }
}

pub struct SessionManager;

impl SessionManager {
    /// Materialises a validated payload and a role decision into a session.
    ///
    /// When the decision is `Unassigned`, scopes and custom roles are
    /// stripped before construction; the closing assertion can therefore
    /// only fire on an internal logic bug, never on token input.
    pub fn create_session(
        payload: &serde_json::Map<String, Value>,
        decision: RoleDecision,
        raw_token: &str,
        mappings: &ClaimMappings,
        session_id: Option<&str>,
    ) -> Arc<UserSession> {
        let user_id = payload
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let username = lookup_claim(payload, &mappings.username)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| user_id.clone());

        // May be absent: a delegation token can supply the legacy identity
        // later, at exchange time.
        let legacy_username = mappings
            .legacy_username
            .as_deref()
            .and_then(|path| lookup_claim(payload, path))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let unassigned = decision.primary == Role::Unassigned;

        let scopes: BTreeSet<String> = if unassigned {
            BTreeSet::new()
        } else {
            lookup_claim(payload, &mappings.scopes)
                .map(string_list)
                .unwrap_or_default()
                .into_iter()
                .collect()
        };

        let custom_roles = if unassigned { BTreeSet::new() } else { decision.custom_roles };

        let mut claims = payload.clone();
        claims.insert(ACCESS_TOKEN_CLAIM.to_owned(), Value::String(raw_token.to_owned()));

        let session = UserSession {
            schema_version: SESSION_SCHEMA_VERSION,
            user_id,
            username,
            legacy_username,
            role: decision.primary,
            custom_roles,
            scopes,
            claims,
            rejected: decision.rejected,
            session_id: session_id.map(str::to_owned),
        };

        assert!(
            session.role != Role::Unassigned || session.scopes.is_empty(),
            "CRITICAL: Unassigned role must have empty scopes"
        );

        Arc::new(session)
    }

    /// Upgrades a raw session snapshot to the current schema version.
    ///
    /// Only used when sessions are rehydrated from an external store.
    pub fn migrate(mut raw: Value) -> anyhow::Result<UserSession> {
        let object = raw.as_object_mut().context("session snapshot is not an object")?;

        let mut version = object
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        while version < u64::from(SESSION_SCHEMA_VERSION) {
            match version {
                // v0 snapshots predate versioning entirely.
                0 => {
                    object.insert("schema_version".to_owned(), Value::from(1));
                    version = 1;
                }
                other => anyhow::bail!("no migration registered from session schema v{other}"),
            }
        }

        if version > u64::from(SESSION_SCHEMA_VERSION) {
            anyhow::bail!("session schema v{version} is newer than this build");
        }

        serde_json::from_value(raw).context("migrated session does not match the current schema")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> serde_json::Map<String, Value> {
        serde_json::json!({
            "sub": "u1",
            "preferred_username": "alice",
            "win_account": "CONTOSO\\alice",
            "roles": ["idp-admins", "developer"],
            "scope": "tools:read tools:write",
            "exp": 4_102_444_800_i64,
        })
        .as_object()
        .expect("object literal")
        .clone()
    }

    fn decision(primary: Role) -> RoleDecision {
        RoleDecision {
            primary,
            custom_roles: ["developer".to_owned()].into(),
            rejected: false,
        }
    }

    #[test]
    fn session_carries_mapped_claims_and_raw_token() {
        let mappings = ClaimMappings {
            legacy_username: Some("win_account".to_owned()),
            ..ClaimMappings::default()
        };

        let session = SessionManager::create_session(&payload(), decision(Role::Admin), "a.b.c", &mappings, Some("mcp-1"));

        assert_eq!(session.schema_version, SESSION_SCHEMA_VERSION);
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.username, "alice");
        assert_eq!(session.legacy_username.as_deref(), Some("CONTOSO\\alice"));
        assert_eq!(session.role, Role::Admin);
        assert!(session.has_scope("tools:read"));
        assert!(session.has_custom_role("developer"));
        assert_eq!(session.access_token(), Some("a.b.c"));
        assert_eq!(session.session_id.as_deref(), Some("mcp-1"));
        assert!(!session.rejected);
    }

    #[test]
    fn unassigned_sessions_are_stripped_of_scopes_and_custom_roles() {
        let session = SessionManager::create_session(
            &payload(),
            RoleDecision {
                primary: Role::Unassigned,
                custom_roles: ["developer".to_owned()].into(),
                rejected: true,
            },
            "a.b.c",
            &ClaimMappings::default(),
            None,
        );

        assert!(session.scopes.is_empty());
        assert!(session.custom_roles.is_empty());
        assert!(session.rejected);
    }

    #[test]
    fn username_falls_back_to_subject() {
        let mut payload = payload();
        payload.remove("preferred_username");

        let session =
            SessionManager::create_session(&payload, decision(Role::User), "a.b.c", &ClaimMappings::default(), None);
        assert_eq!(session.username, "u1");
    }

    #[test]
    fn nested_claim_paths_resolve() {
        let payload = serde_json::json!({
            "sub": "u1",
            "resource_access": { "gateway": { "roles": ["ops"] } },
        })
        .as_object()
        .expect("object literal")
        .clone();

        let roles = lookup_claim(&payload, "resource_access.gateway.roles").expect("path resolves");
        assert_eq!(string_list(roles), ["ops"]);
        assert!(lookup_claim(&payload, "resource_access.missing.roles").is_none());
    }

    #[test]
    fn migrate_stamps_version_on_legacy_snapshots() {
        let mappings = ClaimMappings::default();
        let session = SessionManager::create_session(&payload(), decision(Role::User), "a.b.c", &mappings, None);

        let mut snapshot = serde_json::to_value(&*session).expect("serializable");
        snapshot
            .as_object_mut()
            .expect("object")
            .remove("schema_version");

        let migrated = SessionManager::migrate(snapshot).expect("migrated");
        assert_eq!(migrated.schema_version, SESSION_SCHEMA_VERSION);
        assert_eq!(migrated.user_id, session.user_id);
    }

    #[test]
    fn migrate_rejects_newer_schemas() {
        let snapshot = serde_json::json!({ "schema_version": 99 });
        assert!(SessionManager::migrate(snapshot).is_err());
    }
}
