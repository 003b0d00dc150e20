//! Delegation registry: routes delegated operations to backend modules.
//!
//! Modules are compile-time collaborators registered during bootstrap and
//! stored behind the [`DelegationModule`] trait. The registry guarantees
//! audit-trail integrity (every routing decision is audited, and module
//! trails are stamped with a `delegation:<name>` source when omitted) and
//! failure isolation (a panicking, erroring or hanging module degrades into
//! a typed failure instead of taking the request pipeline down).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::audit::{AuditEntry, AuditService, AuditSource};
use crate::exchange::{ExchangeConfig, ExchangeError, ExchangeRequest, ExchangedToken, TokenExchangeService};
use crate::session::UserSession;
use crate::task::TaskHandle;

pub const MODULE_NOT_FOUND: &str = "MODULE_NOT_FOUND";
pub const MODULE_NOT_INITIALIZED: &str = "MODULE_NOT_INITIALIZED";
pub const DELEGATION_ERROR: &str = "DELEGATION_ERROR";

const DEFAULT_DELEGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a delegated operation.
#[derive(Debug)]
pub struct DelegationResult<T = Value> {
    pub success: bool,
    pub data: Option<T>,
    /// Stable error code (`MODULE_NOT_FOUND`, `DELEGATION_ERROR`, or a
    /// module-declared code).
    pub error: Option<String>,
    pub audit_trail: AuditEntry,
}

impl<T> DelegationResult<T> {
    pub fn success(data: T, audit_trail: AuditEntry) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            audit_trail,
        }
    }

    pub fn failure(error: impl Into<String>, audit_trail: AuditEntry) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            audit_trail,
        }
    }
}

/// Token-exchange connection scoped to the requestor's IdP, handed to
/// modules so they can mint downstream identities.
#[derive(Clone)]
pub struct ExchangeHandle {
    pub service: Arc<TokenExchangeService>,
    pub config: Arc<ExchangeConfig>,
}

impl ExchangeHandle {
    /// Exchanges the session's own bearer token for a downstream-audience
    /// delegation token.
    pub async fn exchange_for(
        &self,
        session: &UserSession,
        audience: &str,
        scope: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<ExchangedToken, ExchangeError> {
        let subject_token = session.access_token().unwrap_or_default();

        self.service
            .exchange(
                &self.config,
                ExchangeRequest {
                    subject_token,
                    audience,
                    scope,
                    session_id,
                    jwt_subject: &session.user_id,
                },
            )
            .await
    }
}

pub struct DelegationContext {
    /// Transport-session correlation id; scopes the encrypted token cache.
    pub session_id: Option<String>,
    pub exchange: Option<ExchangeHandle>,
}

impl DelegationContext {
    pub fn empty() -> Self {
        Self {
            session_id: None,
            exchange: None,
        }
    }
}

#[async_trait]
pub trait DelegationModule: Send + Sync {
    fn name(&self) -> &str;

    /// Backend family (`sql`, `kerberos`, `http`, …).
    fn kind(&self) -> &str;

    /// May open connection pools, load keytabs. Called once at bootstrap,
    /// before registration.
    async fn initialize(&self, config: &Value) -> anyhow::Result<()>;

    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        params: &Value,
        ctx: &DelegationContext,
    ) -> anyhow::Result<DelegationResult>;

    async fn health_check(&self) -> bool;

    /// Releases backend resources. Called on shutdown.
    async fn destroy(&self);
}

pub struct DelegationRegistry {
    modules: parking_lot::RwLock<HashMap<String, Arc<dyn DelegationModule>>>,
    audit: Arc<AuditService>,
    call_timeout: Duration,
}

impl DelegationRegistry {
    pub fn new(audit: Arc<AuditService>) -> Self {
        Self {
            modules: parking_lot::RwLock::new(HashMap::new()),
            audit,
            call_timeout: DEFAULT_DELEGATION_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn register(&self, module: Arc<dyn DelegationModule>) {
        let name = module.name().to_owned();
        info!(module = %name, kind = module.kind(), "Registered delegation module");
        self.modules.write().insert(name, module);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn DelegationModule>> {
        self.modules.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DelegationModule>> {
        self.modules.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    /// Routes a delegated operation to a named module.
    ///
    /// Never panics and never propagates a module error: every outcome is a
    /// [`DelegationResult`], and every outcome is audited.
    pub async fn delegate(
        &self,
        module_name: &str,
        session: &Arc<UserSession>,
        action: &str,
        params: Value,
        ctx: DelegationContext,
    ) -> DelegationResult {
        let Some(module) = self.get(module_name) else {
            let trail = AuditEntry::builder()
                .source(AuditSource::parse("delegation:registry").expect("static tag"))
                .user_id(session.user_id.as_str())
                .action(format!("delegate:{module_name}:{action}"))
                .success(false)
                .error(format!("no delegation module named `{module_name}`"))
                .build();

            self.audit.record(trail.clone());

            return DelegationResult::failure(MODULE_NOT_FOUND, trail);
        };

        let result = self.invoke_isolated(&module, session, action, params, ctx).await;

        let mut result = match result {
            Ok(result) => result,
            Err(detail) => {
                // Module failure detail is an internal matter: the audit
                // trail keeps it, the result carries only the code.
                let trail = AuditEntry::builder()
                    .source(module_source(module_name))
                    .user_id(session.user_id.as_str())
                    .action(format!("delegate:{module_name}:{action}"))
                    .success(false)
                    .error(detail)
                    .build();

                self.audit.record(trail.clone());

                return DelegationResult::failure(DELEGATION_ERROR, trail);
            }
        };

        // Registry-enforced integrity: a module that omitted its source is
        // stamped rather than trusted.
        if result.audit_trail.source.is_none() {
            result.audit_trail.source = Some(module_source(module_name));
        }

        self.audit.record(result.audit_trail.clone());

        result
    }

    /// Runs the module call on its own task with a deadline.
    ///
    /// A panic aborts only that task, and a stuck backend driver is
    /// abandoned at the deadline (the `TaskHandle` aborts it on drop).
    async fn invoke_isolated(
        &self,
        module: &Arc<dyn DelegationModule>,
        session: &Arc<UserSession>,
        action: &str,
        params: Value,
        ctx: DelegationContext,
    ) -> Result<DelegationResult, String> {
        let module = Arc::clone(module);
        let session = Arc::clone(session);
        let action = action.to_owned();

        let call = TaskHandle::spawn(async move { module.delegate(&session, &action, &params, &ctx).await });

        match tokio::time::timeout(self.call_timeout, call.join()).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(format!("module error: {error:#}")),
            Ok(Err(join_error)) => Err(format!("module crashed: {join_error}")),
            Err(_elapsed) => Err(format!(
                "module call exceeded the {}s deadline",
                self.call_timeout.as_secs()
            )),
        }
    }

    pub async fn health_check(&self) -> HashMap<String, bool> {
        let modules: Vec<Arc<dyn DelegationModule>> = self.modules.read().values().cloned().collect();

        let mut report = HashMap::new();
        for module in modules {
            report.insert(module.name().to_owned(), module.health_check().await);
        }
        report
    }

    pub async fn destroy_all(&self) {
        let modules: Vec<Arc<dyn DelegationModule>> = {
            let mut guard = self.modules.write();
            guard.drain().map(|(_, module)| module).collect()
        };

        for module in modules {
            module.destroy().await;
        }
    }
}

fn module_source(module_name: &str) -> AuditSource {
    let sanitized: String = module_name
        .chars()
        .map(|c| match c {
            'a'..='z' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();

    AuditSource::parse(&format!("delegation:{sanitized}")).unwrap_or_else(|_| {
        AuditSource::parse("delegation:module").expect("static tag")
    })
}
