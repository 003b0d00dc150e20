//! Kerberos delegation adapter (S4U2Self / S4U2Proxy).
//!
//! The module owns everything protocol-independent: deriving the user
//! principal from the delegation token's `legacy_name` and the configured
//! realm, enforcing the target-SPN allow-list, sequencing S4U2Self into
//! S4U2Proxy, and caching proxy tickets until their own end time.
//!
//! Talking to the KDC is platform plumbing behind [`TicketProvider`]:
//! bootstrap registers an SSPI-backed provider on Windows (service
//! credentials) or a GSSAPI-backed one on POSIX (keytab). Tests inject a
//! scripted provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use nonempty::NonEmpty;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;

use crate::audit::{AuditEntry, AuditSource};
use crate::delegation::{DelegationContext, DelegationModule, DelegationResult, MODULE_NOT_INITIALIZED};
use crate::session::UserSession;

/// Tickets with less remaining lifetime than this are refreshed instead of
/// served from the cache.
const TICKET_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Forwardable ticket for the impersonated user, produced by S4U2Self.
#[derive(Debug, Clone)]
pub struct SelfTicket {
    pub user_principal: String,
    pub ticket: Vec<u8>,
    pub forwardable: bool,
    pub end_time: OffsetDateTime,
}

/// Service ticket towards a target SPN, produced by S4U2Proxy.
#[derive(Debug, Clone)]
pub struct ProxyTicket {
    pub user_principal: String,
    pub target_spn: String,
    pub ticket: Vec<u8>,
    pub end_time: OffsetDateTime,
}

/// Platform seam for the actual Kerberos exchanges.
#[async_trait]
pub trait TicketProvider: Send + Sync {
    /// Authenticates as the service principal (credentials or keytab).
    async fn establish(&self) -> anyhow::Result<()>;

    async fn s4u2self(&self, user_principal: &str) -> anyhow::Result<SelfTicket>;

    async fn s4u2proxy(&self, self_ticket: &SelfTicket, target_spn: &str) -> anyhow::Result<ProxyTicket>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KerberosModuleConfig {
    /// Kerberos realm, e.g. `corp.example.com`.
    pub realm: String,
    /// Token-exchange audience naming the Kerberos bridge.
    pub audience: String,
    /// Target SPNs this module may request proxy tickets for.
    pub allowed_spns: Vec<String>,
}

struct KerberosState {
    config: KerberosModuleConfig,
    allowed_spns: NonEmpty<String>,
}

pub struct KerberosDelegationModule {
    name: String,
    provider: Arc<dyn TicketProvider>,
    state: OnceLock<KerberosState>,
    ticket_cache: Mutex<HashMap<(String, String), ProxyTicket>>,
}

impl KerberosDelegationModule {
    pub fn new(name: impl Into<String>, provider: Arc<dyn TicketProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
            state: OnceLock::new(),
            ticket_cache: Mutex::new(HashMap::new()),
        }
    }

    fn trail(&self, session: &UserSession, action: &str, success: bool) -> AuditEntry {
        AuditEntry::builder()
            .source(AuditSource::parse("delegation:kerberos").expect("static tag"))
            .user_id(session.user_id.as_str())
            .action(format!("{}:{action}", self.name))
            .success(success)
            .build()
    }

    fn cached_ticket(&self, user_principal: &str, target_spn: &str) -> Option<ProxyTicket> {
        let mut cache = self.ticket_cache.lock();
        let key = (user_principal.to_owned(), target_spn.to_owned());

        match cache.get(&key) {
            Some(ticket) if ticket.end_time > OffsetDateTime::now_utc() + TICKET_EXPIRY_MARGIN => {
                Some(ticket.clone())
            }
            Some(_) => {
                cache.remove(&key);
                None
            }
            None => None,
        }
    }

    async fn obtain_ticket(&self, user_principal: &str, target_spn: &str) -> anyhow::Result<(ProxyTicket, bool)> {
        use anyhow::Context as _;

        if let Some(ticket) = self.cached_ticket(user_principal, target_spn) {
            return Ok((ticket, true));
        }

        let self_ticket = self
            .provider
            .s4u2self(user_principal)
            .await
            .context("S4U2Self failed")?;

        anyhow::ensure!(
            self_ticket.forwardable,
            "S4U2Self ticket is not forwardable; constrained delegation is not configured for the service account",
        );

        let proxy_ticket = self
            .provider
            .s4u2proxy(&self_ticket, target_spn)
            .await
            .context("S4U2Proxy failed")?;

        self.ticket_cache.lock().insert(
            (user_principal.to_owned(), target_spn.to_owned()),
            proxy_ticket.clone(),
        );

        Ok((proxy_ticket, false))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TicketParams {
    spn: String,
}

#[async_trait]
impl DelegationModule for KerberosDelegationModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "kerberos"
    }

    async fn initialize(&self, config: &Value) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let config: KerberosModuleConfig =
            serde_json::from_value(config.clone()).context("invalid Kerberos module configuration")?;

        let allowed_spns = NonEmpty::from_vec(config.allowed_spns.clone())
            .context("at least one allowed target SPN is required")?;

        self.provider
            .establish()
            .await
            .context("failed to authenticate as the service principal")?;

        self.state
            .set(KerberosState { config, allowed_spns })
            .map_err(|_| anyhow::anyhow!("module is already initialized"))
    }

    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        params: &Value,
        ctx: &DelegationContext,
    ) -> anyhow::Result<DelegationResult> {
        let Some(state) = self.state.get() else {
            return Ok(DelegationResult::failure(
                MODULE_NOT_INITIALIZED,
                self.trail(session, action, false),
            ));
        };

        if action != "obtain-ticket" {
            return Ok(DelegationResult::failure(
                "UNSUPPORTED_ACTION",
                self.trail(session, action, false),
            ));
        }

        let params: TicketParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(error) => {
                debug!(%error, "Bad ticket parameters");
                return Ok(DelegationResult::failure(
                    "INVALID_INPUT",
                    self.trail(session, action, false),
                ));
            }
        };

        if !state.allowed_spns.iter().any(|spn| spn.eq_ignore_ascii_case(&params.spn)) {
            warn!(spn = %params.spn, "Requested SPN is not on the allow-list");
            return Ok(DelegationResult::failure(
                "SPN_NOT_ALLOWED",
                self.trail(session, action, false),
            ));
        }

        let Some(exchange) = &ctx.exchange else {
            return Ok(DelegationResult::failure(
                "EXCHANGE_REQUIRED",
                self.trail(session, action, false),
            ));
        };

        let delegation = match exchange
            .exchange_for(session, &state.config.audience, None, ctx.session_id.as_deref())
            .await
        {
            Ok(token) => token,
            Err(error) => {
                return Ok(DelegationResult::failure(
                    error.code(),
                    self.trail(session, action, false),
                ));
            }
        };

        let legacy_name = delegation
            .claims
            .legacy_name
            .clone()
            .or_else(|| session.legacy_username.clone());

        let Some(legacy_name) = legacy_name else {
            return Ok(DelegationResult::failure(
                "NO_LEGACY_IDENTITY",
                self.trail(session, action, false),
            ));
        };

        let user_principal = user_principal(&legacy_name, &state.config.realm);

        match self.obtain_ticket(&user_principal, &params.spn).await {
            Ok((ticket, cached)) => {
                let data = serde_json::json!({
                    "userPrincipal": ticket.user_principal,
                    "targetSpn": ticket.target_spn,
                    "ticket": base64::engine::general_purpose::STANDARD.encode(&ticket.ticket),
                    "endTime": ticket.end_time.unix_timestamp(),
                    "cached": cached,
                });

                Ok(DelegationResult::success(data, self.trail(session, action, true)))
            }
            Err(error) => {
                debug!(error = format!("{error:#}"), "Ticket acquisition failed");
                Ok(DelegationResult::failure(
                    "TICKET_ACQUISITION_FAILED",
                    self.trail(session, action, false),
                ))
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.state.get().is_some() && self.provider.establish().await.is_ok()
    }

    async fn destroy(&self) {
        self.ticket_cache.lock().clear();
    }
}

/// `DOMAIN\user` and plain account names both map onto `user@REALM`.
fn user_principal(legacy_name: &str, realm: &str) -> String {
    let account = legacy_name.rsplit('\\').next().unwrap_or(legacy_name);
    format!("{account}@{}", realm.to_uppercase())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn principal_derivation_strips_the_domain_prefix() {
        assert_eq!(user_principal("CONTOSO\\alice", "corp.example.com"), "alice@CORP.EXAMPLE.COM");
        assert_eq!(user_principal("alice", "corp.example.com"), "alice@CORP.EXAMPLE.COM");
    }

    #[derive(Default)]
    struct ScriptedProvider {
        s4u2self_calls: AtomicU32,
        s4u2proxy_calls: AtomicU32,
        unforwardable: bool,
    }

    #[async_trait]
    impl TicketProvider for ScriptedProvider {
        async fn establish(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn s4u2self(&self, user_principal: &str) -> anyhow::Result<SelfTicket> {
            self.s4u2self_calls.fetch_add(1, Ordering::Relaxed);
            Ok(SelfTicket {
                user_principal: user_principal.to_owned(),
                ticket: b"self-ticket".to_vec(),
                forwardable: !self.unforwardable,
                end_time: OffsetDateTime::now_utc() + Duration::from_secs(600),
            })
        }

        async fn s4u2proxy(&self, self_ticket: &SelfTicket, target_spn: &str) -> anyhow::Result<ProxyTicket> {
            self.s4u2proxy_calls.fetch_add(1, Ordering::Relaxed);
            Ok(ProxyTicket {
                user_principal: self_ticket.user_principal.clone(),
                target_spn: target_spn.to_owned(),
                ticket: b"proxy-ticket".to_vec(),
                end_time: OffsetDateTime::now_utc() + Duration::from_secs(600),
            })
        }
    }

    fn module_with(provider: Arc<ScriptedProvider>) -> KerberosDelegationModule {
        KerberosDelegationModule::new("cifs-delegate", provider)
    }

    #[tokio::test]
    async fn initialize_requires_a_non_empty_spn_allow_list() {
        let module = module_with(Arc::new(ScriptedProvider::default()));

        let result = module
            .initialize(&serde_json::json!({
                "realm": "corp.example.com",
                "audience": "urn:kerberos:cifs",
                "allowedSpns": [],
            }))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn proxy_tickets_are_cached_per_user_and_spn() {
        let provider = Arc::new(ScriptedProvider::default());
        let module = module_with(Arc::clone(&provider));
        module
            .initialize(&serde_json::json!({
                "realm": "corp.example.com",
                "audience": "urn:kerberos:cifs",
                "allowedSpns": ["cifs/files.corp.example.com"],
            }))
            .await
            .expect("valid config");

        let (first, first_cached) = module
            .obtain_ticket("alice@CORP.EXAMPLE.COM", "cifs/files.corp.example.com")
            .await
            .expect("ticket");
        let (_, second_cached) = module
            .obtain_ticket("alice@CORP.EXAMPLE.COM", "cifs/files.corp.example.com")
            .await
            .expect("ticket");

        assert!(!first_cached);
        assert!(second_cached);
        assert_eq!(first.target_spn, "cifs/files.corp.example.com");
        assert_eq!(provider.s4u2self_calls.load(Ordering::Relaxed), 1);
        assert_eq!(provider.s4u2proxy_calls.load(Ordering::Relaxed), 1);

        // A different user does not share tickets.
        module
            .obtain_ticket("bob@CORP.EXAMPLE.COM", "cifs/files.corp.example.com")
            .await
            .expect("ticket");
        assert_eq!(provider.s4u2proxy_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unforwardable_self_ticket_aborts_the_sequence() {
        let provider = Arc::new(ScriptedProvider {
            unforwardable: true,
            ..Default::default()
        });
        let module = module_with(Arc::clone(&provider));
        module
            .initialize(&serde_json::json!({
                "realm": "corp.example.com",
                "audience": "urn:kerberos:cifs",
                "allowedSpns": ["cifs/files.corp.example.com"],
            }))
            .await
            .expect("valid config");

        let result = module
            .obtain_ticket("alice@CORP.EXAMPLE.COM", "cifs/files.corp.example.com")
            .await;

        assert!(result.is_err());
        assert_eq!(provider.s4u2proxy_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn spn_outside_the_allow_list_is_refused() {
        use crate::role::{Role, RoleDecision};
        use crate::session::{ClaimMappings, SessionManager};

        let module = module_with(Arc::new(ScriptedProvider::default()));
        module
            .initialize(&serde_json::json!({
                "realm": "corp.example.com",
                "audience": "urn:kerberos:cifs",
                "allowedSpns": ["cifs/files.corp.example.com"],
            }))
            .await
            .expect("valid config");

        let payload = serde_json::json!({ "sub": "u1" })
            .as_object()
            .expect("object literal")
            .clone();

        let session = SessionManager::create_session(
            &payload,
            RoleDecision {
                primary: Role::User,
                custom_roles: Default::default(),
                rejected: false,
            },
            "a.b.c",
            &ClaimMappings::default(),
            None,
        );

        let result = module
            .delegate(
                &session,
                "obtain-ticket",
                &serde_json::json!({ "spn": "cifs/other.corp.example.com" }),
                &DelegationContext::empty(),
            )
            .await
            .expect("no hard error");

        assert_eq!(result.error.as_deref(), Some("SPN_NOT_ALLOWED"));
    }
}
