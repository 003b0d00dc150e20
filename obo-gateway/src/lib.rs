#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

pub mod api;
pub mod audit;
pub mod auth;
pub mod authorize;
pub mod cache;
pub mod config;
pub mod delegation;
pub mod exchange;
pub mod extract;
pub mod http;
pub mod jwks;
pub mod listener;
pub mod log;
pub mod middleware;
pub mod modules;
pub mod rate;
pub mod role;
pub mod secret;
pub mod service;
pub mod session;
pub mod task;
pub mod token;

use std::sync::Arc;

use anyhow::Context as _;

use crate::audit::{AuditConfig, AuditService, AuditSink};
use crate::auth::AuthenticationService;
use crate::cache::EncryptedTokenCache;
use crate::config::ConfHandle;
use crate::delegation::{DelegationContext, DelegationRegistry, ExchangeHandle};
use crate::exchange::{TokenExchangeService, TokenExchangeServiceOptions};
use crate::jwks::JwksCache;
use crate::session::UserSession;
use crate::token::JwtValidator;

/// Shared core context, constructed once at bootstrap and handed into every
/// subsystem. No process-global singletons.
#[derive(Clone)]
pub struct OgwState {
    pub conf_handle: ConfHandle,
    pub audit: Arc<AuditService>,
    pub auth: Arc<AuthenticationService>,
    pub cache: Arc<EncryptedTokenCache>,
    pub exchange: Arc<TokenExchangeService>,
    pub registry: Arc<DelegationRegistry>,
}

impl OgwState {
    pub fn build(conf_handle: ConfHandle, audit_sink: Option<Arc<dyn AuditSink>>) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let audit = match conf.audit_retention {
            Some(retention) => Arc::new(AuditService::new(AuditConfig {
                retention,
                sink: audit_sink,
            })),
            None => Arc::new(AuditService::disabled()),
        };

        let jwks = JwksCache::new(conf.jwks.clone()).context("JWKS cache")?;
        let validator = JwtValidator::new(conf.idps.iter().cloned(), jwks);
        let auth = Arc::new(AuthenticationService::new(validator, Arc::clone(&audit)));

        let cache = Arc::new(EncryptedTokenCache::new(conf.cache.clone()));

        let exchange = Arc::new(
            TokenExchangeService::new(
                Arc::clone(&cache),
                Arc::clone(&audit),
                TokenExchangeServiceOptions {
                    allow_insecure_endpoints: conf.environment.is_development(),
                    ..TokenExchangeServiceOptions::default()
                },
            )
            .context("token-exchange service")?,
        );

        let registry = Arc::new(DelegationRegistry::new(Arc::clone(&audit)).with_call_timeout(conf.delegation_timeout));

        Ok(Self {
            conf_handle,
            audit,
            auth,
            cache,
            exchange,
            registry,
        })
    }

    /// Token-exchange connection for the IdP that issued this session's
    /// token, if one is configured.
    pub fn exchange_handle_for(&self, session: &UserSession) -> Option<ExchangeHandle> {
        let issuer = session.claims.get("iss")?.as_str()?;
        let idp = self.auth.validator().idp(issuer)?;
        let config = idp.token_exchange.clone()?;

        Some(ExchangeHandle {
            service: Arc::clone(&self.exchange),
            config,
        })
    }

    /// Context handed to delegation modules for a given request.
    pub fn delegation_context(&self, session: &UserSession) -> DelegationContext {
        DelegationContext {
            session_id: session.session_id.clone(),
            exchange: self.exchange_handle_for(session),
        }
    }
}
