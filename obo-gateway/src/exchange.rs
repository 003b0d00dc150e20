//! RFC 8693 token exchange against the IdP token endpoint.
//!
//! Mints downstream-audience delegation tokens on behalf of the requestor.
//! Results are optionally cached in the session-scoped encrypted cache;
//! surfaced errors are sanitised (the raw IdP response, the subject token
//! and the client secret never appear outside the audit trail).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::audit::{AuditEntry, AuditService, AuditSource};
use crate::cache::EncryptedTokenCache;
use crate::rate::FixedWindow;
use crate::session::string_list;
use crate::token::decode_payload_unverified;

pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
pub const SUBJECT_TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Cached tokens with less remaining lifetime than this are treated as
/// misses.
const NEAR_EXPIRY: Duration = Duration::from_secs(5);

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ----- configuration ----- //

/// Token-exchange connection settings, configured per trusted IdP.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub endpoint: Url,
    pub client_id: String,
    /// Resolved secret value, never a descriptor.
    pub client_secret: String,
    /// Default downstream audience for this connection.
    pub audience: String,
    /// Upper bound on how long an exchanged token is considered usable.
    pub ttl: Duration,
    pub timeout: Duration,
    /// HTTP Basic credentials are preferred; form fields are the fallback.
    pub use_basic_auth: bool,
    pub cache_enabled: bool,
}

impl ExchangeConfig {
    pub fn new(endpoint: Url, client_id: String, client_secret: String, audience: String) -> Self {
        Self {
            endpoint,
            client_id,
            client_secret,
            audience,
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            use_basic_auth: true,
            cache_enabled: false,
        }
    }
}

// ----- errors ----- //

/// Exchange failures. `Display` output is safe to surface to clients.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("token endpoint is not HTTPS")]
    Insecure,

    #[error("subject token is empty")]
    EmptySubjectToken,

    #[error("token-exchange client secret is not configured")]
    MissingSecret,

    #[error("token endpoint call failed{}", status_suffix(.status))]
    Http { status: Option<u16> },

    #[error("IdP refused the exchange ({error})")]
    IdpError { error: String },

    #[error("token endpoint timed out")]
    Timeout,

    #[error("token-exchange rate limit reached for this session")]
    RateLimited,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(status) => format!(" (status {status})"),
        None => String::new(),
    }
}

impl ExchangeError {
    pub const fn code(&self) -> &'static str {
        match self {
            ExchangeError::Insecure | ExchangeError::EmptySubjectToken | ExchangeError::MissingSecret => {
                "TOKEN_EXCHANGE_INSECURE"
            }
            ExchangeError::Http { .. } | ExchangeError::RateLimited => "TOKEN_EXCHANGE_HTTP",
            ExchangeError::IdpError { .. } => "TOKEN_EXCHANGE_IDP_ERROR",
            ExchangeError::Timeout => "TOKEN_EXCHANGE_TIMEOUT",
        }
    }
}

// ----- request / result ----- //

pub struct ExchangeRequest<'a> {
    /// The requestor's JWT, exchanged on-behalf-of.
    pub subject_token: &'a str,
    /// Downstream audience; empty means the connection default.
    pub audience: &'a str,
    pub scope: Option<&'a str>,
    /// Transport session id, used for cache scoping.
    pub session_id: Option<&'a str>,
    pub jwt_subject: &'a str,
}

/// Claims of interest decoded (unverified) from the delegation JWT.
#[derive(Debug, Clone, Default)]
pub struct DelegationClaims {
    pub sub: Option<String>,
    pub legacy_name: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub exp: Option<i64>,
}

#[derive(Debug)]
pub struct ExchangedToken {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
    pub claims: DelegationClaims,
    /// Whether the token came out of the encrypted cache.
    pub from_cache: bool,
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct TokenEndpointError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Form stored as cache plaintext; the expiry rides along so near-expiry
/// hits can be refused without re-decoding the JWT.
#[derive(Serialize, Deserialize)]
struct CachedExchange {
    access_token: String,
    expires_at: i64,
}

// ----- service ----- //

pub struct TokenExchangeServiceOptions {
    /// Permit `http://` endpoints; development and tests only.
    pub allow_insecure_endpoints: bool,
    /// Exchange budget per `(session, audience)` per minute when the cache
    /// is disabled.
    pub uncached_exchanges_per_minute: u32,
}

impl Default for TokenExchangeServiceOptions {
    fn default() -> Self {
        Self {
            allow_insecure_endpoints: false,
            uncached_exchanges_per_minute: 30,
        }
    }
}

pub struct TokenExchangeService {
    client: reqwest::Client,
    cache: Arc<EncryptedTokenCache>,
    audit: Arc<AuditService>,
    options: TokenExchangeServiceOptions,
    uncached_limiter: FixedWindow<(String, String)>,
}

impl TokenExchangeService {
    pub fn new(
        cache: Arc<EncryptedTokenCache>,
        audit: Arc<AuditService>,
        options: TokenExchangeServiceOptions,
    ) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let client = reqwest::Client::builder()
            .build()
            .context("failed to build token-exchange HTTP client")?;

        Ok(Self {
            client,
            cache,
            audit,
            uncached_limiter: FixedWindow::new(options.uncached_exchanges_per_minute, Duration::from_secs(60)),
            options,
        })
    }

    pub async fn exchange(
        &self,
        config: &ExchangeConfig,
        request: ExchangeRequest<'_>,
    ) -> Result<ExchangedToken, ExchangeError> {
        let audience = if request.audience.is_empty() {
            config.audience.as_str()
        } else {
            request.audience
        };

        let result = self.exchange_impl(config, &request, audience).await;

        match &result {
            Ok(token) if token.from_cache => {}
            Ok(_) => {
                self.audit.record(self.entry(&request, audience, true, None, None));
            }
            Err(error) => {
                // Full detail stays in the audit trail; the surfaced error is
                // already sanitised.
                self.audit
                    .record(self.entry(&request, audience, false, Some(error.code()), Some(&error.to_string())));
            }
        }

        result
    }

    async fn exchange_impl(
        &self,
        config: &ExchangeConfig,
        request: &ExchangeRequest<'_>,
        audience: &str,
    ) -> Result<ExchangedToken, ExchangeError> {
        if config.endpoint.scheme() != "https" && !self.options.allow_insecure_endpoints {
            return Err(ExchangeError::Insecure);
        }

        if request.subject_token.is_empty() {
            return Err(ExchangeError::EmptySubjectToken);
        }

        if config.client_secret.is_empty() {
            return Err(ExchangeError::MissingSecret);
        }

        let key = cache_key(audience, request.scope);

        let cache_session = config.cache_enabled.then_some(()).and(request.session_id);

        if let Some(session_id) = cache_session {
            self.cache
                .activate_session(session_id, request.subject_token, request.jwt_subject);

            if let Some(plaintext) = self.cache.get(session_id, &key, request.subject_token)
                && let Ok(cached) = serde_json::from_str::<CachedExchange>(&plaintext)
            {
                let expires_at = OffsetDateTime::from_unix_timestamp(cached.expires_at).unwrap_or(OffsetDateTime::UNIX_EPOCH);

                if expires_at >= OffsetDateTime::now_utc() + NEAR_EXPIRY {
                    let claims = delegation_claims(&cached.access_token);

                    return Ok(ExchangedToken {
                        access_token: cached.access_token,
                        expires_at,
                        claims,
                        from_cache: true,
                    });
                }
            }
        } else if let Some(session_id) = request.session_id {
            self.uncached_limiter
                .check((session_id.to_owned(), audience.to_owned()))
                .map_err(|_| ExchangeError::RateLimited)?;
        }

        let access_token = self.call_token_endpoint(config, request, audience).await?;

        let claims = delegation_claims(&access_token);

        let now = OffsetDateTime::now_utc();
        let configured_cap = now + config.ttl;
        let expires_at = claims
            .exp
            .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok())
            .map_or(configured_cap, |token_exp| token_exp.min(configured_cap));

        if let Some(session_id) = cache_session {
            let cached = CachedExchange {
                access_token: access_token.clone(),
                expires_at: expires_at.unix_timestamp(),
            };

            let plaintext = serde_json::to_string(&cached).expect("struct of two plain fields");

            if let Err(error) = self
                .cache
                .set(session_id, &key, &plaintext, request.subject_token, expires_at)
            {
                debug!(%error, "Failed to cache exchanged token");
            }
        }

        Ok(ExchangedToken {
            access_token,
            expires_at,
            claims,
            from_cache: false,
        })
    }

    async fn call_token_endpoint(
        &self,
        config: &ExchangeConfig,
        request: &ExchangeRequest<'_>,
        audience: &str,
    ) -> Result<String, ExchangeError> {
        let mut form: HashMap<&str, &str> = HashMap::from([
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", request.subject_token),
            ("subject_token_type", SUBJECT_TOKEN_TYPE_JWT),
            ("audience", audience),
        ]);

        if let Some(scope) = request.scope {
            form.insert("scope", scope);
        }

        if !config.use_basic_auth {
            form.insert("client_id", &config.client_id);
            form.insert("client_secret", &config.client_secret);
        }

        let mut builder = self
            .client
            .post(config.endpoint.clone())
            .timeout(config.timeout)
            .form(&form);

        if config.use_basic_auth {
            builder = builder.basic_auth(&config.client_id, Some(&config.client_secret));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Http { status: None }
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            // The raw body goes to the trace log only, never to the caller.
            trace!(status = status.as_u16(), body = %body, "Token endpoint refused the exchange");

            return match serde_json::from_str::<TokenEndpointError>(&body) {
                Ok(idp_error) => {
                    debug!(error = idp_error.error, description = ?idp_error.error_description, "IdP error response");
                    Err(ExchangeError::IdpError { error: idp_error.error })
                }
                Err(_) => Err(ExchangeError::Http {
                    status: Some(status.as_u16()),
                }),
            };
        }

        match serde_json::from_str::<TokenEndpointResponse>(&body) {
            Ok(response) => Ok(response.access_token),
            Err(_) => Err(ExchangeError::Http {
                status: Some(status.as_u16()),
            }),
        }
    }

    fn entry(
        &self,
        request: &ExchangeRequest<'_>,
        audience: &str,
        success: bool,
        code: Option<&str>,
        error: Option<&str>,
    ) -> AuditEntry {
        let mut metadata = serde_json::Map::new();
        metadata.insert("audience".to_owned(), Value::String(audience.to_owned()));
        if let Some(code) = code {
            metadata.insert("code".to_owned(), Value::String(code.to_owned()));
        }

        let builder = AuditEntry::builder()
            .source(AuditSource::parse("exchange:service").expect("static tag"))
            .user_id(request.jwt_subject)
            .action("token-exchange")
            .resource(audience)
            .success(success)
            .metadata(metadata);

        match error {
            Some(error) => builder.error(error).build(),
            None => builder.build(),
        }
    }
}

/// Stable composition of the cache key.
///
/// The scope is canonicalised (split on whitespace, sorted, deduplicated) so
/// requests with differing scope spellings never share an entry.
pub fn cache_key(audience: &str, scope: Option<&str>) -> String {
    let canonical_scope = match scope {
        Some(scope) => {
            let mut parts: Vec<&str> = scope.split_whitespace().collect();
            parts.sort_unstable();
            parts.dedup();
            parts.join(" ")
        }
        None => String::new(),
    };

    format!("te:{audience}:{canonical_scope}")
}

fn delegation_claims(access_token: &str) -> DelegationClaims {
    let Ok(payload) = decode_payload_unverified(access_token) else {
        return DelegationClaims::default();
    };

    DelegationClaims {
        sub: payload.get("sub").and_then(Value::as_str).map(str::to_owned),
        legacy_name: payload.get("legacy_name").and_then(Value::as_str).map(str::to_owned),
        roles: payload.get("roles").map(string_list).unwrap_or_default(),
        permissions: payload.get("permissions").map(string_list).unwrap_or_default(),
        exp: payload.get("exp").and_then(Value::as_i64),
    }
}
