//! HTTP API delegation adapter.
//!
//! Mints a delegation token for the configured audience and performs the
//! outbound request with it as the bearer credential. Response bodies are
//! streamed under a byte cap so a misbehaving backend cannot balloon the
//! gateway's memory.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::audit::{AuditEntry, AuditSource};
use crate::delegation::{DelegationContext, DelegationModule, DelegationResult, MODULE_NOT_INITIALIZED};
use crate::session::UserSession;

const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpModuleConfig {
    pub base_url: Url,
    /// Token-exchange audience naming the downstream API.
    pub audience: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RequestParams {
    #[serde(default = "default_method")]
    method: String,
    path: String,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_owned()
}

pub struct HttpApiModule {
    name: String,
    client: reqwest::Client,
    config: OnceLock<HttpModuleConfig>,
}

impl HttpApiModule {
    pub fn new(name: impl Into<String>) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        Ok(Self {
            name: name.into(),
            client: reqwest::Client::builder()
                .build()
                .context("failed to build delegated HTTP client")?,
            config: OnceLock::new(),
        })
    }

    fn trail(&self, session: &UserSession, action: &str, success: bool) -> AuditEntry {
        AuditEntry::builder()
            .source(AuditSource::parse("delegation:http").expect("static tag"))
            .user_id(session.user_id.as_str())
            .action(format!("{}:{action}", self.name))
            .success(success)
            .build()
    }

    async fn read_capped(response: reqwest::Response, cap: usize) -> anyhow::Result<Vec<u8>> {
        use anyhow::Context as _;

        let mut response = response;
        let mut body = Vec::new();

        while let Some(chunk) = response.chunk().await.context("failed to read response body")? {
            if body.len() + chunk.len() > cap {
                anyhow::bail!("response exceeds the {cap} byte cap");
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl DelegationModule for HttpApiModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "http"
    }

    async fn initialize(&self, config: &Value) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let config: HttpModuleConfig =
            serde_json::from_value(config.clone()).context("invalid HTTP module configuration")?;

        self.config
            .set(config)
            .map_err(|_| anyhow::anyhow!("module is already initialized"))
    }

    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        params: &Value,
        ctx: &DelegationContext,
    ) -> anyhow::Result<DelegationResult> {
        let Some(config) = self.config.get() else {
            return Ok(DelegationResult::failure(
                MODULE_NOT_INITIALIZED,
                self.trail(session, action, false),
            ));
        };

        if action != "request" {
            return Ok(DelegationResult::failure(
                "UNSUPPORTED_ACTION",
                self.trail(session, action, false),
            ));
        }

        let params: RequestParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(error) => {
                debug!(%error, "Bad request parameters");
                return Ok(DelegationResult::failure(
                    "INVALID_INPUT",
                    self.trail(session, action, false),
                ));
            }
        };

        let Some(exchange) = &ctx.exchange else {
            return Ok(DelegationResult::failure(
                "EXCHANGE_REQUIRED",
                self.trail(session, action, false),
            ));
        };

        let delegation = match exchange
            .exchange_for(session, &config.audience, config.scope.as_deref(), ctx.session_id.as_deref())
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

        let url = config
            .base_url
            .join(params.path.trim_start_matches('/'))
            .map_err(|e| anyhow::anyhow!(e).context("invalid request path"))?;

        // The joined URL must stay under the configured base: a crafted path
        // must not redirect the delegation token elsewhere.
        if !url.as_str().starts_with(config.base_url.as_str()) {
            return Ok(DelegationResult::failure(
                "INVALID_INPUT",
                self.trail(session, action, false),
            ));
        }

        let method: reqwest::Method = params
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid HTTP method `{}`", params.method))?;

        let mut builder = self
            .client
            .request(method, url)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .bearer_auth(&delegation.access_token);

        if let Some(body) = &params.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(error = %error.without_url(), "Delegated HTTP request failed");
                return Ok(DelegationResult::failure(
                    "UPSTREAM_UNAVAILABLE",
                    self.trail(session, action, false),
                ));
            }
        };

        let status = response.status().as_u16();
        let body = match Self::read_capped(response, config.max_response_bytes).await {
            Ok(body) => body,
            Err(error) => {
                debug!(error = format!("{error:#}"), "Delegated HTTP response rejected");
                return Ok(DelegationResult::failure(
                    "RESPONSE_TOO_LARGE",
                    self.trail(session, action, false),
                ));
            }
        };

        let body: Value = match serde_json::from_slice(&body) {
            Ok(json) => json,
            Err(_) => Value::String(String::from_utf8_lossy(&body).into_owned()),
        };

        let data = serde_json::json!({ "status": status, "body": body });

        Ok(DelegationResult::success(data, self.trail(session, action, true)))
    }

    async fn health_check(&self) -> bool {
        self.config.get().is_some()
    }

    async fn destroy(&self) {}
}

/// Convenience constructor used by bootstrap code.
pub fn module(name: &str) -> anyhow::Result<Arc<dyn DelegationModule>> {
    Ok(Arc::new(HttpApiModule::new(name)?))
}
