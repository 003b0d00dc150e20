use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use smol_str::SmolStr;
use tap::prelude::*;
use url::Url;

use crate::cache::CacheOptions;
use crate::exchange::ExchangeConfig;
use crate::jwks::JwksCacheOptions;
use crate::role::RoleMappings;
use crate::secret::SecretResolver;
use crate::session::ClaimMappings;
use crate::token::{SecurityPolicy, TrustedIdp};

const MAX_CLOCK_TOLERANCE_SECS: u64 = 300;
const MIN_TOKEN_AGE_SECS: u64 = 300;
const MAX_TOKEN_AGE_SECS: u64 = 7200;

const APPLICATION_DIR: &str = "obo-gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl Environment {
    pub fn is_development(self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub hostname: String,
    pub listen: SocketAddr,
    /// Canonical resource URL advertised in the RFC 9728 metadata document.
    pub resource: Url,
    pub environment: Environment,
    pub scopes_supported: Vec<String>,
    pub idps: Vec<TrustedIdp>,
    /// `None` disables audit retention entirely (null-object service).
    pub audit_retention: Option<usize>,
    pub cache: CacheOptions,
    pub jwks: JwksCacheOptions,
    pub delegation_timeout: Duration,
    pub modules: Vec<dto::ModuleConf>,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let environment = conf_file.environment.unwrap_or_default();

        let hostname = conf_file
            .hostname
            .clone()
            .unwrap_or_else(|| default_hostname().unwrap_or_else(|| "localhost".to_owned()));

        let listen: SocketAddr = conf_file
            .listen
            .as_deref()
            .unwrap_or("0.0.0.0:8087")
            .parse()
            .context("invalid listen address")?;

        if conf_file.resource.scheme() != "https" && !environment.is_development() {
            anyhow::bail!("resource URL must be HTTPS in production");
        }

        anyhow::ensure!(
            !conf_file.trusted_idps.is_empty(),
            "at least one trusted IdP is required",
        );

        let idps = conf_file
            .trusted_idps
            .iter()
            .enumerate()
            .map(|(idx, idp)| {
                to_trusted_idp(idp, environment).with_context(|| format!("trusted IdP at position {idx}"))
            })
            .collect::<anyhow::Result<Vec<TrustedIdp>>>()?;

        let audit_retention = match &conf_file.audit {
            Some(audit) if !audit.enabled => None,
            Some(audit) => Some(audit.retention.unwrap_or(10_000)),
            None => Some(10_000),
        };

        let cache_defaults = CacheOptions::default();
        let cache = match &conf_file.cache {
            Some(cache) => CacheOptions {
                session_timeout: cache
                    .session_timeout_seconds
                    .map_or(cache_defaults.session_timeout, Duration::from_secs),
                sweep_interval: cache
                    .sweep_interval_seconds
                    .map_or(cache_defaults.sweep_interval, Duration::from_secs),
                max_entries_per_session: cache
                    .max_entries_per_session
                    .unwrap_or(cache_defaults.max_entries_per_session),
                max_total_entries: cache.max_total_entries.unwrap_or(cache_defaults.max_total_entries),
            },
            None => cache_defaults,
        };

        let jwks_defaults = JwksCacheOptions::default();
        let jwks = match &conf_file.jwks {
            Some(jwks) => JwksCacheOptions {
                ttl: jwks.ttl_seconds.map_or(jwks_defaults.ttl, Duration::from_secs),
                fetch_timeout: jwks
                    .fetch_timeout_seconds
                    .map_or(jwks_defaults.fetch_timeout, Duration::from_secs),
                refetches_per_minute: jwks.refetches_per_minute.unwrap_or(jwks_defaults.refetches_per_minute),
                max_issuers: jwks.max_issuers.unwrap_or(jwks_defaults.max_issuers),
            },
            None => jwks_defaults,
        };

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("gateway"))
            .pipe_ref(|path| normalize_data_path(path, &get_data_dir()));

        Ok(Conf {
            hostname,
            listen,
            resource: conf_file.resource.clone(),
            environment,
            scopes_supported: conf_file.scopes_supported.clone(),
            idps,
            audit_retention,
            cache,
            jwks,
            delegation_timeout: Duration::from_secs(conf_file.delegation_timeout_seconds.unwrap_or(30)),
            modules: conf_file.modules.clone(),
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
        })
    }

    /// URL of the protected-resource metadata document for this deployment.
    pub fn resource_metadata_url(&self) -> String {
        let base = self.resource.as_str().trim_end_matches('/');
        format!("{base}/.well-known/oauth-protected-resource")
    }
}

fn to_trusted_idp(conf: &dto::TrustedIdpConf, environment: Environment) -> anyhow::Result<TrustedIdp> {
    let issuer_url: Url = conf.issuer.parse().context("issuer is not a valid URL")?;

    if issuer_url.scheme() != "https" && !environment.is_development() {
        anyhow::bail!("issuer must be HTTPS in production");
    }

    let algorithms: BTreeSet<_> = conf.algorithms.iter().copied().collect();
    anyhow::ensure!(!algorithms.is_empty(), "at least one signature algorithm is required");

    let security_defaults = SecurityPolicy::default();
    let security = match &conf.security {
        Some(security) => {
            let clock_tolerance = security
                .clock_tolerance_seconds
                .map_or(security_defaults.clock_tolerance, |secs| Duration::from_secs(u64::from(secs)));
            let max_token_age = security
                .max_token_age_seconds
                .map_or(security_defaults.max_token_age, |secs| Duration::from_secs(u64::from(secs)));

            anyhow::ensure!(
                clock_tolerance.as_secs() <= MAX_CLOCK_TOLERANCE_SECS,
                "clock tolerance must not exceed {MAX_CLOCK_TOLERANCE_SECS} seconds",
            );
            anyhow::ensure!(
                (MIN_TOKEN_AGE_SECS..=MAX_TOKEN_AGE_SECS).contains(&max_token_age.as_secs()),
                "max token age must be within {MIN_TOKEN_AGE_SECS}..={MAX_TOKEN_AGE_SECS} seconds",
            );

            SecurityPolicy {
                clock_tolerance,
                max_token_age,
                require_nbf: security.require_nbf,
            }
        }
        None => security_defaults,
    };

    let claim_mapping_defaults = ClaimMappings::default();
    let claim_mappings = match &conf.claim_mappings {
        Some(mappings) => ClaimMappings {
            username: mappings.username.clone().unwrap_or(claim_mapping_defaults.username),
            legacy_username: mappings.legacy_username.clone(),
            roles: mappings.roles.clone().unwrap_or(claim_mapping_defaults.roles),
            scopes: mappings.scopes.clone().unwrap_or(claim_mapping_defaults.scopes),
        },
        None => claim_mapping_defaults,
    };

    let role_mappings = match &conf.role_mappings {
        Some(mappings) => RoleMappings {
            admin: mappings.admin.iter().cloned().collect(),
            user: mappings.user.iter().cloned().collect(),
            guest: mappings.guest.iter().cloned().collect(),
            default_role: mappings.default_role,
            reject_unmapped_roles: mappings.reject_unmapped_roles,
        },
        None => RoleMappings::default(),
    };

    let token_exchange = conf
        .token_exchange
        .as_ref()
        .map(|exchange| to_exchange_config(exchange, environment))
        .transpose()?
        .map(Arc::new);

    Ok(TrustedIdp {
        issuer: SmolStr::new(&conf.issuer),
        jwks_uri: conf.jwks_uri.clone(),
        discovery_url: conf.discovery_url.clone(),
        audience: conf.audience.clone(),
        algorithms,
        claim_mappings,
        role_mappings,
        security,
        token_exchange,
    })
}

fn to_exchange_config(conf: &dto::TokenExchangeConf, environment: Environment) -> anyhow::Result<ExchangeConfig> {
    if conf.endpoint.scheme() != "https" && !environment.is_development() {
        anyhow::bail!("token-exchange endpoint must be HTTPS in production");
    }

    anyhow::ensure!(!conf.client_secret.is_empty(), "token-exchange client secret is empty");

    let mut exchange = ExchangeConfig::new(
        conf.endpoint.clone(),
        conf.client_id.clone(),
        conf.client_secret.clone(),
        conf.audience.clone(),
    );

    if let Some(ttl) = conf.ttl_seconds {
        exchange.ttl = Duration::from_secs(ttl);
    }
    if let Some(timeout) = conf.timeout_seconds {
        exchange.timeout = Duration::from_secs(timeout);
    }
    if let Some(use_basic_auth) = conf.use_basic_auth {
        exchange.use_basic_auth = use_basic_auth;
    }
    exchange.cache_enabled = conf.cache.as_ref().is_some_and(|cache| cache.enabled);

    Ok(exchange)
}

/// Configuration handle, source of truth for the installed configuration.
///
/// Hot reload is deliberately out of scope: the configuration is loaded,
/// secret descriptors resolved, schema-validated and then installed once.
#[derive(Clone, Debug)]
pub struct ConfHandle {
    inner: Arc<Conf>,
}

impl ConfHandle {
    /// Loads and installs the configuration from disk using the default
    /// provider chain (`/run/secrets`, then environment).
    pub fn init() -> anyhow::Result<Self> {
        Self::init_with_resolver(&SecretResolver::with_default_providers())
    }

    pub fn init_with_resolver(resolver: &SecretResolver) -> anyhow::Result<Self> {
        let conf_file_path = get_conf_file_path();

        let raw = std::fs::read_to_string(&conf_file_path)
            .with_context(|| format!("couldn't read config file at {conf_file_path}"))?;

        Self::from_json_str(&raw, resolver).with_context(|| format!("invalid config file at {conf_file_path}"))
    }

    /// Resolve secrets first, then schema-validate, then install.
    pub fn from_json_str(raw: &str, resolver: &SecretResolver) -> anyhow::Result<Self> {
        let mut document: serde_json::Value = serde_json::from_str(raw).context("config is not valid JSON")?;

        resolver
            .resolve_value(&mut document)
            .context("failed to resolve secret descriptors")?;

        let conf_file: dto::ConfFile =
            serde_json::from_value(document).context("config does not match the expected schema")?;

        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration")?;

        Ok(Self { inner: Arc::new(conf) })
    }

    #[doc(hidden)]
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        Self::from_json_str(json_config, &SecretResolver::new(Vec::new()))
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner)
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = std::env::var("OBOGW_CONFIG_PATH") {
        Utf8PathBuf::from(config_path_env)
    } else {
        let mut config_path = Utf8PathBuf::new();

        if cfg!(target_os = "windows") {
            let program_data_env = std::env::var("ProgramData").expect("ProgramData env variable");
            config_path.push(program_data_env);
            config_path.push(APPLICATION_DIR);
        } else if cfg!(target_os = "macos") {
            config_path.push("/Library/Application Support");
            config_path.push(APPLICATION_DIR);
        } else {
            config_path.push("/etc");
            config_path.push(APPLICATION_DIR);
        }

        config_path
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("gateway.json")
}

fn default_hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty())
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

/// Writes a fresh default configuration file and returns its path.
pub fn write_default_conf_file() -> anyhow::Result<Utf8PathBuf> {
    let conf_file_path = get_conf_file_path();

    if conf_file_path.exists() {
        anyhow::bail!("refusing to overwrite existing config file at {conf_file_path}");
    }

    if let Some(parent) = conf_file_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("couldn't create directory {parent}"))?;
    }

    let defaults = dto::ConfFile::generate_new();
    let json = serde_json::to_string_pretty(&defaults).context("failed JSON serialization of configuration")?;
    std::fs::write(&conf_file_path, json).with_context(|| format!("failed to write file at {conf_file_path}"))?;

    Ok(conf_file_path)
}

pub mod dto {
    use super::*;
    use crate::role::Role;
    use crate::token::JwtAlgorithm;

    /// Source of truth for gateway configuration.
    ///
    /// This struct represents the JSON file as close as possible. Unknown
    /// fields are rejected: a typo in a security-relevant key must not be
    /// silently ignored.
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct ConfFile {
        /// This gateway's hostname (defaults to the HOSTNAME variable)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub hostname: Option<String>,
        /// Listen address, e.g. `0.0.0.0:8087`
        #[serde(skip_serializing_if = "Option::is_none")]
        pub listen: Option<String>,
        /// Canonical resource URL of this server (RFC 9728 `resource`)
        pub resource: Url,
        /// `production` (default) or `development`
        #[serde(skip_serializing_if = "Option::is_none")]
        pub environment: Option<Environment>,
        /// Scopes advertised in the metadata document
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub scopes_supported: Vec<String>,
        /// Identity providers whose tokens are accepted
        pub trusted_idps: Vec<TrustedIdpConf>,
        /// Audit retention settings
        #[serde(skip_serializing_if = "Option::is_none")]
        pub audit: Option<AuditConf>,
        /// Encrypted delegation-token cache settings
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cache: Option<CacheConf>,
        /// JWKS fetching and caching settings
        #[serde(skip_serializing_if = "Option::is_none")]
        pub jwks: Option<JwksConf>,
        /// Upper bound on a single delegated call
        #[serde(skip_serializing_if = "Option::is_none")]
        pub delegation_timeout_seconds: Option<u64>,
        /// Delegation modules to initialize at startup
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub modules: Vec<ModuleConf>,
        /// Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                hostname: None,
                listen: Some("0.0.0.0:8087".to_owned()),
                resource: "https://gateway.example.com".parse().expect("static url"),
                environment: None,
                scopes_supported: vec!["tools:read".to_owned(), "tools:write".to_owned()],
                trusted_idps: vec![TrustedIdpConf {
                    issuer: "https://idp.example.com/realms/main".to_owned(),
                    jwks_uri: "https://idp.example.com/realms/main/protocol/openid-connect/certs"
                        .parse()
                        .expect("static url"),
                    discovery_url: None,
                    audience: "obo-gateway".to_owned(),
                    algorithms: vec![JwtAlgorithm::Rs256],
                    claim_mappings: None,
                    role_mappings: None,
                    security: None,
                    token_exchange: None,
                }],
                audit: None,
                cache: None,
                jwks: None,
                delegation_timeout_seconds: None,
                modules: Vec::new(),
                log_file: None,
                verbosity_profile: None,
            }
        }
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct TrustedIdpConf {
        /// Exact `iss` claim value (also a URL; HTTPS in production)
        pub issuer: String,
        pub jwks_uri: Url,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub discovery_url: Option<Url>,
        /// Expected `aud` for this resource server
        pub audience: String,
        /// Non-empty subset of RS256/ES256
        pub algorithms: Vec<JwtAlgorithm>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub claim_mappings: Option<ClaimMappingsConf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role_mappings: Option<RoleMappingsConf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub security: Option<SecurityConf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub token_exchange: Option<TokenExchangeConf>,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct ClaimMappingsConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub legacy_username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub roles: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub scopes: Option<String>,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct RoleMappingsConf {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub admin: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub user: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub guest: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub default_role: Option<Role>,
        #[serde(default)]
        pub reject_unmapped_roles: bool,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct SecurityConf {
        /// 0..=300
        #[serde(skip_serializing_if = "Option::is_none")]
        pub clock_tolerance_seconds: Option<u16>,
        /// 300..=7200
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_token_age_seconds: Option<u32>,
        #[serde(default)]
        pub require_nbf: bool,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct TokenExchangeConf {
        pub endpoint: Url,
        pub client_id: String,
        /// Normally supplied through a `$secret` descriptor
        pub client_secret: String,
        /// Default downstream audience for this connection
        pub audience: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ttl_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub timeout_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub use_basic_auth: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cache: Option<ExchangeCacheConf>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct ExchangeCacheConf {
        pub enabled: bool,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct AuditConf {
        #[serde(default = "default_true")]
        pub enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub retention: Option<usize>,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct CacheConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub session_timeout_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub sweep_interval_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_entries_per_session: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_total_entries: Option<usize>,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct JwksConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ttl_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub fetch_timeout_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub refetches_per_minute: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_issuers: Option<usize>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct ModuleConf {
        pub name: String,
        /// Backend family: `sql`, `kerberos`, `http`
        #[serde(rename = "type")]
        pub kind: String,
        #[serde(default)]
        pub config: serde_json::Value,
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "debug,hyper=info,h2=info",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }

    fn default_true() -> bool {
        true
    }
}
