//! Per-issuer JWKS resolution and caching.
//!
//! Key sets are fetched lazily over HTTPS with a bounded timeout, cached per
//! issuer with a TTL and a size cap, busted when a token references an
//! unknown `kid`, and refetches are rate-limited per issuer so a flood of
//! bad tokens cannot be turned into a flood of outbound requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

use crate::rate::FixedWindow;

const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("failed to fetch JWKS document")]
    Fetch { source: anyhow::Error },

    #[error("JWKS document is malformed")]
    Parse { source: anyhow::Error },

    #[error("JWKS refetch rate limit reached for issuer `{issuer}`")]
    RateLimited { issuer: SmolStr },

    #[error("no usable key in JWKS (kid: {kid:?})")]
    UnknownKey { kid: Option<String> },
}

/// A verification key extracted from a JWKS document.
pub struct ResolvedKey {
    pub kid: Option<String>,
    /// Algorithm advertised by the JWK, when present.
    pub algorithm: Option<jsonwebtoken::Algorithm>,
    pub decoding_key: DecodingKey,
}

struct IssuerKeys {
    fetched_at: Instant,
    by_kid: HashMap<String, Arc<ResolvedKey>>,
    all: Vec<Arc<ResolvedKey>>,
}

impl IssuerKeys {
    fn fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }

    fn find(&self, kid: Option<&str>) -> Option<Arc<ResolvedKey>> {
        match kid {
            Some(kid) => self.by_kid.get(kid).cloned(),
            // Without a kid the key is unambiguous only when the set holds a
            // single usable key.
            None => match self.all.as_slice() {
                [only] => Some(Arc::clone(only)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwksCacheOptions {
    pub ttl: Duration,
    pub fetch_timeout: Duration,
    pub refetches_per_minute: u32,
    pub max_issuers: usize,
}

impl Default for JwksCacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(10),
            refetches_per_minute: 10,
            max_issuers: 32,
        }
    }
}

pub struct JwksCache {
    client: reqwest::Client,
    options: JwksCacheOptions,
    issuers: parking_lot::RwLock<HashMap<SmolStr, Arc<IssuerKeys>>>,
    fetch_locks: parking_lot::Mutex<HashMap<SmolStr, Arc<tokio::sync::Mutex<()>>>>,
    refetch_limiter: FixedWindow<SmolStr>,
}

impl JwksCache {
    pub fn new(options: JwksCacheOptions) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.fetch_timeout)
            .build()
            .context("failed to build JWKS HTTP client")?;

        Ok(Self {
            client,
            refetch_limiter: FixedWindow::new(options.refetches_per_minute, Duration::from_secs(60)),
            options,
            issuers: parking_lot::RwLock::new(HashMap::new()),
            fetch_locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Returns the verification key for `kid`, fetching or refreshing the
    /// issuer's key set as needed.
    pub async fn resolve(
        &self,
        issuer: &str,
        jwks_uri: &Url,
        kid: Option<&str>,
    ) -> Result<Arc<ResolvedKey>, JwksError> {
        if let Some(entry) = self.cached(issuer)
            && entry.fresh(self.options.ttl)
            && let Some(key) = entry.find(kid)
        {
            return Ok(key);
        }

        // Writers are serialised per issuer; readers never wait on a fetch
        // for a different issuer.
        let lock = self.fetch_lock(issuer);
        let _guard = lock.lock().await;

        // Another request may have completed the fetch while we waited.
        if let Some(entry) = self.cached(issuer)
            && entry.fresh(self.options.ttl)
            && let Some(key) = entry.find(kid)
        {
            return Ok(key);
        }

        self.refetch_limiter
            .check(SmolStr::new(issuer))
            .map_err(|_| JwksError::RateLimited {
                issuer: SmolStr::new(issuer),
            })?;

        let set = self.fetch_with_retry(jwks_uri).await?;
        let entry = self.install(issuer, &set);

        entry.find(kid).ok_or_else(|| JwksError::UnknownKey {
            kid: kid.map(str::to_owned),
        })
    }

    fn cached(&self, issuer: &str) -> Option<Arc<IssuerKeys>> {
        self.issuers.read().get(issuer).cloned()
    }

    fn fetch_lock(&self, issuer: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock();
        Arc::clone(locks.entry(SmolStr::new(issuer)).or_default())
    }

    async fn fetch_with_retry(&self, jwks_uri: &Url) -> Result<JwkSet, JwksError> {
        let body = match self.fetch_body(jwks_uri).await {
            Ok(body) => body,
            Err(first_error) => {
                debug!(error = format!("{first_error:#}"), "JWKS fetch failed, retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                self.fetch_body(jwks_uri)
                    .await
                    .map_err(|source| JwksError::Fetch { source })?
            }
        };

        serde_json::from_str(&body).map_err(|e| JwksError::Parse {
            source: anyhow::Error::new(e),
        })
    }

    async fn fetch_body(&self, jwks_uri: &Url) -> anyhow::Result<String> {
        let response = self
            .client
            .get(jwks_uri.clone())
            .send()
            .await
            .context("JWKS endpoint is unreachable")?;

        let response = response
            .error_for_status()
            .context("JWKS endpoint answered with an error status")?;

        response.text().await.context("failed to read JWKS response body")
    }

    fn install(&self, issuer: &str, set: &JwkSet) -> Arc<IssuerKeys> {
        let mut by_kid = HashMap::new();
        let mut all = Vec::new();

        for jwk in &set.keys {
            match resolve_jwk(jwk) {
                Ok(key) => {
                    let key = Arc::new(key);
                    if let Some(kid) = &key.kid {
                        by_kid.insert(kid.clone(), Arc::clone(&key));
                    }
                    all.push(key);
                }
                Err(error) => {
                    debug!(kid = ?jwk.common.key_id, %error, "Skipping unusable JWK");
                }
            }
        }

        let entry = Arc::new(IssuerKeys {
            fetched_at: Instant::now(),
            by_kid,
            all,
        });

        let mut issuers = self.issuers.write();

        if issuers.len() >= self.options.max_issuers && !issuers.contains_key(issuer) {
            // Evict the stalest issuer to stay within the cap.
            if let Some(stalest) = issuers
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(issuer, _)| issuer.clone())
            {
                issuers.remove(&stalest);
            }
        }

        issuers.insert(SmolStr::new(issuer), Arc::clone(&entry));

        entry
    }

    /// Installs keys for an issuer without fetching. Test plumbing.
    #[doc(hidden)]
    pub fn seed(&self, issuer: &str, keys: Vec<ResolvedKey>) {
        let mut by_kid = HashMap::new();
        let mut all = Vec::new();

        for key in keys {
            let key = Arc::new(key);
            if let Some(kid) = &key.kid {
                by_kid.insert(kid.clone(), Arc::clone(&key));
            }
            all.push(key);
        }

        self.issuers.write().insert(
            SmolStr::new(issuer),
            Arc::new(IssuerKeys {
                fetched_at: Instant::now(),
                by_kid,
                all,
            }),
        );
    }
}

fn resolve_jwk(jwk: &Jwk) -> anyhow::Result<ResolvedKey> {
    use jsonwebtoken::jwk::KeyAlgorithm;

    let algorithm = match jwk.common.key_algorithm {
        Some(KeyAlgorithm::RS256) => Some(jsonwebtoken::Algorithm::RS256),
        Some(KeyAlgorithm::ES256) => Some(jsonwebtoken::Algorithm::ES256),
        Some(other) => anyhow::bail!("unsupported JWK algorithm `{other}`"),
        None => None,
    };

    let decoding_key = DecodingKey::from_jwk(jwk).context("failed to build verification key from JWK")?;

    Ok(ResolvedKey {
        kid: jwk.common.key_id.clone(),
        algorithm,
        decoding_key,
    })
}
