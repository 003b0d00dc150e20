//! Bearer-token validation against the configured trusted IdPs.
//!
//! Validation follows RFC 8725 hardening: the JOSE header is decoded first
//! and the algorithm checked against a per-issuer allow-list (a subset of
//! RS256/ES256) before any signature work, so `alg: "none"` and HMAC
//! downgrade attempts fail without touching key material. The unverified
//! `iss` claim only routes to the per-issuer configuration; every claim is
//! re-checked after signature verification.
//!
//! The validator itself never writes audit entries: it has no subject to
//! attribute them to. Typed errors propagate to the authentication service.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

use crate::exchange::ExchangeConfig;
use crate::jwks::{JwksCache, JwksError};
use crate::role::RoleMappings;
use crate::session::ClaimMappings;

pub const DEFAULT_CLOCK_TOLERANCE: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_TOKEN_AGE: Duration = Duration::from_secs(3600);

// ----- trusted IdP configuration ----- //

/// Signature algorithms this resource server accepts. Nothing else is
/// representable: `none` and HMAC variants are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JwtAlgorithm {
    #[serde(rename = "RS256")]
    Rs256,
    #[serde(rename = "ES256")]
    Es256,
}

impl JwtAlgorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            JwtAlgorithm::Rs256 => "RS256",
            JwtAlgorithm::Es256 => "ES256",
        }
    }

    pub fn from_header(alg: &str) -> Option<Self> {
        match alg {
            "RS256" => Some(JwtAlgorithm::Rs256),
            "ES256" => Some(JwtAlgorithm::Es256),
            _ => None,
        }
    }

    fn as_jsonwebtoken(self) -> jsonwebtoken::Algorithm {
        match self {
            JwtAlgorithm::Rs256 => jsonwebtoken::Algorithm::RS256,
            JwtAlgorithm::Es256 => jsonwebtoken::Algorithm::ES256,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SecurityPolicy {
    /// Allowed skew when checking `exp`, `nbf` and `iat`. At most 5 minutes.
    pub clock_tolerance: Duration,
    /// Tokens whose `iat` is older than this are rejected even when not yet
    /// expired.
    pub max_token_age: Duration,
    pub require_nbf: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            clock_tolerance: DEFAULT_CLOCK_TOLERANCE,
            max_token_age: DEFAULT_MAX_TOKEN_AGE,
            require_nbf: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustedIdp {
    /// Exact `iss` value. Must be HTTPS in production.
    pub issuer: SmolStr,
    pub jwks_uri: Url,
    pub discovery_url: Option<Url>,
    /// Expected `aud` for this resource server.
    pub audience: String,
    /// Non-empty subset of {RS256, ES256}.
    pub algorithms: BTreeSet<JwtAlgorithm>,
    pub claim_mappings: ClaimMappings,
    pub role_mappings: RoleMappings,
    pub security: SecurityPolicy,
    pub token_exchange: Option<Arc<ExchangeConfig>>,
}

// ----- validation ----- //

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed { source: anyhow::Error },

    #[error("token algorithm `{alg}` is not allowed")]
    BadAlgorithm { alg: SmolStr },

    #[error("token issuer `{issuer}` is not trusted")]
    UnknownIssuer { issuer: SmolStr },

    #[error("no verification key matches the token (kid: {kid:?})")]
    UnknownKey { kid: Option<String> },

    #[error("token signature verification failed")]
    BadSignature { source: jsonwebtoken::errors::Error },

    #[error("token is expired")]
    Expired,

    #[error("token was issued too long ago")]
    TooOld,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("token was issued in the future")]
    ClockSkew,

    #[error("token audience does not include this resource server")]
    BadAudience,

    #[error("JWKS refetch rate limit reached")]
    RefreshRateLimited,
}

impl TokenError {
    /// Stable code used in audit entries and sanitised client messages.
    pub const fn code(&self) -> &'static str {
        match self {
            TokenError::Malformed { .. } => "MALFORMED_TOKEN",
            TokenError::BadAlgorithm { .. } => "BAD_ALGORITHM",
            TokenError::UnknownIssuer { .. } => "UNKNOWN_ISSUER",
            TokenError::UnknownKey { .. } | TokenError::RefreshRateLimited => "UNKNOWN_KEY",
            TokenError::BadSignature { .. } => "BAD_SIGNATURE",
            TokenError::Expired | TokenError::TooOld => "EXPIRED",
            TokenError::NotYetValid => "NOT_YET_VALID",
            TokenError::ClockSkew => "CLOCK_SKEW",
            TokenError::BadAudience => "BAD_AUDIENCE",
        }
    }
}

#[derive(Deserialize)]
struct JoseHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug)]
pub struct ValidatedToken {
    /// Signature-verified payload.
    pub claims: serde_json::Map<String, Value>,
    pub issuer: SmolStr,
    pub kid: Option<String>,
    pub idp: Arc<TrustedIdp>,
}

pub struct JwtValidator {
    idps: HashMap<SmolStr, Arc<TrustedIdp>>,
    jwks: JwksCache,
}

impl JwtValidator {
    pub fn new(idps: impl IntoIterator<Item = TrustedIdp>, jwks: JwksCache) -> Self {
        Self {
            idps: idps
                .into_iter()
                .map(|idp| (idp.issuer.clone(), Arc::new(idp)))
                .collect(),
            jwks,
        }
    }

    pub fn idp(&self, issuer: &str) -> Option<&Arc<TrustedIdp>> {
        self.idps.get(issuer)
    }

    pub fn idps(&self) -> impl Iterator<Item = &Arc<TrustedIdp>> {
        self.idps.values()
    }

    pub async fn validate(&self, token: &str) -> Result<ValidatedToken, TokenError> {
        let (header, unverified_claims) = decode_unverified(token)?;

        // Routing only: nothing read from the unverified payload is trusted
        // before the signature checks out.
        let issuer = unverified_claims
            .get("iss")
            .and_then(Value::as_str)
            .map(SmolStr::new)
            .unwrap_or_default();

        let Some(idp) = self.idps.get(&issuer) else {
            return Err(TokenError::UnknownIssuer { issuer });
        };

        let alg = check_algorithm(&header.alg, &idp.algorithms)?;

        let key = match self
            .jwks
            .resolve(&issuer, &idp.jwks_uri, header.kid.as_deref())
            .await
        {
            Ok(key) => key,
            Err(JwksError::RateLimited { .. }) => return Err(TokenError::RefreshRateLimited),
            Err(JwksError::UnknownKey { kid }) => return Err(TokenError::UnknownKey { kid }),
            Err(error @ (JwksError::Fetch { .. } | JwksError::Parse { .. })) => {
                // Transport and parse failures surface as UNKNOWN_KEY after
                // the bounded retry inside the cache.
                debug!(%issuer, error = format!("{error:#}"), "JWKS resolution failed");
                return Err(TokenError::UnknownKey { kid: header.kid });
            }
        };

        if let Some(key_alg) = key.algorithm
            && key_alg != alg.as_jsonwebtoken()
        {
            return Err(TokenError::UnknownKey { kid: header.kid });
        }

        // Signature only; claims are checked manually below for precise
        // error reporting and per-issuer tolerances.
        let mut validation = jsonwebtoken::Validation::new(alg.as_jsonwebtoken());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let verified = jsonwebtoken::decode::<Value>(token, &key.decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;

            match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey => {
                    TokenError::BadSignature { source: e }
                }
                ErrorKind::InvalidAlgorithm => TokenError::BadAlgorithm {
                    alg: SmolStr::new(&header.alg),
                },
                _ => TokenError::Malformed {
                    source: anyhow::Error::new(e),
                },
            }
        })?;

        let claims = match verified.claims {
            Value::Object(map) => map,
            _ => {
                return Err(TokenError::Malformed {
                    source: anyhow::anyhow!("payload is not a JSON object"),
                });
            }
        };

        check_claims(&claims, idp)?;

        Ok(ValidatedToken {
            claims,
            issuer,
            kid: header.kid,
            idp: Arc::clone(idp),
        })
    }
}

fn check_algorithm(alg: &str, allowed: &BTreeSet<JwtAlgorithm>) -> Result<JwtAlgorithm, TokenError> {
    match JwtAlgorithm::from_header(alg) {
        Some(parsed) if allowed.contains(&parsed) => Ok(parsed),
        // Covers `none`, every HMAC variant, and any algorithm outside the
        // issuer's allow-list.
        _ => Err(TokenError::BadAlgorithm { alg: SmolStr::new(alg) }),
    }
}

pub(crate) fn decode_payload_unverified(token: &str) -> anyhow::Result<serde_json::Map<String, Value>> {
    let (_, payload) = decode_unverified(token).map_err(|e| anyhow::anyhow!(e))?;
    Ok(payload)
}

fn decode_unverified(token: &str) -> Result<(JoseHeader, serde_json::Map<String, Value>), TokenError> {
    let malformed = |source: anyhow::Error| TokenError::Malformed { source };

    let mut parts = token.split('.');

    let (Some(header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed(anyhow::anyhow!("expected a three-part compact JWS")));
    };

    let header = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| malformed(anyhow::Error::new(e).context("header is not base64url")))?;
    let header: JoseHeader = serde_json::from_slice(&header)
        .map_err(|e| malformed(anyhow::Error::new(e).context("header is not a JOSE header")))?;

    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| malformed(anyhow::Error::new(e).context("payload is not base64url")))?;
    let payload: serde_json::Map<String, Value> = serde_json::from_slice(&payload)
        .map_err(|e| malformed(anyhow::Error::new(e).context("payload is not a JSON object")))?;

    Ok((header, payload))
}

fn check_claims(claims: &serde_json::Map<String, Value>, idp: &TrustedIdp) -> Result<(), TokenError> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let tolerance = to_secs(idp.security.clock_tolerance);

    match claims.get("iss").and_then(Value::as_str) {
        Some(iss) if iss == idp.issuer => {}
        other => {
            return Err(TokenError::UnknownIssuer {
                issuer: SmolStr::new(other.unwrap_or_default()),
            });
        }
    }

    if !audience_matches(claims.get("aud"), &idp.audience) {
        return Err(TokenError::BadAudience);
    }

    let exp = claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| TokenError::Malformed {
            source: anyhow::anyhow!("`exp` claim is missing or not a number"),
        })?;

    if exp <= now - tolerance {
        return Err(TokenError::Expired);
    }

    match claims.get("nbf").and_then(Value::as_i64) {
        Some(nbf) => {
            if nbf > now + tolerance {
                return Err(TokenError::NotYetValid);
            }
        }
        None if idp.security.require_nbf => {
            return Err(TokenError::Malformed {
                source: anyhow::anyhow!("`nbf` claim is required by this issuer"),
            });
        }
        None => {}
    }

    let iat = claims
        .get("iat")
        .and_then(Value::as_i64)
        .ok_or_else(|| TokenError::Malformed {
            source: anyhow::anyhow!("`iat` claim is missing or not a number"),
        })?;

    if iat > now + tolerance {
        return Err(TokenError::ClockSkew);
    }

    if iat + to_secs(idp.security.max_token_age) < now {
        return Err(TokenError::TooOld);
    }

    Ok(())
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(aud)) => aud == expected,
        Some(Value::Array(entries)) => entries.iter().any(|entry| entry.as_str() == Some(expected)),
        _ => false,
    }
}

fn to_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::JwksCacheOptions;

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
    }

    fn forge(header: &serde_json::Value, payload: &serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            b64(header.to_string().as_bytes()),
            b64(payload.to_string().as_bytes()),
            b64(b"signature")
        )
    }

    fn test_idp() -> TrustedIdp {
        TrustedIdp {
            issuer: SmolStr::new("https://idp.example.com"),
            jwks_uri: "https://idp.example.com/jwks".parse().expect("static url"),
            discovery_url: None,
            audience: "mcp".to_owned(),
            algorithms: [JwtAlgorithm::Rs256].into(),
            claim_mappings: ClaimMappings::default(),
            role_mappings: RoleMappings::default(),
            security: SecurityPolicy::default(),
            token_exchange: None,
        }
    }

    fn validator() -> JwtValidator {
        JwtValidator::new(
            [test_idp()],
            JwksCache::new(JwksCacheOptions::default()).expect("cache"),
        )
    }

    #[tokio::test]
    async fn alg_none_is_rejected_before_signature_checks() {
        let token = forge(
            &serde_json::json!({ "alg": "none" }),
            &serde_json::json!({ "iss": "https://idp.example.com", "aud": "mcp" }),
        );

        let error = validator().validate(&token).await.expect_err("must fail");
        assert!(matches!(error, TokenError::BadAlgorithm { .. }));
        assert_eq!(error.code(), "BAD_ALGORITHM");
    }

    #[tokio::test]
    async fn hmac_is_rejected_regardless_of_signature() {
        let token = forge(
            &serde_json::json!({ "alg": "HS256" }),
            &serde_json::json!({ "iss": "https://idp.example.com", "aud": "mcp" }),
        );

        let error = validator().validate(&token).await.expect_err("must fail");
        assert!(matches!(error, TokenError::BadAlgorithm { .. }));
    }

    #[tokio::test]
    async fn unlisted_but_supported_algorithm_is_rejected() {
        // ES256 is valid in general but absent from this issuer's allow-list.
        let token = forge(
            &serde_json::json!({ "alg": "ES256" }),
            &serde_json::json!({ "iss": "https://idp.example.com", "aud": "mcp" }),
        );

        let error = validator().validate(&token).await.expect_err("must fail");
        assert!(matches!(error, TokenError::BadAlgorithm { .. }));
    }

    #[tokio::test]
    async fn unknown_issuer_is_rejected() {
        let token = forge(
            &serde_json::json!({ "alg": "RS256" }),
            &serde_json::json!({ "iss": "https://rogue.example.com", "aud": "mcp" }),
        );

        let error = validator().validate(&token).await.expect_err("must fail");
        assert!(matches!(error, TokenError::UnknownIssuer { .. }));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let error = validator().validate("not-a-jwt").await.expect_err("must fail");
        assert!(matches!(error, TokenError::Malformed { .. }));

        let error = validator().validate("a.b").await.expect_err("must fail");
        assert!(matches!(error, TokenError::Malformed { .. }));
    }

    #[test]
    fn audience_accepts_string_and_array_forms() {
        assert!(audience_matches(Some(&serde_json::json!("mcp")), "mcp"));
        assert!(audience_matches(Some(&serde_json::json!(["other", "mcp"])), "mcp"));
        assert!(!audience_matches(Some(&serde_json::json!(["other"])), "mcp"));
        assert!(!audience_matches(Some(&serde_json::json!(42)), "mcp"));
        assert!(!audience_matches(None, "mcp"));
    }

    #[test]
    fn claim_checks_enforce_lifetimes() {
        let idp = test_idp();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let claims = |exp: i64, iat: i64| -> serde_json::Map<String, Value> {
            serde_json::json!({
                "iss": "https://idp.example.com",
                "aud": "mcp",
                "exp": exp,
                "iat": iat,
            })
            .as_object()
            .expect("object literal")
            .clone()
        };

        check_claims(&claims(now + 300, now), &idp).expect("valid claims");

        assert!(matches!(
            check_claims(&claims(now - 400, now - 500), &idp),
            Err(TokenError::Expired)
        ));

        // Old but unexpired: max token age still rejects it.
        assert!(matches!(
            check_claims(&claims(now + 300, now - 7200), &idp),
            Err(TokenError::TooOld)
        ));

        // Issued in the future.
        assert!(matches!(
            check_claims(&claims(now + 600, now + 500), &idp),
            Err(TokenError::ClockSkew)
        ));
    }

    #[test]
    fn nbf_is_honoured_and_optionally_required() {
        let mut idp = test_idp();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let mut claims = serde_json::json!({
            "iss": "https://idp.example.com",
            "aud": "mcp",
            "exp": now + 300,
            "iat": now,
            "nbf": now + 600,
        })
        .as_object()
        .expect("object literal")
        .clone();

        assert!(matches!(check_claims(&claims, &idp), Err(TokenError::NotYetValid)));

        claims.remove("nbf");
        check_claims(&claims, &idp).expect("nbf optional by default");

        idp.security.require_nbf = true;
        assert!(matches!(check_claims(&claims, &idp), Err(TokenError::Malformed { .. })));
    }
}
