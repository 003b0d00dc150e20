#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use common::*;
use obo_gateway::audit::{AuditConfig, AuditService};
use obo_gateway::cache::{CacheOptions, EncryptedTokenCache};
use obo_gateway::exchange::{
    ExchangeConfig, ExchangeError, ExchangeRequest, TokenExchangeService, TokenExchangeServiceOptions,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn delegation_jwt(exp: i64) -> String {
    forge(
        &json!({ "alg": "RS256" }),
        &json!({
            "sub": "u1",
            "legacy_name": "CONTOSO\\alice",
            "roles": ["db-writer"],
            "permissions": ["read", "write"],
            "exp": exp,
        }),
    )
}

fn service(cache: Arc<EncryptedTokenCache>) -> TokenExchangeService {
    TokenExchangeService::new(
        cache,
        Arc::new(AuditService::new(AuditConfig::default())),
        TokenExchangeServiceOptions {
            allow_insecure_endpoints: true,
            ..TokenExchangeServiceOptions::default()
        },
    )
    .expect("service builds")
}

fn exchange_config(idp: &MockServer, cache_enabled: bool) -> ExchangeConfig {
    let mut config = ExchangeConfig::new(
        format!("{}/token", idp.uri()).parse().unwrap(),
        "gateway".to_owned(),
        "client-secret".to_owned(),
        "urn:sql:db".to_owned(),
    );
    config.cache_enabled = cache_enabled;
    config
}

fn request<'a>(subject_token: &'a str, session_id: Option<&'a str>) -> ExchangeRequest<'a> {
    ExchangeRequest {
        subject_token,
        audience: "",
        scope: None,
        session_id,
        jwt_subject: "u1",
    }
}

async fn mount_token_endpoint(idp: &MockServer, access_token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange"))
        .and(body_string_contains("audience=urn%3Asql%3Adb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access_token,
            "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
            "token_type": "Bearer",
            "expires_in": 300,
        })))
        .expect(expected_calls)
        .mount(idp)
        .await;
}

#[tokio::test]
async fn exchange_decodes_delegation_claims() {
    let idp = MockServer::start().await;
    mount_token_endpoint(&idp, &delegation_jwt(now() + 300), 1).await;

    let service = service(Arc::new(EncryptedTokenCache::new(CacheOptions::default())));
    let subject = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1" }));

    let token = service
        .exchange(&exchange_config(&idp, false), request(&subject, None))
        .await
        .expect("exchange succeeds");

    assert_eq!(token.claims.legacy_name.as_deref(), Some("CONTOSO\\alice"));
    assert_eq!(token.claims.roles, ["db-writer"]);
    assert!(!token.from_cache);
}

#[tokio::test]
async fn same_jwt_hits_the_cache_and_spares_the_idp() {
    let idp = MockServer::start().await;
    mount_token_endpoint(&idp, &delegation_jwt(now() + 300), 1).await;

    let cache = Arc::new(EncryptedTokenCache::new(CacheOptions::default()));
    let service = service(Arc::clone(&cache));
    let config = exchange_config(&idp, true);

    let subject = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1" }));

    let first = service
        .exchange(&config, request(&subject, Some("mcp-1")))
        .await
        .expect("exchange succeeds");
    let second = service
        .exchange(&config, request(&subject, Some("mcp-1")))
        .await
        .expect("cache hit");

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.access_token, second.access_token);

    let metrics = cache.metrics();
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.misses, 1);
}

#[tokio::test]
async fn a_different_jwt_cannot_use_the_cached_token() {
    let idp = MockServer::start().await;
    mount_token_endpoint(&idp, &delegation_jwt(now() + 300), 2).await;

    let cache = Arc::new(EncryptedTokenCache::new(CacheOptions::default()));
    let service = service(Arc::clone(&cache));
    let config = exchange_config(&idp, true);

    let first_jwt = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1", "jti": "a" }));
    let second_jwt = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1", "jti": "b" }));

    service
        .exchange(&config, request(&first_jwt, Some("mcp-1")))
        .await
        .expect("exchange succeeds");

    // Same session id, different requestor JWT: AAD binding forces a miss
    // and a fresh IdP call.
    let second = service
        .exchange(&config, request(&second_jwt, Some("mcp-1")))
        .await
        .expect("fresh exchange");

    assert!(!second.from_cache);
    assert!(cache.metrics().decryption_failures >= 1);
}

#[tokio::test]
async fn near_expiry_hits_are_treated_as_misses() {
    let idp = MockServer::start().await;
    // Delegation token that expires in 3 seconds: under the 5 s margin.
    mount_token_endpoint(&idp, &delegation_jwt(now() + 3), 2).await;

    let cache = Arc::new(EncryptedTokenCache::new(CacheOptions::default()));
    let service = service(Arc::clone(&cache));
    let config = exchange_config(&idp, true);

    let subject = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1" }));

    let first = service
        .exchange(&config, request(&subject, Some("mcp-1")))
        .await
        .expect("exchange succeeds");
    let second = service
        .exchange(&config, request(&subject, Some("mcp-1")))
        .await
        .expect("fresh exchange");

    assert!(!first.from_cache);
    assert!(!second.from_cache);
}

#[tokio::test]
async fn idp_errors_are_sanitised() {
    let idp = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "subject token was minted by realm internal-secrets",
        })))
        .mount(&idp)
        .await;

    let service = service(Arc::new(EncryptedTokenCache::new(CacheOptions::default())));
    let subject = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1" }));

    let error = service
        .exchange(&exchange_config(&idp, false), request(&subject, None))
        .await
        .expect_err("IdP refused");

    assert_eq!(error.code(), "TOKEN_EXCHANGE_IDP_ERROR");

    let rendered = error.to_string();
    assert!(rendered.contains("invalid_grant"));
    assert!(!rendered.contains("internal-secrets"));
    assert!(!rendered.contains(&subject));
}

#[tokio::test]
async fn plain_http_endpoint_is_refused_outside_development() {
    let idp = MockServer::start().await;

    let strict_service = TokenExchangeService::new(
        Arc::new(EncryptedTokenCache::new(CacheOptions::default())),
        Arc::new(AuditService::new(AuditConfig::default())),
        TokenExchangeServiceOptions::default(),
    )
    .expect("service builds");

    let subject = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1" }));

    let error = strict_service
        .exchange(&exchange_config(&idp, false), request(&subject, None))
        .await
        .expect_err("insecure endpoint");

    assert!(matches!(error, ExchangeError::Insecure));
    assert!(idp.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn uncached_exchanges_are_rate_limited_per_session_and_audience() {
    let idp = MockServer::start().await;
    mount_token_endpoint(&idp, &delegation_jwt(now() + 300), 2).await;

    let service = TokenExchangeService::new(
        Arc::new(EncryptedTokenCache::new(CacheOptions::default())),
        Arc::new(AuditService::new(AuditConfig::default())),
        TokenExchangeServiceOptions {
            allow_insecure_endpoints: true,
            uncached_exchanges_per_minute: 2,
        },
    )
    .expect("service builds");

    let config = exchange_config(&idp, false);
    let subject = forge(&json!({ "alg": "RS256" }), &json!({ "sub": "u1" }));

    for _ in 0..2 {
        service
            .exchange(&config, request(&subject, Some("mcp-1")))
            .await
            .expect("within budget");
    }

    let error = service
        .exchange(&config, request(&subject, Some("mcp-1")))
        .await
        .expect_err("over budget");

    assert!(matches!(error, ExchangeError::RateLimited));
}

#[tokio::test]
async fn empty_subject_token_is_refused() {
    let idp = MockServer::start().await;

    let service = service(Arc::new(EncryptedTokenCache::new(CacheOptions::default())));

    let error = service
        .exchange(&exchange_config(&idp, false), request("", None))
        .await
        .expect_err("empty subject token");

    assert!(matches!(error, ExchangeError::EmptySubjectToken));
}
