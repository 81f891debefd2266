use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::api::errors::ApiError;
use crate::config::Config;
use crate::metrics_utils::TOKEN_RESOLUTIONS_COUNTER;
use crate::store::{StoreError, TokenStore};
use crate::tokens::token_models::{validate_secret, ApiToken, TokenType, WILDCARD};

pub const FRONTEND_ACCESS: &[TokenType] = &[TokenType::Frontend, TokenType::Admin];
pub const CLIENT_ACCESS: &[TokenType] = &[TokenType::Client, TokenType::Admin];
pub const ADMIN_ACCESS: &[TokenType] = &[TokenType::Admin];

/// Reads the secret from the Authorization header, with or without a `Bearer` prefix.
pub fn extract_secret(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let secret = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    };
    (!secret.is_empty()).then_some(secret)
}

pub struct TokenResolver {
    store: Arc<dyn TokenStore>,
}

impl TokenResolver {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        TokenResolver { store }
    }

    /// Resolves a secret into its token, checking the token type against the route's allowed set.
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        secret: Option<&str>,
        allowed: &[TokenType],
    ) -> Result<ApiToken, ApiError> {
        let result = self.lookup(secret, allowed).await;
        let outcome = match &result {
            Ok(_) => "resolved",
            Err(e) => e.error_code(),
        };
        metrics::counter!(TOKEN_RESOLUTIONS_COUNTER, "outcome" => outcome).increment(1);
        result
    }

    async fn lookup(
        &self,
        secret: Option<&str>,
        allowed: &[TokenType],
    ) -> Result<ApiToken, ApiError> {
        let secret = secret.ok_or(ApiError::MissingToken)?;
        validate_secret(secret)?;

        let token = self
            .store
            .get_token(secret)
            .await?
            .ok_or(ApiError::UnknownToken)?;

        if !allowed.contains(&token.token_type) {
            tracing::debug!(token_type = %token.token_type, "token type not allowed");
            return Err(ApiError::Forbidden(token.token_type));
        }
        Ok(token)
    }

    pub async fn resolve_headers(
        &self,
        headers: &HeaderMap,
        allowed: &[TokenType],
    ) -> Result<ApiToken, ApiError> {
        self.resolve(extract_secret(headers), allowed).await
    }
}

/// Builds a token from a configured secret. Admin tokens always get full scope,
/// other tokens must be bound to one environment.
fn seeded_token(
    secret: &str,
    token_type: TokenType,
    now: DateTime<Utc>,
) -> Result<ApiToken, String> {
    let mut token = ApiToken::from_secret(secret, token_type, now).map_err(|e| e.to_string())?;
    match token_type {
        TokenType::Admin => {
            token.projects = vec![WILDCARD.to_string()];
            token.environment = WILDCARD.to_string();
        }
        TokenType::Client | TokenType::Frontend if token.environment == WILDCARD => {
            return Err("environment must not be a wildcard".to_string());
        }
        _ => {}
    }
    Ok(token)
}

/// Inserts the tokens listed in configuration, skipping those already present.
/// Returns how many were inserted.
pub async fn seed_tokens(
    store: &dyn TokenStore,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let configured = [
        (TokenType::Admin, &config.init_admin_api_tokens),
        (TokenType::Client, &config.init_client_api_tokens),
        (TokenType::Frontend, &config.init_frontend_api_tokens),
    ];

    let mut inserted = 0;
    for (token_type, secrets) in configured {
        for secret in secrets.0.iter() {
            let token = match seeded_token(secret, token_type, now) {
                Ok(token) => token,
                Err(reason) => {
                    tracing::warn!(%token_type, %reason, "skipping configured token");
                    continue;
                }
            };
            match store.insert_token(&token).await {
                Ok(()) => inserted += 1,
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::config::SecretList;
    use crate::store::memory::MemoryStore;
    use crate::tokens::token_models::InvalidTokenReason;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    async fn resolver_with(tokens: &[(&str, TokenType)]) -> TokenResolver {
        let store = Arc::new(MemoryStore::new());
        for (secret, token_type) in tokens {
            let token = ApiToken::from_secret(secret, *token_type, Utc::now()).unwrap();
            store.insert_token(&token).await.unwrap();
        }
        TokenResolver::new(store)
    }

    #[test]
    fn test_extract_secret() {
        assert_eq!(
            extract_secret(&headers("default:development.abc")),
            Some("default:development.abc")
        );
        assert_eq!(
            extract_secret(&headers("Bearer default:development.abc")),
            Some("default:development.abc")
        );
        assert_eq!(extract_secret(&headers("Bearer ")), None);
        assert_eq!(extract_secret(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_resolve_failures() {
        let resolver = resolver_with(&[("default:development.client", TokenType::Client)]).await;

        assert!(matches!(
            resolver.resolve(None, FRONTEND_ACCESS).await,
            Err(ApiError::MissingToken)
        ));
        assert!(matches!(
            resolver.resolve(Some("no-shape"), FRONTEND_ACCESS).await,
            Err(ApiError::InvalidToken(InvalidTokenReason::IsMalformed))
        ));
        assert!(matches!(
            resolver
                .resolve(Some("default:development.unknown"), FRONTEND_ACCESS)
                .await,
            Err(ApiError::UnknownToken)
        ));
        assert!(matches!(
            resolver
                .resolve(Some("default:development.client"), FRONTEND_ACCESS)
                .await,
            Err(ApiError::Forbidden(TokenType::Client))
        ));
    }

    #[tokio::test]
    async fn test_resolve_allowed_types() {
        let resolver = resolver_with(&[
            ("default:development.frontend", TokenType::Frontend),
            ("*:*.admin", TokenType::Admin),
        ])
        .await;

        let token = resolver
            .resolve(Some("default:development.frontend"), FRONTEND_ACCESS)
            .await
            .unwrap();
        assert_eq!(token.token_type, TokenType::Frontend);

        let token = resolver
            .resolve_headers(&headers("Bearer *:*.admin"), FRONTEND_ACCESS)
            .await
            .unwrap();
        assert_eq!(token.token_type, TokenType::Admin);

        assert!(matches!(
            resolver
                .resolve(Some("default:development.frontend"), ADMIN_ACCESS)
                .await,
            Err(ApiError::Forbidden(TokenType::Frontend))
        ));
    }

    #[tokio::test]
    async fn test_seed_tokens_is_repeatable() {
        let store = MemoryStore::new();
        let config = Config {
            init_admin_api_tokens: SecretList(vec!["default:development.admin".to_string()]),
            init_client_api_tokens: SecretList(vec![
                "default:development.client".to_string(),
                "*:*.wildcard-env".to_string(),
                "garbage".to_string(),
            ]),
            init_frontend_api_tokens: SecretList(vec!["default:development.frontend".to_string()]),
            ..Config::default_test_config()
        };

        assert_eq!(seed_tokens(&store, &config, Utc::now()).await.unwrap(), 3);
        assert_eq!(seed_tokens(&store, &config, Utc::now()).await.unwrap(), 0);

        let admin = store
            .get_token("default:development.admin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admin.projects, vec!["*".to_string()]);
        assert_eq!(admin.environment, "*");
        assert!(store.get_token("*:*.wildcard-env").await.unwrap().is_none());
    }
}
