//! Request authentication (spec §6, out-of-scope identity service stubbed
//! behind a trait). Grounded on the teacher's `ApiKeyExtractor`
//! (`config.rs`) header-reading shape, generalized from "extract a string
//! for rate-limit keying" into "resolve a full `AuthContext`".

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::GatewayError;
use crate::model::AuthContext;

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, GatewayError>;
}

/// Static bearer-token authenticator: a fixed table of API key -> account
/// context, read from configuration. Sufficient for the gateway's own
/// scope (spec §1 Non-goals exclude building an identity provider).
pub struct StaticBearerAuthenticator {
    keys: std::collections::HashMap<String, AuthContext>,
}

impl StaticBearerAuthenticator {
    pub fn new(keys: std::collections::HashMap<String, AuthContext>) -> Self {
        Self { keys }
    }

    fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
        let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
        raw.strip_prefix("Bearer ").or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        })
    }
}

#[async_trait]
impl Authenticator for StaticBearerAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, GatewayError> {
        let token = Self::extract_bearer(headers).ok_or(GatewayError::Unauthorized)?;
        self.keys.get(token).cloned().ok_or(GatewayError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sample_auth() -> AuthContext {
        AuthContext {
            account_id: "acct-1".into(),
            team_id: None,
            api_key_id: "key-1".into(),
            is_admin: false,
            account_tier: 1,
        }
    }

    #[tokio::test]
    async fn bearer_token_resolves_to_configured_context() {
        let mut keys = std::collections::HashMap::new();
        keys.insert("sk-test".to_string(), sample_auth());
        let auth = StaticBearerAuthenticator::new(keys);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-test"),
        );
        let ctx = auth.authenticate(&headers).await.unwrap();
        assert_eq!(ctx.account_id, "acct-1");
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let auth = StaticBearerAuthenticator::new(std::collections::HashMap::new());
        let headers = HeaderMap::new();
        let result = auth.authenticate(&headers).await;
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
    }
}
