//! Access token state and the refresh callback contract.
//!
//! Token acquisition is not implemented here: the client carries whatever
//! bearer token it was given and, when a request comes back 401/403, invokes
//! a caller-supplied refresh callback with the full request context. The
//! callback decides whether to hand back a rotated token or abort.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// The current access token and its expiry, shared by every in-flight fetch
/// of a traversal so a refresh is visible to all of them.
#[derive(Debug, Clone, Default)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub expiry: Option<OffsetDateTime>,
}

/// Shared, mutable token state.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<TokenState>>,
}

impl SharedToken {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TokenState {
                access_token,
                expiry: None,
            })),
        }
    }

    pub async fn get(&self) -> TokenState {
        self.inner.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.read().await.access_token.clone()
    }

    pub async fn set(&self, access_token: Option<String>, expiry: Option<OffsetDateTime>) {
        let mut state = self.inner.write().await;
        state.access_token = access_token;
        state.expiry = expiry;
    }
}

/// Everything a refresh callback needs to decide what to do.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    /// The URL of the request that was rejected.
    pub url: String,
    /// The HTTP status that triggered the refresh (401 or 403).
    pub status: u16,
    /// The token the rejected request carried.
    pub current_token: Option<String>,
    /// Expiry of the current token, when known.
    pub expiry: Option<OffsetDateTime>,
    /// How many times the request has been retried so far.
    pub retry_count: u32,
}

/// The callback's answer.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// The replacement token, if one could be obtained.
    pub access_token: Option<String>,
    /// Expiry of the replacement token.
    pub expiry_date: Option<OffsetDateTime>,
    /// True to give up on this request instead of retrying.
    pub abort_request: bool,
}

impl RefreshOutcome {
    /// A successful rotation to the given token.
    pub fn rotated(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            expiry_date: None,
            abort_request: false,
        }
    }

    /// Abort the request; no token is available.
    pub fn abort() -> Self {
        Self {
            access_token: None,
            expiry_date: None,
            abort_request: true,
        }
    }
}

/// Async token refresh callback.
pub type RefreshTokenCallback =
    Arc<dyn Fn(RefreshContext) -> BoxFuture<'static, RefreshOutcome> + Send + Sync>;

/// Wrap an async closure as a [`RefreshTokenCallback`].
pub fn refresh_callback<F, Fut>(f: F) -> RefreshTokenCallback
where
    F: Fn(RefreshContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = RefreshOutcome> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_token_rotation_visible() {
        let token = SharedToken::new(Some("old".to_string()));
        let other = token.clone();
        other.set(Some("new".to_string()), None).await;
        assert_eq!(token.access_token().await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_refresh_callback_invocation() {
        let callback = refresh_callback(|ctx: RefreshContext| async move {
            assert_eq!(ctx.status, 401);
            RefreshOutcome::rotated("rotated-token")
        });
        let outcome = callback(RefreshContext {
            url: "http://fhir.example.com/Patient/1".to_string(),
            status: 401,
            current_token: Some("old".to_string()),
            expiry: None,
            retry_count: 0,
        })
        .await;
        assert_eq!(outcome.access_token.as_deref(), Some("rotated-token"));
        assert!(!outcome.abort_request);
    }

    #[test]
    fn test_abort_outcome() {
        let outcome = RefreshOutcome::abort();
        assert!(outcome.abort_request);
        assert!(outcome.access_token.is_none());
    }
}
