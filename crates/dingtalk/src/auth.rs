use std::{sync::Mutex, time::Duration};

use {
    futures::future::{BoxFuture, FutureExt, Shared},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio::time::Instant,
    tracing::debug,
};

use crate::{
    accounts::DingTalkCredentials,
    error::{Error, Result},
};

/// Tokens are refreshed once they are this close to expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

const DEFAULT_TOKEN_TTL_SECS: u64 = 7200;

#[derive(Clone)]
pub struct CachedAccessToken {
    pub token: Secret<String>,
    pub expires_at: Instant,
}

impl CachedAccessToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: Option<String>,
    expire_in: Option<u64>,
    code: Option<String>,
    message: Option<String>,
}

type RefreshFuture =
    Shared<BoxFuture<'static, std::result::Result<CachedAccessToken, String>>>;

#[derive(Default)]
struct TokenState {
    cached: Option<CachedAccessToken>,
    /// Refresh currently in flight, tagged with its generation.
    inflight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

/// Access-token cache for the DingTalk open API.
///
/// Concurrent callers share one in-flight refresh: however many tasks ask
/// for a token while it is stale, a single exchange hits the network.
pub struct TokenCache {
    http: reqwest::Client,
    token_url: String,
    app_key: String,
    app_secret: Secret<String>,
    state: Mutex<TokenState>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, api_base: &str, credentials: &DingTalkCredentials) -> Self {
        Self {
            http,
            token_url: format!("{}/v1.0/oauth2/accessToken", api_base.trim_end_matches('/')),
            app_key: credentials.app_key.clone(),
            app_secret: credentials.app_secret.clone(),
            state: Mutex::new(TokenState::default()),
        }
    }

    pub async fn get_access_token(&self) -> Result<Secret<String>> {
        let (generation, refresh) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = state.cached.as_ref()
                && cached.is_fresh(Instant::now())
            {
                return Ok(cached.token.clone());
            }
            match state.inflight.as_ref() {
                Some((generation, refresh)) => (*generation, refresh.clone()),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    debug!(generation, "refreshing DingTalk access token");
                    let refresh = fetch_token(
                        self.http.clone(),
                        self.token_url.clone(),
                        self.app_key.clone(),
                        self.app_secret.clone(),
                    )
                    .boxed()
                    .shared();
                    state.inflight = Some((generation, refresh.clone()));
                    (generation, refresh)
                },
            }
        };

        let outcome = refresh.await;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state
            .inflight
            .as_ref()
            .is_some_and(|(current, _)| *current == generation)
        {
            state.inflight = None;
            // A failed refresh leaves the cache empty rather than stale.
            state.cached = outcome.as_ref().ok().cloned();
        }
        outcome.map(|cached| cached.token).map_err(Error::auth)
    }

    /// Drop the cached token, e.g. after the API rejected it.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cached = None;
    }
}

async fn fetch_token(
    http: reqwest::Client,
    url: String,
    app_key: String,
    app_secret: Secret<String>,
) -> std::result::Result<CachedAccessToken, String> {
    let body = serde_json::json!({
        "appKey": app_key,
        "appSecret": app_secret.expose_secret(),
    });
    let resp = http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("token request failed: {e}"))?;
    let status = resp.status();
    let text = resp.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("token endpoint returned {status}: {text}"));
    }

    let parsed: TokenResponse =
        serde_json::from_str(&text).map_err(|e| format!("invalid token response: {e}"))?;
    let Some(token) = parsed.access_token.filter(|t| !t.is_empty()) else {
        return Err(format!(
            "token response without accessToken ({}: {})",
            parsed.code.unwrap_or_default(),
            parsed.message.unwrap_or_default()
        ));
    };
    let ttl = parsed.expire_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    Ok(CachedAccessToken {
        token: Secret::new(token),
        expires_at: Instant::now() + Duration::from_secs(ttl),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(server: &mockito::Server) -> TokenCache {
        let creds = DingTalkCredentials {
            app_key: "ding123".into(),
            app_secret: Secret::new("s3cret".into()),
            agent_id: None,
        };
        TokenCache::new(reqwest::Client::new(), &server.url(), &creds)
    }

    #[tokio::test]
    async fn caches_token_within_validity_window() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "appKey": "ding123",
                "appSecret": "s3cret",
            })))
            .with_status(200)
            .with_body(r#"{"accessToken":"tok-1","expireIn":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let cache = cache(&server);
        let first = cache.get_access_token().await.unwrap();
        let second = cache.get_access_token().await.unwrap();
        assert_eq!(first.expose_secret(), "tok-1");
        assert_eq!(second.expose_secret(), "tok-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn concurrent_cold_start_fetches_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"tok-1","expireIn":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let cache = cache(&server);
        let tokens =
            futures::future::join_all((0..8).map(|_| cache.get_access_token())).await;
        for token in tokens {
            assert_eq!(token.unwrap().expose_secret(), "tok-1");
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_near_expiry_refreshes_once_under_concurrency() {
        let mut server = mockito::Server::new_async().await;
        // 120s is inside the refresh margin, so every cached token is stale.
        let mock = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"short","expireIn":120}"#)
            .expect(2)
            .create_async()
            .await;

        let cache = cache(&server);
        cache.get_access_token().await.unwrap();
        let tokens =
            futures::future::join_all((0..8).map(|_| cache.get_access_token())).await;
        assert!(tokens.iter().all(Result::is_ok));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failure_leaves_cache_empty() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_status(401)
            .with_body(r#"{"code":"InvalidAuthentication","message":"bad secret"}"#)
            .expect(1)
            .create_async()
            .await;

        let cache = cache(&server);
        let err = cache.get_access_token().await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        failing.assert_async().await;
        failing.remove_async().await;

        let ok = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"tok-2","expireIn":7200}"#)
            .expect(1)
            .create_async()
            .await;
        assert_eq!(cache.get_access_token().await.unwrap().expose_secret(), "tok-2");
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn vendor_error_body_is_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"code":"Forbidden.AccessDenied","message":"ip not allowed"}"#)
            .create_async()
            .await;

        let err = cache(&server).get_access_token().await.unwrap_err();
        assert!(err.to_string().contains("Forbidden.AccessDenied"));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"tok","expireIn":7200}"#)
            .expect(2)
            .create_async()
            .await;

        let cache = cache(&server);
        cache.get_access_token().await.unwrap();
        cache.invalidate();
        cache.get_access_token().await.unwrap();
        mock.assert_async().await;
    }
}
