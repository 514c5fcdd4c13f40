use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::header::{self, HeaderMap};
use reqwest::{Method, StatusCode};
use tokio::time::sleep;

use crate::{
    cache::{CacheKey, CacheStore, EtagCache},
    decode::{decode_body, retry_after},
    retry::{RetryDecision, RetryPolicy, RetryState, RetryTrigger},
    usage::UsageCounter,
    ApiRequest, ApiResult, AuthFlow, AuthProvider, BearerToken, Body, CallOptions,
    ClientCredentials, ClientOptions, Decoded, ErrorResponse, Params, Result, SpfyError,
};

/// HTTP client for the Spotify Web API request pipeline.
///
/// Cloning is cheap; clones share the connection pool, the ETag cache and
/// the auth session.
#[derive(Clone)]
pub struct SpfyClient {
    inner: Arc<ClientInner>,
}

#[derive(Clone)]
struct ClientInner {
    http: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
    cache: EtagCache,
    usage: Option<Arc<dyn UsageCounter>>,
    options: ClientOptions,
    retry: RetryPolicy,
}

/// Non-owning handle results keep to the client that produced them.
#[derive(Clone, Default)]
pub(crate) struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<SpfyClient> {
        self.0.upgrade().map(|inner| SpfyClient { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for SpfyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpfyClient")
            .field("flow", &self.inner.auth.flow())
            .field("authorization", &"<redacted>")
            .field("cache", &self.inner.cache)
            .field("options", &self.inner.options)
            .finish()
    }
}

/// A request ready to be sent, with its cache fingerprint.
struct PreparedCall {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    content_type: String,
    headers: HeaderMap,
    key: CacheKey,
}

impl SpfyClient {
    /// Creates a client with default options and an in-process ETag cache.
    pub fn new<A: AuthProvider + 'static>(auth: A) -> Self {
        Self::with_auth(Arc::new(auth))
    }

    pub fn with_auth(auth: Arc<dyn AuthProvider>) -> Self {
        let options = ClientOptions::default();
        Self {
            inner: Arc::new(ClientInner {
                http: reqwest::Client::new(),
                auth,
                cache: EtagCache::in_memory(options.cache_ttl()),
                usage: None,
                retry: RetryPolicy::from_options(&options),
                options,
            }),
        }
    }

    /// Creates a client from a user access token.
    ///
    /// If the token is missing the `Bearer ` prefix, it is added automatically.
    pub fn from_bearer(token: impl Into<String>) -> Self {
        Self::new(BearerToken::new(token))
    }

    /// Creates a client-credentials client from environment variables.
    ///
    /// Reads `SPFY_CLIENT_ID`, `SPFY_CLIENT_SECRET` and the `SPFY_*` option
    /// overrides described on [`ClientOptions::from_env`]. The session is not
    /// opened yet; call [`SpfyClient::authenticate`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use spfy_http::SpfyClient;
    ///
    /// # async fn run() -> spfy_http::Result<()> {
    /// let client = SpfyClient::from_env()?;
    /// client.authenticate().await?;
    /// let artist = client.get("artists/0oSGxfWSnnOXhD2fKuz2Gy", ()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_env() -> Result<Self> {
        let auth = ClientCredentials::from_env()?;
        let options = ClientOptions::from_env()?;
        Self::new(auth).with_options(options)
    }

    /// Applies client options such as timeout, cache TTL and retry behavior.
    ///
    /// Fails with [`SpfyError::Config`] when [`ClientOptions::validate`]
    /// rejects `opts`.
    pub fn with_options(self, opts: ClientOptions) -> Result<Self> {
        opts.validate()?;
        Ok(self.map_inner(|inner| {
            inner.retry = RetryPolicy::from_options(&opts);
            inner.cache = inner.cache.clone().with_ttl(opts.cache_ttl());
            inner.options = opts;
        }))
    }

    /// Replaces the in-process cache with another backing store.
    pub fn with_cache_store(self, store: Arc<dyn CacheStore>) -> Self {
        self.map_inner(|inner| {
            inner.cache = EtagCache::new(store, inner.options.cache_ttl());
        })
    }

    pub fn with_usage_counter(self, counter: Arc<dyn UsageCounter>) -> Self {
        self.map_inner(|inner| inner.usage = Some(counter))
    }

    /// Uses a preconfigured `reqwest` client (proxy, TLS, user agent).
    pub fn with_http_client(self, http: reqwest::Client) -> Self {
        self.map_inner(|inner| inner.http = http)
    }

    fn map_inner(self, apply: impl FnOnce(&mut ClientInner)) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        apply(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn cache(&self) -> &EtagCache {
        &self.inner.cache
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.inner.auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.auth.is_authenticated()
    }

    /// Opens the session if it is not open yet.
    pub async fn authenticate(&self) -> Result<()> {
        if self.inner.auth.is_authenticated() {
            return Ok(());
        }
        self.inner.auth.reauthenticate(self.inner.auth.flow()).await
    }

    pub async fn get<P: Into<Params>>(&self, url: &str, params: P) -> Result<Decoded> {
        self.execute(ApiRequest::get(url).params(params), CallOptions::default())
            .await
    }

    pub async fn post<P: Into<Params>>(
        &self,
        url: &str,
        params: P,
        body: Option<Body>,
    ) -> Result<Decoded> {
        self.execute(with_body(ApiRequest::post(url).params(params), body), CallOptions::default())
            .await
    }

    pub async fn put<P: Into<Params>>(
        &self,
        url: &str,
        params: P,
        body: Option<Body>,
    ) -> Result<Decoded> {
        self.execute(with_body(ApiRequest::put(url).params(params), body), CallOptions::default())
            .await
    }

    pub async fn delete<P: Into<Params>>(
        &self,
        url: &str,
        params: P,
        body: Option<Body>,
    ) -> Result<Decoded> {
        self.execute(
            with_body(ApiRequest::delete(url).params(params), body),
            CallOptions::default(),
        )
        .await
    }

    /// Performs one logical call, retrying per the client's retry policy.
    ///
    /// Rate-limited replies (429 and 5xx) are retried after the server's
    /// `Retry-After` for as long as it takes; cancel the future to give up.
    pub async fn execute(&self, request: ApiRequest, call: CallOptions) -> Result<Decoded> {
        let auth = &self.inner.auth;
        if !auth.is_authenticated() {
            return Err(SpfyError::AuthRequired);
        }

        let prepared = self.prepare(&request)?;
        tracing::debug!(method = %prepared.method, url = %prepared.url, key = %prepared.key, "api call");

        let mut state = RetryState::new(&self.inner.retry, &call);
        loop {
            let err = match self.attempt(&prepared, &call).await {
                Ok(decoded) => return Ok(decoded),
                Err(err) => err,
            };

            match state.decide(&err, auth.flow()) {
                RetryDecision::Wait(delay, trigger) => {
                    log_wait(trigger, delay, &prepared.url, &err);
                    sleep(delay).await;
                }
                RetryDecision::Reauthenticate => {
                    tracing::info!("access token expired, re-authenticating");
                    auth.reauthenticate(AuthFlow::ClientCredentials).await?;
                }
                RetryDecision::Surface => {
                    tracing::debug!(last_error = ?state.last_error(), url = %prepared.url, "giving up");
                    return Err(err);
                }
            }
        }
    }

    fn prepare(&self, request: &ApiRequest) -> Result<PreparedCall> {
        let url = self.resolve_url(&request.url);
        let body = request.body.as_ref().map(Body::to_bytes).transpose()?;
        let key = CacheKey::compute(&url, &request.params.canonical(), body.as_deref());
        let content_type = request
            .body
            .as_ref()
            .map_or("application/json", Body::content_type)
            .to_owned();

        Ok(PreparedCall {
            method: request.method.clone(),
            url,
            query: request.params.sanitized(),
            body,
            content_type,
            headers: request.headers.clone(),
            key,
        })
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_owned();
        }
        format!(
            "{}/{}",
            self.inner.options.base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }

    /// One attempt; a 304 whose cached body is unusable costs a second,
    /// unconditional round trip.
    async fn attempt(&self, call: &PreparedCall, opts: &CallOptions) -> Result<Decoded> {
        let response = self.send(call, opts, true).await?;
        if response.status() != StatusCode::NOT_MODIFIED {
            return self.finish(call, response, opts).await;
        }

        if let Some(value) = self.inner.cache.revive(&call.key).await {
            return Ok(self.wrap(value));
        }
        tracing::warn!(key = %call.key, url = %call.url, "re-fetching without validator");
        let response = self.send(call, opts, false).await?;
        self.finish(call, response, opts).await
    }

    async fn send(
        &self,
        call: &PreparedCall,
        opts: &CallOptions,
        conditional: bool,
    ) -> Result<reqwest::Response> {
        let credentials = self.inner.auth.credentials().await?;
        if credentials.is_expired() {
            return Err(SpfyError::TokenExpired);
        }

        let mut request = self
            .inner
            .http
            .request(call.method.clone(), &call.url)
            .header(header::AUTHORIZATION, credentials.authorization())
            .header(header::CONTENT_TYPE, &call.content_type)
            .timeout(self.inner.options.timeout());

        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if conditional {
            if let Some(etag) = self.inner.cache.validator(&call.key).await {
                tracing::debug!(key = %call.key, %etag, "conditional request");
                request = request.header(header::IF_NONE_MATCH, etag);
            }
        }
        request = request.headers(call.headers.clone());
        if let Some(body) = &call.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(SpfyError::Transport)?;
        if opts.increment_usage {
            self.count_usage().await;
        }
        Ok(response)
    }

    async fn finish(
        &self,
        call: &PreparedCall,
        response: reqwest::Response,
        opts: &CallOptions,
    ) -> Result<Decoded> {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().to_string();
        let body = response.text().await.map_err(SpfyError::Transport)?;

        if opts.check_device_busy && status == StatusCode::ACCEPTED {
            return Err(SpfyError::DeviceUnavailable(Box::new(ErrorResponse {
                status: status.as_u16(),
                url,
                headers,
                body,
            })));
        }
        if should_wait_on_status(status) {
            return Err(SpfyError::RateLimited {
                status: status.as_u16(),
                retry_after: retry_after(&headers),
            });
        }
        if !status.is_success() {
            let response = Box::new(ErrorResponse {
                status: status.as_u16(),
                url,
                headers,
                body,
            });
            return Err(if status == StatusCode::FORBIDDEN {
                SpfyError::Forbidden(response)
            } else {
                SpfyError::Api(response)
            });
        }

        let Some(value) = decode_body(&body)? else {
            return Ok(Decoded::Empty);
        };
        let etag = headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok());
        self.inner.cache.remember(&call.key, etag, &value).await;
        Ok(self.wrap(value))
    }

    fn wrap(&self, value: serde_json::Value) -> Decoded {
        Decoded::Result(ApiResult::new(
            value,
            WeakClient(Arc::downgrade(&self.inner)),
        ))
    }

    async fn count_usage(&self) {
        let (Some(counter), Some(user_id)) = (&self.inner.usage, self.inner.auth.user_id()) else {
            return;
        };
        if let Err(err) = counter.increment(&user_id).await {
            tracing::warn!(%user_id, error = %err, "cannot update usage counter");
        }
    }
}

fn with_body(request: ApiRequest, body: Option<Body>) -> ApiRequest {
    match body {
        Some(body) => request.body(body),
        None => request,
    }
}

/// Statuses answered by waiting `Retry-After` and asking again.
fn should_wait_on_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn log_wait(trigger: RetryTrigger, delay: Duration, url: &str, err: &SpfyError) {
    match trigger {
        RetryTrigger::RateLimit => tracing::warn!(
            url,
            status = ?err.status(),
            delay_secs = delay.as_secs_f64(),
            "reached API rate limit, retrying"
        ),
        RetryTrigger::DeviceBusy => tracing::warn!(
            url,
            delay_secs = delay.as_secs_f64(),
            "device is temporarily unavailable, retrying"
        ),
        RetryTrigger::Transport => tracing::warn!(
            url,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "transient transport failure, retrying"
        ),
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{should_wait_on_status, SpfyClient};
    use crate::{ApiRequest, CallOptions, ClientCredentials, ClientOptions, SpfyError};

    #[test]
    fn debug_redacts_authorization_value() {
        let client = SpfyClient::from_bearer("secret-token");
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn relative_urls_resolve_against_base() {
        let client = SpfyClient::from_bearer("t").with_options(ClientOptions {
            base_url: "http://localhost:9000/v1/".to_owned(),
            ..ClientOptions::default()
        })
        .expect("valid options");
        assert_eq!(client.resolve_url("me/tracks"), "http://localhost:9000/v1/me/tracks");
        assert_eq!(client.resolve_url("/me"), "http://localhost:9000/v1/me");
        assert_eq!(
            client.resolve_url("https://api.spotify.com/v1/me?offset=5"),
            "https://api.spotify.com/v1/me?offset=5"
        );
    }

    #[test]
    fn with_options_updates_cache_ttl() {
        let client = SpfyClient::from_bearer("t").with_options(ClientOptions {
            cache_ttl_secs: 42,
            ..ClientOptions::default()
        })
        .expect("valid options");
        assert_eq!(client.cache().ttl().as_secs(), 42);
        assert_eq!(client.options().cache_ttl_secs, 42);
    }

    #[test]
    fn with_options_rejects_invalid_settings() {
        let zero_timeout = SpfyClient::from_bearer("t").with_options(ClientOptions {
            timeout_ms: 0,
            ..ClientOptions::default()
        });
        assert!(matches!(zero_timeout, Err(SpfyError::Config(_))));

        let zero_pages = SpfyClient::from_bearer("t").with_options(ClientOptions {
            page_concurrency: 0,
            ..ClientOptions::default()
        });
        assert!(matches!(zero_pages, Err(SpfyError::Config(_))));
    }

    #[test]
    fn rate_limit_statuses() {
        assert!(should_wait_on_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_wait_on_status(StatusCode::BAD_GATEWAY));
        assert!(should_wait_on_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_wait_on_status(StatusCode::FORBIDDEN));
        assert!(!should_wait_on_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn unauthenticated_call_fails_before_sending() {
        let client = SpfyClient::new(ClientCredentials::new("id", "secret")).with_options(
            ClientOptions {
                base_url: "http://127.0.0.1:1/v1/".to_owned(),
                ..ClientOptions::default()
            },
        )
        .expect("valid options");
        let err = client
            .execute(ApiRequest::get("me"), CallOptions::default())
            .await
            .expect_err("no session");
        assert!(matches!(err, SpfyError::AuthRequired));
    }
}
