use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, TtlCache};
use crate::classifier::classify_response;
use crate::errors::{Result, SyncError};

const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";
const DEFAULT_API_VERSION: &str = "v19.0";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_ENV_VAR: &str = "META_ACCESS_TOKEN";

/// Headers in which Graph reports per-app / per-account usage and the
/// number of minutes until throttling lifts.
const USAGE_HEADERS: &[&str] = &[
    "x-business-use-case-usage",
    "x-ad-account-usage",
    "x-app-usage",
];

/// Where the bearer token is attached on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlacement {
    /// `access_token` query parameter (Graph API default).
    Query,
    /// `Authorization: Bearer` header.
    Header,
}

/// Re-authenticates without user interaction.
///
/// Invoked at most once per HTTP request, after the remote side rejected the
/// current token. The returned token replaces the gateway's credentials.
///
/// The budget is per request, not per logical operation: a chunked upload or
/// an action batch issues many requests, and each of them may trigger one
/// refresh of its own. A refresher that must not run repeatedly should
/// remember its last success and fail with [`SyncError::AuthExpired`], which
/// the gateway then reports as [`SyncError::SessionExpired`].
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String>;
}

/// Builder for constructing a [`Gateway`] with custom configuration.
///
/// # Example
///
/// ```no_run
/// use graphsync::GatewayBuilder;
/// use std::time::Duration;
///
/// # fn example() -> graphsync::Result<()> {
/// let gateway = GatewayBuilder::new()
///     .access_token("EAAB...")
///     .api_version("v19.0")
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct GatewayBuilder {
    access_token: Option<String>,
    base_url: String,
    api_version: String,
    timeout: Duration,
    auth_placement: AuthPlacement,
    cache: Option<Arc<TtlCache>>,
    cache_ttl: Option<Duration>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl GatewayBuilder {
    /// Start from the defaults: public Graph host, `v19.0`, 60 s timeout,
    /// token in the query string and a private five-minute cache.
    pub fn new() -> Self {
        Self {
            access_token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: DEFAULT_TIMEOUT,
            auth_placement: AuthPlacement::Query,
            cache: None,
            cache_ttl: None,
            refresher: None,
        }
    }

    /// Set the access token. Surrounding whitespace is trimmed on build.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Override the base URL (defaults to `https://graph.facebook.com`).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Path prefix inserted before every call. An empty string disables it.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Set the HTTP request timeout (defaults to 60 seconds).
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    /// Choose how the token is attached (defaults to the `access_token` query parameter).
    pub fn auth_placement(mut self, placement: AuthPlacement) -> Self {
        self.auth_placement = placement;
        self
    }

    /// Share an existing cache instead of creating a private one.
    pub fn cache(mut self, cache: Arc<TtlCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// TTL of the private cache. Ignored when [`cache`](Self::cache) is set.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Install a hook that renews an expired token without user interaction.
    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Build the [`Gateway`].
    ///
    /// If no token was set via [`access_token`](Self::access_token), the
    /// builder reads the `META_ACCESS_TOKEN` environment variable.
    pub fn build(self) -> Result<Gateway> {
        let token = self
            .access_token
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Configuration {
                message: "no access token configured".into(),
                remediation: format!(
                    "Pass a token to GatewayBuilder::access_token() or set {TOKEN_ENV_VAR}."
                ),
            })?;

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(SyncError::Http)?;

        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(match self.cache_ttl {
                Some(ttl) => TtlCache::with_ttl(ttl),
                None => TtlCache::new(),
            })
        });

        Ok(Gateway {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_version: self.api_version.trim_matches('/').to_string(),
            http,
            token: Arc::new(RwLock::new(token)),
            auth_placement: self.auth_placement,
            cache,
            refresher: self.refresher,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary part of a multipart upload.
#[derive(Debug, Clone)]
pub(crate) struct FilePart {
    pub field: &'static str,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Request body. Kept as plain data so a call can be replayed after a refresh.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Empty,
    Form(Vec<(String, String)>),
    Json(Value),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

/// Transport to a Graph-style REST API.
///
/// Reads go through the TTL cache, writes clear it, and every response is
/// routed through the classifier. Cloning is cheap and clones share the
/// cache and credentials.
#[derive(Clone)]
pub struct Gateway {
    base_url: String,
    api_version: String,
    http: reqwest::Client,
    token: Arc<RwLock<String>>,
    auth_placement: AuthPlacement,
    cache: Arc<TtlCache>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl Gateway {
    /// Create a gateway against the public Graph API with default settings.
    pub fn new(access_token: impl Into<String>) -> Result<Self> {
        GatewayBuilder::new().access_token(access_token).build()
    }

    /// The read cache, shared with every clone of this gateway.
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// Replace the credentials. Incidental whitespace is trimmed.
    pub fn set_access_token(&self, token: impl AsRef<str>) {
        let mut guard = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = token.as_ref().trim().to_string();
    }

    /// Cached read. A hit returns without touching the network; a miss
    /// fetches, classifies, and stores the payload on success.
    pub async fn cached_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let key = cache_key(path, params);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key, "cache hit");
            return Ok(hit);
        }

        debug!(key, "cache miss");
        let value = self.execute(Method::GET, path, params, &Payload::Empty).await?;
        self.cache.put(key, value.clone());
        Ok(value)
    }

    /// Uncached read, for endpoints whose answer changes between calls
    /// (job status, upload readiness).
    pub async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        self.execute(Method::GET, path, params, &Payload::Empty).await
    }

    /// Apply `changes` to a remote object. Any success clears the read cache.
    pub async fn mutate(&self, object_id: &str, changes: &[(&str, String)]) -> Result<bool> {
        let fields = changes
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let value = self
            .write(Method::POST, &format!("/{object_id}"), Payload::Form(fields))
            .await?;
        Ok(value.get("success").and_then(Value::as_bool).unwrap_or(true))
    }

    /// Form-encoded write.
    pub async fn post(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let fields = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.write(Method::POST, path, Payload::Form(fields)).await
    }

    /// JSON-bodied write.
    pub async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        self.write(Method::POST, path, Payload::Json(body)).await
    }

    /// Delete a remote object. Success clears the read cache.
    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.write(Method::DELETE, path, Payload::Empty).await
    }

    pub(crate) async fn post_multipart(
        &self,
        path: &str,
        fields: Vec<(String, String)>,
        file: FilePart,
    ) -> Result<Value> {
        self.write(Method::POST, path, Payload::Multipart { fields, file })
            .await
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn write(&self, method: Method, path: &str, payload: Payload) -> Result<Value> {
        let value = self.execute(method, path, &[], &payload).await?;
        self.cache.invalidate_all();
        Ok(value)
    }

    /// Send once; on an expired session, refresh silently and replay exactly once.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: &Payload,
    ) -> Result<Value> {
        let message = match self.execute_once(method.clone(), path, query, payload).await {
            Err(SyncError::AuthExpired { message }) => message,
            other => return other,
        };

        let Some(refresher) = &self.refresher else {
            return Err(SyncError::AuthExpired { message });
        };

        info!(path, "access token rejected, attempting silent refresh");
        let token = refresher.refresh().await.map_err(|e| match e {
            SyncError::AuthExpired { message } => SyncError::SessionExpired { message },
            other => other,
        })?;
        self.set_access_token(token);

        match self.execute_once(method, path, query, payload).await {
            Err(SyncError::AuthExpired { message }) => {
                warn!(path, "access token rejected again after refresh");
                Err(SyncError::SessionExpired { message })
            }
            other => other,
        }
    }

    async fn execute_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: &Payload,
    ) -> Result<Value> {
        let url = self.url(path);
        let token = self.current_token();

        let mut req = self.http.request(method.clone(), &url);
        req = match self.auth_placement {
            AuthPlacement::Query => req.query(&[("access_token", token.as_str())]),
            AuthPlacement::Header => req.bearer_auth(&token),
        };
        if !query.is_empty() {
            req = req.query(query);
        }

        req = match payload {
            Payload::Empty => req,
            Payload::Form(fields) => req.form(fields),
            Payload::Json(body) => req.json(body),
            Payload::Multipart { fields, file } => {
                let mut form = Form::new();
                for (k, v) in fields {
                    form = form.text(k.clone(), v.clone());
                }
                let part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
                req.multipart(form.part(file.field, part))
            }
        };

        debug!(%method, path, "sending request");
        let response = req.send().await?;
        let status = response.status().as_u16();
        let retry_after = retry_after_hint(response.headers());
        let text = response.text().await?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        let result = classify_response(status, body, retry_after);
        if let Err(ref e) = result {
            warn!(%method, path, status, error = %e, "request rejected");
        }
        result
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.api_version.is_empty() {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/{}/{}", self.base_url, self.api_version, path)
        }
    }

    fn current_token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Extract a back-off hint from `Retry-After` or Graph's usage headers.
fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    USAGE_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| serde_json::from_str::<Value>(v).ok())
        .filter_map(|v| regain_minutes(&v))
        .max()
        .filter(|m| *m > 0)
        .map(|m| Duration::from_secs(m * 60))
}

fn regain_minutes(v: &Value) -> Option<u64> {
    match v {
        Value::Object(map) => {
            let own = map
                .get("estimated_time_to_regain_access")
                .and_then(Value::as_u64);
            map.values().filter_map(regain_minutes).chain(own).max()
        }
        Value::Array(items) => items.iter().filter_map(regain_minutes).max(),
        _ => None,
    }
}
