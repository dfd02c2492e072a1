//! REST client: builds, signs, and dispatches rate-limited API requests.
//!
//! Every request flows through the crate's [`RateLimiter`], keyed by the
//! caller-supplied bucket. Endpoint wrappers live outside this crate; they
//! supply the method, path template, bucket, and parameters, and this client
//! supplies serialization, authentication headers, and limit classification.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{RestError, Result};
use crate::limiter::{LimitInfo, RateLimiter};

/// Default API base for the hosted platform.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api";

const DEFAULT_USER_AGENT: &str = "DiscordBot (corvid, 0.1.0)";

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Bot token used for the authorization header.
    pub token: String,
    /// Base URL all endpoint paths are appended to.
    pub api_base: String,
    /// Identification header sent with every request.
    pub user_agent: String,
}

impl RestConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// REST Client
// ----------------------------------------------------------------------------

/// Rate-limited HTTP client for the request/response API.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    limiter: RateLimiter<reqwest::Result<Response>>,
    headers: Arc<HeaderMap>,
    config: Arc<RestConfig>,
}

impl RestClient {
    /// Create a client from the given configuration.
    pub fn new(config: RestConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let authorization = format!("Bot {}", config.token.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&authorization)
                .map_err(|e| RestError::Config(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-ratelimit-precision",
            HeaderValue::from_static("millisecond"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| RestError::Config(e.to_string()))?,
        );

        Ok(Self {
            http: reqwest::Client::new(),
            limiter: RateLimiter::new(),
            headers: Arc::new(headers),
            config: Arc::new(config),
        })
    }

    /// Issue one API request through the rate limiter.
    ///
    /// Resolves with the raw response once a non-throttled attempt comes
    /// back with a 2xx status; any other status is surfaced as
    /// [`RestError::Status`] with the response body attached.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        bucket: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Response> {
        let url = build_url(&self.config.api_base, path, query)?;
        debug!(%method, %url, bucket, "dispatching API request");

        let http = self.http.clone();
        let headers = Arc::clone(&self.headers);
        let execute = move || {
            let request = http
                .request(method.clone(), url.clone())
                .headers(headers.as_ref().clone());
            let request = match body.clone() {
                Some(body) => request.json(&body),
                None => request,
            };
            async move { request.send().await }
        };

        let response = self
            .limiter
            .submit(bucket, execute, classify)
            .await??;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RestError::Status { status, body })
        }
    }

    /// Issue a request and decode the response body as JSON.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        bucket: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T> {
        let response = self.request(method, path, bucket, query, body).await?;
        Ok(response.json().await?)
    }

    /// Resolve the streaming-connection endpoint.
    pub async fn get_gateway(&self) -> Result<GatewayEndpoint> {
        self.request_json(Method::GET, "/gateway", "/gateway", &[], None)
            .await
    }
}

/// Response of the streaming-connection endpoint resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEndpoint {
    /// Base websocket URL to connect the session to.
    pub url: String,
}

// ----------------------------------------------------------------------------
// Limit Classification
// ----------------------------------------------------------------------------

/// Classify one raw attempt into rate-limit information.
///
/// Transport errors carry no limit headers; they classify as unthrottled so
/// the dispatcher resolves immediately and the error reaches the caller.
fn classify(result: &reqwest::Result<Response>) -> LimitInfo {
    match result {
        Ok(response) => limit_info(response.status(), response.headers()),
        Err(_) => LimitInfo::default(),
    }
}

/// Extract rate-limit state from a response's status and headers.
fn limit_info(status: StatusCode, headers: &HeaderMap) -> LimitInfo {
    let number = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<f64>().ok())
    };

    LimitInfo {
        was_limited: status == StatusCode::TOO_MANY_REQUESTS,
        remaining: number("x-ratelimit-remaining").map(|v| v as i64),
        reset_at: number("x-ratelimit-reset")
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs_f64(secs)),
        global_reset: if headers.contains_key("x-ratelimit-global") {
            number("retry-after")
                .map(|secs| SystemTime::now() + Duration::from_secs_f64(secs))
        } else {
            None
        },
        group: headers
            .get("x-ratelimit-bucket")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

fn build_url(base: &str, path: &str, query: &[(&str, String)]) -> Result<Url> {
    let mut url = Url::parse(&format!("{base}{path}"))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter().cloned());
    }
    Ok(url)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
