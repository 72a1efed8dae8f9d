use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::identity::IdentityEntry;
use crate::model::{null_as_default, FeedKey, Post, ReactionCategory, UserId};
use crate::reactions::ReactionPayload;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Supplies the bearer token. Refresh and retry live behind this seam.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<Option<String>> {
        Ok(self.0.clone().filter(|token| !token.trim().is_empty()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api: unauthorized")]
    Unauthorized,
    #[error("api: forbidden")]
    Forbidden,
    #[error("api: rate limited on {resource}: {body}")]
    RateLimited { resource: String, body: String },
    #[error("api: error {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub remaining: f64,
    pub used: f64,
    pub reset_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub predictions: Vec<Post>,
    #[serde(default)]
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct ReactBody {
    #[serde(rename = "type")]
    code: u8,
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    rates: RwLock<HashMap<String, RateLimit>>,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("api client user agent required");
        }
        let mut base = config
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("api: parse base url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
                .build()
                .context("api: build http client")?,
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
            rates: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Last rate-limit headers seen for a collection (`predictions`, ...).
    pub fn rate_limit(&self, resource: &str) -> Option<RateLimit> {
        self.rates.read().get(resource).cloned()
    }

    pub fn predictions(&self, page: u32, page_size: u32) -> Result<PredictionPage> {
        self.get_json("predictions", &page_params(page, page_size))
    }

    pub fn daily_posts(&self, page: u32, page_size: u32) -> Result<Vec<Post>> {
        self.get_json("dailyposts", &page_params(page, page_size))
    }

    pub fn likes(&self, key: FeedKey) -> Result<ReactionPayload> {
        let path = format!("{}/{}/likes", key.kind.resource(), key.id);
        self.get_json(&path, &[])
    }

    pub fn like(&self, key: FeedKey, category: ReactionCategory) -> Result<()> {
        let path = format!("{}/{}/like", key.kind.resource(), key.id);
        let body = serde_json::to_value(ReactBody {
            code: category.code(),
        })?;
        self.request(Method::POST, &path, &[], Some(body))?;
        Ok(())
    }

    pub fn users_bulk(&self, ids: &[UserId]) -> Result<Vec<IdentityEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let csv = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.get_json("profile/users/bulk", &[("userIds".to_string(), csv)])
    }

    fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(Method::GET, path, params, None)?;
        resp.json()
            .with_context(|| format!("api: decode response from {path}"))
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = self.token_provider.token()? {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send()?;
        let resource = path.split('/').next().unwrap_or(path).to_string();
        self.capture_rate(&resource, resp.headers());
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let err = match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden,
            429 => ApiError::RateLimited { resource, body },
            code => ApiError::Status { status: code, body },
        };
        Err(err.into())
    }

    fn capture_rate(&self, resource: &str, headers: &HeaderMap) {
        let remaining = header_float(headers, "x-ratelimit-remaining");
        let used = header_float(headers, "x-ratelimit-used");
        let reset = header_float(headers, "x-ratelimit-reset");
        if remaining == 0.0 && used == 0.0 && reset == 0.0 {
            return;
        }
        let reset_at = Duration::try_from_secs_f64(reset.max(0.0))
            .ok()
            .and_then(|wait| SystemTime::now().checked_add(wait));
        self.rates.write().insert(
            resource.to_string(),
            RateLimit {
                remaining,
                used,
                reset_at,
            },
        );
    }
}

fn page_params(page: u32, page_size: u32) -> Vec<(String, String)> {
    vec![
        ("page".to_string(), page.to_string()),
        ("pageSize".to_string(), page_size.to_string()),
    ]
}

fn header_float(headers: &HeaderMap, key: &str) -> f64 {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(0.0)
}
