//! National Weather Service upstream and the weather tools built on it

mod format;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::tools::ToolRegistry;

pub use format::{
    AlertFeature, AlertProperties, AlertsResponse, ForecastPeriod, ForecastResponse,
    PointsResponse, format_alert, format_period,
};
pub use tools::{GetAlertsTool, GetForecastTool};

const DEFAULT_BASE_URL: &str = "https://api.weather.gov";
const DEFAULT_USER_AGENT: &str = "weather-app/1.0";

/// Upstream settings, the `[weather]` table of the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Request/response fetcher for weather data.
///
/// Returns `None` on any failure; callers turn that into tool text rather
/// than a protocol error. No retries.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Base URL that endpoint paths are appended to
    fn base_url(&self) -> &str;

    async fn fetch_json(&self, url: &str) -> Option<Value>;
}

/// Fetch `url` and decode it into `T`, treating decode failures like fetch failures
pub(crate) async fn fetch_as<T: DeserializeOwned>(source: &dyn WeatherSource, url: &str) -> Option<T> {
    let value = source.fetch_json(url).await?;
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Unexpected NWS payload from {}: {}", url, e);
            None
        }
    }
}

/// HTTP client for api.weather.gov
#[derive(Clone)]
pub struct NwsClient {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for NwsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NwsClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl NwsClient {
    pub fn new(config: &WeatherConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WeatherSource for NwsClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_json(&self, url: &str) -> Option<Value> {
        debug!(url = url, "NWS request");

        let response = match self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/geo+json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Error making NWS request to {}: {}", url, e);
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("NWS request to {} failed with status {}", url, status);
            return None;
        }

        match response.json::<Value>().await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("Failed to decode NWS response from {}: {}", url, e);
                None
            }
        }
    }
}

/// Build the registry served by the gateway: `get-alerts` then `get-forecast`
pub fn default_registry(source: Arc<dyn WeatherSource>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    // Fixed, distinct names; registration cannot collide.
    let _ = registry.register(Arc::new(GetAlertsTool::new(source.clone())));
    let _ = registry.register(Arc::new(GetForecastTool::new(source)));
    registry
}
