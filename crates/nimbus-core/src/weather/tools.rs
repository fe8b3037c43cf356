//! `get-alerts` and `get-forecast`

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::format::{AlertsResponse, ForecastResponse, PointsResponse, format_alert, format_period};
use super::{WeatherSource, fetch_as};
use crate::tools::{ToolHandler, json_schema};

/// Tool: active weather alerts for a US state
pub struct GetAlertsTool {
    source: Arc<dyn WeatherSource>,
}

impl GetAlertsTool {
    pub fn new(source: Arc<dyn WeatherSource>) -> Self {
        Self { source }
    }
}

#[derive(Deserialize)]
struct AlertsInput {
    state: String,
}

#[async_trait]
impl ToolHandler for GetAlertsTool {
    fn name(&self) -> &str {
        "get-alerts"
    }

    fn description(&self) -> &str {
        "Get weather alerts for a state"
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "state": {
                    "type": "string",
                    "description": "Two-letter state code (e.g. CA, NY)"
                }
            }),
            vec!["state"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let input: AlertsInput =
            serde_json::from_value(input).context("get-alerts expects a string 'state'")?;
        let state = input.state.trim().to_uppercase();
        let mut url = Url::parse(&format!("{}/alerts", self.source.base_url()))
            .context("Invalid NWS base URL")?;
        url.query_pairs_mut().append_pair("area", &state);

        let Some(alerts) = fetch_as::<AlertsResponse>(self.source.as_ref(), url.as_str()).await else {
            return Ok("Failed to retrieve alerts data".to_string());
        };

        if alerts.features.is_empty() {
            return Ok(format!("No active alerts for {state}"));
        }

        debug!(state = %state, count = alerts.features.len(), "Alerts retrieved");
        let formatted: Vec<String> = alerts.features.iter().map(format_alert).collect();
        Ok(format!(
            "Active alerts for {state}:\n\n{}",
            formatted.join("\n")
        ))
    }
}

/// Tool: multi-period forecast for a coordinate pair
pub struct GetForecastTool {
    source: Arc<dyn WeatherSource>,
}

impl GetForecastTool {
    pub fn new(source: Arc<dyn WeatherSource>) -> Self {
        Self { source }
    }
}

#[derive(Deserialize)]
struct ForecastInput {
    latitude: f64,
    longitude: f64,
}

#[async_trait]
impl ToolHandler for GetForecastTool {
    fn name(&self) -> &str {
        "get-forecast"
    }

    fn description(&self) -> &str {
        "Get weather forecast for a location"
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "latitude": {
                    "type": "number",
                    "description": "Latitude of the location"
                },
                "longitude": {
                    "type": "number",
                    "description": "Longitude of the location"
                }
            }),
            vec!["latitude", "longitude"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let ForecastInput {
            latitude,
            longitude,
        } = serde_json::from_value(input)
            .context("get-forecast expects numeric 'latitude' and 'longitude'")?;

        let points_url = format!(
            "{}/points/{:.4},{:.4}",
            self.source.base_url(),
            latitude,
            longitude
        );
        let Some(points) = fetch_as::<PointsResponse>(self.source.as_ref(), &points_url).await
        else {
            return Ok(format!(
                "Failed to retrieve grid point data for coordinates: {latitude}, {longitude}. \
                 This location may not be supported by the NWS API (only US locations are supported)."
            ));
        };

        let Some(forecast_url) = points.properties.forecast.filter(|u| !u.is_empty()) else {
            return Ok("Failed to get forecast URL from grid point data".to_string());
        };

        let Some(forecast) = fetch_as::<ForecastResponse>(self.source.as_ref(), &forecast_url).await
        else {
            return Ok("Failed to retrieve forecast data".to_string());
        };

        let periods = forecast.properties.periods;
        if periods.is_empty() {
            return Ok("No forecast periods available".to_string());
        }

        let formatted: Vec<String> = periods.iter().map(format_period).collect();
        Ok(format!(
            "Forecast for {latitude}, {longitude}:\n\n{}",
            formatted.join("\n")
        ))
    }
}
