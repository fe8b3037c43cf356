//! NWS payload shapes and their text rendering

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsResponse {
    #[serde(default)]
    pub features: Vec<AlertFeature>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFeature {
    #[serde(default)]
    pub properties: AlertProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertProperties {
    pub event: Option<String>,
    pub area_desc: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub headline: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PointsResponse {
    #[serde(default)]
    pub properties: PointsProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PointsProperties {
    pub forecast: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForecastResponse {
    #[serde(default)]
    pub properties: ForecastProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForecastProperties {
    #[serde(default)]
    pub periods: Vec<ForecastPeriod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPeriod {
    pub name: Option<String>,
    pub temperature: Option<serde_json::Number>,
    pub temperature_unit: Option<String>,
    pub wind_speed: Option<String>,
    pub wind_direction: Option<String>,
    pub short_forecast: Option<String>,
}

fn or<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    value.as_deref().filter(|s| !s.is_empty()).unwrap_or(fallback)
}

/// Render one alert as a block terminated by `---`
pub fn format_alert(feature: &AlertFeature) -> String {
    let props = &feature.properties;
    [
        format!("Event: {}", or(&props.event, "Unknown")),
        format!("Area: {}", or(&props.area_desc, "Unknown")),
        format!("Severity: {}", or(&props.severity, "Unknown")),
        format!("Status: {}", or(&props.status, "Unknown")),
        format!("Headline: {}", or(&props.headline, "No headline")),
        "---".to_string(),
    ]
    .join("\n")
}

/// Render one forecast period as a block terminated by `---`
pub fn format_period(period: &ForecastPeriod) -> String {
    let temperature = period
        .temperature
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    [
        format!("{}:", or(&period.name, "Unknown")),
        format!(
            "Temperature: {}°{}",
            temperature,
            or(&period.temperature_unit, "F")
        ),
        format!(
            "Wind: {} {}",
            or(&period.wind_speed, "Unknown"),
            or(&period.wind_direction, "")
        ),
        or(&period.short_forecast, "No forecast available").to_string(),
        "---".to_string(),
    ]
    .join("\n")
}
