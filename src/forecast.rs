use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::geometry::Feature;
use crate::loader::SourceRecord;

pub const DEFAULT_SERIES_PREFIX: &str = "time_series_discharge_simulated-";

const TIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastSeries {
    pub model: String,
    pub points: Vec<ForecastPoint>,
}

/// Pairs `time_period` entries with each discharge series found on a record.
#[derive(Debug, Clone)]
pub struct SeriesExtractor {
    time_field: String,
    prefix: String,
    extra_fields: Vec<String>,
}

impl Default for SeriesExtractor {
    fn default() -> Self {
        Self {
            time_field: "time_period".to_string(),
            prefix: DEFAULT_SERIES_PREFIX.to_string(),
            extra_fields: Vec::new(),
        }
    }
}

impl SeriesExtractor {
    pub fn with_extra_fields(mut self, fields: Vec<String>) -> Self {
        self.extra_fields = fields;
        self
    }

    pub fn extract(&self, record: &Map<String, Value>) -> Vec<ForecastSeries> {
        let Some(times) = record.get(&self.time_field).map(split_times) else {
            return Vec::new();
        };
        let mut series = Vec::new();
        for (field, value) in record {
            let model = if let Some(model) = field.strip_prefix(&self.prefix) {
                model.to_ascii_uppercase()
            } else if self.extra_fields.iter().any(|extra| extra == field) {
                field.to_ascii_uppercase()
            } else {
                continue;
            };
            let values = split_values(value);
            if values.len() != times.len() {
                warn!(field = %field, times = times.len(), values = values.len(), "series length differs from time_period");
            }
            let points: Vec<ForecastPoint> = times
                .iter()
                .zip(values)
                .filter_map(|(time, value)| match (time, value) {
                    (Some(time), Some(value)) => Some(ForecastPoint { time: *time, value }),
                    _ => None,
                })
                .collect();
            debug!(model = %model, points = points.len(), "series extracted");
            series.push(ForecastSeries { model, points });
        }
        series
    }

    /// Flattens merged features into `sector_forecast` rows.
    pub fn rows(
        &self,
        features: &[Feature],
        code_field: &str,
        name_field: &str,
    ) -> Vec<SourceRecord> {
        let mut rows = Vec::new();
        for feature in features {
            let code = feature.attributes.get(code_field).cloned().unwrap_or(Value::Null);
            let name = feature.attributes.get(name_field).cloned().unwrap_or(Value::Null);
            for series in self.extract(&feature.attributes) {
                for point in series.points {
                    let attributes = json!({
                        "sec_code": code,
                        "section_name": name,
                        "model_type": series.model,
                        "time_point": point.time.to_rfc3339_opts(SecondsFormat::Secs, true),
                        "forecast_value": point.value,
                    });
                    if let Value::Object(attributes) = attributes {
                        rows.push(SourceRecord {
                            attributes,
                            geometry: None,
                        });
                    }
                }
            }
        }
        rows
    }
}

pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn split_times(value: &Value) -> Vec<Option<DateTime<Utc>>> {
    items(value)
        .into_iter()
        .map(|item| item.as_deref().and_then(parse_time))
        .collect()
}

fn split_values(value: &Value) -> Vec<Option<f64>> {
    match value {
        Value::Array(entries) => entries
            .iter()
            .map(|entry| match entry {
                Value::Number(number) => number.as_f64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .collect(),
        other => items(other)
            .into_iter()
            .map(|item| item.and_then(|text| text.trim().parse().ok()))
            .collect(),
    }
}

/// Comma-delimited string or list, as optional strings in order.
fn items(value: &Value) -> Vec<Option<String>> {
    match value {
        Value::String(text) if text.trim().is_empty() => Vec::new(),
        Value::String(text) => text.split(',').map(|part| Some(part.trim().to_string())).collect(),
        Value::Array(entries) => entries
            .iter()
            .map(|entry| match entry {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![Some(other.to_string())],
    }
}
