//! IQAir AirVisual Outdoor units polled over HTTP.
//!
//! The unit's API returns a JSON document with `name`, `current` and
//! `historical` sections. A poll fetches the document and flattens the
//! `current` object into fields, joining nested keys with `_`.

use super::{DriverSettings, InstrumentDriver};
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::measurement::{FieldValue, Reading};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

/// Fields of a typical `current` section, used for simulated readings
pub const DEFAULT_FIELDS: &[&str] = &["ts", "tp", "hm", "pr", "p2_conc", "p2_aqius", "p1_conc"];

/// Flatten nested JSON objects into `parent_child` keys.
pub fn flatten(value: &Value, prefix: &str, out: &mut Vec<(String, FieldValue)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}_{key}")
                };
                flatten(child, &name, out);
            }
        }
        Value::Number(n) => {
            let field = match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            };
            out.push((prefix.to_string(), field));
        }
        Value::Bool(b) => out.push((prefix.to_string(), FieldValue::Bool(*b))),
        Value::String(s) => out.push((prefix.to_string(), FieldValue::Text(s.clone()))),
        Value::Null => {}
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten(item, &format!("{prefix}_{index}"), out);
            }
        }
    }
}

/// Extract the `current` section of an AVO document into `reading`.
pub fn parse_document(instrument: &str, document: &Value, reading: &mut Reading) -> DaqResult<()> {
    let current = document
        .get("current")
        .filter(|c| c.is_object())
        .ok_or_else(|| DaqError::protocol(instrument, "document has no 'current' object"))?;
    let mut fields = Vec::new();
    flatten(current, "", &mut fields);
    if fields.is_empty() {
        return Err(DaqError::protocol(instrument, "'current' object is empty"));
    }
    for (name, value) in fields {
        reading.push(name, value);
    }
    Ok(())
}

/// Driver for AirVisual Outdoor units.
#[derive(Debug)]
pub struct AvoDriver {
    settings: DriverSettings,
    url: String,
    #[cfg(feature = "http")]
    client: Option<reqwest::Client>,
    #[cfg(not(feature = "http"))]
    client: Option<()>,
}

impl AvoDriver {
    /// Driver for `config`
    pub fn new(config: &InstrumentConfig) -> Self {
        Self {
            settings: DriverSettings::from_config(config, ""),
            url: config
                .params
                .http
                .as_ref()
                .map(|h| h.url.clone())
                .unwrap_or_default(),
            client: None,
        }
    }

    #[cfg(feature = "http")]
    async fn fetch(&self, url: &str) -> DaqResult<Value> {
        let name = &self.settings.name;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DaqError::connection(name, "not connected"))?;
        let response = client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                DaqError::timeout(name, self.settings.timeout)
            } else {
                DaqError::connection(name, err.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(DaqError::protocol(name, format!("HTTP {}", response.status())));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| DaqError::protocol(name, format!("invalid JSON: {err}")))
    }

    #[cfg(not(feature = "http"))]
    async fn fetch(&self, _url: &str) -> DaqResult<Value> {
        Err(DaqError::FeatureNotEnabled("http".into()))
    }
}

#[async_trait]
impl InstrumentDriver for AvoDriver {
    fn driver_type(&self) -> &'static str {
        "avo"
    }

    fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    #[cfg(feature = "http")]
    async fn connect(&mut self) -> DaqResult<()> {
        let client = reqwest::Client::builder()
            .timeout(self.settings.timeout)
            .build()
            .map_err(|err| DaqError::connection(&self.settings.name, err.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    #[cfg(not(feature = "http"))]
    async fn connect(&mut self) -> DaqResult<()> {
        Err(DaqError::FeatureNotEnabled("http".into()))
    }

    async fn send_command(&mut self, command: &str) -> DaqResult<String> {
        let url = if command.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url.trim_end_matches('/'), command.trim_start_matches('/'))
        };
        Ok(self.fetch(&url).await?.to_string())
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        let url = if self.settings.get_data.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url.trim_end_matches('/'), self.settings.get_data)
        };
        let document = self.fetch(&url).await?;
        let mut reading = Reading::new(Utc::now());
        parse_document(&self.settings.name, &document, &mut reading)?;
        Ok(reading)
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_current_section() {
        let document = json!({
            "name": "Station Roof",
            "current": {
                "ts": "2024-05-17T10:00:00.000Z",
                "tp": 21.5,
                "hm": 48,
                "pm25": { "conc": 7.2, "aqius": 30 },
                "outdoor_station": null
            },
            "historical": { "instant": [] }
        });
        let mut reading = Reading::new(Utc::now());
        parse_document("avo", &document, &mut reading).unwrap();
        assert_eq!(reading.get("tp"), Some(&FieldValue::Float(21.5)));
        assert_eq!(reading.get("hm"), Some(&FieldValue::Int(48)));
        assert_eq!(reading.get("pm25_conc"), Some(&FieldValue::Float(7.2)));
        assert_eq!(reading.get("pm25_aqius"), Some(&FieldValue::Int(30)));
        assert!(reading.get("outdoor_station").is_none());
        assert!(reading.get("name").is_none());
    }

    #[test]
    fn missing_current_is_a_protocol_error() {
        let mut reading = Reading::new(Utc::now());
        let err = parse_document("avo", &json!({"name": "x"}), &mut reading).unwrap_err();
        assert!(matches!(err, DaqError::Protocol { .. }));
    }
}
