//! Readings produced by instrument polls.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Value of one reading field
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// Parse a raw token: integer, then float, otherwise text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            return FieldValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return FieldValue::Float(f);
        }
        FieldValue::Text(raw.to_string())
    }

    /// Convert to f64 for numeric operations
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// True for a float NaN
    pub fn is_nan(&self) -> bool {
        matches!(self, FieldValue::Float(f) if f.is_nan())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// One timestamped record from one poll of one instrument.
///
/// Fields keep the order in which the driver produced them; that order becomes
/// the column order of the data file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
    /// Ordered field name/value pairs
    pub fields: Vec<(String, FieldValue)>,
}

impl Reading {
    /// Empty reading at `timestamp`
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: Vec::new(),
        }
    }

    /// Append a field, replacing an earlier field of the same name
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder-style [`Reading::push`]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.push(name, value);
        self
    }

    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the reading has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Combine several readings of the same instrument into one.
    ///
    /// Float fields become the mean of their non-NaN values, rounded to three
    /// decimals. Integer, text and boolean fields (status words, instrument
    /// clock) keep the value of the last reading, as does the timestamp.
    /// Returns `None` for an empty slice.
    pub fn mean(readings: &[Reading]) -> Option<Reading> {
        let last = readings.last()?;
        let mut combined = Reading::new(last.timestamp);
        for (name, value) in &last.fields {
            if !matches!(value, FieldValue::Float(_)) {
                combined.push(name.clone(), value.clone());
                continue;
            }
            let values: Vec<f64> = readings
                .iter()
                .filter_map(|r| r.get(name))
                .filter(|v| !v.is_nan())
                .filter_map(FieldValue::as_f64)
                .collect();
            let mean = if values.is_empty() {
                f64::NAN
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            };
            combined.push(name.clone(), (mean * 1000.0).round() / 1000.0);
        }
        Some(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_averages_floats_and_keeps_last_status() {
        let t0 = chrono::Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let readings = [
            Reading::new(t0)
                .with_field("ssp1", 10.0)
                .with_field("rh", f64::NAN)
                .with_field("dio_state", 31i64),
            Reading::new(t1)
                .with_field("ssp1", 11.0)
                .with_field("rh", 40.0)
                .with_field("dio_state", 15i64),
        ];
        let mean = Reading::mean(&readings).unwrap();
        assert_eq!(mean.timestamp, t1);
        assert_eq!(mean.get("ssp1"), Some(&FieldValue::Float(10.5)));
        assert_eq!(mean.get("rh"), Some(&FieldValue::Float(40.0)));
        assert_eq!(mean.get("dio_state"), Some(&FieldValue::Int(15)));
        assert!(Reading::mean(&[]).is_none());
    }

    #[test]
    fn parses_tokens() {
        assert_eq!(FieldValue::parse("42"), FieldValue::Int(42));
        assert_eq!(FieldValue::parse(" 30.781 "), FieldValue::Float(30.781));
        assert_eq!(FieldValue::parse("0C100400"), FieldValue::Text("0C100400".into()));
        assert!(FieldValue::parse("nan").is_nan());
    }

    #[test]
    fn push_keeps_order_and_replaces_duplicates() {
        let reading = Reading::new(Utc::now())
            .with_field("o3", 30.5)
            .with_field("flags", "0C100400")
            .with_field("o3", 31.0);
        let names: Vec<_> = reading.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["o3", "flags"]);
        assert_eq!(reading.get("o3").and_then(FieldValue::as_f64), Some(31.0));
    }
}
