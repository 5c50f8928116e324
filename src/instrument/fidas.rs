//! Palas Fidas optical particle counter over TCP.
//!
//! The instrument answers a data request with a frame such as
//! `6082<sendVal 0=0.0;1=1.0;2=2.0;8=4.8;14=42.4;74=0.0>3E`. Each `k=v` pair
//! becomes field `v<k>`; `nan` values are dropped.

use super::transport::{self, DynTransport, Link};
use super::{DriverSettings, InstrumentDriver};
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::measurement::{FieldValue, Reading};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Default data command
pub const DEFAULT_GET_DATA: &str = "sendVal";

/// Channels reported by a default Fidas setup, used for simulated readings
pub const DEFAULT_FIELDS: &[&str] = &["v0", "v1", "v2", "v8", "v14", "v74"];

const REPLY_IDLE: Duration = Duration::from_millis(200);

static FRAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<sendVal\s+([^>]*)>").expect("Invalid sendVal regex"));

/// Driver for the Fidas.
#[derive(Debug)]
pub struct FidasDriver {
    config: InstrumentConfig,
    settings: DriverSettings,
    link: Option<Link>,
}

impl FidasDriver {
    /// Driver for `config`
    pub fn new(config: &InstrumentConfig) -> Self {
        Self {
            config: config.clone(),
            settings: DriverSettings::from_config(config, DEFAULT_GET_DATA),
            link: None,
        }
    }

    /// Use an already open transport instead of connecting.
    pub fn attach(&mut self, io: DynTransport) {
        self.link = Some(Link::new(io, &self.settings.name, self.settings.timeout));
    }
}

/// Parse a `<sendVal ...>` frame.
pub fn parse_frame(instrument: &str, reply: &str, reading: &mut Reading) -> DaqResult<()> {
    let payload = FRAME_PATTERN
        .captures(reply)
        .and_then(|c| c.get(1))
        .ok_or_else(|| DaqError::protocol(instrument, format!("no sendVal frame in: {reply}")))?
        .as_str();

    for item in payload.split(';').filter(|i| !i.trim().is_empty()) {
        let (key, raw) = item
            .split_once('=')
            .ok_or_else(|| DaqError::protocol(instrument, format!("bad item '{item}'")))?;
        let key: u32 = key
            .trim()
            .parse()
            .map_err(|_| DaqError::protocol(instrument, format!("bad channel '{key}'")))?;
        let value = FieldValue::parse(raw);
        if value.is_nan() {
            continue;
        }
        reading.push(format!("v{key}"), value);
    }
    Ok(())
}

#[async_trait]
impl InstrumentDriver for FidasDriver {
    fn driver_type(&self) -> &'static str {
        "fidas"
    }

    fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    async fn connect(&mut self) -> DaqResult<()> {
        let io = transport::open(&self.config).await?;
        self.attach(io);
        tracing::info!(instrument = %self.settings.name, "connected");
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> DaqResult<String> {
        let name = &self.settings.name;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| DaqError::connection(name, "not connected"))?;
        link.drain(Duration::from_millis(10)).await;
        link.send(format!("{command}\r\n").as_bytes()).await?;
        let raw = link.read_reply(Some(b'>'), REPLY_IDLE).await?;
        let mut reply = String::from_utf8_lossy(&raw).trim().to_string();
        if reply.contains('<') {
            reply.push('>');
        }
        Ok(reply)
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        let command = self.settings.get_data.clone();
        let reply = self.send_command(&command).await?;
        let mut reading = Reading::new(Utc::now());
        parse_frame(&self.settings.name, &reply, &mut reading)?;
        Ok(reading)
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parses_send_val_frame() {
        let mut reading = Reading::new(Utc::now());
        parse_frame("fidas", "6082<sendVal 0=0.0;1=1.0;2=nan;8=4.8;14=42.4;74=0.0>3E", &mut reading).unwrap();
        assert_eq!(reading.get("v8"), Some(&FieldValue::Float(4.8)));
        assert_eq!(reading.get("v14"), Some(&FieldValue::Float(42.4)));
        assert!(reading.get("v2").is_none());
        assert_eq!(reading.len(), 5);
    }

    #[test]
    fn missing_frame_is_a_protocol_error() {
        let mut reading = Reading::new(Utc::now());
        let err = parse_frame("fidas", "6082 busy", &mut reading).unwrap_err();
        assert!(matches!(err, DaqError::Protocol { .. }));
        assert!(parse_frame("fidas", "<sendVal x=1.0>", &mut reading).is_err());
    }

    #[tokio::test]
    async fn polls_over_tcp_style_stream() {
        let config = crate::config::StationConfig::from_yaml_str(
            "paths: { root: /tmp/t }\ninstruments:\n  - name: fidas\n    class: Fidas\n    params: { socket: { host: 10.0.0.5, port: 11231, timeout: 1 }, sampling_interval: 1, reporting_interval: 60 }\n",
        )
        .unwrap();
        let (mut host, device) = tokio::io::duplex(1024);
        let mut driver = FidasDriver::new(&config.instruments[0]);
        driver.attach(Box::new(device));

        let instrument = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"sendVal\r\n");
            host.write_all(b"6082<sendVal 0=12.0;14=42.4>3E").await.unwrap();
            host
        });

        let reading = driver.poll().await.unwrap();
        assert_eq!(reading.get("v0"), Some(&FieldValue::Float(12.0)));
        instrument.await.unwrap();
    }
}
