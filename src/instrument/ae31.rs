//! Magee Scientific AE31 aethalometer.
//!
//! The AE31 writes one comma-separated record per timebase on its serial line
//! (expanded data format). The port stays open between polls, so records queue
//! up; a poll returns the newest complete line and skips older ones. If a data
//! command is configured, stale input is discarded and the command is sent.

use super::transport::{self, DynTransport, Link};
use super::{DriverSettings, InstrumentDriver};
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::measurement::{FieldValue, Reading};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Column names of the expanded data format. Empty names are unused columns.
pub const COLUMNS: &[&str] = &[
    "id", "date", "time", "UV370", "B470", "G520", "Y590", "R660", "IR880", "IR950", "flow",
    "UV370_1", "UV370_2", "UV370_3", "UV370_4", "", "UV370_5", "UV370_6",
    "B470_1", "B470_2", "B470_3", "B470_4", "", "B470_5", "B470_6",
    "G520_1", "G520_2", "G520_3", "G520_4", "", "G520_5", "G520_6",
    "Y590_1", "Y590_2", "Y590_3", "Y590_4", "", "Y590_5", "Y590_6",
    "R660_1", "R660_2", "R660_3", "R660_4", "", "R660_5", "R660_6",
    "IR880_1", "IR880_2", "IR880_3", "IR880_4", "", "IR880_5", "IR880_6",
    "IR950_1", "IR950_2", "IR950_3", "IR950_4", "", "IR950_5", "IR950_6",
];

/// Leading columns every record must carry (id, date, time, seven channels, flow)
const MIN_COLUMNS: usize = 11;

/// Gap after which no further queued record is expected
const QUIET: Duration = Duration::from_millis(200);

/// Driver for the AE31.
#[derive(Debug)]
pub struct Ae31Driver {
    config: InstrumentConfig,
    settings: DriverSettings,
    link: Option<Link>,
}

impl Ae31Driver {
    /// Driver for `config`
    pub fn new(config: &InstrumentConfig) -> Self {
        Self {
            config: config.clone(),
            settings: DriverSettings::from_config(config, ""),
            link: None,
        }
    }

    /// Use an already open transport instead of connecting.
    pub fn attach(&mut self, io: DynTransport) {
        self.link = Some(Link::new(io, &self.settings.name, self.settings.timeout));
    }

    fn link(&mut self) -> DaqResult<&mut Link> {
        let name = &self.settings.name;
        self.link
            .as_mut()
            .ok_or_else(|| DaqError::connection(name, "not connected"))
    }
}

/// Parse one AE31 record.
pub fn parse_line(instrument: &str, line: &str, reading: &mut Reading) -> DaqResult<()> {
    let values: Vec<&str> = line
        .split(',')
        .map(|v| v.trim().trim_matches('"'))
        .collect();
    if values.len() < MIN_COLUMNS {
        return Err(DaqError::protocol(
            instrument,
            format!("expected at least {MIN_COLUMNS} columns, got {}: {line}", values.len()),
        ));
    }

    for (index, raw) in values.iter().enumerate() {
        let name = match COLUMNS.get(index) {
            Some(name) if name.is_empty() => continue,
            Some(name) => (*name).to_string(),
            None => format!("col{index}"),
        };
        let value = if index < 3 {
            FieldValue::Text((*raw).to_string())
        } else {
            FieldValue::parse(raw)
        };
        reading.push(name, value);
    }
    Ok(())
}

#[async_trait]
impl InstrumentDriver for Ae31Driver {
    fn driver_type(&self) -> &'static str {
        "ae31"
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
        let link = self.link()?;
        link.send(format!("{command}\r").as_bytes()).await?;
        link.read_line().await
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        let command = self.settings.get_data.clone();
        let line = if command.is_empty() {
            self.link()?.read_latest_line(QUIET).await?
        } else {
            self.link()?.drain(QUIET).await;
            self.send_command(&command).await?
        };
        let mut reading = Reading::new(Utc::now());
        parse_line(&self.settings.name, &line, &mut reading)?;
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
    use crate::config::StationConfig;
    use tokio::io::AsyncWriteExt;

    const LINE: &str = "\"1\",\"19-jul-22\",\"05:25\",1523,1410,1388,1361,1340,1290,1260,3.9,0.81,47.11,0.79,52.10,,1.1,0.9";

    fn config() -> InstrumentConfig {
        StationConfig::from_yaml_str(
            "paths: { root: /tmp/t }\ninstruments:\n  - name: ae31\n    class: AE31\n    params: { serial: { port: /dev/ttyUSB1, timeout: 1 }, sampling_interval: 5, reporting_interval: 60 }\n",
        )
        .unwrap()
        .instruments[0]
            .clone()
    }

    #[test]
    fn parses_expanded_record() {
        let mut reading = Reading::new(Utc::now());
        parse_line("ae31", LINE, &mut reading).unwrap();
        assert_eq!(reading.get("date"), Some(&FieldValue::Text("19-jul-22".into())));
        assert_eq!(reading.get("UV370"), Some(&FieldValue::Int(1523)));
        assert_eq!(reading.get("flow"), Some(&FieldValue::Float(3.9)));
        assert_eq!(reading.get("UV370_4"), Some(&FieldValue::Float(52.10)));
        assert_eq!(reading.get("UV370_6"), Some(&FieldValue::Float(0.9)));
        assert!(reading.get("").is_none());
    }

    #[test]
    fn short_record_is_a_protocol_error() {
        let mut reading = Reading::new(Utc::now());
        let err = parse_line("ae31", "\"1\",\"19-jul-22\",\"05:25\",1523", &mut reading).unwrap_err();
        assert!(matches!(err, DaqError::Protocol { .. }));
    }

    #[tokio::test]
    async fn poll_reads_streamed_line() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut driver = Ae31Driver::new(&config());
        driver.attach(Box::new(device));

        host.write_all(format!("{LINE}\r\n").as_bytes()).await.unwrap();
        let reading = driver.poll().await.unwrap();
        assert_eq!(reading.get("IR950"), Some(&FieldValue::Int(1260)));
    }

    #[tokio::test]
    async fn poll_returns_newest_queued_record() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut driver = Ae31Driver::new(&config());
        driver.attach(Box::new(device));

        let older = LINE.replace("\"05:25\"", "\"05:20\"");
        host.write_all(format!("{older}\r\n{LINE}\r\n").as_bytes()).await.unwrap();
        let reading = driver.poll().await.unwrap();
        assert_eq!(reading.get("time"), Some(&FieldValue::Text("05:25".into())));

        // Nothing left over for the next poll
        let newer = LINE.replace("\"05:25\"", "\"05:30\"");
        host.write_all(format!("{newer}\r\n").as_bytes()).await.unwrap();
        let reading = driver.poll().await.unwrap();
        assert_eq!(reading.get("time"), Some(&FieldValue::Text("05:30".into())));
    }
}
