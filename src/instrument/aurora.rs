//! Ecotech Aurora 3000 nephelometer.
//!
//! Commands are plain ASCII terminated by CR. `VI099` returns the current
//! data line `YYYY-MM-DD HH:MM:SS, v1, ..., hexstatus`; the final column is the
//! digital I/O state in hex. `ID0` and `VI088` (status word) are useful as
//! `get_config` commands.
//!
//! With `params.instant_interval` set, a poll takes one instant reading every
//! `instant_interval` seconds across the sampling interval and returns their
//! mean (see [`Reading::mean`]). Otherwise a poll is a single instant reading.

use super::transport::{self, DynTransport, Link};
use super::{DriverSettings, InstrumentDriver};
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::measurement::{FieldValue, Reading};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

/// Default data command: current data
pub const DEFAULT_GET_DATA: &str = "VI099";

/// Field names of a `VI099` reply after the timestamp
pub const FIELDS: &[&str] = &[
    "ssp1",
    "ssp2",
    "ssp3",
    "sbsp1",
    "sbsp2",
    "sbsp3",
    "sample_temp",
    "enclosure_temp",
    "rh",
    "pressure",
    "major_state",
    "dio_state",
];

const REPLY_IDLE: Duration = Duration::from_millis(200);

/// Instant readings averaged into one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Averaging {
    /// Time between instant readings
    pub every: Duration,
    /// Instant readings per poll
    pub count: u32,
}

impl Averaging {
    /// Averaging configured for `config`, if any
    pub fn from_config(config: &InstrumentConfig) -> Option<Self> {
        let secs = config.params.instant_interval.filter(|s| *s > 0)?;
        let every = Duration::from_secs(u64::from(secs));
        let count = (config.sampling_period().as_secs() / u64::from(secs)).max(1);
        Some(Self {
            every,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }
}

/// Driver for the Aurora 3000.
#[derive(Debug)]
pub struct AuroraDriver {
    config: InstrumentConfig,
    settings: DriverSettings,
    averaging: Option<Averaging>,
    link: Option<Link>,
}

impl AuroraDriver {
    /// Driver for `config`
    pub fn new(config: &InstrumentConfig) -> Self {
        Self {
            config: config.clone(),
            settings: DriverSettings::from_config(config, DEFAULT_GET_DATA),
            averaging: Averaging::from_config(config),
            link: None,
        }
    }

    /// Use an already open transport instead of connecting.
    pub fn attach(&mut self, io: DynTransport) {
        self.link = Some(Link::new(io, &self.settings.name, self.settings.timeout));
    }

    async fn read_instant(&mut self) -> DaqResult<Reading> {
        let command = self.settings.get_data.clone();
        let reply = self.send_command(&command).await?;
        let mut reading = Reading::new(Utc::now());
        parse_current_data(&self.settings.name, &reply, &mut reading)?;
        Ok(reading)
    }

    /// Instant readings on a fixed schedule, averaged.
    ///
    /// A failed instant reading is skipped; slots missed while waiting on a
    /// slow reply are not made up. Connection loss ends the poll.
    async fn read_average(&mut self, averaging: Averaging) -> DaqResult<Reading> {
        let start = Instant::now();
        let mut instants = Vec::with_capacity(averaging.count as usize);
        let mut last_err = None;
        for slot in 0..averaging.count {
            let due = start + averaging.every * slot;
            if Instant::now() > due + averaging.every {
                continue;
            }
            tokio::time::sleep_until(due).await;
            match self.read_instant().await {
                Ok(reading) => instants.push(reading),
                Err(err @ DaqError::Connection { .. }) => return Err(err),
                Err(err) => {
                    tracing::debug!(instrument = %self.settings.name, slot, error = %err, "instant reading failed");
                    last_err = Some(err);
                }
            }
        }
        tracing::debug!(instrument = %self.settings.name, instants = instants.len(), of = averaging.count, "averaged instant readings");
        match Reading::mean(&instants) {
            Some(mean) => Ok(mean),
            None => Err(last_err.unwrap_or_else(|| {
                DaqError::protocol(&self.settings.name, "no instant reading in sampling interval")
            })),
        }
    }
}

/// Parse a `VI099` reply.
pub fn parse_current_data(instrument: &str, reply: &str, reading: &mut Reading) -> DaqResult<()> {
    let line = reply.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != FIELDS.len() + 1 {
        return Err(DaqError::protocol(
            instrument,
            format!("expected {} columns, got {}: {line}", FIELDS.len() + 1, parts.len()),
        ));
    }

    chrono::NaiveDateTime::parse_from_str(parts[0], "%Y-%m-%d %H:%M:%S").map_err(|err| {
        DaqError::protocol(instrument, format!("bad timestamp '{}': {err}", parts[0]))
    })?;
    reading.push("instrument_time", FieldValue::Text(parts[0].to_string()));

    let (status, values) = parts[1..].split_at(FIELDS.len() - 1);
    for (name, raw) in FIELDS.iter().zip(values) {
        let value: f64 = raw
            .parse()
            .map_err(|_| DaqError::protocol(instrument, format!("{name}: not a number '{raw}'")))?;
        reading.push(*name, value);
    }
    let dio = i64::from_str_radix(status[0], 16).map_err(|_| {
        DaqError::protocol(instrument, format!("dio_state: not hex '{}'", status[0]))
    })?;
    reading.push("dio_state", dio);
    Ok(())
}

#[async_trait]
impl InstrumentDriver for AuroraDriver {
    fn driver_type(&self) -> &'static str {
        "aurora3000"
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
        link.send(format!("{command}\r").as_bytes()).await?;
        let raw = link.read_reply(None, REPLY_IDLE).await?;
        Ok(String::from_utf8_lossy(&raw)
            .replace("\r\n\n", "\r\n")
            .trim()
            .to_string())
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        match self.averaging {
            Some(averaging) => self.read_average(averaging).await,
            None => self.read_instant().await,
        }
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

    const REPLY: &str =
        "2024-05-17 10:00:00, 12.5, 9.8, 6.1, 1.2, 0.9, 0.7, 24.3, 29.1, 38.0, 1012.4, 0, 1F\r\n";

    #[test]
    fn parses_current_data() {
        let mut reading = Reading::new(Utc::now());
        parse_current_data("neph", REPLY, &mut reading).unwrap();
        assert_eq!(reading.get("ssp1"), Some(&FieldValue::Float(12.5)));
        assert_eq!(reading.get("pressure"), Some(&FieldValue::Float(1012.4)));
        assert_eq!(reading.get("major_state"), Some(&FieldValue::Float(0.0)));
        assert_eq!(reading.get("dio_state"), Some(&FieldValue::Int(31)));
        assert_eq!(reading.len(), FIELDS.len() + 1);
    }

    #[test]
    fn rejects_truncated_reply() {
        let mut reading = Reading::new(Utc::now());
        assert!(parse_current_data("neph", "2024-05-17 10:00:00, 12.5", &mut reading).is_err());
        assert!(parse_current_data("neph", "", &mut reading).is_err());
    }

    fn config(extra: &str) -> InstrumentConfig {
        crate::config::StationConfig::from_yaml_str(&format!(
            "paths: {{ root: /tmp/t }}\ninstruments:\n  - name: neph\n    class: Aurora3000\n    params: {{ serial: {{ port: /dev/ttyUSB2, timeout: 1 }}, sampling_interval: 1, reporting_interval: 60{extra} }}\n",
        ))
        .unwrap()
        .instruments[0]
            .clone()
    }

    #[tokio::test]
    async fn polls_with_vi099() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut driver = AuroraDriver::new(&config(""));
        driver.attach(Box::new(device));

        let instrument = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"VI099\r");
            host.write_all(REPLY.as_bytes()).await.unwrap();
            host
        });

        let reading = driver.poll().await.unwrap();
        assert_eq!(reading.get("rh"), Some(&FieldValue::Float(38.0)));
        instrument.await.unwrap();
    }

    #[test]
    fn averaging_spans_the_sampling_interval() {
        assert_eq!(Averaging::from_config(&config("")), None);
        assert_eq!(
            Averaging::from_config(&config(", instant_interval: 5")),
            Some(Averaging {
                every: Duration::from_secs(5),
                count: 12
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_averages_instant_readings() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut driver = AuroraDriver::new(&config(", instant_interval: 20"));
        driver.attach(Box::new(device));

        let instrument = tokio::spawn(async move {
            let mut sent = Vec::new();
            for ssp1 in ["10.0", "12.0", "garbage"] {
                let mut buf = [0u8; 16];
                let n = host.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"VI099\r");
                sent.push(tokio::time::Instant::now());
                let reply = REPLY.replacen("12.5", ssp1, 1);
                host.write_all(reply.as_bytes()).await.unwrap();
            }
            (host, sent)
        });

        let reading = driver.poll().await.unwrap();
        assert_eq!(reading.get("ssp1"), Some(&FieldValue::Float(11.0)));
        assert_eq!(reading.get("rh"), Some(&FieldValue::Float(38.0)));
        assert_eq!(reading.get("dio_state"), Some(&FieldValue::Int(31)));

        let (_host, sent) = instrument.await.unwrap();
        assert_eq!(sent[1] - sent[0], Duration::from_secs(20));
        assert_eq!(sent[2] - sent[0], Duration::from_secs(40));
    }
}
