//! Thermo Scientific 49i / 49C ozone analyzers.
//!
//! Both use the C-Link ASCII protocol. Every command is framed as
//! `[id + 128] <command> \r`; the reply echoes the command and ends with a
//! `*XXXX` checksum. Over TCP the reply is NUL-terminated, over serial it ends
//! when the line goes quiet.
//!
//! `lrec` replies look like
//! `05:26 07-19-22 flags 0C100400 o3 30.781 hio3 0.000 cellai 50927 ...`
//! and are parsed into `time`, `date` and key/value fields.
//!
//! [`ThermoDriver::download_lrec`] pulls the instrument's whole record logger,
//! ten records per request, for backfilling gaps after an outage.

use super::transport::{self, DynTransport, Link};
use super::{apply_commands, ConfigureReport, DriverSettings, InstrumentDriver};
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::measurement::{FieldValue, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data command: the latest long record
pub const DEFAULT_GET_DATA: &str = "lrec";

/// Default instrument id
pub const DEFAULT_ID: u8 = 49;

/// Fields of an `lrec` reply, used for simulated readings
pub const LREC_FIELDS: &[&str] = &[
    "time", "date", "flags", "o3", "hio3", "cellai", "cellbi", "bncht", "lmpt", "o3lt", "flowa",
    "flowb", "pres",
];

const SERIAL_IDLE: Duration = Duration::from_millis(100);

/// Records fetched per `lrec <index> <count>` request
const LREC_CHUNK: usize = 10;

/// Driver for Thermo 49i and 49C analyzers.
#[derive(Debug)]
pub struct ThermoDriver {
    config: InstrumentConfig,
    settings: DriverSettings,
    kind: &'static str,
    id: u8,
    link: Option<Link>,
}

impl ThermoDriver {
    /// Driver for `config`; `kind` is `thermo49i` or `thermo49c`
    pub fn new(config: &InstrumentConfig, kind: &'static str) -> Self {
        Self {
            config: config.clone(),
            settings: DriverSettings::from_config(config, DEFAULT_GET_DATA),
            kind,
            id: config.params.id.unwrap_or(DEFAULT_ID),
            link: None,
        }
    }

    /// Use an already open transport instead of connecting.
    pub fn attach(&mut self, io: DynTransport) {
        self.link = Some(Link::new(io, &self.settings.name, self.settings.timeout));
    }

    fn frame(&self, command: &str) -> Vec<u8> {
        let mut frame = Vec::with_capacity(command.len() + 2);
        frame.push(self.id.saturating_add(128));
        frame.extend_from_slice(command.as_bytes());
        frame.push(b'\r');
        frame
    }

    fn uses_socket(&self) -> bool {
        self.config.params.socket.is_some()
    }

    fn reply_idle(&self) -> Duration {
        match &self.config.params.socket {
            Some(socket) => Duration::from_secs_f64(socket.sleep.max(0.05)),
            None => SERIAL_IDLE,
        }
    }

    /// Sync the instrument clock with the station clock.
    async fn set_datetime(&mut self) -> ConfigureReport {
        let now = Local::now();
        let commands = [
            format!("set date {}", now.format("%m-%d-%y")),
            format!("set time {}", now.format("%H:%M:%S")),
        ];
        apply_commands(self, &commands).await
    }

    /// Download every long record held in the instrument's logger.
    ///
    /// The record format is switched to 0 for the download and restored
    /// afterwards, also when the download fails.
    pub async fn download_lrec(&mut self) -> DaqResult<Vec<String>> {
        let reply = self.send_command("no of lrec").await?;
        let count: usize = reply
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| DaqError::protocol(&self.settings.name, format!("bad record count: {reply}")))?;

        let previous = self.send_command("lrec format").await?;
        let ack = self.send_command("set lrec format 0").await?;
        if !ack.to_lowercase().contains("ok") {
            tracing::warn!(instrument = %self.settings.name, reply = %ack, "set lrec format 0 not acknowledged");
        }

        tracing::info!(instrument = %self.settings.name, records = count, "downloading record logger");
        let records = self.fetch_lrec(count).await;

        let restore = format!("set lrec format {}", previous.trim());
        if let Err(err) = self.send_command(&restore).await {
            tracing::warn!(instrument = %self.settings.name, error = %err, "could not restore lrec format");
        }
        records
    }

    async fn fetch_lrec(&mut self, count: usize) -> DaqResult<Vec<String>> {
        let mut records = Vec::with_capacity(count);
        let mut index = count;
        while index > 0 {
            let take = index.min(LREC_CHUNK);
            let command = format!("lrec {index} {take}");
            tracing::debug!(instrument = %self.settings.name, command = %command, "fetching records");
            let reply = self.send_command(&command).await?;
            records.extend(
                reply
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
            index -= take;
        }
        Ok(records)
    }
}

/// Write a logger download to `dir/<instrument>_all_lrec-<YYYYmmddHHMMSS>.dat`.
pub fn write_lrec_dump(
    dir: &Path,
    instrument: &str,
    records: &[String],
    at: DateTime<Local>,
) -> DaqResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file = dir.join(format!("{instrument}_all_lrec-{}.dat", at.format("%Y%m%d%H%M%S")));
    let part = file.with_extension("dat.part");
    let mut body = records.join("\n");
    body.push('\n');
    std::fs::write(&part, body)?;
    std::fs::rename(&part, &file)?;
    Ok(file)
}

/// Strip the checksum and the leading command echo from a raw reply.
pub fn clean_reply(raw: &[u8], command: &str) -> String {
    let text = String::from_utf8_lossy(raw).replace('\0', "");
    let text = text.split('*').next().unwrap_or_default().trim();
    text.strip_prefix(command).unwrap_or(text).trim().to_string()
}

fn is_clock_time(token: &str) -> bool {
    let parts: Vec<&str> = token.split(':').collect();
    parts.len() >= 2 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn is_instrument_date(token: &str) -> bool {
    let parts: Vec<&str> = token.split('-').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Parse the cleaned reply to `command` into `reading`.
///
/// Replies are either key/value records (optionally led by the instrument's
/// time and date) or a bare value with an optional unit, which is stored under
/// the command name.
pub fn parse_reply(instrument: &str, command: &str, reply: &str, reading: &mut Reading) -> DaqResult<()> {
    if reply.is_empty() {
        return Err(DaqError::protocol(instrument, "empty reply"));
    }
    if reply.to_lowercase().contains("bad cmd") {
        return Err(DaqError::protocol(instrument, format!("instrument rejected command: {reply}")));
    }
    let malformed = || DaqError::protocol(instrument, format!("malformed reply: {reply}"));

    let mut tokens: Vec<&str> = reply.split_whitespace().collect();
    if tokens.len() >= 2 && is_clock_time(tokens[0]) && is_instrument_date(tokens[1]) {
        reading.push("time", FieldValue::Text(tokens[0].to_string()));
        reading.push("date", FieldValue::Text(tokens[1].to_string()));
        tokens.drain(..2);
    }

    let is_number = |token: &str| token.parse::<f64>().is_ok();
    let key = command.trim().replace(' ', "_");
    match tokens.as_slice() {
        [value] if is_number(*value) => reading.push(key, FieldValue::parse(value)),
        [value, unit] if is_number(*value) && !is_number(*unit) => {
            reading.push(key, FieldValue::parse(value));
            reading.push("unit", FieldValue::Text(unit.to_string()));
        }
        _ => {
            let pairs = tokens.chunks_exact(2);
            if !pairs.remainder().is_empty() {
                return Err(malformed());
            }
            for pair in pairs {
                let (name, raw) = (pair[0], pair[1]);
                if is_number(name) {
                    return Err(malformed());
                }
                let value = if name == "flags" {
                    FieldValue::Text(raw.to_string())
                } else {
                    FieldValue::parse(raw)
                };
                reading.push(name, value);
            }
        }
    }

    if reading.is_empty() {
        return Err(malformed());
    }
    Ok(())
}

#[async_trait]
impl InstrumentDriver for ThermoDriver {
    fn driver_type(&self) -> &'static str {
        self.kind
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
        tracing::info!(instrument = %self.settings.name, id = self.id, "connected");
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> DaqResult<String> {
        let frame = self.frame(command);
        let terminator = self.uses_socket().then_some(0u8);
        let idle = self.reply_idle();
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| DaqError::connection(&self.settings.name, "not connected"))?;

        link.drain(Duration::from_millis(10)).await;
        link.send(&frame).await?;
        let raw = link.read_reply(terminator, idle).await?;
        Ok(clean_reply(&raw, command))
    }

    async fn configure(&mut self, commands: &[String]) -> ConfigureReport {
        let mut report = self.set_datetime().await;
        let rest = apply_commands(self, commands).await;
        report.applied.extend(rest.applied);
        report.failed.extend(rest.failed);
        report
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        let command = self.settings.get_data.clone();
        let reply = self.send_command(&command).await?;
        let mut reading = Reading::new(Utc::now());
        parse_reply(&self.settings.name, &command, &reply, &mut reading)?;
        tracing::debug!(instrument = %self.settings.name, reply = %reply.chars().take(60).collect::<String>(), "polled");
        Ok(reading)
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}
