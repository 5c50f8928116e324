//! Byte transports for instrument drivers.
//!
//! # Types
//!
//! - [`TransportIO`]: Trait alias combining AsyncRead + AsyncWrite for any byte stream
//! - [`DynTransport`]: Type-erased boxed transport
//! - [`Link`]: A transport bound to one instrument with its reply timeout
//!
//! # Utilities
//!
//! - [`open_tcp`]: Connect a TCP socket within the reply timeout
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`drain`]: Drain stale data from a transport

use crate::config::{InstrumentConfig, SerialParams, SocketParams};
use crate::error::{DaqError, DaqResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

// =============================================================================
// Transport Trait
// =============================================================================

/// Trait alias for async instrument I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a transport. This includes:
/// - `tokio_serial::SerialStream` (serial lines)
/// - `tokio::net::TcpStream` (socket instruments)
/// - `tokio::io::DuplexStream` (testing)
pub trait TransportIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportIO for T {}

/// Type-erased boxed transport.
pub type DynTransport = Box<dyn TransportIO>;

// =============================================================================
// Opening
// =============================================================================

/// Open the transport configured for `config` (socket or serial).
pub async fn open(config: &InstrumentConfig) -> DaqResult<DynTransport> {
    if let Some(socket) = &config.params.socket {
        let stream = open_tcp(&config.name, socket).await?;
        return Ok(Box::new(stream));
    }
    if let Some(serial) = &config.params.serial {
        return open_serial(&config.name, serial).await;
    }
    Err(DaqError::Configuration(format!(
        "instrument '{}' has no socket or serial transport",
        config.name
    )))
}

/// Connect a TCP socket, failing with `Connection` on refusal or timeout.
pub async fn open_tcp(instrument: &str, socket: &SocketParams) -> DaqResult<TcpStream> {
    let timeout = Duration::from_secs_f64(socket.timeout.max(0.1));
    match tokio::time::timeout(timeout, TcpStream::connect((socket.host.as_str(), socket.port)))
        .await
    {
        Ok(Ok(stream)) => {
            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(instrument, error = %err, "could not set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(err)) => Err(DaqError::connection(
            instrument,
            format!("{}:{}: {err}", socket.host, socket.port),
        )),
        Err(_) => Err(DaqError::connection(
            instrument,
            format!("{}:{}: connect timed out after {timeout:?}", socket.host, socket.port),
        )),
    }
}

#[cfg(feature = "serial")]
async fn open_serial(instrument: &str, serial: &SerialParams) -> DaqResult<DynTransport> {
    let port = open_serial_async(serial, instrument).await?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(_instrument: &str, _serial: &SerialParams) -> DaqResult<DynTransport> {
    Err(DaqError::FeatureNotEnabled("serial".into()))
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Port opening can block on some USB adapters, so it runs on the blocking
/// pool. Framing (data bits, parity, stop bits) comes from the configuration;
/// flow control is off.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    serial: &SerialParams,
    instrument: &str,
) -> DaqResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = match serial.bytesize {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match serial.parity.to_uppercase().as_str() {
        "E" => tokio_serial::Parity::Even,
        "O" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };
    let stop_bits = if serial.stopbits == 2 {
        tokio_serial::StopBits::Two
    } else {
        tokio_serial::StopBits::One
    };

    let path = serial.port.clone();
    let baud_rate = serial.baudrate;
    let name = instrument.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|err| DaqError::connection(&name, format!("{path}: {err}")))
    })
    .await
    .map_err(|err| DaqError::connection(instrument, format!("serial open task failed: {err}")))?
}

/// List serial ports visible to the host.
#[cfg(feature = "serial")]
pub fn available_ports() -> DaqResult<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|err| DaqError::Io(std::io::Error::other(err.to_string())))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

// =============================================================================
// Link
// =============================================================================

/// A transport bound to one instrument, with bounded reads.
pub struct Link {
    io: BufReader<DynTransport>,
    instrument: String,
    timeout: Duration,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("instrument", &self.instrument)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Link {
    /// Wrap a transport for `instrument`; every read is bounded by `timeout`.
    pub fn new(io: DynTransport, instrument: &str, timeout: Duration) -> Self {
        Self {
            io: BufReader::new(io),
            instrument: instrument.to_string(),
            timeout,
        }
    }

    /// Reply timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write a complete command frame.
    pub async fn send(&mut self, frame: &[u8]) -> DaqResult<()> {
        let writer = self.io.get_mut();
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DaqError::connection(&self.instrument, format!("write failed: {err}"))),
            Err(_) => Err(DaqError::timeout(&self.instrument, self.timeout)),
        }
    }

    /// Read one `\n`-terminated line, without the line ending.
    pub async fn read_line(&mut self) -> DaqResult<String> {
        let mut line = String::new();
        match tokio::time::timeout(self.timeout, self.io.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(DaqError::connection(&self.instrument, "connection closed")),
            Ok(Ok(_)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(err)) => Err(DaqError::connection(&self.instrument, format!("read failed: {err}"))),
            Err(_) => Err(DaqError::timeout(&self.instrument, self.timeout)),
        }
    }

    /// Read the newest complete line of a streaming instrument.
    ///
    /// Waits for one line like [`Link::read_line`], then keeps reading while
    /// further lines arrive within `idle` of each other, up to the reply
    /// timeout. Lines that queued up since the previous read are skipped.
    pub async fn read_latest_line(&mut self, idle: Duration) -> DaqResult<String> {
        let deadline = Instant::now() + self.timeout;
        let mut latest = self.read_line().await?;
        let mut skipped = 0usize;
        while Instant::now() < deadline {
            if self.io.buffer().is_empty() {
                match tokio::time::timeout(idle, self.io.fill_buf()).await {
                    Ok(Ok(buf)) if !buf.is_empty() => {}
                    _ => break,
                }
            }
            latest = self.read_line().await?;
            skipped += 1;
        }
        if skipped > 0 {
            tracing::debug!(instrument = %self.instrument, skipped, "skipped queued lines");
        }
        Ok(latest)
    }

    /// Read a reply that ends with `terminator` or with a quiet gap.
    ///
    /// Returns as soon as the terminator byte arrives, or once at least one byte
    /// was received and the line stays silent for `idle`. Fails with `Timeout`
    /// when nothing arrives within the reply timeout.
    pub async fn read_reply(&mut self, terminator: Option<u8>, idle: Duration) -> DaqResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut reply = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = if reply.is_empty() { remaining } else { idle.min(remaining) };

            match tokio::time::timeout(wait, self.io.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    if reply.is_empty() {
                        return Err(DaqError::connection(&self.instrument, "connection closed"));
                    }
                    break;
                }
                Ok(Ok(n)) => {
                    let data = &chunk[..n];
                    if let Some(t) = terminator {
                        if let Some(pos) = data.iter().position(|b| *b == t) {
                            reply.extend_from_slice(&data[..pos]);
                            return Ok(reply);
                        }
                    }
                    reply.extend_from_slice(data);
                }
                Ok(Err(err)) => {
                    return Err(DaqError::connection(&self.instrument, format!("read failed: {err}")));
                }
                Err(_) => {
                    if !reply.is_empty() {
                        break;
                    }
                }
            }
        }

        if reply.is_empty() {
            Err(DaqError::timeout(&self.instrument, self.timeout))
        } else {
            Ok(reply)
        }
    }

    /// Discard bytes already waiting on the line.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let buffered = self.io.buffer().len();
        self.io.consume(buffered);
        buffered + drain(self.io.get_mut(), window).await
    }

    /// Shut down the write side, ignoring errors.
    pub async fn close(mut self) {
        let _ = self.io.get_mut().shutdown().await;
    }
}

/// Drain stale data from a transport.
///
/// Reads and discards until the line is quiet or `window` elapses.
/// Returns the number of bytes discarded.
pub async fn drain<R: AsyncRead + Unpin + ?Sized>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(device: tokio::io::DuplexStream) -> Link {
        Link::new(Box::new(device), "test", Duration::from_millis(500))
    }

    #[tokio::test]
    async fn read_line_strips_line_ending() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = link(device);

        host.write_all(b"2024-05-17 10:00:00,1.5\r\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "2024-05-17 10:00:00,1.5");
    }

    #[tokio::test]
    async fn read_latest_line_skips_queued_lines() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut link = link(device);

        host.write_all(b"old,1\r\nolder,2\r\nnewest,3\r\n").await.unwrap();
        let line = link.read_latest_line(Duration::from_millis(20)).await.unwrap();
        assert_eq!(line, "newest,3");

        host.write_all(b"next,4\r\n").await.unwrap();
        let line = link.read_latest_line(Duration::from_millis(20)).await.unwrap();
        assert_eq!(line, "next,4");
    }

    #[tokio::test]
    async fn read_reply_stops_at_terminator() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = link(device);

        host.write_all(b"o3 30.8 ppb\0trailing").await.unwrap();
        let reply = link.read_reply(Some(0), Duration::from_millis(50)).await.unwrap();
        assert_eq!(reply, b"o3 30.8 ppb");
    }

    #[tokio::test]
    async fn read_reply_ends_on_quiet_line() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = link(device);

        host.write_all(b"partial ").await.unwrap();
        host.write_all(b"reply").await.unwrap();
        let reply = link.read_reply(None, Duration::from_millis(20)).await.unwrap();
        assert_eq!(reply, b"partial reply");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_line_times_out() {
        let (_host, device) = tokio::io::duplex(64);
        let mut link = link(device);

        let err = link.read_reply(None, Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
        let err = link.read_line().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn closed_peer_is_a_connection_error() {
        let (host, device) = tokio::io::duplex(64);
        let mut link = link(device);
        drop(host);

        let err = link.read_line().await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = link(device);

        host.write_all(b"stale data 12345").await.unwrap();
        let discarded = link.drain(Duration::from_millis(30)).await;
        assert_eq!(discarded, 16);
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let params = SocketParams {
            host: "127.0.0.1".into(),
            port,
            timeout: 1.0,
            sleep: 0.0,
        };
        let err = open_tcp("o3", &params).await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
    }

    #[tokio::test]
    async fn tcp_connect_disables_nagle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let params = SocketParams {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
            timeout: 1.0,
            sleep: 0.0,
        };
        let (stream, accepted) = tokio::join!(open_tcp("o3", &params), listener.accept());
        let stream = stream.unwrap();
        accepted.unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
