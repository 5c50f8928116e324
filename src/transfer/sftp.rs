//! SFTP archive, reached directly or through a SOCKS5 proxy.
//!
//! Authentication uses the configured private key. Every sync opens one SSH
//! session; uploads truncate and rewrite the remote file, then `stat` it to
//! confirm the size.

use super::{Connector, RemoteSession};
use crate::config::SftpConfig;
use crate::error::{DaqError, DaqResult};
use ssh2::{Session, Sftp};
use std::fs::File;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

fn transfer_err(context: &str, err: impl std::fmt::Display) -> DaqError {
    DaqError::Transfer(format!("{context}: {err}"))
}

/// How the TCP connection to the SSH server is made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Connect to the server directly
    Direct,
    /// Tunnel through a SOCKS5 proxy
    Socks5 {
        /// Proxy host
        host: String,
        /// Proxy port
        port: u16,
    },
}

/// Opens SFTP sessions with key authentication.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    host: String,
    port: u16,
    user: String,
    key: PathBuf,
    route: Route,
}

impl SftpConnector {
    /// Connector for the configured endpoint
    pub fn from_config(config: &SftpConfig) -> Self {
        let route = match &config.proxy {
            Some(proxy) => Route::Socks5 {
                host: proxy.socks5.clone(),
                port: proxy.port,
            },
            None => Route::Direct,
        };
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.usr.clone(),
            key: config.key.clone(),
            route,
        }
    }

    fn tcp(&self) -> DaqResult<TcpStream> {
        let target = (self.host.as_str(), self.port);
        let stream = match &self.route {
            Route::Direct => TcpStream::connect(target)
                .map_err(|e| transfer_err(&format!("connect {}:{}", self.host, self.port), e))?,
            Route::Socks5 { host, port } => {
                socks::Socks5Stream::connect((host.as_str(), *port), target)
                    .map_err(|e| transfer_err(&format!("socks5 {host}:{port}"), e))?
                    .into_inner()
            }
        };
        stream.set_read_timeout(Some(SESSION_TIMEOUT))?;
        stream.set_write_timeout(Some(SESSION_TIMEOUT))?;
        Ok(stream)
    }
}

impl Connector for SftpConnector {
    fn describe(&self) -> String {
        match &self.route {
            Route::Direct => format!("sftp://{}@{}:{}", self.user, self.host, self.port),
            Route::Socks5 { host, port } => format!(
                "sftp://{}@{}:{} via socks5 {host}:{port}",
                self.user, self.host, self.port
            ),
        }
    }

    fn open(&self) -> DaqResult<Box<dyn RemoteSession>> {
        let mut session = Session::new().map_err(|e| transfer_err("ssh session", e))?;
        session.set_tcp_stream(self.tcp()?);
        session.set_timeout(SESSION_TIMEOUT.as_millis() as u32);
        session.handshake().map_err(|e| transfer_err("ssh handshake", e))?;
        session
            .userauth_pubkey_file(&self.user, None, &self.key, None)
            .map_err(|e| transfer_err(&format!("authenticate {}", self.user), e))?;
        if !session.authenticated() {
            return Err(DaqError::Transfer(format!("{} not authenticated", self.user)));
        }
        let sftp = session.sftp().map_err(|e| transfer_err("sftp subsystem", e))?;
        tracing::debug!(endpoint = %self.describe(), "sftp session opened");
        Ok(Box::new(SftpSession { session, sftp }))
    }
}

struct SftpSession {
    session: Session,
    sftp: Sftp,
}

impl RemoteSession for SftpSession {
    fn ensure_dir(&mut self, dir: &str) -> DaqResult<()> {
        let mut current = String::new();
        if dir.starts_with('/') {
            current.push('/');
        }
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(part);
            let path = Path::new(&current);
            if self.sftp.stat(path).is_err() {
                if let Err(err) = self.sftp.mkdir(path, 0o755) {
                    // Another writer may have created it meanwhile
                    if self.sftp.stat(path).is_err() {
                        return Err(transfer_err(&format!("mkdir {current}"), err));
                    }
                }
            }
        }
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> DaqResult<u64> {
        let remote_path = Path::new(remote);
        let mut source = File::open(local)?;
        let mut target = self
            .sftp
            .create(remote_path)
            .map_err(|e| transfer_err(&format!("create {remote}"), e))?;
        std::io::copy(&mut source, &mut target)
            .map_err(|e| transfer_err(&format!("write {remote}"), e))?;
        target
            .close()
            .map_err(|e| transfer_err(&format!("close {remote}"), e))?;
        let stat = self
            .sftp
            .stat(remote_path)
            .map_err(|e| transfer_err(&format!("stat {remote}"), e))?;
        Ok(stat.size.unwrap_or(0))
    }

    fn close(self: Box<Self>) {
        let SftpSession { session, sftp } = *self;
        drop(sftp);
        if let Err(err) = session.disconnect(None, "sync finished", None) {
            tracing::debug!(error = %err, "sftp disconnect");
        }
    }
}
