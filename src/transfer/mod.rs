//! Transfer manager: ships staged files to the remote archive.
//!
//! A single manager serves the whole station. Each [`TransferManager::sync`]
//! walks the staging area, opens one [`RemoteSession`] through the configured
//! [`Connector`], uploads every staged file to its mirrored remote path and
//! deletes the local copy only once the remote side reports the full size.
//!
//! Failures are contained: a file that fails stays staged and is retried on the
//! next sync; a sync that cannot connect at all is logged and retried on the
//! next interval. Delivery is at-least-once, and uploads overwrite by name so a
//! repeated upload leaves a single remote file.
//!
//! The connector is chosen once from configuration (local mirror, direct SFTP
//! or SFTP through a SOCKS5 proxy); the manager never branches on it.

pub mod local;
#[cfg(feature = "sftp")]
pub mod sftp;

use crate::config::{StationConfig, TransferBackend};
use crate::data::storage::is_part_file;
use crate::error::{DaqError, DaqResult};
use std::collections::HashSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One open connection to the archive, used for a single sync.
///
/// Methods block; the manager calls them from the blocking pool.
pub trait RemoteSession: Send {
    /// Create `dir` and all missing parents.
    fn ensure_dir(&mut self, dir: &str) -> DaqResult<()>;

    /// Write `local` to `remote`, replacing an existing file, and return the
    /// size the remote side reports afterwards.
    fn upload(&mut self, local: &Path, remote: &str) -> DaqResult<u64>;

    /// Close the session. Never fails.
    fn close(self: Box<Self>);
}

/// Opens [`RemoteSession`]s.
pub trait Connector: Send + Sync + Debug {
    /// Human-readable endpoint for logs
    fn describe(&self) -> String;

    /// Open a new session
    fn open(&self) -> DaqResult<Box<dyn RemoteSession>>;
}

/// Maps a staging subfolder to its remote subfolder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Folder below the staging root
    pub staging: PathBuf,
    /// Folder below the remote root
    pub remote: PathBuf,
}

/// A staged file and its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// Local staged path
    pub local: PathBuf,
    /// Remote destination path
    pub remote: String,
}

/// Outcome of one sync
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Files uploaded and removed locally
    pub uploaded: Vec<PathBuf>,
    /// Files left staged, with the reason
    pub failed: Vec<(PathBuf, String)>,
    /// Files not attempted because the sync was cancelled
    pub skipped: usize,
}

/// Join remote path segments with `/`.
fn remote_join(base: &str, rel: &Path) -> String {
    let rooted = base.starts_with('/');
    let mut out = base.trim_end_matches('/').to_string();
    for part in rel.components() {
        if let std::path::Component::Normal(part) = part {
            if rooted || !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

fn remote_parent(remote: &str) -> &str {
    remote.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Station-wide transfer manager.
#[derive(Debug, Clone)]
pub struct TransferManager {
    staging_root: PathBuf,
    remote_root: String,
    routes: Arc<Vec<Route>>,
    connector: Arc<dyn Connector>,
}

impl TransferManager {
    /// Manager uploading below `remote_root` through `connector`
    pub fn new(
        staging_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        mut routes: Vec<Route>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        // Longest staging prefix wins
        routes.sort_by_key(|r| std::cmp::Reverse(r.staging.components().count()));
        Self {
            staging_root: staging_root.into(),
            remote_root: remote_root.into(),
            routes: Arc::new(routes),
            connector,
        }
    }

    /// Manager for the configured backend, or `None` when transfer is not configured.
    pub fn from_config(station: &StationConfig) -> DaqResult<Option<Self>> {
        let routes = station
            .instruments
            .iter()
            .map(|i| Route {
                staging: i.staging_subdir(),
                remote: i.remote_subdir(),
            })
            .collect();

        let (connector, remote_root): (Arc<dyn Connector>, String) = match station.transfer.backend {
            TransferBackend::Local => {
                let archive = station.transfer.archive_path.clone().ok_or_else(|| {
                    DaqError::Configuration("transfer.backend 'local' requires transfer.archive_path".into())
                })?;
                (Arc::new(local::LocalMirror), archive.to_string_lossy().into_owned())
            }
            TransferBackend::Sftp => {
                let Some(sftp) = &station.sftp else {
                    return Ok(None);
                };
                (
                    sftp_connector(sftp)?,
                    sftp.remote_path.to_string_lossy().into_owned(),
                )
            }
        };

        Ok(Some(Self::new(station.staging_dir(), remote_root, routes, connector)))
    }

    /// Endpoint description
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    fn remote_for(&self, rel: &Path) -> String {
        for route in self.routes.iter() {
            if let Ok(rest) = rel.strip_prefix(&route.staging) {
                let base = remote_join(&self.remote_root, &route.remote);
                return remote_join(&base, rest);
            }
        }
        remote_join(&self.remote_root, rel)
    }

    /// Staged files and their destinations, sorted by local path.
    pub fn pending(&self) -> DaqResult<Vec<PendingFile>> {
        let mut pending = Vec::new();
        if !self.staging_root.exists() {
            return Ok(pending);
        }
        let mut dirs = vec![self.staging_root.clone()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if is_hidden(&path) || is_part_file(&path) {
                    continue;
                }
                if path.is_dir() {
                    dirs.push(path);
                } else if path.is_file() {
                    let rel = path.strip_prefix(&self.staging_root).unwrap_or(&path);
                    pending.push(PendingFile {
                        remote: self.remote_for(rel),
                        local: path.clone(),
                    });
                }
            }
        }
        pending.sort_by(|a, b| a.local.cmp(&b.local));
        Ok(pending)
    }

    fn transfer_one(
        &self,
        session: &mut dyn RemoteSession,
        created: &mut HashSet<String>,
        file: &PendingFile,
    ) -> DaqResult<()> {
        let dir = remote_parent(&file.remote).to_string();
        if !dir.is_empty() && !created.contains(&dir) {
            session.ensure_dir(&dir)?;
            created.insert(dir);
        }
        let local_size = std::fs::metadata(&file.local)?.len();
        let remote_size = session.upload(&file.local, &file.remote)?;
        if remote_size != local_size {
            return Err(DaqError::Transfer(format!(
                "{}: remote size {remote_size} != local size {local_size}",
                file.remote
            )));
        }
        std::fs::remove_file(&file.local)?;
        Ok(())
    }

    /// Upload every staged file. Blocks; see [`TransferManager::sync_async`].
    pub fn sync(&self) -> DaqResult<SyncReport> {
        self.sync_until(&CancellationToken::new())
    }

    /// Like [`TransferManager::sync`], but stops before the next file once
    /// `cancel` fires. Files not yet attempted stay staged.
    pub fn sync_until(&self, cancel: &CancellationToken) -> DaqResult<SyncReport> {
        let pending = self.pending()?;
        let mut report = SyncReport::default();
        if pending.is_empty() {
            tracing::debug!("nothing staged");
            return Ok(report);
        }

        let mut session = self.connector.open()?;
        let mut created = HashSet::new();
        let total = pending.len();
        for (index, file) in pending.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped = total - index;
                tracing::info!(remaining = report.skipped, "sync cancelled, remaining files stay staged");
                break;
            }
            match self.transfer_one(session.as_mut(), &mut created, &file) {
                Ok(()) => {
                    tracing::info!(file = %file.local.display(), remote = %file.remote, "uploaded");
                    report.uploaded.push(file.local);
                }
                Err(err) => {
                    tracing::warn!(file = %file.local.display(), remote = %file.remote, error = %err, "upload failed, file stays staged");
                    report.failed.push((file.local, err.to_string()));
                }
            }
        }
        session.close();

        tracing::info!(
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "sync finished"
        );
        Ok(report)
    }

    /// [`TransferManager::sync_until`] on the blocking pool
    pub async fn sync_async(&self, cancel: &CancellationToken) -> DaqResult<SyncReport> {
        let manager = self.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || manager.sync_until(&cancel))
            .await
            .map_err(|err| DaqError::Transfer(format!("sync task failed: {err}")))?
    }

    /// Sync every `interval` and, when `trigger` is given, `settle` after the
    /// stager signals new files. Runs until cancelled.
    pub async fn run(
        self,
        interval: Duration,
        trigger: Option<(Arc<Notify>, Duration)>,
        cancel: CancellationToken,
    ) {
        tracing::info!(endpoint = %self.describe(), interval = ?interval, "transfer manager started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let reactive = async {
                match &trigger {
                    Some((notify, settle)) => {
                        notify.notified().await;
                        tokio::time::sleep(*settle).await;
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = reactive => {
                    tracing::debug!("sync triggered by staging");
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.sync_async(&cancel) => result,
            };
            if let Err(err) = result {
                tracing::error!(endpoint = %self.describe(), error = %err, "sync failed, retrying next cycle");
            }
        }
        tracing::info!("transfer manager stopped");
    }
}

#[cfg(feature = "sftp")]
fn sftp_connector(config: &crate::config::SftpConfig) -> DaqResult<Arc<dyn Connector>> {
    Ok(Arc::new(sftp::SftpConnector::from_config(config)))
}

#[cfg(not(feature = "sftp"))]
fn sftp_connector(_config: &crate::config::SftpConfig) -> DaqResult<Arc<dyn Connector>> {
    Err(DaqError::FeatureNotEnabled("sftp".into()))
}
