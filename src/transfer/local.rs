//! Local or mounted archive directory as a transfer target.
//!
//! Remote paths are plain local paths. Uploads are written under a hidden
//! temporary name next to the target and renamed over it, so readers of the
//! archive never see a partial file and a re-upload replaces the old copy.

use super::{Connector, RemoteSession};
use crate::error::DaqResult;
use std::fs::File;
use std::path::Path;

/// Connector for a directory archive
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMirror;

impl Connector for LocalMirror {
    fn describe(&self) -> String {
        "local archive".to_string()
    }

    fn open(&self) -> DaqResult<Box<dyn RemoteSession>> {
        Ok(Box::new(LocalSession))
    }
}

struct LocalSession;

impl RemoteSession for LocalSession {
    fn ensure_dir(&mut self, dir: &str) -> DaqResult<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> DaqResult<u64> {
        let target = Path::new(remote);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{name}.tmp"));

        std::fs::copy(local, &temp)?;
        File::open(&temp)?.sync_all()?;
        std::fs::rename(&temp, target)?;
        Ok(std::fs::metadata(target)?.len())
    }

    fn close(self: Box<Self>) {}
}
