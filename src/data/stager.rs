//! Staging of closed data files.
//!
//! A closed data file is published to the transfer manager by renaming it from
//! `data/<subdir>/` into `staging/<subdir>/`. The rename is atomic, so the
//! staging area only ever holds complete files. When data and staging live on
//! different filesystems the file is copied under a hidden temporary name and
//! renamed into place instead.
//!
//! With compression enabled the file is instead written as a single-entry zip
//! archive `<stem>.zip` (deflate) under a hidden temporary name, renamed into
//! place, and the data file is removed.
//!
//! Staging is idempotent: when the target name already exists the file is not
//! staged a second time.

use super::storage::{is_data_file, is_part_file};
use crate::error::{DaqError, DaqResult};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const ARCHIVE_EXTENSION: &str = "zip";

/// Result of a [`Stager::stage`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The file was moved into staging
    Staged(PathBuf),
    /// A file of that name was already staged; the source was absent or an
    /// identical copy and is gone now
    AlreadyStaged(PathBuf),
    /// A different file of that name is already staged; the source was kept
    Conflict(PathBuf),
}

impl StageOutcome {
    /// Path in the staging area
    pub fn staged_path(&self) -> &Path {
        match self {
            StageOutcome::Staged(p) | StageOutcome::AlreadyStaged(p) | StageOutcome::Conflict(p) => p,
        }
    }
}

/// Files handled during startup recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Leftover closed files that were staged
    pub staged: usize,
    /// Unfinished `.part` files that were removed
    pub removed_parts: usize,
}

/// Write `source` into a new zip archive at `archive` and flush it to disk.
fn write_archive(source: &Path, archive: &Path) -> DaqResult<()> {
    let entry = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "data file has no name"))?;
    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(entry, options)?;
    io::copy(&mut File::open(source)?, &mut zip)?;
    zip.finish()?.sync_all()?;
    Ok(())
}

/// Name and contents of the single entry of a staged archive.
pub fn read_archive(archive: &Path) -> DaqResult<(String, Vec<u8>)> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    if zip.len() != 1 {
        return Err(DaqError::Archive(zip::result::ZipError::InvalidArchive(
            "expected exactly one entry".into(),
        )));
    }
    let mut entry = zip.by_index(0)?;
    let name = entry.name().to_string();
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    Ok((name, contents))
}

/// Moves closed data files into the staging area.
#[derive(Debug, Clone)]
pub struct Stager {
    root: PathBuf,
    notify: Arc<Notify>,
    compress: bool,
}

impl Stager {
    /// Stager publishing below `staging_root`
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            root: staging_root.into(),
            notify: Arc::new(Notify::new()),
            compress: false,
        }
    }

    /// Stage zip archives instead of the data files themselves
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Whether files are staged as zip archives
    pub fn compresses(&self) -> bool {
        self.compress
    }

    /// Staging root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Signalled after every newly staged file
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Where a file named `name` is staged for `subdir`
    pub fn staged_path(&self, subdir: &Path, name: &str) -> PathBuf {
        self.root.join(subdir).join(name)
    }

    /// Name a data file is staged under
    pub fn staged_name(&self, data_file: &Path) -> Option<PathBuf> {
        let name = Path::new(data_file.file_name()?);
        Some(if self.compress {
            name.with_extension(ARCHIVE_EXTENSION)
        } else {
            name.to_path_buf()
        })
    }

    fn staged_contents(&self, target: &Path) -> DaqResult<Vec<u8>> {
        if self.compress {
            Ok(read_archive(target)?.1)
        } else {
            Ok(std::fs::read(target)?)
        }
    }

    /// Stage `data_file` into `staging/<subdir>/`.
    pub fn stage(&self, data_file: &Path, subdir: &Path) -> DaqResult<StageOutcome> {
        let name = self
            .staged_name(data_file)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "data file has no name"))?;
        let target_dir = self.root.join(subdir);
        let target = target_dir.join(&name);

        if target.exists() {
            if !data_file.exists() {
                tracing::debug!(file = %target.display(), "already staged");
                return Ok(StageOutcome::AlreadyStaged(target));
            }
            if std::fs::read(data_file)? == self.staged_contents(&target)? {
                std::fs::remove_file(data_file)?;
                tracing::info!(file = %target.display(), "already staged, removed duplicate data copy");
                return Ok(StageOutcome::AlreadyStaged(target));
            }
            tracing::warn!(
                file = %data_file.display(),
                staged = %target.display(),
                "a different file with this name is already staged, keeping data copy"
            );
            return Ok(StageOutcome::Conflict(target));
        }

        std::fs::create_dir_all(&target_dir)?;
        let temp = target_dir.join(format!(".{}.tmp", name.display()));
        if self.compress {
            write_archive(data_file, &temp)?;
            std::fs::rename(&temp, &target)?;
            std::fs::remove_file(data_file)?;
        } else {
            match std::fs::rename(data_file, &target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                    std::fs::copy(data_file, &temp)?;
                    File::open(&temp)?.sync_all()?;
                    std::fs::rename(&temp, &target)?;
                    std::fs::remove_file(data_file)?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::info!(file = %target.display(), "staged");
        self.notify.notify_one();
        Ok(StageOutcome::Staged(target))
    }

    /// Stage closed files left in `data_dir` by an earlier run and remove
    /// unfinished `.part` files.
    pub fn recover(&self, data_dir: &Path, subdir: &Path) -> DaqResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let entries = match std::fs::read_dir(data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err.into()),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            if is_part_file(&path) {
                tracing::warn!(file = %path.display(), "removing unfinished data file");
                std::fs::remove_file(&path)?;
                report.removed_parts += 1;
            } else if is_data_file(&path) {
                if let StageOutcome::Staged(_) = self.stage(&path, subdir)? {
                    report.staged += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, Stager) {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data/o3");
        std::fs::create_dir_all(&data).unwrap();
        let stager = Stager::new(root.path().join("staging"));
        (root, data, stager)
    }

    #[test]
    fn stage_moves_into_subdir() {
        let (_root, data, stager) = setup();
        let file = data.join("o3-202405171000-202405171100.csv");
        std::fs::write(&file, "dtm\n").unwrap();

        let outcome = stager.stage(&file, Path::new("ozone")).unwrap();
        let staged = stager.staged_path(Path::new("ozone"), "o3-202405171000-202405171100.csv");
        assert_eq!(outcome, StageOutcome::Staged(staged.clone()));
        assert!(!file.exists());
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "dtm\n");
    }

    #[test]
    fn staging_twice_is_idempotent() {
        let (_root, data, stager) = setup();
        let file = data.join("a.csv");
        std::fs::write(&file, "dtm\n1\n").unwrap();
        let sub = Path::new("o3");

        assert!(matches!(stager.stage(&file, sub).unwrap(), StageOutcome::Staged(_)));
        assert!(matches!(stager.stage(&file, sub).unwrap(), StageOutcome::AlreadyStaged(_)));

        // Identical copy reappears (crash between copy and delete)
        std::fs::write(&file, "dtm\n1\n").unwrap();
        assert!(matches!(stager.stage(&file, sub).unwrap(), StageOutcome::AlreadyStaged(_)));
        assert!(!file.exists());

        let staged: Vec<_> = std::fs::read_dir(stager.root().join(sub)).unwrap().collect();
        assert_eq!(staged.len(), 1);
    }

    #[test]
    fn conflicting_content_keeps_source() {
        let (_root, data, stager) = setup();
        let file = data.join("a.csv");
        std::fs::write(&file, "first").unwrap();
        stager.stage(&file, Path::new("o3")).unwrap();

        std::fs::write(&file, "second").unwrap();
        let outcome = stager.stage(&file, Path::new("o3")).unwrap();
        assert!(matches!(outcome, StageOutcome::Conflict(_)));
        assert!(file.exists());
        assert_eq!(std::fs::read_to_string(outcome.staged_path()).unwrap(), "first");
    }

    #[test]
    fn recovery_stages_leftovers_and_drops_parts() {
        let (_root, data, stager) = setup();
        std::fs::write(data.join("o3-1.csv"), "x").unwrap();
        std::fs::write(data.join("o3-2.csv.part"), "x").unwrap();
        std::fs::write(data.join("notes.txt"), "x").unwrap();

        let report = stager.recover(&data, Path::new("o3")).unwrap();
        assert_eq!(report, RecoveryReport { staged: 1, removed_parts: 1 });
        assert!(data.join("notes.txt").exists());
        assert!(stager.root().join("o3/o3-1.csv").exists());

        let missing = stager.recover(&data.join("nope"), Path::new("o3")).unwrap();
        assert_eq!(missing, RecoveryReport::default());
    }

    #[test]
    fn compressed_staging_writes_single_entry_archive() {
        let (_root, data, stager) = setup();
        let stager = stager.with_compression(true);
        let file = data.join("o3-202405171000-202405171100.csv");
        std::fs::write(&file, "# {}\ndtm,o3\n2024-05-17T10:00:00Z,30.8\n").unwrap();

        let outcome = stager.stage(&file, Path::new("o3")).unwrap();
        let staged = stager.root().join("o3/o3-202405171000-202405171100.zip");
        assert_eq!(outcome, StageOutcome::Staged(staged.clone()));
        assert!(!file.exists());

        let (entry, contents) = read_archive(&staged).unwrap();
        assert_eq!(entry, "o3-202405171000-202405171100.csv");
        assert_eq!(contents, b"# {}\ndtm,o3\n2024-05-17T10:00:00Z,30.8\n");

        // Identical copy reappears: compared against the archived contents
        std::fs::write(&file, "# {}\ndtm,o3\n2024-05-17T10:00:00Z,30.8\n").unwrap();
        assert!(matches!(stager.stage(&file, Path::new("o3")).unwrap(), StageOutcome::AlreadyStaged(_)));
        assert!(!file.exists());

        let names: Vec<_> = std::fs::read_dir(stager.root().join("o3"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, [OsStr::new("o3-202405171000-202405171100.zip")]);
    }

    #[test]
    fn recovery_with_compression_stages_archives() {
        let (_root, data, stager) = setup();
        let stager = stager.with_compression(true);
        std::fs::write(data.join("o3-1.csv"), "x").unwrap();

        let report = stager.recover(&data, Path::new("o3")).unwrap();
        assert_eq!(report.staged, 1);
        assert_eq!(read_archive(&stager.root().join("o3/o3-1.zip")).unwrap().1, b"x");
    }

    #[tokio::test]
    async fn staging_signals_notifier() {
        let (_root, data, stager) = setup();
        let notify = stager.notifier();
        let file = data.join("a.csv");
        std::fs::write(&file, "x").unwrap();
        stager.stage(&file, Path::new("o3")).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }
}
