//! Finished recordings on disk.
//!
//! ```text
//! recordings/
//! ├── .incoming/                 sessions being written, never listed
//! │   └── motion_20240520_101500.wpr
//! ├── 2024-05-20/
//! │   ├── motion_20240520_101500.wpr
//! │   └── manual_20240520_083012.wpr
//! └── 2024-05-19/
//!     └── ...
//! ```
//!
//! A session is written into `.incoming/` and [`StorageManager::register`]
//! renames it into the directory of its start date. Listing and retention
//! sweeps only look at date directories, so they never see a file that is
//! still being written.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use watchpost_core::{RetentionPolicy, Trigger};

use crate::recording::file_format::{WprFrame, WprReader, WprSummary};

pub const INCOMING_DIR: &str = ".incoming";
pub const RECORDING_EXTENSION: &str = "wpr";

const DATE_DIR_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Recording not found: {0}")]
    NotFound(String),

    #[error("Path {0} is outside the recordings directory")]
    InvalidPath(String),

    #[error("Cannot delete {}: {source}", path.display())]
    DeletionFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} has no frame at or after {at_ms} ms")]
    NoFrame { path: String, at_ms: u64 },

    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A finished recording
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    #[serde(skip_serializing)]
    pub path: PathBuf,
    /// `<date>/<filename>`, the handle used by `get_video`
    pub relative_path: String,
    pub filename: String,
    /// `None` when the header could not be read
    pub trigger: Option<Trigger>,
    /// Session start, or the modification time for unreadable files
    pub created: DateTime<Utc>,
    pub duration_ms: u64,
    pub frame_count: u32,
    pub size: u64,
    /// False for a salvaged file without footer
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDay {
    pub date: NaiveDate,
    /// Most recent first
    pub recordings: Vec<RecordingFile>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted: usize,
    /// Files that were due but could not be removed
    pub failed: usize,
    pub removed_dirs: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    /// Bytes taken by finished recordings
    pub recordings_bytes: u64,
    /// Filesystem totals; absent where the platform cannot report them
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
}

pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    /// Open (creating if needed) a recordings directory
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir.join(INCOMING_DIR))?;
        let base_dir = base_dir.canonicalize()?;
        log::debug!("Recordings directory: {}", base_dir.display());
        Ok(StorageManager { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.base_dir.join(INCOMING_DIR)
    }

    /// Where a session with this filename is written while recording
    pub fn incoming_path(&self, filename: &str) -> PathBuf {
        self.incoming_dir().join(filename)
    }

    /// Move a finished file into the directory of its start date.
    pub fn register(
        &self,
        finished: &Path,
        started: DateTime<Local>,
    ) -> Result<RecordingFile, StorageError> {
        let filename = finished
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidPath(finished.display().to_string()))?;
        let day_dir = self.base_dir.join(started.format(DATE_DIR_FORMAT).to_string());
        fs::create_dir_all(&day_dir)?;
        let target = unique_path(&day_dir, filename);

        if let Err(e) = fs::rename(finished, &target) {
            if e.kind() != io::ErrorKind::NotFound || !finished.exists() {
                return Err(e.into());
            }
            // A sweep removed the empty day directory in between
            fs::create_dir_all(&day_dir)?;
            fs::rename(finished, &target)?;
        }
        log::info!("Registered recording {}", target.display());

        self.recording_info(&target)
            .ok_or_else(|| StorageError::NotFound(target.display().to_string()))
    }

    /// Finished recordings grouped by date, newest first at both levels
    pub fn list(&self) -> Vec<RecordingDay> {
        let mut days: Vec<RecordingDay> = self
            .day_dirs()
            .into_iter()
            .filter_map(|(date, dir)| {
                let mut recordings: Vec<RecordingFile> = recording_paths(&dir)
                    .iter()
                    .filter_map(|p| self.recording_info(p))
                    .collect();
                if recordings.is_empty() {
                    return None;
                }
                recordings.sort_by(|a, b| b.created.cmp(&a.created));
                Some(RecordingDay { date, recordings })
            })
            .collect();
        days.sort_by(|a, b| b.date.cmp(&a.date));
        days
    }

    /// Metadata of one recording, `None` if it is not a readable file
    pub fn recording_info(&self, path: &Path) -> Option<RecordingFile> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let filename = path.file_name()?.to_str()?.to_string();
        let day = path.parent()?.file_name()?.to_str()?;
        let relative_path = format!("{}/{}", day, filename);

        let parsed = File::open(path)
            .and_then(|f| WprReader::open(BufReader::new(f)))
            .and_then(|mut reader| {
                let header = reader.header().clone();
                reader.summary().map(|summary| (header, summary))
            });

        let (trigger, created, summary) = match parsed {
            Ok((header, summary)) => {
                let created = DateTime::from_timestamp_millis(header.start_time_ms as i64)?;
                (Some(header.trigger), created, summary)
            }
            Err(e) => {
                log::debug!("{} is not a readable recording: {}", path.display(), e);
                let created: DateTime<Utc> = metadata.modified().ok()?.into();
                let empty = WprSummary {
                    frame_count: 0,
                    duration_ms: 0,
                    complete: false,
                };
                (None, created, empty)
            }
        };

        Some(RecordingFile {
            path: path.to_path_buf(),
            relative_path,
            filename,
            trigger,
            created,
            duration_ms: summary.duration_ms,
            frame_count: summary.frame_count,
            size: metadata.len(),
            complete: summary.complete,
        })
    }

    /// Look up a recording by its relative path, refusing anything that
    /// resolves outside the date directories.
    pub fn resolve_video(&self, relative: &str) -> Result<RecordingFile, StorageError> {
        let requested = Path::new(relative);
        let plain = requested
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain || requested.starts_with(INCOMING_DIR) {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }

        let path = self.base_dir.join(requested);
        let canonical = path
            .canonicalize()
            .map_err(|_| StorageError::NotFound(relative.to_string()))?;
        if !canonical.starts_with(&self.base_dir) {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        if canonical.extension().and_then(|e| e.to_str()) != Some(RECORDING_EXTENSION) {
            return Err(StorageError::NotFound(relative.to_string()));
        }
        self.recording_info(&canonical)
            .ok_or_else(|| StorageError::NotFound(relative.to_string()))
    }

    /// First frame at or after `at_ms` into a recording, located through
    /// the file's seek index
    pub fn frame_at(&self, relative: &str, at_ms: u64) -> Result<WprFrame, StorageError> {
        let recording = self.resolve_video(relative)?;
        let mut reader = WprReader::open(BufReader::new(File::open(&recording.path)?))?;
        reader.seek_to_timestamp(at_ms)?;
        reader.read_frame()?.ok_or_else(|| StorageError::NoFrame {
            path: relative.to_string(),
            at_ms,
        })
    }

    pub fn sweep(&self, policy: &RetentionPolicy) -> SweepReport {
        self.sweep_at(policy, Local::now())
    }

    /// Delete every recording created strictly before the policy's cutoff,
    /// then remove date directories left empty. Per-file failures are
    /// logged and counted.
    pub fn sweep_at(&self, policy: &RetentionPolicy, now: DateTime<Local>) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(cutoff) = policy.cutoff(&now) else {
            log::warn!("Retention cutoff for {} is out of range, nothing swept", policy);
            return report;
        };
        log::debug!("Sweeping recordings created before {}", cutoff);

        for (_, dir) in self.day_dirs() {
            for path in recording_paths(&dir) {
                let Some(info) = self.recording_info(&path) else {
                    continue;
                };
                if info.created.with_timezone(&Local) >= cutoff {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => {
                        log::info!("Retention: deleted {}", info.relative_path);
                        report.deleted += 1;
                    }
                    Err(source) => {
                        let e = StorageError::DeletionFailed { path, source };
                        log::warn!("Retention: {}", e);
                        report.failed += 1;
                    }
                }
            }

            let empty = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty && fs::remove_dir(&dir).is_ok() {
                report.removed_dirs += 1;
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            log::info!(
                "Retention sweep ({}): {} deleted, {} failed",
                policy,
                report.deleted,
                report.failed
            );
        }
        report
    }

    pub fn disk_usage(&self) -> DiskUsage {
        let recordings_bytes = self
            .list()
            .iter()
            .flat_map(|day| day.recordings.iter())
            .map(|r| r.size)
            .sum();
        let mut usage = DiskUsage {
            recordings_bytes,
            ..DiskUsage::default()
        };
        self.fill_filesystem_usage(&mut usage);
        usage
    }

    #[cfg(unix)]
    fn fill_filesystem_usage(&self, usage: &mut DiskUsage) {
        match nix::sys::statvfs::statvfs(&self.base_dir) {
            Ok(stat) => {
                let fragment = stat.fragment_size() as u64;
                let total = stat.blocks() as u64 * fragment;
                let free = stat.blocks_available() as u64 * fragment;
                let used = total.saturating_sub(stat.blocks_free() as u64 * fragment);
                usage.total_bytes = Some(total);
                usage.free_bytes = Some(free);
                usage.used_bytes = Some(used);
            }
            Err(e) => log::warn!("statvfs {}: {}", self.base_dir.display(), e),
        }
    }

    #[cfg(not(unix))]
    fn fill_filesystem_usage(&self, _usage: &mut DiskUsage) {}

    fn day_dirs(&self) -> Vec<(NaiveDate, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name();
                let date = NaiveDate::parse_from_str(name.to_str()?, DATE_DIR_FORMAT).ok()?;
                Some((date, e.path()))
            })
            .collect()
    }
}

fn recording_paths(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORDING_EXTENSION))
        .collect()
}

/// `dir/name`, or `dir/stem-N.ext` if that is taken
fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{}", ext)),
        None => (filename, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{}-{}{}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
