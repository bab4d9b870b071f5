//! On-disk layout for rendered videos and per-job frame staging, plus
//! the background reaper that enforces retention.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::jobs::JobRegistry;
use crate::options::Format;

/// Rendered outputs live flat in `output_dir` as
/// `timelapse_<jobId>.<ext>`; staged frames live in a per-job
/// subdirectory of `frames_dir` that is deleted when the job leaves the
/// encode phase.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
    frames_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(output_dir: impl Into<PathBuf>, frames_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            frames_dir: frames_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn output_path(&self, job_id: &str, format: Format) -> PathBuf {
        self.output_dir
            .join(format!("timelapse_{job_id}.{}", format.extension()))
    }

    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.frames_dir.join(job_id)
    }

    pub async fn create_staging_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self.staging_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create staging dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Write one staged frame. Indices are 1-based so the files line up
    /// with ffmpeg's `-start_number 1` image sequence input.
    pub async fn stage_frame(&self, job_id: &str, index: u64, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.staging_dir(job_id).join(format!("frame_{index:06}.jpg"));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write frame {}", path.display()))?;
        Ok(path)
    }

    /// Best-effort staging cleanup on every job exit path.
    pub async fn remove_staging_dir(&self, job_id: &str) {
        let dir = self.staging_dir(job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "failed to remove staging dir");
            }
        }
    }

    pub async fn remove_output(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove output file");
            }
        }
    }

    /// Delete output files whose modification time is older than
    /// `max_age`. Returns the number of files removed.
    pub fn sweep_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = std::time::SystemTime::now();
        let mut removed = 0;

        let entries = std::fs::read_dir(&self.output_dir)
            .with_context(|| format!("failed to read {}", self.output_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > max_age {
                let path = entry.path();
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), age_secs = age.as_secs(), "reaped output");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to reap output"),
                }
            }
        }

        Ok(removed)
    }
}

/// Periodic retention sweep. Runs until the process exits; registry
/// records for reaped outputs are pruned in the same pass so status
/// queries never point at deleted files.
pub async fn run_reaper(
    store: Arc<ArtifactStore>,
    registry: Arc<JobRegistry>,
    interval: Duration,
    retention: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup is quiet.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match store.sweep_older_than(retention) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "retention sweep removed expired outputs"),
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
        registry.prune_missing_outputs();
    }
}

/// Outcome of parsing a `Range` request header against a known file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No header, or one we don't understand. Serve the whole file.
    Full,
    /// Inclusive byte span within the file.
    Partial { start: u64, end: u64 },
    /// Syntactically valid but outside the file. 416.
    Unsatisfiable,
}

/// Parse a single-span `bytes=` range: `a-b`, `a-`, or `-n` (last n
/// bytes). The end is clamped to the file; a start at or past the end
/// of the file is unsatisfiable. Multi-span ranges are not supported
/// and fall back to the full file.
pub fn parse_range_header(header: Option<&str>, file_size: u64) -> RangeSpec {
    let Some(header) = header else {
        return RangeSpec::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeSpec::Full;
    };
    if spec.contains(',') {
        return RangeSpec::Full;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeSpec::Full;
    };

    let (start, end) = match (start_str.trim(), end_str.trim()) {
        ("", "") => return RangeSpec::Full,
        // Suffix form: the last n bytes.
        ("", suffix) => {
            let Ok(n) = suffix.parse::<u64>() else {
                return RangeSpec::Full;
            };
            if n == 0 || file_size == 0 {
                return RangeSpec::Unsatisfiable;
            }
            (file_size.saturating_sub(n), file_size - 1)
        }
        (start, "") => {
            let Ok(start) = start.parse::<u64>() else {
                return RangeSpec::Full;
            };
            if file_size == 0 {
                return RangeSpec::Unsatisfiable;
            }
            (start, file_size - 1)
        }
        (start, end) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return RangeSpec::Full;
            };
            if file_size == 0 {
                return RangeSpec::Unsatisfiable;
            }
            (start, end.min(file_size - 1))
        }
    };

    if start >= file_size || start > end {
        return RangeSpec::Unsatisfiable;
    }

    RangeSpec::Partial { start, end }
}

/// Open `path` and return a stream over exactly the inclusive byte span.
pub async fn open_range(
    path: &Path,
    start: u64,
    end: u64,
) -> Result<ReaderStream<tokio::io::Take<tokio::fs::File>>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .context("failed to seek to range start")?;
    Ok(ReaderStream::new(file.take(end - start + 1)))
}
