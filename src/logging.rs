use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

use crate::console::OutputSink;

/// Transcripts kept per console name by [`rotate_transcripts`].
pub const KEEP_TRANSCRIPTS: usize = 10;

/// Sessions started within the same second get `<timestamp>.1`, `.2`, …
const MAX_SAME_SECOND: u32 = 100;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards writes until `handle.set_file(path)` is
/// called, so the subscriber can be installed before the logs directory
/// is known.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Activation handle returned by [`DeferredFileWriter::new`].
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start writing to `path` (append mode).
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── Transcript ───────────────────────────────────────────

/// Append-only raw console log.
///
/// Created as `<timestamp>_<name>_running.log`; [`Transcript::finish`]
/// renames it to `_ok.log` or `_failed.log`. Every append is flushed so a
/// viewer tailing the file sees output as it arrives. An existing file is
/// never reopened: a second session in the same second gets a numbered
/// timestamp.
pub struct Transcript {
    file: File,
    path: PathBuf,
}

impl Transcript {
    pub fn create(logs_dir: &Path, name: &str) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let timestamp = utc_timestamp();
        let mut attempt = 0;
        loop {
            let stamp = if attempt == 0 {
                timestamp.clone()
            } else {
                format!("{timestamp}.{attempt}")
            };
            let path = logs_dir.join(format!("{stamp}_{name}_running.log"));
            match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => return Ok(Self { file, path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists
                    && attempt < MAX_SAME_SECOND =>
                {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, text: &str) {
        if let Err(e) = self
            .file
            .write_all(text.as_bytes())
            .and_then(|()| self.file.flush())
        {
            tracing::warn!(path = %self.path.display(), "transcript write failed: {e}");
        }
    }

    /// Close the file and rename it by outcome. Returns the final path.
    pub fn finish(mut self, success: bool) -> PathBuf {
        if let Err(e) = self.file.flush() {
            tracing::warn!(path = %self.path.display(), "transcript flush failed: {e}");
        }
        let suffix = if success { "ok" } else { "failed" };
        let renamed = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        match renamed {
            Some(name) => {
                let new_path = self.path.with_file_name(name);
                match fs::rename(&self.path, &new_path) {
                    Ok(()) => new_path,
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            "transcript not renamed to {}: {e}",
                            new_path.display()
                        );
                        self.path
                    }
                }
            }
            None => self.path,
        }
    }
}

impl OutputSink for Transcript {
    fn append(&mut self, text: &str) {
        Transcript::append(self, text);
    }
}

// ── Rotation and listing ─────────────────────────────────

/// Delete the oldest finished transcripts for `name`, keeping at most `keep`.
pub fn rotate_transcripts(logs_dir: &Path, name: &str, keep: usize) {
    let matching: Vec<PathBuf> = list_transcripts(logs_dir)
        .into_iter()
        .filter(|e| e.name == name)
        .map(|e| e.path)
        .collect();

    if matching.len() > keep {
        for old in &matching[..matching.len() - keep] {
            if let Err(e) = fs::remove_file(old) {
                tracing::warn!(path = %old.display(), "failed to remove old transcript: {e}");
            }
        }
    }
}

/// Metadata parsed from a transcript filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub path: PathBuf,
    pub timestamp: String,
    pub name: String,
    pub status: String,
}

/// Finished transcripts (`_ok` / `_failed`), oldest first.
pub fn list_transcripts(logs_dir: &Path) -> Vec<TranscriptEntry> {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return Vec::new();
    };

    let mut logs: Vec<TranscriptEntry> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_transcript_name(&e.path()))
        .collect();

    logs.sort_by(|a, b| timestamp_order(&a.timestamp).cmp(&timestamp_order(&b.timestamp)));
    logs
}

/// `2024-01-01T00-00-00.10` sorts after `.9`.
fn timestamp_order(timestamp: &str) -> (&str, u32) {
    match timestamp.split_once('.') {
        Some((base, n)) => (base, n.parse().unwrap_or(0)),
        None => (timestamp, 0),
    }
}

fn parse_transcript_name(path: &Path) -> Option<TranscriptEntry> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".log")?;
    let (timestamp, rest) = stem.split_once('_')?;
    let (name, status) = rest.rsplit_once('_')?;
    if status != "ok" && status != "failed" {
        return None;
    }
    Some(TranscriptEntry {
        path: path.to_path_buf(),
        timestamp: timestamp.to_string(),
        name: name.to_string(),
        status: status.to_string(),
    })
}

/// Most recent finished transcript, optionally failed-only.
pub fn latest_transcript(logs_dir: &Path, failed_only: bool) -> Option<PathBuf> {
    list_transcripts(logs_dir)
        .into_iter()
        .rev()
        .find(|e| !failed_only || e.status == "failed")
        .map(|e| e.path)
}

// ── Timestamp helper ─────────────────────────────────────

/// Current UTC time as `YYYY-MM-DDTHH-MM-SS`.
pub fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_timestamp(secs)
}

fn format_timestamp(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let (hours, minutes, seconds) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    // Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02}T{hours:02}-{minutes:02}-{seconds:02}")
}
