//! Session directories on disk
//!
//! A session lives in `<root>/<name>/`:
//!   inputs.json                 the event log
//!   inputs_frame_aligned.json   input state sampled at the session fps
//!   metadata.json               start time, fps, video settings, stats

use crate::frame::FrameStats;
use crate::log::{EventLog, LogError, PersistedLog};
use crate::sampler::{FrameAlignedEntry, frame_aligned};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const EVENT_LOG_FILE: &str = "inputs.json";
pub const FRAME_ALIGNED_FILE: &str = "inputs_frame_aligned.json";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{} not found", .0.display())]
    Missing(PathBuf),
    #[error("{} is not a valid session file: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{} holds an invalid event log: {source}", path.display())]
    InvalidLog { path: PathBuf, source: LogError },
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::Missing(path.to_path_buf())
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// A finished recording. Immutable once built; share it with `Arc`.
#[derive(Debug, Clone)]
pub struct Session {
    log: Arc<EventLog>,
    fps: u32,
    started_at: DateTime<Local>,
}

impl Session {
    pub fn new(log: EventLog, fps: u32, started_at: DateTime<Local>) -> Self {
        Self {
            log: Arc::new(log),
            fps,
            started_at,
        }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn duration(&self) -> f64 {
        self.log.duration()
    }

    pub fn frame_aligned(&self) -> Vec<FrameAlignedEntry> {
        frame_aligned(&self.log, f64::from(self.fps))
    }

    pub fn default_name(&self) -> String {
        default_session_name(self.started_at)
    }
}

pub fn default_session_name(started_at: DateTime<Local>) -> String {
    started_at.format("session_%Y%m%d_%H%M%S").to_string()
}

/// Totals shown before a replay and stored in the metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputStats {
    pub total_events: usize,
    pub duration: f64,
    pub event_counts: BTreeMap<String, usize>,
}

impl InputStats {
    pub fn of(log: &EventLog) -> Self {
        Self {
            total_events: log.len(),
            duration: log.duration(),
            event_counts: log
                .counts()
                .into_iter()
                .map(|(kind, count)| (kind.to_string(), count))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// RFC 3339
    pub session_start: String,
    pub fps: u32,
    pub resolution: Option<(u32, u32)>,
    pub video_codec: String,
    pub duration: f64,
    pub screen_stats: Option<FrameStats>,
    pub input_stats: InputStats,
}

impl SessionMetadata {
    pub fn new(session: &Session, resolution: Option<(u32, u32)>, video_codec: &str) -> Self {
        Self {
            session_start: session.started_at.to_rfc3339(),
            fps: session.fps,
            resolution,
            video_codec: video_codec.to_string(),
            duration: session.duration(),
            screen_stats: None,
            input_stats: InputStats::of(&session.log),
        }
    }

    pub fn with_screen_stats(mut self, stats: FrameStats) -> Self {
        self.screen_stats = Some(stats);
        self
    }
}

/// Where a finished session is persisted
pub trait SessionSink {
    fn write_event_log(&mut self, session: &Session) -> Result<(), StorageError>;
    fn write_frame_aligned(&mut self, entries: &[FrameAlignedEntry]) -> Result<(), StorageError>;
    fn write_metadata(&mut self, metadata: &SessionMetadata) -> Result<(), StorageError>;
}

/// Write every part of a session through `sink`
pub fn save_session<S: SessionSink + ?Sized>(
    sink: &mut S,
    session: &Session,
    metadata: &SessionMetadata,
) -> Result<(), StorageError> {
    sink.write_event_log(session)?;
    sink.write_frame_aligned(&session.frame_aligned())?;
    sink.write_metadata(metadata)
}

/// JSON files in one session directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        file_name: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let path = self.dir.join(file_name);
        let file = File::create(&path).map_err(|e| StorageError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|source| StorageError::Malformed {
            path: path.clone(),
            source,
        })?;
        writer.flush().map_err(|e| StorageError::io(&path, e))?;
        debug!(path = %path.display(), "wrote session file");
        Ok(())
    }
}

impl SessionSink for DirectorySink {
    fn write_event_log(&mut self, session: &Session) -> Result<(), StorageError> {
        self.write_json(EVENT_LOG_FILE, session.log.as_ref())?;
        info!(
            events = session.log.len(),
            dir = %self.dir.display(),
            "saved event log"
        );
        Ok(())
    }

    fn write_frame_aligned(&mut self, entries: &[FrameAlignedEntry]) -> Result<(), StorageError> {
        self.write_json(FRAME_ALIGNED_FILE, entries)
    }

    fn write_metadata(&mut self, metadata: &SessionMetadata) -> Result<(), StorageError> {
        self.write_json(METADATA_FILE, metadata)
    }
}

/// Accepts either a session directory or the log file itself
pub fn resolve_log_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(EVENT_LOG_FILE)
    } else {
        path.to_path_buf()
    }
}

pub fn load_event_log(path: &Path) -> Result<EventLog, StorageError> {
    let path = resolve_log_path(path);
    let text = fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))?;
    let persisted: PersistedLog =
        serde_json::from_str(&text).map_err(|source| StorageError::Malformed {
            path: path.clone(),
            source,
        })?;
    let log = EventLog::from_events(persisted.events)
        .map_err(|source| StorageError::InvalidLog { path, source })?;
    debug!(events = log.len(), "loaded event log");
    Ok(log)
}

pub fn load_metadata(dir: &Path) -> Result<SessionMetadata, StorageError> {
    let path = dir.join(METADATA_FILE);
    let text = fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))?;
    serde_json::from_str(&text).map_err(|source| StorageError::Malformed { path, source })
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub name: String,
    pub path: PathBuf,
    pub metadata: Option<SessionMetadata>,
}

/// Session directories under `root`, by name. A missing root has none.
pub fn list_sessions(root: &Path) -> Result<Vec<SessionSummary>, StorageError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(root, e)),
    };

    let mut sessions = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StorageError::io(root, e))?.path();
        if !path.join(EVENT_LOG_FILE).is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        sessions.push(SessionSummary {
            name,
            metadata: load_metadata(&path).ok(),
            path,
        });
    }
    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sessions)
}
