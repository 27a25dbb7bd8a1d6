//! Session identity and the artifacts flushed at cleanup.
//!
//! Every session gets a unique id (`<name>_<datetime>_<unix>`) and a
//! directory under `data_dir/tello/<id>/` holding the metadata record, the
//! ordered command and telemetry histories, the event log and the raw video
//! stream.

use crate::command::CommandRecord;
use crate::error::Result;
use crate::telemetry::TelemetryFrame;
use crate::video::VideoStats;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::macros::format_description;
use time::OffsetDateTime;

pub(crate) fn as_unix_secs(time: &SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Serialize a `SystemTime` as fractional unix seconds.
pub(crate) mod unix_seconds {
    use super::as_unix_secs;
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(as_unix_secs(time))
    }
}

/// Serialize an `Option<SystemTime>` as fractional unix seconds or null.
pub(crate) mod opt_unix_seconds {
    use super::as_unix_secs;
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(
        time: &Option<SystemTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => serializer.serialize_f64(as_unix_secs(time)),
            None => serializer.serialize_none(),
        }
    }
}

/// Build the session id from the session name and the current wall clock.
pub(crate) fn session_id(name: &str) -> String {
    let now = SystemTime::now();
    let format = format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");
    let datetime = OffsetDateTime::from(now)
        .format(format)
        .unwrap_or_else(|_| "epoch".to_owned());
    format!(
        "{}_{}_{}",
        name,
        datetime,
        now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EventKind {
    Status,
    Send,
    Receive,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EventRecord {
    #[serde(with = "unix_seconds")]
    pub timestamp: SystemTime,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub value: String,
}

/// Timestamped status/send/receive log shared by all workers.
#[derive(Clone)]
pub(crate) struct EventLog {
    entries: Arc<Mutex<Vec<EventRecord>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, kind: EventKind, value: String) {
        self.entries.lock().unwrap().push(EventRecord {
            timestamp: SystemTime::now(),
            kind,
            value,
        });
    }

    pub fn status(&self, value: impl Into<String>) {
        self.push(EventKind::Status, value.into());
    }

    pub fn send(&self, value: impl Into<String>) {
        self.push(EventKind::Send, value.into());
    }

    pub fn receive(&self, value: impl Into<String>) {
        self.push(EventKind::Receive, value.into());
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.entries.lock().unwrap().clone()
    }
}

/// The metadata record written once at cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub id: String,
    pub num_messages: usize,
    pub num_states: usize,
    pub num_frames: u64,
    #[serde(with = "opt_unix_seconds")]
    pub video_start_time: Option<SystemTime>,
    #[serde(with = "opt_unix_seconds")]
    pub video_end_time: Option<SystemTime>,
    pub video_fps: f64,
}

impl SessionMetadata {
    pub(crate) fn new(
        id: &str,
        num_messages: usize,
        num_states: usize,
        video: &VideoStats,
    ) -> Self {
        // Guard against a zero-length capture window when computing the rate.
        let elapsed = match (video.started_at, video.ended_at) {
            (Some(start), Some(end)) => end
                .duration_since(start)
                .unwrap_or_default()
                .max(Duration::from_secs(1)),
            _ => Duration::from_secs(1),
        };
        Self {
            id: id.to_owned(),
            num_messages,
            num_states,
            num_frames: video.frames,
            video_start_time: video.started_at,
            video_end_time: video.ended_at,
            video_fps: video.frames as f64 / elapsed.as_secs_f64(),
        }
    }
}

/// Filesystem layout of one session's persisted artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub directory: PathBuf,
    pub metadata: PathBuf,
    pub messages: PathBuf,
    pub states: PathBuf,
    pub event_log: PathBuf,
    pub video: PathBuf,
}

impl ArtifactPaths {
    pub(crate) fn new(data_dir: &Path, id: &str) -> Self {
        let directory = data_dir.join("tello").join(id);
        Self {
            metadata: directory.join(format!("metadata_{}.json", id)),
            messages: directory.join(format!("messages_{}.json", id)),
            states: directory.join(format!("states_{}.json", id)),
            event_log: directory.join(format!("event_log_{}.json", id)),
            video: directory.join(format!("{}.h264", id)),
            directory,
        }
    }

    pub(crate) fn create_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        Ok(())
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value).map_err(std::io::Error::from)?;
    Ok(())
}

/// Flush every artifact except the video stream, which the ingest worker
/// appends to while running. Called exactly once, after all workers joined.
pub(crate) fn flush(
    paths: &ArtifactPaths,
    metadata: &SessionMetadata,
    messages: &[CommandRecord],
    states: &[TelemetryFrame],
    events: &[EventRecord],
) -> Result<()> {
    paths.create_directory()?;
    write_json(&paths.metadata, metadata)?;
    write_json(&paths.messages, &messages)?;
    write_json(&paths.states, &states)?;
    write_json(&paths.event_log, &events)?;
    Ok(())
}
