use std::path::PathBuf;
use std::time::Duration;

/// Retry policy for opening the video source.
///
/// The video transport is usually not ready the instant `streamon` is
/// acknowledged, so the ingest loop retries the open with a fixed delay
/// between attempts. `Forever` keeps session startup blocked until the
/// stream appears; callers needing a hard deadline must use `Bounded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Give up after this many failed attempts.
    Bounded(usize),
    /// Retry until the stream opens.
    Forever,
}

impl RetryPolicy {
    pub(crate) fn exhausted(&self, attempts: usize) -> bool {
        match self {
            RetryPolicy::Bounded(max) => attempts >= *max,
            RetryPolicy::Forever => false,
        }
    }
}

/// Per-session configuration.
///
/// All addressing, timeout and retry knobs live here; a session never
/// consults process-wide mutable state. The defaults match the aircraft's
/// factory setup (drone at 192.168.10.1, control on 8889, telemetry
/// broadcast to 8890, video stream to 11111).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name, used as the prefix of the session id.
    pub name: String,
    /// Address of the aircraft's control socket.
    pub drone_host: String,
    /// Remote control port on the aircraft.
    pub control_port: u16,
    /// Local port the control socket binds to. The aircraft replies to the
    /// source address of the command, so 0 (ephemeral) works as well.
    pub control_bind_port: u16,
    /// Local port the telemetry broadcasts arrive on.
    pub telemetry_port: u16,
    /// Local port the video elementary stream arrives on.
    pub video_port: u16,
    /// How long an ack-awaiting send waits for its reply.
    pub command_timeout: Duration,
    /// Read timeout on every socket; bounds how long `cleanup()` can be
    /// stuck behind a blocking read.
    pub read_timeout: Duration,
    /// Fixed delay between telemetry reads.
    pub telemetry_read_delay: Duration,
    /// Maximum `streamon` attempts during `connect()`.
    pub stream_enable_attempts: usize,
    /// Retry policy for opening the video source.
    pub video_retry: RetryPolicy,
    /// Delay between video open attempts.
    pub video_open_delay: Duration,
    /// Presentation interval of one video frame; the pacing computation
    /// skips `floor(processing_elapsed / frame_interval)` frames.
    pub frame_interval: Duration,
    /// Root directory for persisted session artifacts.
    pub data_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "Tello".to_owned(),
            drone_host: "192.168.10.1".to_owned(),
            control_port: 8889,
            control_bind_port: 8889,
            telemetry_port: 8890,
            video_port: 11111,
            command_timeout: Duration::from_secs(4),
            read_timeout: Duration::from_millis(500),
            telemetry_read_delay: Duration::from_millis(100),
            stream_enable_attempts: 8,
            video_retry: RetryPolicy::Bounded(5),
            video_open_delay: Duration::from_millis(500),
            frame_interval: Duration::from_secs(1) / 30,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl SessionConfig {
    pub(crate) fn control_addr(&self) -> String {
        format!("{}:{}", self.drone_host, self.control_port)
    }

    pub(crate) fn video_url(&self) -> String {
        format!("udp://0.0.0.0:{}", self.video_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addressing_matches_the_aircraft() {
        let config = SessionConfig::default();
        assert_eq!(config.control_addr(), "192.168.10.1:8889");
        assert_eq!(config.telemetry_port, 8890);
        assert_eq!(config.video_url(), "udp://0.0.0.0:11111");
    }

    #[test]
    fn bounded_retry_exhausts() {
        assert!(RetryPolicy::Bounded(3).exhausted(3));
        assert!(!RetryPolicy::Bounded(3).exhausted(2));
        assert!(!RetryPolicy::Forever.exhausted(usize::MAX));
    }
}
