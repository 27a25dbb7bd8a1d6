//! Drone session orchestration.
//!
//! A [`DroneSession`] composes the command channel, the telemetry listener
//! and the video ingest worker, drives the `command` handshake and owns the
//! shared histories. Lifecycle is strictly one way:
//!
//! `Disconnected → Handshaking → Ready → ShuttingDown → Closed`
//!
//! A failed handshake falls back to `Disconnected` and the caller may retry
//! `connect()`; everything after `Ready` is terminal for this instance.

use crate::command::{CommandLink, CommandRecord, FlipDirection};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{SubscriptionId, Subscribers};
use crate::persist::{self, ArtifactPaths, EventLog, SessionMetadata};
use crate::telemetry::{TelemetryFrame, TelemetryListener};
use crate::video::{UdpVideoSource, VideoFrame, VideoIngest, VideoSource, VideoStats};
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Lifecycle state of one session instance. No state is re-entered once
/// left, except `Disconnected` after a failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    ShuttingDown,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::ShuttingDown => "shutting down",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Session to one aircraft: control, telemetry and video channels plus the
/// persisted histories.
pub struct DroneSession {
    config: SessionConfig,
    id: String,
    paths: ArtifactPaths,
    state: Arc<Mutex<SessionState>>,
    events: EventLog,
    stop: Arc<AtomicBool>,
    command: Option<CommandLink>,
    command_history: Arc<Mutex<Vec<CommandRecord>>>,
    telemetry_history: Arc<Mutex<Vec<TelemetryFrame>>>,
    telemetry_subscribers: Arc<Subscribers<TelemetryFrame>>,
    video_subscribers: Arc<Subscribers<VideoFrame>>,
    video_stats: Arc<Mutex<VideoStats>>,
    video_source: Option<Box<dyn VideoSource>>,
    workers: Vec<thread::JoinHandle<()>>,
    disconnect: flume::Receiver<()>,
}

impl DroneSession {
    /// Create a session. No sockets are bound until [`connect`](Self::connect).
    pub fn new(config: SessionConfig) -> Self {
        let id = persist::session_id(&config.name);
        let paths = ArtifactPaths::new(&config.data_dir, &id);
        // Sender dropped right away: wait_close() on a never-connected
        // session returns immediately.
        let (_, disconnect) = flume::bounded(0);
        Self {
            config,
            id,
            paths,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            events: EventLog::new(),
            stop: Arc::new(AtomicBool::new(false)),
            command: None,
            command_history: Arc::new(Mutex::new(Vec::new())),
            telemetry_history: Arc::new(Mutex::new(Vec::new())),
            telemetry_subscribers: Arc::new(Subscribers::new()),
            video_subscribers: Arc::new(Subscribers::new()),
            video_stats: Arc::new(Mutex::new(VideoStats::default())),
            video_source: None,
            workers: Vec::new(),
            disconnect,
        }
    }

    /// Replace the default UDP video source, e.g. with a decoder-backed
    /// implementation or a test stub.
    pub fn with_video_source(mut self, source: Box<dyn VideoSource>) -> Self {
        self.video_source = Some(source);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where this session's artifacts are (or will be) persisted.
    pub fn artifact_paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, new_state: SessionState) {
        debug!("Session state: {}", new_state);
        *self.state.lock().unwrap() = new_state;
    }

    fn link(&self) -> Result<&CommandLink> {
        self.command.as_ref().ok_or(Error::InvalidState(self.state()))
    }

    fn send_acked(&self, command: &str) -> Result<CommandRecord> {
        self.link()?.send(command, true, self.config.command_timeout)
    }

    /// Perform the handshake and start the background channels.
    ///
    /// Sends the mode-enable `command` with ack required, resets the video
    /// subsystem (`streamoff`, then `streamon` until acknowledged, bounded
    /// by `stream_enable_attempts`), then starts the telemetry listener and
    /// video ingest workers. Returns only once both are confirmed running.
    ///
    /// On failure the session is back at `Disconnected` and `connect()` may
    /// be retried.
    pub fn connect(&mut self) -> Result<()> {
        if self.state() != SessionState::Disconnected {
            return Err(Error::InvalidState(self.state()));
        }
        self.stop.store(false, Relaxed);
        self.set_state(SessionState::Handshaking);
        self.events
            .status("Attempting initialization of SDK mode");

        let (disconnect_tx, disconnect_rx) = flume::bounded(0);
        match self.try_connect(&disconnect_tx) {
            Ok(()) => {
                // Workers hold the only senders now; recv returns when the
                // last worker exits.
                self.disconnect = disconnect_rx;
                self.set_state(SessionState::Ready);
                info!("Session {} ready", self.id);
                Ok(())
            }
            Err(e) => {
                self.teardown_workers();
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    fn try_connect(&mut self, disconnect_tx: &flume::Sender<()>) -> Result<()> {
        self.command = Some(CommandLink::open(
            &self.config,
            self.command_history.clone(),
            self.events.clone(),
            self.stop.clone(),
            disconnect_tx.clone(),
        )?);

        let handshake = self.send_acked("command")?;
        match handshake.reply.as_deref() {
            Some("ok") => {
                info!("SDK mode enabled");
                self.events.status("SDK mode enabled");
            }
            Some(other) => return Err(Error::HandshakeRefused(other.to_owned())),
            None => return Err(Error::Timeout),
        }

        // Put the video subsystem in a known state before opening the local
        // end of the stream.
        self.send_acked("streamoff")?;
        let mut stream_enabled = false;
        for attempt in 1..=self.config.stream_enable_attempts {
            if self.send_acked("streamon")?.acknowledged() {
                stream_enabled = true;
                break;
            }
            warn!(
                "Could not turn on drone video stream (attempt {})",
                attempt
            );
            self.events.status("Could not turn on drone video stream");
        }
        if !stream_enabled {
            return Err(Error::StreamEnableFailed(self.config.stream_enable_attempts));
        }

        self.paths.create_directory()?;

        let listener = TelemetryListener::bind(
            self.config.telemetry_port,
            self.config.read_timeout,
            self.config.telemetry_read_delay,
            self.telemetry_history.clone(),
            self.telemetry_subscribers.clone(),
            self.events.clone(),
            self.stop.clone(),
        )?;
        self.workers.push(listener.spawn(disconnect_tx.clone()));

        let source = match self.video_source.take() {
            Some(source) => source,
            None => Box::new(UdpVideoSource::new(
                &self.config.video_url(),
                self.config.read_timeout,
            )?),
        };
        let ingest = VideoIngest {
            source,
            artifact: self.paths.video.clone(),
            subscribers: self.video_subscribers.clone(),
            stats: self.video_stats.clone(),
            events: self.events.clone(),
            stop: self.stop.clone(),
            retry: self.config.video_retry,
            open_delay: self.config.video_open_delay,
            frame_interval: self.config.frame_interval,
        };
        let (handle, ready) = ingest.spawn(disconnect_tx.clone());
        self.workers.push(handle);
        // Blocks until the source opened or the retry policy gave up; with
        // RetryPolicy::Forever this can wait indefinitely.
        ready.recv()??;

        Ok(())
    }

    /// Send a raw command. The session must be `Ready`.
    pub fn send_command(
        &self,
        command: &str,
        await_ack: bool,
        timeout: Duration,
    ) -> Result<CommandRecord> {
        if self.state() != SessionState::Ready {
            return Err(Error::InvalidState(self.state()));
        }
        self.link()?.send(command, await_ack, timeout)
    }

    fn fire_and_forget(&self, command: String) -> Result<CommandRecord> {
        self.send_command(&command, false, self.config.command_timeout)
    }

    /// Auto-takeoff.
    pub fn takeoff(&self) -> Result<CommandRecord> {
        self.fire_and_forget("takeoff".to_owned())
    }

    /// Auto-land.
    pub fn land(&self) -> Result<CommandRecord> {
        self.fire_and_forget("land".to_owned())
    }

    /// Immediately stop all motors.
    pub fn emergency(&self) -> Result<CommandRecord> {
        self.fire_and_forget("emergency".to_owned())
    }

    /// Perform a flip in the given direction.
    pub fn flip(&self, direction: FlipDirection) -> Result<CommandRecord> {
        self.fire_and_forget(format!("flip {}", direction.letter()))
    }

    /// Set the forward speed in cm/s, clamped to the aircraft's 10..=100
    /// range.
    pub fn set_speed(&self, speed_cms: u32) -> Result<CommandRecord> {
        self.fire_and_forget(format!("speed {}", speed_cms.clamp(10, 100)))
    }

    /// Steer via the four RC channels (left/right, forward/back, up/down,
    /// yaw), each clamped to -100..=100.
    pub fn send_rc(
        &self,
        left_right: i32,
        forward_back: i32,
        up_down: i32,
        yaw: i32,
    ) -> Result<CommandRecord> {
        self.fire_and_forget(format!(
            "rc {} {} {} {}",
            left_right.clamp(-100, 100),
            forward_back.clamp(-100, 100),
            up_down.clamp(-100, 100),
            yaw.clamp(-100, 100)
        ))
    }

    /// Most recent telemetry frame, or `None` before the first broadcast.
    pub fn latest_telemetry(&self) -> Option<TelemetryFrame> {
        self.telemetry_history.lock().unwrap().last().cloned()
    }

    /// Snapshot of the full command history so far.
    pub fn command_history(&self) -> Vec<CommandRecord> {
        self.command_history.lock().unwrap().clone()
    }

    /// Snapshot of the full telemetry log so far.
    pub fn telemetry_history(&self) -> Vec<TelemetryFrame> {
        self.telemetry_history.lock().unwrap().clone()
    }

    pub fn subscribe_telemetry(
        &self,
        callback: impl Fn(&TelemetryFrame) + Send + 'static,
    ) -> SubscriptionId {
        self.telemetry_subscribers.subscribe(callback)
    }

    pub fn unsubscribe_telemetry(&self, id: SubscriptionId) -> bool {
        self.telemetry_subscribers.unsubscribe(id)
    }

    pub fn subscribe_video(
        &self,
        callback: impl Fn(&VideoFrame) + Send + 'static,
    ) -> SubscriptionId {
        self.video_subscribers.subscribe(callback)
    }

    pub fn unsubscribe_video(&self, id: SubscriptionId) -> bool {
        self.video_subscribers.unsubscribe(id)
    }

    /// Block until every background worker has exited. Returns immediately
    /// if the session never connected. A return while the session still
    /// reports `Ready` means the link died underneath it; `cleanup()` will
    /// still flush everything collected so far.
    pub fn wait_close(&self) {
        let _ = self.disconnect.recv();
    }

    fn teardown_workers(&mut self) {
        self.stop.store(true, Relaxed);
        if let Some(link) = self.command.take() {
            link.shutdown();
        }
        // Bounded: every worker read has a timeout, so the loops observe the
        // stop flag within one read interval.
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Stop all background activity and flush the persisted artifacts.
    ///
    /// Safe to call at any point in the lifecycle and idempotent; once the
    /// session reports `Closed` no further operation is permitted.
    pub fn cleanup(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Closed | SessionState::ShuttingDown => return Ok(()),
            SessionState::Ready => {
                // Courtesy stop of the stream; the outcome does not matter.
                if let Some(link) = &self.command {
                    let _ = link.send("streamoff", true, self.config.command_timeout);
                }
            }
            _ => {}
        }

        self.set_state(SessionState::ShuttingDown);
        self.events.status("Shutting down");
        self.teardown_workers();

        let num_messages = self.command_history.lock().unwrap().len();
        let num_states = self.telemetry_history.lock().unwrap().len();
        let metadata = SessionMetadata::new(
            &self.id,
            num_messages,
            num_states,
            &self.video_stats.lock().unwrap().clone(),
        );

        let messages = self.command_history.lock().unwrap();
        let states = self.telemetry_history.lock().unwrap();
        let events = self.events.snapshot();
        persist::flush(&self.paths, &metadata, &messages, &states, &events)?;
        drop(messages);
        drop(states);

        self.set_state(SessionState::Closed);
        info!("Session {} closed", self.id);
        Ok(())
    }
}

impl Drop for DroneSession {
    fn drop(&mut self) {
        // Workers are daemon-like: dropping the session trips the stop flag
        // so no loop outlives the owner.
        self.stop.store(true, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(tag: &str) -> SessionConfig {
        SessionConfig {
            name: format!("TestTello-{}", tag),
            data_dir: std::env::temp_dir().join("tello-link-session-tests"),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn commands_require_a_ready_session() {
        let session = DroneSession::new(temp_config("not-ready"));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.takeoff(),
            Err(Error::InvalidState(SessionState::Disconnected))
        ));
        assert!(matches!(
            session.send_command("battery?", true, Duration::from_secs(1)),
            Err(Error::InvalidState(SessionState::Disconnected))
        ));
    }

    #[test]
    fn cleanup_before_connect_closes_and_flushes_empty_histories() {
        let mut session = DroneSession::new(temp_config("early-cleanup"));
        session.cleanup().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.artifact_paths().metadata.exists());

        // Idempotent; a second call is a no-op.
        session.cleanup().unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let _ = std::fs::remove_dir_all(&session.artifact_paths().directory);
    }

    #[test]
    fn wait_close_returns_immediately_when_never_connected() {
        let session = DroneSession::new(temp_config("wait-close"));
        session.wait_close();
    }

    #[test]
    fn state_display_names() {
        assert_eq!(SessionState::Disconnected.to_string(), "disconnected");
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::ShuttingDown.to_string(), "shutting down");
    }
}
