//! Video ingest.
//!
//! The aircraft pushes an H.264 elementary stream in UDP datagrams once
//! `streamon` is acknowledged. The ingest worker opens a [`VideoSource`]
//! (retrying per policy, because the stream is rarely ready right after the
//! handshake), then reads frames, fans them out to subscribers and appends
//! the raw stream to the session's video artifact. Pacing is kept close to
//! real time by skipping frames whenever processing falls behind the
//! stream's presentation interval.

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::events::Subscribers;
use crate::persist::EventLog;
use log::{debug, error, info, warn};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

const DATAGRAM_SIZE: usize = 2048;
const ANNEX_B_START: [u8; 4] = [0, 0, 0, 1];

/// One retained video frame: a single Annex-B access unit plus metadata.
///
/// Frames are transient; only counts and timing survive the session.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub captured_at: SystemTime,
    /// Monotonically increasing for the lifetime of one ingest run.
    pub sequence: u64,
}

/// Seam between the ingest loop and the actual stream transport/decoder.
///
/// The crate ships [`UdpVideoSource`] which yields undecoded access units;
/// implementations wrapping a real decoder can be plugged into
/// [`DroneSession::with_video_source`](crate::DroneSession::with_video_source).
pub trait VideoSource: Send {
    /// Open the stream. Called repeatedly by the retry loop until it
    /// succeeds or the policy is exhausted.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame payload. `Ok(None)` means nothing arrived within
    /// the source's read timeout; the loop re-checks the stop signal and
    /// tries again. Errors are fatal for the session.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release the stream resources.
    fn close(&mut self) {}
}

/// Default source: binds the local video port and groups datagrams into
/// access units on Annex-B start codes.
pub struct UdpVideoSource {
    port: u16,
    read_timeout: Duration,
    socket: Option<UdpSocket>,
    assembly: Vec<u8>,
}

impl UdpVideoSource {
    /// `url` must look like `udp://0.0.0.0:11111` (the form the aircraft
    /// streams to).
    pub fn new(url: &str, read_timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url)?;
        if parsed.scheme() != "udp" {
            return Err(Error::InvalidVideoUrl);
        }
        let port = parsed.port().ok_or(Error::InvalidVideoUrl)?;
        Ok(Self {
            port,
            read_timeout,
            socket: None,
            assembly: Vec::new(),
        })
    }
}

impl VideoSource for UdpVideoSource {
    fn open(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))?;
        socket.set_read_timeout(Some(self.read_timeout))?;

        // The transport is only considered open once data actually flows;
        // a silent socket means the aircraft has not started streaming yet.
        let mut buffer = [0u8; DATAGRAM_SIZE];
        match socket.recv_from(&mut buffer) {
            Ok((len, _)) => self.assembly.extend_from_slice(&buffer[..len]),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e.into()),
        }

        self.socket = Some(socket);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "video source not opened",
            ))
        })?;

        let mut buffer = [0u8; DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buffer) {
                Ok((len, _)) => {
                    let datagram = &buffer[..len];
                    // A start code at a datagram boundary begins the next
                    // access unit; whatever was assembled so far is one frame.
                    if datagram.starts_with(&ANNEX_B_START) && !self.assembly.is_empty() {
                        let frame = std::mem::replace(&mut self.assembly, datagram.to_vec());
                        return Ok(Some(frame));
                    }
                    self.assembly.extend_from_slice(datagram);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        self.socket = None;
        self.assembly.clear();
    }
}

/// Counters and timing retained after the frames themselves are discarded.
#[derive(Debug, Clone, Default)]
pub struct VideoStats {
    pub frames: u64,
    pub skipped: u64,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

/// How many frames to discard when one iteration of the pipeline took
/// `elapsed` against a stream pacing of one frame per `frame_interval`.
pub(crate) fn frames_to_skip(elapsed: Duration, frame_interval: Duration) -> u64 {
    if frame_interval.is_zero() {
        return 0;
    }
    (elapsed.as_secs_f64() / frame_interval.as_secs_f64()).floor() as u64
}

pub(crate) struct VideoIngest {
    pub source: Box<dyn VideoSource>,
    pub artifact: PathBuf,
    pub subscribers: Arc<Subscribers<VideoFrame>>,
    pub stats: Arc<Mutex<VideoStats>>,
    pub events: EventLog,
    pub stop: Arc<AtomicBool>,
    pub retry: RetryPolicy,
    pub open_delay: Duration,
    pub frame_interval: Duration,
}

impl VideoIngest {
    /// Spawn the ingest worker. The returned channel reports exactly once
    /// whether the source opened (after which the loop is running) or the
    /// retry policy was exhausted.
    pub fn spawn(
        self,
        disconnect: flume::Sender<()>,
    ) -> (thread::JoinHandle<()>, flume::Receiver<Result<()>>) {
        let (ready_tx, ready_rx) = flume::bounded(1);
        let handle = thread::spawn(move || {
            self.run(ready_tx);
            drop(disconnect);
        });
        (handle, ready_rx)
    }

    fn run(mut self, ready: flume::Sender<Result<()>>) {
        let mut attempts = 0usize;
        loop {
            if self.stop.load(Relaxed) {
                let _ = ready.send(Err(Error::StreamOpenFailed(attempts)));
                return;
            }
            match self.source.open() {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    warn!("Could not open video stream (attempt {}): {}", attempts, e);
                    self.events
                        .status(format!("Could not open video stream: {}", e));
                    if self.retry.exhausted(attempts) {
                        let _ = ready.send(Err(Error::StreamOpenFailed(attempts)));
                        return;
                    }
                    thread::sleep(self.open_delay);
                }
            }
        }

        let mut writer = match File::create(&self.artifact) {
            Ok(file) => BufWriter::new(file),
            Err(e) => {
                error!("Could not create video artifact: {}", e);
                let _ = ready.send(Err(e.into()));
                self.source.close();
                return;
            }
        };

        info!("Video stream open");
        self.events.status("Opened video stream");
        let _ = ready.send(Ok(()));
        self.stats.lock().unwrap().started_at = Some(SystemTime::now());

        let mut sequence = 0u64;
        while !self.stop.load(Relaxed) {
            let iteration_started = Instant::now();
            match self.source.read_frame() {
                Ok(Some(data)) => {
                    sequence += 1;
                    let frame = VideoFrame {
                        data,
                        captured_at: SystemTime::now(),
                        sequence,
                    };
                    if let Err(e) = writer.write_all(&frame.data) {
                        error!("Could not persist video frame: {}", e);
                        self.events
                            .status(format!("Could not persist video frame: {}", e));
                        self.stop.store(true, Relaxed);
                        break;
                    }
                    self.subscribers.dispatch(&frame);
                    self.stats.lock().unwrap().frames += 1;
                }
                Ok(None) => continue,
                Err(e) => {
                    error!("Video stream failed: {}", e);
                    self.events.status(format!("Video stream failed: {}", e));
                    self.stop.store(true, Relaxed);
                    break;
                }
            }

            // Recomputed every iteration: when handling the last frame took
            // longer than its presentation interval, discard enough frames
            // to catch back up to real time.
            let skip = frames_to_skip(iteration_started.elapsed(), self.frame_interval);
            for _ in 0..skip {
                match self.source.read_frame() {
                    Ok(Some(_)) => self.stats.lock().unwrap().skipped += 1,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Read error while skipping frames: {}", e);
                        break;
                    }
                }
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.ended_at = Some(SystemTime::now());
        drop(stats);

        if let Err(e) = writer.flush() {
            warn!("Could not flush video artifact: {}", e);
        }
        self.source.close();
        debug!("Video ingest stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_count_is_the_floor_of_the_lag_ratio() {
        // 0.08s of lag against a 30 fps stream: floor(0.08 / (1/30)) = 2.
        let skip = frames_to_skip(Duration::from_millis(80), Duration::from_secs(1) / 30);
        assert_eq!(skip, 2);
    }

    #[test]
    fn no_skip_when_the_pipeline_keeps_up() {
        let interval = Duration::from_secs(1) / 30;
        assert_eq!(frames_to_skip(Duration::from_millis(10), interval), 0);
        assert_eq!(frames_to_skip(Duration::ZERO, interval), 0);
    }

    #[test]
    fn udp_source_rejects_non_udp_urls() {
        assert!(matches!(
            UdpVideoSource::new("tcp://0.0.0.0:11111", Duration::from_millis(100)),
            Err(Error::InvalidVideoUrl)
        ));
        assert!(UdpVideoSource::new("udp://0.0.0.0:11111", Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn udp_source_splits_access_units_on_start_codes() {
        let source_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut source = UdpVideoSource::new(
            "udp://0.0.0.0:0", // rebind below with the real port
            Duration::from_millis(200),
        )
        .unwrap();
        // Pick an ephemeral port for the test and point the sender at it.
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let target = receiver.local_addr().unwrap();
        source.socket = Some(receiver);

        // First access unit arrives in two datagrams, second begins with a
        // fresh start code.
        source_socket
            .send_to(&[0, 0, 0, 1, 0x67, 0xAA], target)
            .unwrap();
        source_socket.send_to(&[0xBB, 0xCC], target).unwrap();
        source_socket
            .send_to(&[0, 0, 0, 1, 0x41, 0xDD], target)
            .unwrap();

        // Let the datagrams land before reading.
        thread::sleep(Duration::from_millis(50));
        let frame = source.read_frame().unwrap().unwrap();
        assert_eq!(frame, vec![0, 0, 0, 1, 0x67, 0xAA, 0xBB, 0xCC]);
        // The second unit stays buffered until the next start code or
        // timeout; a timeout read reports "nothing complete yet".
        assert_eq!(source.read_frame().unwrap(), None);
        assert_eq!(source.assembly, vec![0, 0, 0, 1, 0x41, 0xDD]);
    }

    /// Source that fails a configured number of opens, then produces a fixed
    /// set of frames.
    struct FlakySource {
        failures_left: usize,
        frames: Vec<Vec<u8>>,
    }

    impl VideoSource for FlakySource {
        fn open(&mut self) -> Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::Timeout);
            }
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.frames.pop())
        }
    }

    fn ingest(source: FlakySource, retry: RetryPolicy, artifact: PathBuf) -> VideoIngest {
        VideoIngest {
            source: Box::new(source),
            artifact,
            subscribers: Arc::new(Subscribers::new()),
            stats: Arc::new(Mutex::new(VideoStats::default())),
            events: EventLog::new(),
            stop: Arc::new(AtomicBool::new(false)),
            retry,
            open_delay: Duration::from_millis(1),
            frame_interval: Duration::from_secs(1) / 30,
        }
    }

    fn temp_artifact(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tello-link-test-{}-{}.h264",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn open_retries_until_the_third_attempt_succeeds() {
        let artifact = temp_artifact("retry-ok");
        let source = FlakySource {
            failures_left: 2,
            frames: vec![vec![1, 2, 3]],
        };
        let worker = ingest(source, RetryPolicy::Bounded(3), artifact.clone());
        let stop = worker.stop.clone();
        let stats = worker.stats.clone();

        let (disconnect, _) = flume::bounded(0);
        let (handle, ready) = worker.spawn(disconnect);
        assert!(ready.recv().unwrap().is_ok());

        stop.store(true, Relaxed);
        handle.join().unwrap();

        let stats = stats.lock().unwrap();
        assert!(stats.started_at.is_some());
        assert!(stats.ended_at.is_some());
        let _ = std::fs::remove_file(artifact);
    }

    #[test]
    fn bounded_retry_of_two_gives_up_before_the_third_attempt() {
        let artifact = temp_artifact("retry-fail");
        let source = FlakySource {
            failures_left: 2,
            frames: Vec::new(),
        };
        let worker = ingest(source, RetryPolicy::Bounded(2), artifact);

        let (disconnect, _) = flume::bounded(0);
        let (handle, ready) = worker.spawn(disconnect);
        match ready.recv().unwrap() {
            Err(Error::StreamOpenFailed(attempts)) => assert_eq!(attempts, 2),
            other => panic!("expected StreamOpenFailed, got {:?}", other),
        }
        handle.join().unwrap();
    }

    #[test]
    fn sequence_numbers_increase_monotonically() {
        let artifact = temp_artifact("sequence");
        let source = FlakySource {
            failures_left: 0,
            frames: vec![vec![3], vec![2], vec![1]],
        };
        let worker = ingest(source, RetryPolicy::Bounded(1), artifact.clone());
        let stop = worker.stop.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            let stop = stop.clone();
            worker.subscribers.subscribe(move |frame: &VideoFrame| {
                let mut seen = seen.lock().unwrap();
                seen.push(frame.sequence);
                if seen.len() == 3 {
                    stop.store(true, Relaxed);
                }
            });
        }

        let (disconnect, _) = flume::bounded(0);
        let (handle, ready) = worker.spawn(disconnect);
        assert!(ready.recv().unwrap().is_ok());
        handle.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        let _ = std::fs::remove_file(artifact);
    }
}
