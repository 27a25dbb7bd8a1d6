//! Command channel.
//!
//! Text commands go out on the control socket; the aircraft answers with
//! `ok`, `error` or a bare value. The wire protocol carries no correlation
//! id, so ack matching relies on a strict single-command-in-flight
//! discipline plus a drain heuristic for fire-and-forget sends (see
//! [`CommandLink::send`]).

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::persist::EventLog;
use log::{debug, error, warn};
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

const BUFFER_SIZE: usize = 1024;
const REPLY_BACKLOG: usize = 64;

/// Direction letter for the `flip` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipDirection {
    Left,
    Right,
    Forward,
    Back,
}

impl FlipDirection {
    pub(crate) fn letter(self) -> char {
        match self {
            FlipDirection::Left => 'l',
            FlipDirection::Right => 'r',
            FlipDirection::Forward => 'f',
            FlipDirection::Back => 'b',
        }
    }
}

/// Audit record of one command exchange.
///
/// Created when the command is submitted, filled in once when its reply
/// arrives (or the wait times out), immutable afterwards. An ack-awaiting
/// record with `reply == None` means the outcome is unknown, not that the
/// aircraft necessarily rejected the command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command: String,
    #[serde(rename = "timestamp", with = "crate::persist::unix_seconds")]
    pub sent_at: SystemTime,
    pub awaits_ack: bool,
    pub reply: Option<String>,
    #[serde(rename = "reply_time", with = "crate::persist::opt_unix_seconds")]
    pub reply_at: Option<SystemTime>,
}

impl CommandRecord {
    /// Whether the aircraft answered `ok`.
    pub fn acknowledged(&self) -> bool {
        self.reply.as_deref() == Some("ok")
    }

    /// Round-trip latency, when a reply arrived.
    pub fn round_trip(&self) -> Option<Duration> {
        self.reply_at?.duration_since(self.sent_at).ok()
    }
}

#[derive(Debug)]
struct Reply {
    text: String,
    received_at: SystemTime,
}

struct TxState {
    /// Replies still expected from earlier fire-and-forget sends.
    outstanding: usize,
}

/// Owns the control socket. A dedicated reader thread feeds decoded replies
/// into a bounded channel; `send` consumes them.
pub(crate) struct CommandLink {
    socket: UdpSocket,
    drone_addr: SocketAddr,
    replies: flume::Receiver<Reply>,
    tx: Mutex<TxState>,
    history: Arc<Mutex<Vec<CommandRecord>>>,
    events: EventLog,
    reader: Option<thread::JoinHandle<()>>,
}

impl CommandLink {
    pub fn open(
        config: &SessionConfig,
        history: Arc<Mutex<Vec<CommandRecord>>>,
        events: EventLog,
        stop: Arc<AtomicBool>,
        disconnect: flume::Sender<()>,
    ) -> Result<CommandLink> {
        let drone_addr = config
            .control_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "could not resolve the aircraft address",
                ))
            })?;

        let socket = UdpSocket::bind(("0.0.0.0", config.control_bind_port))?;
        socket.set_read_timeout(Some(config.read_timeout))?;

        let (reply_tx, reply_rx) = flume::bounded(REPLY_BACKLOG);
        let reader_socket = socket.try_clone()?;
        let reader_events = events.clone();
        let reader = thread::spawn(move || {
            reader_loop(reader_socket, reply_tx, reader_events, stop);
            drop(disconnect);
        });

        Ok(CommandLink {
            socket,
            drone_addr,
            replies: reply_rx,
            tx: Mutex::new(TxState { outstanding: 0 }),
            history,
            events,
            reader: Some(reader),
        })
    }

    /// Transmit a command and, when `await_ack` is set, block until the
    /// matching reply arrives or `timeout` elapses.
    ///
    /// Matching is heuristic: the protocol has no correlation id, so before
    /// waiting for its own reply an ack-awaiting send first drains one reply
    /// per earlier fire-and-forget command. This assumes replies arrive in
    /// send order; out-of-order delivery misattributes an ack to the wrong
    /// command. That fragility is inherent to the wire protocol and is kept
    /// as documented behavior rather than papered over.
    ///
    /// At most one ack-awaiting send may be in flight; a concurrent call
    /// fails with [`Error::CommandInFlight`].
    pub fn send(&self, command: &str, await_ack: bool, timeout: Duration) -> Result<CommandRecord> {
        let mut tx = self.tx.try_lock().map_err(|_| Error::CommandInFlight)?;

        let sent_at = SystemTime::now();
        self.events.send(format!("Sending message: {}", command));
        self.socket.send_to(command.as_bytes(), self.drone_addr)?;

        let mut record = CommandRecord {
            command: command.to_owned(),
            sent_at,
            awaits_ack: await_ack,
            reply: None,
            reply_at: None,
        };

        if await_ack {
            while tx.outstanding > 0 {
                match self.replies.recv_timeout(timeout) {
                    Ok(stale) => debug!("Draining stale reply: {:?}", stale.text),
                    Err(_) => warn!("Expected a stale reply, none arrived in {:?}", timeout),
                }
                tx.outstanding -= 1;
            }
            match self.replies.recv_timeout(timeout) {
                Ok(reply) => {
                    record.reply = Some(reply.text);
                    record.reply_at = Some(reply.received_at);
                }
                Err(_) => warn!(
                    "No reply to {:?} within {:?}; outcome unknown",
                    command, timeout
                ),
            }
        } else {
            tx.outstanding += 1;
        }

        self.history.lock().unwrap().push(record.clone());
        Ok(record)
    }

    /// Join the reader thread. The caller must have tripped the shared stop
    /// flag first; the socket read timeout bounds the wait.
    pub fn shutdown(mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(
    socket: UdpSocket,
    replies: flume::Sender<Reply>,
    events: EventLog,
    stop: Arc<AtomicBool>,
) {
    let mut buffer = [0u8; BUFFER_SIZE];
    while !stop.load(Relaxed) {
        match socket.recv_from(&mut buffer) {
            Ok((len, _)) => {
                let received_at = SystemTime::now();
                match std::str::from_utf8(&buffer[..len]) {
                    Ok(text) => {
                        let text = text.trim().to_owned();
                        events.receive(text.clone());
                        if replies.try_send(Reply { text, received_at }).is_err() {
                            warn!("Reply backlog full, dropping reply");
                        }
                    }
                    Err(_) => debug!("Dropping undecodable reply datagram"),
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("Control socket failed: {}", e);
                events.status(format!("Control socket failed: {}", e));
                stop.store(true, Relaxed);
                break;
            }
        }
    }
    debug!("Reply reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    struct Harness {
        link: CommandLink,
        history: Arc<Mutex<Vec<CommandRecord>>>,
        stop: Arc<AtomicBool>,
        drone: thread::JoinHandle<()>,
    }

    /// Stand-in aircraft that answers `ok` to `replies_expected` datagrams.
    fn harness(replies_expected: usize) -> Harness {
        let drone_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        drone_socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let drone_addr = drone_socket.local_addr().unwrap();

        let drone = thread::spawn(move || {
            let mut buffer = [0u8; BUFFER_SIZE];
            for _ in 0..replies_expected {
                if let Ok((_, from)) = drone_socket.recv_from(&mut buffer) {
                    drone_socket.send_to(b"ok", from).unwrap();
                }
            }
        });

        let config = SessionConfig {
            drone_host: drone_addr.ip().to_string(),
            control_port: drone_addr.port(),
            control_bind_port: 0,
            read_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let history = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (disconnect, _) = flume::bounded(0);
        let link = CommandLink::open(
            &config,
            history.clone(),
            EventLog::new(),
            stop.clone(),
            disconnect,
        )
        .unwrap();

        Harness {
            link,
            history,
            stop,
            drone,
        }
    }

    impl Harness {
        fn finish(self) {
            self.stop.store(true, Relaxed);
            self.link.shutdown();
            let _ = self.drone.join();
        }
    }

    #[test]
    fn ack_round_trip_is_bounded_by_the_timeout() {
        let harness = harness(1);
        let timeout = Duration::from_secs(2);

        let record = harness.link.send("command", true, timeout).unwrap();
        assert_eq!(record.reply.as_deref(), Some("ok"));
        assert!(record.acknowledged());
        let round_trip = record.round_trip().unwrap();
        assert!(round_trip <= timeout);

        harness.finish();
    }

    #[test]
    fn ack_timeout_leaves_the_outcome_unknown() {
        // Zero expected replies: the aircraft stays silent.
        let harness = harness(0);

        let record = harness
            .link
            .send("command", true, Duration::from_millis(100))
            .unwrap();
        assert!(record.awaits_ack);
        assert_eq!(record.reply, None);
        assert_eq!(record.reply_at, None);
        assert!(!record.acknowledged());

        harness.finish();
    }

    #[test]
    fn stale_replies_are_drained_before_the_awaited_one() {
        // The aircraft answers both the fire-and-forget send and the
        // ack-awaiting one; the first reply must not be attributed to the
        // second command.
        let harness = harness(2);

        let takeoff = harness
            .link
            .send("takeoff", false, Duration::from_secs(2))
            .unwrap();
        assert!(!takeoff.awaits_ack);
        assert_eq!(takeoff.reply, None);

        let command = harness
            .link
            .send("command", true, Duration::from_secs(2))
            .unwrap();
        assert_eq!(command.reply.as_deref(), Some("ok"));

        harness.finish();
    }

    #[test]
    fn history_is_append_only_and_at_most_one_unanswered_ack_awaiter() {
        let harness = harness(2);

        harness
            .link
            .send("takeoff", false, Duration::from_secs(2))
            .unwrap();
        harness
            .link
            .send("command", true, Duration::from_secs(2))
            .unwrap();

        let history = harness.history.lock().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, "takeoff");
        assert_eq!(history[1].command, "command");
        let unanswered_awaiting = history
            .iter()
            .filter(|record| record.awaits_ack && record.reply_at.is_none())
            .count();
        assert!(unanswered_awaiting <= 1);
        drop(history);

        harness.finish();
    }
}
