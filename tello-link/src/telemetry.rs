//! Telemetry listener.
//!
//! The aircraft broadcasts a periodic status datagram of `key:value;` pairs
//! to a fixed local port. The listener parses each datagram into a
//! [`TelemetryFrame`], appends it to the shared ordered log and dispatches it
//! to subscribers in arrival order.

use crate::error::Result;
use crate::events::Subscribers;
use crate::persist::EventLog;
use log::{debug, error};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

const BUFFER_SIZE: usize = 1024;

/// Attitude angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attitude {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

/// Ground velocity components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Velocity {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// IMU acceleration components, in 0.001 g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Acceleration {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Onboard temperature bounds in degrees celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempRange {
    pub low: f64,
    pub high: f64,
}

impl TempRange {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// One parsed status broadcast.
///
/// `fields` holds the raw key/value pairs from the wire; the typed accessors
/// below are conveniences over the fields the SDK documents (`pitch`, `roll`,
/// `yaw`, `vgx/vgy/vgz`, `templ/temph`, `tof`, `h`, `bat`, `baro`, `time`,
/// `agx/agy/agz`). All return `None` when the field is absent or unparsable.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryFrame {
    pub fields: HashMap<String, String>,
    #[serde(rename = "timestamp", with = "crate::persist::unix_seconds")]
    pub received_at: SystemTime,
}

impl TelemetryFrame {
    /// Parse one status datagram.
    ///
    /// Tokens are separated by `;` with a trailing empty token; empty tokens
    /// are discarded. A token without a `:` separator is dropped on its own,
    /// the rest of the frame stays usable.
    pub fn parse(raw: &str, received_at: SystemTime) -> TelemetryFrame {
        let mut fields = HashMap::new();
        for token in raw.trim().split(';') {
            if token.is_empty() {
                continue;
            }
            match token.split_once(':') {
                Some((key, value)) => {
                    fields.insert(key.to_owned(), value.to_owned());
                }
                None => debug!("Dropping malformed telemetry token: {:?}", token),
            }
        }
        TelemetryFrame {
            fields,
            received_at,
        }
    }

    fn numeric(&self, key: &str) -> Option<f64> {
        self.fields.get(key)?.parse().ok()
    }

    /// Battery level, percent.
    pub fn battery(&self) -> Option<f64> {
        self.numeric("bat")
    }

    /// Height above the ground, centimeters.
    pub fn height_cm(&self) -> Option<f64> {
        self.numeric("h")
    }

    /// Time the motors have been on, seconds.
    pub fn flight_time(&self) -> Option<f64> {
        self.numeric("time")
    }

    /// Barometric measurement, centimeters.
    pub fn barometer(&self) -> Option<f64> {
        self.numeric("baro")
    }

    /// Distance from the point of takeoff, centimeters.
    pub fn time_of_flight(&self) -> Option<f64> {
        self.numeric("tof")
    }

    pub fn attitude(&self) -> Option<Attitude> {
        Some(Attitude {
            pitch: self.numeric("pitch")?,
            roll: self.numeric("roll")?,
            yaw: self.numeric("yaw")?,
        })
    }

    pub fn velocity(&self) -> Option<Velocity> {
        Some(Velocity {
            x: self.numeric("vgx")?,
            y: self.numeric("vgy")?,
            z: self.numeric("vgz")?,
        })
    }

    pub fn acceleration(&self) -> Option<Acceleration> {
        Some(Acceleration {
            x: self.numeric("agx")?,
            y: self.numeric("agy")?,
            z: self.numeric("agz")?,
        })
    }

    pub fn temperature(&self) -> Option<TempRange> {
        Some(TempRange {
            low: self.numeric("templ")?,
            high: self.numeric("temph")?,
        })
    }
}

/// Worker that owns the telemetry socket.
pub(crate) struct TelemetryListener {
    socket: UdpSocket,
    history: Arc<Mutex<Vec<TelemetryFrame>>>,
    subscribers: Arc<Subscribers<TelemetryFrame>>,
    events: EventLog,
    stop: Arc<AtomicBool>,
    read_delay: Duration,
}

impl TelemetryListener {
    pub fn bind(
        port: u16,
        read_timeout: Duration,
        read_delay: Duration,
        history: Arc<Mutex<Vec<TelemetryFrame>>>,
        subscribers: Arc<Subscribers<TelemetryFrame>>,
        events: EventLog,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        // The read timeout bounds how long shutdown can be stuck behind a
        // blocking receive.
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(Self {
            socket,
            history,
            subscribers,
            events,
            stop,
            read_delay,
        })
    }

    pub fn spawn(self, disconnect: flume::Sender<()>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            self.run();
            drop(disconnect);
        })
    }

    fn run(self) {
        let mut buffer = [0u8; BUFFER_SIZE];
        while !self.stop.load(Relaxed) {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, _)) => {
                    let received_at = SystemTime::now();
                    match std::str::from_utf8(&buffer[..len]) {
                        Ok(text) => {
                            let frame = TelemetryFrame::parse(text, received_at);
                            self.history.lock().unwrap().push(frame.clone());
                            self.subscribers.dispatch(&frame);
                        }
                        Err(_) => debug!("Dropping undecodable telemetry datagram"),
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    // Socket teardown mid-session is fatal for the whole link.
                    error!("Telemetry socket failed: {}", e);
                    self.events.status(format!("Telemetry socket failed: {}", e));
                    self.stop.store(true, Relaxed);
                    break;
                }
            }
            thread::sleep(self.read_delay);
        }
        debug!("Telemetry listener stopped");
    }
}
