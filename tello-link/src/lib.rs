//! # Tello Link
//!
//! This crate implements the session and communication layer for a Tello
//! quadcopter driven over Wi-Fi UDP. It opens the control, telemetry and
//! video channels to the aircraft, correlates outgoing text commands with
//! their asynchronous acknowledgements, and supervises the background
//! threads that keep the three channels alive for the lifetime of one flight
//! session.
//!
//! The entry point is [`DroneSession`]: construct it with a
//! [`SessionConfig`], call [`connect`](DroneSession::connect) to perform the
//! mode-enable handshake and start the background channels, issue commands,
//! read or subscribe to telemetry and video, and finally call
//! [`cleanup`](DroneSession::cleanup) to stop everything and flush the
//! session's persisted histories.
//!
//! Example:
//!
//! ``` no_run
//! # fn main() -> tello_link::Result<()> {
//! let mut session = tello_link::DroneSession::new(Default::default());
//! session.connect()?;
//!
//! if let Some(battery) = session.latest_telemetry().and_then(|t| t.battery()) {
//!     println!("Battery: {}%", battery);
//! }
//!
//! session.takeoff()?;
//! session.land()?;
//! session.cleanup()?;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod error;
mod events;
mod persist;
mod session;
mod telemetry;
mod video;

pub use command::{CommandRecord, FlipDirection};
pub use config::{RetryPolicy, SessionConfig};
pub use error::{Error, Result};
pub use events::SubscriptionId;
pub use persist::{ArtifactPaths, SessionMetadata};
pub use session::{DroneSession, SessionState};
pub use telemetry::{Acceleration, Attitude, TelemetryFrame, TempRange, Velocity};
pub use video::{UdpVideoSource, VideoFrame, VideoSource, VideoStats};
