use anyhow::Result;
use std::thread::sleep;
use std::time::Duration;
use tello_link::{DroneSession, FlipDirection, SessionConfig};

/// Scripted hop: take off, yaw back and forth, flip, land.
fn main() -> Result<()> {
    let mut session = DroneSession::new(SessionConfig::default());
    while let Err(e) = session.connect() {
        eprintln!("Connect failed ({}), retrying...", e);
        sleep(Duration::from_secs(1));
    }

    if let Some(frame) = session.latest_telemetry() {
        println!("Battery:  {:?}", frame.battery());
        println!("Attitude: {:?}", frame.attitude());
        println!("Height:   {:?}", frame.height_cm());
    }

    session.takeoff()?;
    sleep(Duration::from_secs(5));

    session.send_rc(0, 0, 0, 50)?;
    sleep(Duration::from_secs(1));
    session.send_rc(0, 0, 0, -50)?;
    sleep(Duration::from_secs(1));
    session.send_rc(0, 0, 0, 0)?;

    session.flip(FlipDirection::Back)?;
    sleep(Duration::from_secs(5));

    session.land()?;
    sleep(Duration::from_secs(5));

    session.cleanup()?;
    Ok(())
}
