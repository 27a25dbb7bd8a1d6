use anyhow::Result;
use std::time::Duration;
use structopt::StructOpt;
use tello_link::{DroneSession, SessionConfig};

#[derive(StructOpt)]
#[structopt(name = "monitor", about = "Connect to the aircraft and print telemetry")]
struct Opt {
    /// Aircraft address
    #[structopt(long, default_value = "192.168.10.1")]
    host: String,
    /// How long to watch, in seconds
    #[structopt(long, default_value = "10")]
    duration: u64,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let config = SessionConfig {
        drone_host: opt.host,
        ..SessionConfig::default()
    };
    let mut session = DroneSession::new(config);
    session.connect()?;

    for _ in 0..opt.duration {
        std::thread::sleep(Duration::from_secs(1));
        match session.latest_telemetry() {
            Some(frame) => println!(
                "battery {:?}% | height {:?}cm | attitude {:?} | baro {:?}",
                frame.battery(),
                frame.height_cm(),
                frame.attitude(),
                frame.barometer()
            ),
            None => println!("no telemetry yet"),
        }
    }

    session.cleanup()?;
    Ok(())
}
