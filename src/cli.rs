//! Command line of the `mav-offboard` binary

use std::time::Duration;

use clap::Parser;

use crate::maneuvers::Maneuver;
use crate::url::ConnectionUrl;

const URL_HELP: &str = "\
Connection URL format should be:
  For TCP : tcp://[server_host][:server_port]
  For UDP : udp://[bind_host][:bind_port]
  For Serial : serial:///path/to/serial/dev[:baudrate]

For example, to connect to the simulator use URL: udp://:14540

Log verbosity is set with RUST_LOG (default: info).";

/// Command line arguments, flags are documented by their help
#[allow(missing_docs)]
#[derive(Parser, Debug)]
#[command(
    name = "mav-offboard",
    version,
    about = "Fly a PX4 vehicle through an offboard control demo",
    after_help = URL_HELP
)]
pub struct Cli {
    #[arg(help = "Vehicle connection URL")]
    pub connection_url: ConnectionUrl,
    #[arg(
        long,
        value_enum,
        default_value_t = Maneuver::PositionNed,
        help = "Offboard maneuver flown after takeoff"
    )]
    pub maneuver: Maneuver,
    #[arg(long, default_value_t = false, help = "Land right after the maneuver")]
    pub no_keyboard: bool,
    #[arg(
        long,
        default_value_t = 1.5,
        value_parser = positive_f32,
        help = "Takeoff altitude (meters)"
    )]
    pub takeoff_altitude: f32,
    #[arg(
        long,
        default_value_t = 10,
        help = "Hover time after takeoff and after the maneuver (seconds)"
    )]
    pub hover_secs: u64,
    #[arg(
        long,
        default_value_t = 2,
        help = "Time to wait for the vehicle heartbeat (seconds)"
    )]
    pub discovery_timeout_secs: u64,
    #[arg(
        long,
        default_value_t = 1.0,
        value_parser = positive_f64,
        help = "Position telemetry rate (Hz)"
    )]
    pub telemetry_rate_hz: f64,
    #[arg(
        long,
        default_value_t = 0.1,
        value_parser = positive_f32,
        help = "Keyboard control step (meters)"
    )]
    pub keyboard_step: f32,
}

fn positive_f32(value: &str) -> Result<f32, String> {
    match value.parse::<f32>() {
        Ok(v) if v > 0.0 && v.is_finite() => Ok(v),
        Ok(_) => Err(format!("{} is not a positive number", value)),
        Err(e) => Err(e.to_string()),
    }
}

fn positive_f64(value: &str) -> Result<f64, String> {
    match value.parse::<f64>() {
        Ok(v) if v > 0.0 && v.is_finite() => Ok(v),
        Ok(_) => Err(format!("{} is not a positive number", value)),
        Err(e) => Err(e.to_string()),
    }
}

/// Settings of one flight
#[derive(Debug, Clone, PartialEq)]
pub struct FlightConfig {
    /// Vehicle address
    pub connection_url: ConnectionUrl,
    /// Maneuver flown after takeoff
    pub maneuver: Maneuver,
    /// Run keyboard control after the maneuver
    pub keyboard: bool,
    /// Takeoff altitude (meters)
    pub takeoff_altitude_m: f32,
    /// Hover time after takeoff and after the maneuver
    pub hover: Duration,
    /// Time to wait for the vehicle heartbeat
    pub discovery_timeout: Duration,
    /// Position telemetry rate (Hz)
    pub telemetry_rate_hz: f64,
    /// Keyboard control step (meters)
    pub keyboard_step_m: f32,
}

impl From<Cli> for FlightConfig {
    fn from(cli: Cli) -> Self {
        Self {
            connection_url: cli.connection_url,
            maneuver: cli.maneuver,
            keyboard: !cli.no_keyboard,
            takeoff_altitude_m: cli.takeoff_altitude,
            hover: Duration::from_secs(cli.hover_secs),
            discovery_timeout: Duration::from_secs(cli.discovery_timeout_secs),
            telemetry_rate_hz: cli.telemetry_rate_hz,
            keyboard_step_m: cli.keyboard_step,
        }
    }
}
