//! # Offboard demo flight
//!
//! The complete flight run by the `mav-offboard` binary: connect, wait for the vehicle to be ready, arm, take off,
//! fly a [maneuver](crate::maneuvers), steer with the [keyboard](crate::keyboard) and land.
//!
//! Every step must succeed, the first error ends the flight and is returned to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::cli::FlightConfig;
use crate::keyboard::{keyboard_control, KeySource, RawTerminal};
use crate::link::MavlinkConnection;
use crate::maneuvers::run_maneuver;
use crate::{Error, Result, Vehicle};

const READY_POLL: Duration = Duration::from_secs(1);
const LANDED_WATCH: Duration = Duration::from_secs(3);

/// Connect to the vehicle and fly the demo
///
/// Ctrl-C ends the flight with [Error::Interrupted], the terminal settings are restored before returning.
pub async fn run(config: &FlightConfig) -> Result<()> {
    let link = MavlinkConnection::open(&config.connection_url)?;
    log::info!("Connected to {}", config.connection_url);

    log::info!("Waiting to discover system...");
    let vehicle = match Vehicle::connect_from_link(Arc::new(link), config.discovery_timeout).await {
        Err(Error::NoSystemFound) => {
            log::error!("No system found, exiting.");
            return Err(Error::NoSystemFound);
        }
        vehicle => vehicle?,
    };

    let result = interruptible(fly(&vehicle, config), tokio::signal::ctrl_c()).await;
    vehicle.disconnect().await;
    result
}

/// Run `flight` until it ends or `interrupt` fires
///
/// The flight future is dropped on interrupt, which releases the keyboard.
async fn interruptible<F, I>(flight: F, interrupt: I) -> Result<()>
where
    F: Future<Output = Result<()>>,
    I: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = flight => result,
        signal = interrupt => {
            match signal {
                Ok(()) => log::warn!("Interrupted, leaving the vehicle in its current state"),
                Err(e) => log::warn!("Could not wait for Ctrl-C: {}", e),
            }
            Err(Error::Interrupted)
        }
    }
}

/// Fly the demo with a connected vehicle
///
/// The keyboard is only used if enabled in the configuration, it is read from the terminal.
pub async fn fly(vehicle: &Vehicle, config: &FlightConfig) -> Result<()> {
    fly_with_keys(vehicle, config, RawTerminal::new).await
}

/// Fly the demo, reading keys from the source returned by `open_keys`
///
/// The key source is opened before arming so that a missing terminal ends the flight on the ground.
pub async fn fly_with_keys<K, F>(vehicle: &Vehicle, config: &FlightConfig, open_keys: F) -> Result<()>
where
    K: KeySource + 'static,
    F: FnOnce() -> Result<K>,
{
    let watchers = Watchers::start(vehicle);

    if let Err(e) = vehicle.telemetry.request_home_position().await {
        log::warn!("Home position request failed: {}", e);
    }

    vehicle
        .telemetry
        .set_rate_position(config.telemetry_rate_hz)
        .await
        .map_err(|e| {
            log::error!("Setting rate failed: {}", e);
            e
        })?;

    log::info!("{}", vehicle.telemetry.rc_status());

    while !vehicle.telemetry.health_all_ok() {
        log::info!("Vehicle is getting ready to arm");
        log::info!("{}", vehicle.telemetry.health());
        sleep(READY_POLL).await;
    }

    let keys = if config.keyboard {
        match open_keys() {
            Ok(keys) => Some(keys),
            Err(e) => {
                log::error!("Keyboard unavailable ({}), run with --no-keyboard", e);
                return Err(e);
            }
        }
    } else {
        None
    };

    log::info!("Arming...");
    vehicle.action.arm().await?;

    log::info!("Set take off altitude is {} m", config.takeoff_altitude_m);
    vehicle
        .action
        .set_takeoff_altitude(config.takeoff_altitude_m)
        .await?;

    log::info!("Taking off...");
    vehicle.action.takeoff().await?;
    sleep(config.hover).await;

    log::info!("Global: {}", vehicle.telemetry.position());
    log::info!(
        "Local: {}",
        vehicle.telemetry.position_velocity_ned().position
    );

    run_maneuver(&vehicle.offboard, config.maneuver).await?;
    sleep(config.hover).await;

    if let Some(keys) = keys {
        keyboard_control(&vehicle.offboard, keys, config.keyboard_step_m).await?;
    }

    log::info!("Landing...");
    vehicle.action.land().await?;

    while vehicle.telemetry.in_air() {
        log::info!("Vehicle is landing...");
        sleep(READY_POLL).await;
    }
    log::info!("Landed!");

    // Keep watching the telemetry for a moment
    sleep(LANDED_WATCH).await;
    log::info!("Finished...");

    drop(watchers);
    Ok(())
}

/// Background logging of the vehicle components and altitude
struct Watchers {
    components: JoinHandle<()>,
    altitude: JoinHandle<()>,
}

impl Watchers {
    fn start(vehicle: &Vehicle) -> Self {
        let components = vehicle.components();
        let components = tokio::spawn(async move {
            let mut components = std::pin::pin!(components);
            while let Some(component) = components.next().await {
                log::info!(
                    "Discovered a component with type {:?} (id {})",
                    component.component_type,
                    component.component_id
                );
            }
        });

        let positions = vehicle.telemetry.position_stream();
        let altitude = tokio::spawn(async move {
            let mut positions = std::pin::pin!(positions);
            while let Some(position) = positions.next().await {
                log::info!(target: "telemetry", "Altitude: {} m", position.relative_altitude_m);
            }
        });

        Self {
            components,
            altitude,
        }
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        self.components.abort();
        self.altitude.abort();
    }
}
