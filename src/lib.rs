//! # Offboard control library
//!
//! This crate allows to connect, communicate with and control a PX4 vehicle over MAVLink using the [mavlink] crate
//! to open the communication link. TCP, UDP and serial links are supported.
//!
//! ## Status
//!
//! The vehicle functionalities are implemented in subsystems. The current status is:
//!
//! | Subsystem | Support |
//! |-----------|---------|
//! | Action | Arm, disarm, takeoff, land, return to launch, takeoff altitude |
//! | Offboard | Position NED, velocity NED, velocity body, attitude |
//! | Telemetry | Armed, flight mode, position, local position, landed state, health, RC |
//!
//! On top of the subsystems, [maneuvers] contains the scripted offboard flights, [keyboard] the interactive position
//! control and [mission] the complete flight run by the `mav-offboard` binary.
//!
//! ## Compatibility
//!
//! The flight modes and parameters used are the PX4 ones, the lib is tested against PX4 SITL. Messages are sent
//! using MAVLink 2.
//!
//! ## Usage
//!
//! The basic procedure to use the lib is:
//!  - Get the connection URL, as a config or user input (see [ConnectionUrl])
//!  - Create a Vehicle object from the URL or an opened link, this will wait for an autopilot heartbeat and initialize
//!    the subsystems
//!  - Subsystems are available as public fields of the [Vehicle] struct.
//!  - Use the subsystems in the Vehicle object to control the vehicle
//!  - Drop the Vehicle object or call [Vehicle::disconnect()]
//!
//! All subsystems functions are only taking an un-mutable reference to self (`&self`), the intention is for the
//! Vehicle object to be shared between tasks using `Arc<>`.
//!
//! For example:
//! ``` no_run
//! # use std::time::Duration;
//! # async fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let vehicle = mav_offboard::Vehicle::connect_from_url("udp://:14540", Duration::from_secs(2)).await?;
//!
//! println!("Connected to system {}", vehicle.system_id());
//! println!("Flight mode: {:?}", vehicle.telemetry.flight_mode());
//! println!("{}", vehicle.telemetry.health());
//!
//! vehicle.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! [mavlink]: https://crates.io/crates/mavlink

#![warn(missing_docs)]

mod error;
mod mavlink_utils;
mod vehicle;

pub mod cli;
pub mod keyboard;
pub mod link;
pub mod maneuvers;
pub mod mission;
pub mod subsystems;
pub mod url;

pub use crate::error::{Error, Result};
pub use crate::url::ConnectionUrl;
pub use crate::vehicle::{ComponentDiscovered, ComponentType, Vehicle};

/// MAVLink system id used by this ground station
pub const GCS_SYSTEM_ID: u8 = 245;

/// MAVLink component id used by this ground station (MAV_COMP_ID_MISSIONPLANNER)
pub const GCS_COMPONENT_ID: u8 = 190;
