//! # Telemetry subsystem
//!
//! The autopilot streams its state as a set of periodic MAVLink messages. This subsystem keeps the latest
//! decoded value of the messages the flight script cares about, and lets the user query them at any time:
//!  - Armed state and PX4 flight mode from `HEARTBEAT`
//!  - Global position from `GLOBAL_POSITION_INT`
//!  - Local NED position and velocity from `LOCAL_POSITION_NED`
//!  - Landed state from `EXTENDED_SYS_STATE`
//!  - Sensor calibration and position estimate health from `SYS_STATUS`, `GPS_RAW_INT`, `HOME_POSITION`
//!  - RC link status from `RC_CHANNELS` and `SYS_STATUS`
//!
//! Position updates can also be followed as they arrive with [Telemetry::position_stream()]:
//! ``` no_run
//! # use futures::StreamExt;
//! # async fn altitude(vehicle: &mav_offboard::Vehicle) -> mav_offboard::Result<()> {
//! vehicle.telemetry.set_rate_position(1.0).await?;
//!
//! let mut positions = vehicle.telemetry.position_stream();
//! while let Some(position) = positions.next().await {
//!     println!("Altitude: {} m", position.relative_altitude_m);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use async_broadcast::{broadcast, InactiveReceiver};
use flume::{Receiver, Sender};
use futures::Stream;
use mavlink::common::{
    GpsFixType, MavCmd, MavLandedState, MavMessage, MavModeFlag, MavSysStatusSensor,
};
use mavlink::MavHeader;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::mavlink_utils::{CommandSender, Received, Target};
use crate::Result;

const GLOBAL_POSITION_INT_ID: f32 = 33.0;
const HOME_POSITION_ID: f32 = 242.0;

const POSITION_STREAM_CAPACITY: usize = 16;

/// PX4 main flight modes, as encoded in bits 16..24 of the heartbeat custom mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Px4MainMode {
    Manual = 1,
    Altctl = 2,
    Posctl = 3,
    Auto = 4,
    Acro = 5,
    Offboard = 6,
    Stabilized = 7,
    Rattitude = 8,
}

/// PX4 auto sub modes, as encoded in bits 24..32 of the heartbeat custom mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Px4AutoSubMode {
    Ready = 1,
    Takeoff = 2,
    Loiter = 3,
    Mission = 4,
    Rtl = 5,
    Land = 6,
    FollowTarget = 8,
    Precland = 9,
}

/// Flight mode of the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlightMode {
    /// Mode not (yet) known
    #[default]
    Unknown,
    /// Armed and ready to take off
    Ready,
    /// Taking off
    Takeoff,
    /// Holding position (loiter)
    Hold,
    /// Flying a mission
    Mission,
    /// Returning to the launch point
    ReturnToLaunch,
    /// Landing
    Land,
    /// Following externally provided setpoints
    Offboard,
    /// Following a target
    FollowMe,
    /// Manual control
    Manual,
    /// Altitude control
    Altctl,
    /// Position control
    Posctl,
    /// Acro
    Acro,
    /// Stabilized
    Stabilized,
    /// Rattitude
    Rattitude,
}

impl FlightMode {
    /// Decode a PX4 `HEARTBEAT.custom_mode` value
    pub fn from_px4_custom_mode(custom_mode: u32) -> Self {
        let main = ((custom_mode >> 16) & 0xff) as u8;
        let sub = ((custom_mode >> 24) & 0xff) as u8;

        match Px4MainMode::try_from(main) {
            Ok(Px4MainMode::Manual) => FlightMode::Manual,
            Ok(Px4MainMode::Altctl) => FlightMode::Altctl,
            Ok(Px4MainMode::Posctl) => FlightMode::Posctl,
            Ok(Px4MainMode::Acro) => FlightMode::Acro,
            Ok(Px4MainMode::Offboard) => FlightMode::Offboard,
            Ok(Px4MainMode::Stabilized) => FlightMode::Stabilized,
            Ok(Px4MainMode::Rattitude) => FlightMode::Rattitude,
            Ok(Px4MainMode::Auto) => match Px4AutoSubMode::try_from(sub) {
                Ok(Px4AutoSubMode::Ready) => FlightMode::Ready,
                Ok(Px4AutoSubMode::Takeoff) => FlightMode::Takeoff,
                Ok(Px4AutoSubMode::Loiter) => FlightMode::Hold,
                Ok(Px4AutoSubMode::Mission) => FlightMode::Mission,
                Ok(Px4AutoSubMode::Rtl) => FlightMode::ReturnToLaunch,
                Ok(Px4AutoSubMode::Land) | Ok(Px4AutoSubMode::Precland) => FlightMode::Land,
                Ok(Px4AutoSubMode::FollowTarget) => FlightMode::FollowMe,
                Err(_) => FlightMode::Unknown,
            },
            Err(_) => FlightMode::Unknown,
        }
    }
}

/// Landed state of the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LandedState {
    /// Not reported yet
    #[default]
    Unknown,
    /// On the ground
    OnGround,
    /// Flying
    InAir,
    /// Taking off
    TakingOff,
    /// Landing
    Landing,
}

/// Global position
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    /// Latitude in degrees
    pub latitude_deg: f64,
    /// Longitude in degrees
    pub longitude_deg: f64,
    /// Altitude above mean sea level in meters
    pub absolute_altitude_m: f32,
    /// Altitude above the takeoff point in meters
    pub relative_altitude_m: f32,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[latitude_deg: {:.7}, longitude_deg: {:.7}, absolute_altitude_m: {:.2}, relative_altitude_m: {:.2}]",
            self.latitude_deg, self.longitude_deg, self.absolute_altitude_m, self.relative_altitude_m
        )
    }
}

/// Position in the local North-East-Down frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionNed {
    /// North in meters
    pub north_m: f32,
    /// East in meters
    pub east_m: f32,
    /// Down in meters
    pub down_m: f32,
}

impl fmt::Display for PositionNed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[north_m: {:.2}, east_m: {:.2}, down_m: {:.2}]",
            self.north_m, self.east_m, self.down_m
        )
    }
}

/// Velocity in the local North-East-Down frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityNed {
    /// North in meters/second
    pub north_m_s: f32,
    /// East in meters/second
    pub east_m_s: f32,
    /// Down in meters/second
    pub down_m_s: f32,
}

/// Local position and velocity
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionVelocityNed {
    /// Position
    pub position: PositionNed,
    /// Velocity
    pub velocity: VelocityNed,
}

/// Pre-flight health of the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Health {
    /// Gyrometer calibrated and healthy
    pub is_gyrometer_calibration_ok: bool,
    /// Accelerometer calibrated and healthy
    pub is_accelerometer_calibration_ok: bool,
    /// Magnetometer calibrated and healthy
    pub is_magnetometer_calibration_ok: bool,
    /// Local position estimate available
    pub is_local_position_ok: bool,
    /// Global position estimate (3D GPS fix) available
    pub is_global_position_ok: bool,
    /// Home position set
    pub is_home_position_ok: bool,
}

impl Health {
    /// Every check passes, the vehicle can be armed for a position controlled flight
    pub fn all_ok(&self) -> bool {
        self.is_gyrometer_calibration_ok
            && self.is_accelerometer_calibration_ok
            && self.is_magnetometer_calibration_ok
            && self.is_local_position_ok
            && self.is_global_position_ok
            && self.is_home_position_ok
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gyro calibration: {}", ok_str(self.is_gyrometer_calibration_ok))?;
        writeln!(f, "Accel calibration: {}", ok_str(self.is_accelerometer_calibration_ok))?;
        writeln!(f, "Mag calibration: {}", ok_str(self.is_magnetometer_calibration_ok))?;
        writeln!(f, "Local position: {}", ok_str(self.is_local_position_ok))?;
        writeln!(f, "Global position: {}", ok_str(self.is_global_position_ok))?;
        write!(f, "Home position: {}", ok_str(self.is_home_position_ok))
    }
}

fn ok_str(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "not ok"
    }
}

/// Remote control link status
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RcStatus {
    /// An RC signal has been seen at least once since connection
    pub was_available_once: bool,
    /// The RC signal is currently available
    pub is_available: bool,
    /// Signal strength in percent, NaN when the receiver does not report it
    pub signal_strength_percent: f32,
}

impl Default for RcStatus {
    fn default() -> Self {
        Self {
            was_available_once: false,
            is_available: false,
            signal_strength_percent: f32::NAN,
        }
    }
}

impl fmt::Display for RcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RC status: [was_available_once: {}, is_available: {}, signal_strength_percent: {}]",
            self.was_available_once, self.is_available, self.signal_strength_percent
        )
    }
}

/// Latest decoded telemetry
#[derive(Debug, Clone, Default)]
pub(crate) struct TelemetryState {
    pub armed: bool,
    pub flight_mode: FlightMode,
    pub position: Position,
    pub position_velocity_ned: PositionVelocityNed,
    pub landed_state: LandedState,
    pub in_air: bool,
    pub health: Health,
    pub rc_status: RcStatus,
}

impl TelemetryState {
    /// Update the state from a message sent by the target system
    ///
    /// Returns the new position when the message was a global position update.
    pub fn update(&mut self, header: &MavHeader, message: &MavMessage, target: Target) -> Option<Position> {
        if header.system_id != target.system_id {
            return None;
        }

        match message {
            MavMessage::HEARTBEAT(heartbeat) => {
                if header.component_id != target.component_id {
                    return None;
                }
                self.armed = heartbeat
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.flight_mode = if heartbeat
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED)
                {
                    FlightMode::from_px4_custom_mode(heartbeat.custom_mode)
                } else {
                    FlightMode::Unknown
                };
            }
            MavMessage::GLOBAL_POSITION_INT(global) => {
                self.position = Position {
                    latitude_deg: global.lat as f64 * 1e-7,
                    longitude_deg: global.lon as f64 * 1e-7,
                    absolute_altitude_m: global.alt as f32 * 1e-3,
                    relative_altitude_m: global.relative_alt as f32 * 1e-3,
                };
                return Some(self.position);
            }
            MavMessage::LOCAL_POSITION_NED(local) => {
                self.position_velocity_ned = PositionVelocityNed {
                    position: PositionNed {
                        north_m: local.x,
                        east_m: local.y,
                        down_m: local.z,
                    },
                    velocity: VelocityNed {
                        north_m_s: local.vx,
                        east_m_s: local.vy,
                        down_m_s: local.vz,
                    },
                };
                self.health.is_local_position_ok = true;
            }
            MavMessage::EXTENDED_SYS_STATE(state) => {
                self.landed_state = match state.landed_state {
                    MavLandedState::MAV_LANDED_STATE_ON_GROUND => LandedState::OnGround,
                    MavLandedState::MAV_LANDED_STATE_IN_AIR => LandedState::InAir,
                    MavLandedState::MAV_LANDED_STATE_TAKEOFF => LandedState::TakingOff,
                    MavLandedState::MAV_LANDED_STATE_LANDING => LandedState::Landing,
                    _ => LandedState::Unknown,
                };
                match self.landed_state {
                    LandedState::OnGround => self.in_air = false,
                    LandedState::InAir | LandedState::TakingOff | LandedState::Landing => {
                        self.in_air = true
                    }
                    LandedState::Unknown => (),
                }
            }
            MavMessage::SYS_STATUS(status) => {
                let healthy = |sensor: MavSysStatusSensor| {
                    status.onboard_control_sensors_present.contains(sensor)
                        && status.onboard_control_sensors_health.contains(sensor)
                };
                self.health.is_gyrometer_calibration_ok =
                    healthy(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO);
                self.health.is_accelerometer_calibration_ok =
                    healthy(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL);
                self.health.is_magnetometer_calibration_ok =
                    healthy(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG);

                if status
                    .onboard_control_sensors_present
                    .contains(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_RC_RECEIVER)
                {
                    let available = status
                        .onboard_control_sensors_health
                        .contains(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_RC_RECEIVER);
                    self.rc_status.is_available = available;
                    self.rc_status.was_available_once |= available;
                }
            }
            MavMessage::GPS_RAW_INT(gps) => {
                self.health.is_global_position_ok = matches!(
                    gps.fix_type,
                    GpsFixType::GPS_FIX_TYPE_3D_FIX
                        | GpsFixType::GPS_FIX_TYPE_DGPS
                        | GpsFixType::GPS_FIX_TYPE_RTK_FLOAT
                        | GpsFixType::GPS_FIX_TYPE_RTK_FIXED
                        | GpsFixType::GPS_FIX_TYPE_STATIC
                        | GpsFixType::GPS_FIX_TYPE_PPP
                );
            }
            MavMessage::HOME_POSITION(_) => {
                self.health.is_home_position_ok = true;
            }
            MavMessage::RC_CHANNELS(rc) => {
                // 255: invalid/unknown
                if rc.rssi == 255 {
                    self.rc_status.signal_strength_percent = f32::NAN;
                } else {
                    self.rc_status.signal_strength_percent = rc.rssi as f32 * 100.0 / 254.0;
                    self.rc_status.is_available = rc.rssi > 0;
                    self.rc_status.was_available_once |= rc.rssi > 0;
                }
            }
            _ => (),
        }

        None
    }
}

/// # Access to the telemetry subsystem
///
/// See the [telemetry module documentation](crate::subsystems::telemetry) for more context and information.
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
    commands: CommandSender,
    position_receiver: InactiveReceiver<Position>,
    _telemetry_task: JoinHandle<()>,
}

impl Telemetry {
    pub(crate) fn new(
        uplink: Sender<MavMessage>,
        downlink: Receiver<Received>,
        ack_downlink: Receiver<Received>,
        target: Target,
    ) -> Self {
        let state: Arc<Mutex<TelemetryState>> = Default::default();

        let (mut position_broadcast, position_receiver) = broadcast(POSITION_STREAM_CAPACITY);
        position_broadcast.set_overflow(true);
        let position_receiver = position_receiver.deactivate();

        let task_state = state.clone();
        let _telemetry_task = tokio::spawn(async move {
            while let Ok((header, message)) = downlink.recv_async().await {
                let position = task_state.lock().update(&header, &message, target);

                // Nobody listening is fine, overflow drops the oldest
                if let Some(position) = position {
                    let _ = position_broadcast.try_broadcast(position);
                }
            }
        });

        Self {
            state,
            commands: CommandSender::new(uplink, ack_downlink, target),
            position_receiver,
            _telemetry_task,
        }
    }

    /// Messages decoded by this subsystem
    pub(crate) fn is_telemetry(message: &MavMessage) -> bool {
        matches!(
            message,
            MavMessage::HEARTBEAT(_)
                | MavMessage::GLOBAL_POSITION_INT(_)
                | MavMessage::LOCAL_POSITION_NED(_)
                | MavMessage::EXTENDED_SYS_STATE(_)
                | MavMessage::SYS_STATUS(_)
                | MavMessage::GPS_RAW_INT(_)
                | MavMessage::HOME_POSITION(_)
                | MavMessage::RC_CHANNELS(_)
        )
    }

    pub(crate) fn shared_state(&self) -> Arc<Mutex<TelemetryState>> {
        self.state.clone()
    }

    /// Set the rate at which the global position is streamed, in Hz
    ///
    /// A rate of 0 or less stops the stream.
    pub async fn set_rate_position(&self, rate_hz: f64) -> Result<()> {
        let interval_us = if rate_hz > 0.0 { 1e6 / rate_hz } else { -1.0 };
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                [GLOBAL_POSITION_INT_ID, interval_us as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
            )
            .await
    }

    /// Ask the autopilot to send its home position
    pub async fn request_home_position(&self) -> Result<()> {
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_REQUEST_MESSAGE,
                [HOME_POSITION_ID, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            )
            .await
    }

    /// Stream of global position updates, starting with the next one received
    pub fn position_stream(&self) -> impl Stream<Item = Position> {
        self.position_receiver.activate_cloned()
    }

    /// Motors are armed
    pub fn armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Current flight mode
    pub fn flight_mode(&self) -> FlightMode {
        self.state.lock().flight_mode
    }

    /// Latest global position
    pub fn position(&self) -> Position {
        self.state.lock().position
    }

    /// Latest local position and velocity
    pub fn position_velocity_ned(&self) -> PositionVelocityNed {
        self.state.lock().position_velocity_ned
    }

    /// Latest landed state
    pub fn landed_state(&self) -> LandedState {
        self.state.lock().landed_state
    }

    /// The vehicle is flying (including taking off and landing)
    pub fn in_air(&self) -> bool {
        self.state.lock().in_air
    }

    /// Pre-flight health report
    pub fn health(&self) -> Health {
        self.state.lock().health
    }

    /// All pre-flight health checks pass
    pub fn health_all_ok(&self) -> bool {
        self.state.lock().health.all_ok()
    }

    /// RC link status
    pub fn rc_status(&self) -> RcStatus {
        self.state.lock().rc_status
    }
}
