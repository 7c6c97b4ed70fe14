//! # Offboard control subsystem
//!
//! In offboard mode the autopilot follows setpoints streamed by the ground: positions or velocities in the local
//! North-East-Down frame, velocities in the body frame, or attitudes. The setpoints are described as low-level in the
//! sense that they are setting the instant target state.
//!
//! The autopilot has a couple of safety mechanisms that one needs to be aware of in order to use offboard mode:
//!  - The setpoint stream must be running *before* switching to offboard mode, otherwise the mode change is rejected.
//!    This is why [Offboard::start()] returns [Error::NoSetpointSet] if no setpoint has been set yet.
//!  - If setpoints stop arriving (PX4 allows 0.5 seconds), the autopilot leaves offboard mode and triggers its
//!    failsafe. Once a setpoint is set, this subsystem re-sends the latest one at 20 Hz until [Offboard::stop()].
//!
//! The following example code would climb for two seconds and hold position:
//! ``` no_run
//! # use tokio::time::{sleep, Duration};
//! # use mav_offboard::subsystems::offboard::VelocityNedYaw;
//! # async fn climb(vehicle: mav_offboard::Vehicle) -> mav_offboard::Result<()> {
//! // Stream a still setpoint, then switch mode
//! vehicle.offboard.set_velocity_ned(VelocityNedYaw::default()).await?;
//! vehicle.offboard.start().await?;
//!
//! vehicle.offboard.set_velocity_ned(VelocityNedYaw { down_m_s: -1.0, ..Default::default() }).await?;
//! sleep(Duration::from_secs(2)).await;
//!
//! // Hold
//! vehicle.offboard.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flume::{Receiver, Sender};
use mavlink::common::{
    AttitudeTargetTypemask, MavCmd, MavFrame, MavMessage, MavModeFlag, PositionTargetTypemask,
    SET_ATTITUDE_TARGET_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::mavlink_utils::{CommandSender, Received, Target};
use crate::subsystems::telemetry::{FlightMode, Px4AutoSubMode, Px4MainMode, TelemetryState};
use crate::{Error, Result};

const STREAMING_PERIOD: Duration = Duration::from_millis(50);

/// Position in the NED frame with an absolute yaw
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionNedYaw {
    /// North from the local origin (meters)
    pub north_m: f32,
    /// East from the local origin (meters)
    pub east_m: f32,
    /// Down from the local origin (meters, negative is up)
    pub down_m: f32,
    /// Heading, 0 is North, positive clockwise (degrees)
    pub yaw_deg: f32,
}

/// Velocity in the NED frame with an absolute yaw
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityNedYaw {
    /// Velocity North (meters/second)
    pub north_m_s: f32,
    /// Velocity East (meters/second)
    pub east_m_s: f32,
    /// Velocity Down (meters/second)
    pub down_m_s: f32,
    /// Heading, 0 is North, positive clockwise (degrees)
    pub yaw_deg: f32,
}

/// Velocity in the body frame with a yaw rate
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityBodyYawspeed {
    /// Velocity forward (meters/second)
    pub forward_m_s: f32,
    /// Velocity to the right (meters/second)
    pub right_m_s: f32,
    /// Velocity down (meters/second)
    pub down_m_s: f32,
    /// Yaw rate, positive clockwise (degrees/second)
    pub yawspeed_deg_s: f32,
}

/// Attitude and collective thrust
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    /// Roll angle, positive right wing down (degrees)
    pub roll_deg: f32,
    /// Pitch angle, positive nose up (degrees)
    pub pitch_deg: f32,
    /// Yaw angle, positive clockwise (degrees)
    pub yaw_deg: f32,
    /// Thrust from 0 to 1
    pub thrust_value: f32,
}

/// Any offboard setpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setpoint {
    /// Position in the NED frame
    PositionNed(PositionNedYaw),
    /// Velocity in the NED frame
    VelocityNed(VelocityNedYaw),
    /// Velocity in the body frame
    VelocityBody(VelocityBodyYawspeed),
    /// Attitude
    Attitude(Attitude),
}

impl Setpoint {
    pub(crate) fn to_message(&self, target: Target, time_boot_ms: u32) -> MavMessage {
        let ignore_acceleration = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE;
        let ignore_velocity = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE;
        let ignore_position = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE;

        let local_ned = SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms,
            target_system: target.system_id,
            target_component: target.component_id,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            ..Default::default()
        };

        match *self {
            Setpoint::PositionNed(p) => {
                MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
                    x: p.north_m,
                    y: p.east_m,
                    z: p.down_m,
                    yaw: p.yaw_deg.to_radians(),
                    type_mask: ignore_velocity
                        | ignore_acceleration
                        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE,
                    ..local_ned
                })
            }
            Setpoint::VelocityNed(v) => {
                MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
                    vx: v.north_m_s,
                    vy: v.east_m_s,
                    vz: v.down_m_s,
                    yaw: v.yaw_deg.to_radians(),
                    type_mask: ignore_position
                        | ignore_acceleration
                        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE,
                    ..local_ned
                })
            }
            Setpoint::VelocityBody(v) => {
                MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
                    vx: v.forward_m_s,
                    vy: v.right_m_s,
                    vz: v.down_m_s,
                    yaw_rate: v.yawspeed_deg_s.to_radians(),
                    coordinate_frame: MavFrame::MAV_FRAME_BODY_NED,
                    type_mask: ignore_position
                        | ignore_acceleration
                        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE,
                    ..local_ned
                })
            }
            Setpoint::Attitude(a) => MavMessage::SET_ATTITUDE_TARGET(SET_ATTITUDE_TARGET_DATA {
                time_boot_ms,
                target_system: target.system_id,
                target_component: target.component_id,
                q: quaternion_from_euler_deg(a.roll_deg, a.pitch_deg, a.yaw_deg),
                thrust: a.thrust_value,
                type_mask: AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_ROLL_RATE_IGNORE
                    | AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_PITCH_RATE_IGNORE
                    | AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_YAW_RATE_IGNORE,
                ..Default::default()
            }),
        }
    }
}

/// Hamilton quaternion `[w, x, y, z]` for a Z-Y-X (yaw, pitch, roll) rotation
fn quaternion_from_euler_deg(roll_deg: f32, pitch_deg: f32, yaw_deg: f32) -> [f32; 4] {
    let (sr, cr) = (roll_deg.to_radians() / 2.0).sin_cos();
    let (sp, cp) = (pitch_deg.to_radians() / 2.0).sin_cos();
    let (sy, cy) = (yaw_deg.to_radians() / 2.0).sin_cos();

    [
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    ]
}

/// Setpoint sink used by the flight scripts
///
/// Implemented by [Offboard], the flight script code only depends on this trait so that it can be exercised without
/// a vehicle.
#[async_trait]
pub trait OffboardControl: Send + Sync {
    /// Set the current setpoint
    async fn set_setpoint(&self, setpoint: Setpoint) -> Result<()>;
    /// Switch the vehicle to offboard mode
    async fn start(&self) -> Result<()>;
    /// Leave offboard mode
    async fn stop(&self) -> Result<()>;
}

/// # Offboard control subsystem
///
/// This struct implements methods to stream offboard setpoints and to switch the vehicle in and out of offboard
/// mode. See the [offboard module documentation](crate::subsystems::offboard) for more context and information.
pub struct Offboard {
    uplink: Sender<MavMessage>,
    commands: CommandSender,
    telemetry: Arc<Mutex<TelemetryState>>,
    setpoint: Arc<Mutex<Option<Setpoint>>>,
    streaming_task: Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
}

impl Offboard {
    pub(crate) fn new(
        uplink: Sender<MavMessage>,
        ack_downlink: Receiver<Received>,
        target: Target,
        telemetry: Arc<Mutex<TelemetryState>>,
    ) -> Self {
        Self {
            commands: CommandSender::new(uplink.clone(), ack_downlink, target),
            uplink,
            telemetry,
            setpoint: Default::default(),
            streaming_task: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    /// Set a position setpoint in the local NED frame
    pub async fn set_position_ned(&self, position: PositionNedYaw) -> Result<()> {
        self.set(Setpoint::PositionNed(position)).await
    }

    /// Set a velocity setpoint in the local NED frame
    pub async fn set_velocity_ned(&self, velocity: VelocityNedYaw) -> Result<()> {
        self.set(Setpoint::VelocityNed(velocity)).await
    }

    /// Set a velocity setpoint in the body frame
    pub async fn set_velocity_body(&self, velocity: VelocityBodyYawspeed) -> Result<()> {
        self.set(Setpoint::VelocityBody(velocity)).await
    }

    /// Set an attitude setpoint
    pub async fn set_attitude(&self, attitude: Attitude) -> Result<()> {
        self.set(Setpoint::Attitude(attitude)).await
    }

    /// Start offboard mode
    ///
    /// Returns [Error::NoSetpointSet] if no setpoint has been set yet, or the error of the mode change command.
    pub async fn start(&self) -> Result<()> {
        if self.setpoint.lock().is_none() {
            return Err(Error::NoSetpointSet);
        }

        self.set_px4_mode(Px4MainMode::Offboard, 0).await
    }

    /// Stop offboard mode
    ///
    /// The vehicle is switched to hold (loiter) and the setpoint stream is stopped.
    pub async fn stop(&self) -> Result<()> {
        self.set_px4_mode(Px4MainMode::Auto, Px4AutoSubMode::Loiter.into())
            .await?;
        self.stop_streaming();
        Ok(())
    }

    /// The vehicle currently reports offboard flight mode
    pub fn is_active(&self) -> bool {
        self.telemetry.lock().flight_mode == FlightMode::Offboard
    }

    /// Stop re-sending setpoints, without changing the flight mode
    pub(crate) fn stop_streaming(&self) {
        *self.setpoint.lock() = None;
        if let Some(task) = self.streaming_task.lock().take() {
            task.abort();
        }
    }

    async fn set(&self, setpoint: Setpoint) -> Result<()> {
        *self.setpoint.lock() = Some(setpoint);

        let target = self.commands.target();
        self.uplink
            .send_async(setpoint.to_message(target, self.time_boot_ms()))
            .await?;

        self.ensure_streaming();
        Ok(())
    }

    fn ensure_streaming(&self) {
        let mut task = self.streaming_task.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }

        let uplink = self.uplink.clone();
        let setpoint = self.setpoint.clone();
        let target = self.commands.target();
        let epoch = self.epoch;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STREAMING_PERIOD);
            loop {
                interval.tick().await;
                let current = *setpoint.lock();
                let Some(current) = current else { return };
                let time_boot_ms = epoch.elapsed().as_millis() as u32;
                if uplink
                    .send_async(current.to_message(target, time_boot_ms))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }));
    }

    async fn set_px4_mode(&self, main: Px4MainMode, sub: u8) -> Result<()> {
        let main: u8 = main.into();
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_DO_SET_MODE,
                [
                    MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                    main as f32,
                    sub as f32,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                ],
            )
            .await
    }

    fn time_boot_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

impl Drop for Offboard {
    fn drop(&mut self) {
        if let Some(task) = self.streaming_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl OffboardControl for Offboard {
    async fn set_setpoint(&self, setpoint: Setpoint) -> Result<()> {
        self.set(setpoint).await
    }

    async fn start(&self) -> Result<()> {
        Offboard::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        Offboard::stop(self).await
    }
}
