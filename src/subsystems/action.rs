//! # Action subsystem
//!
//! This subsystem sends the vehicle lifecycle commands: arm, disarm, take off, land and return to launch. Every
//! command is acknowledged by the autopilot, the functions return once the command is accepted and fail with
//! [Error::CommandDenied](crate::Error::CommandDenied) if it is refused.
//!
//! The commands are not waiting for the action to complete. For example [Action::takeoff()] returns as soon as the
//! autopilot has started the takeoff, the [telemetry](crate::subsystems::telemetry) subsystem can be used to follow
//! the vehicle state.
//!
//! ``` no_run
//! # use tokio::time::{sleep, Duration};
//! # async fn hop(vehicle: &mav_offboard::Vehicle) -> mav_offboard::Result<()> {
//! vehicle.action.arm().await?;
//! vehicle.action.set_takeoff_altitude(1.5).await?;
//! vehicle.action.takeoff().await?;
//! sleep(Duration::from_secs(10)).await;
//!
//! vehicle.action.land().await?;
//! while vehicle.telemetry.in_air() {
//!     sleep(Duration::from_secs(1)).await;
//! }
//! # Ok(())
//! # }
//! ```

use flume::{Receiver, Sender};
use futures::lock::Mutex;
use mavlink::common::{MavCmd, MavMessage, MavParamType, PARAM_SET_DATA};
use tokio::time::timeout;

use crate::mavlink_utils::{
    CommandSender, Received, Target, WaitForMessage, COMMAND_RETRIES, COMMAND_TIMEOUT,
};
use crate::{Error, Result};

const TAKEOFF_ALTITUDE_PARAM: &str = "MIS_TAKEOFF_ALT";
const PARAM_ID_LENGTH: usize = 16;

/// # Access to the action subsystem
///
/// See the [action module documentation](crate::subsystems::action) for more context and information.
pub struct Action {
    uplink: Sender<MavMessage>,
    commands: CommandSender,
    param_downlink: Mutex<Receiver<Received>>,
    target: Target,
}

impl Action {
    pub(crate) fn new(
        uplink: Sender<MavMessage>,
        ack_downlink: Receiver<Received>,
        param_downlink: Receiver<Received>,
        target: Target,
    ) -> Self {
        Self {
            commands: CommandSender::new(uplink.clone(), ack_downlink, target),
            uplink,
            param_downlink: Mutex::new(param_downlink),
            target,
        }
    }

    pub(crate) fn is_param_value(message: &MavMessage) -> bool {
        matches!(message, MavMessage::PARAM_VALUE(_))
    }

    /// Arm the motors
    pub async fn arm(&self) -> Result<()> {
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            )
            .await
    }

    /// Disarm the motors
    ///
    /// The autopilot refuses to disarm while flying.
    pub async fn disarm(&self) -> Result<()> {
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            )
            .await
    }

    /// Take off to the takeoff altitude
    ///
    /// The altitude is configured with [Action::set_takeoff_altitude()].
    pub async fn takeoff(&self) -> Result<()> {
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_NAV_TAKEOFF,
                [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN],
            )
            .await
    }

    /// Land at the current position
    pub async fn land(&self) -> Result<()> {
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_NAV_LAND,
                [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN],
            )
            .await
    }

    /// Fly back to the launch position and land
    pub async fn return_to_launch(&self) -> Result<()> {
        self.commands
            .send_command_long(
                MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            )
            .await
    }

    /// Set the altitude above ground reached by [Action::takeoff()] (meters)
    ///
    /// The value is written to the `MIS_TAKEOFF_ALT` parameter, the function returns once the autopilot echoes the
    /// new value.
    pub async fn set_takeoff_altitude(&self, altitude_m: f32) -> Result<()> {
        self.set_param_float(TAKEOFF_ALTITUDE_PARAM, altitude_m).await
    }

    async fn set_param_float(&self, name: &str, value: f32) -> Result<()> {
        let param_id = param_id(name);
        let downlink = self.param_downlink.lock().await;
        while downlink.try_recv().is_ok() {}

        for _ in 0..COMMAND_RETRIES {
            let message = MavMessage::PARAM_SET(PARAM_SET_DATA {
                param_value: value,
                target_system: self.target.system_id,
                target_component: self.target.component_id,
                param_id,
                param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
            });
            self.uplink.send_async(message).await?;

            let echo = timeout(
                COMMAND_TIMEOUT,
                downlink.wait_message(|_, message| match message {
                    MavMessage::PARAM_VALUE(param) if param.param_id == param_id => {
                        Some(param.param_value)
                    }
                    _ => None,
                }),
            )
            .await;

            match echo {
                Ok(Ok(echoed)) if echoed == value => return Ok(()),
                Ok(Ok(echoed)) => {
                    log::warn!("{} set to {} but autopilot reports {}", name, value, echoed);
                    return Err(Error::ParamRejected(name.to_owned()));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => log::debug!("No answer to {} write, retrying", name),
            }
        }

        Err(Error::Timeout)
    }
}

/// Zero padded MAVLink parameter id
fn param_id(name: &str) -> [u8; PARAM_ID_LENGTH] {
    let mut id = [0u8; PARAM_ID_LENGTH];
    let len = name.len().min(PARAM_ID_LENGTH);
    id[..len].copy_from_slice(&name.as_bytes()[..len]);
    id
}
