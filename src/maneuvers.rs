//! # Scripted offboard maneuvers
//!
//! Each maneuver is a fixed list of setpoints, each held for a fixed duration. Running a maneuver sends its initial
//! setpoint (offboard mode is rejected without one), switches to offboard, plays the steps and leaves offboard mode.

use std::f32::consts::PI;
use std::time::Duration;

use clap::ValueEnum;
use tokio::time::sleep;

use crate::subsystems::offboard::{
    Attitude, OffboardControl, PositionNedYaw, Setpoint, VelocityBodyYawspeed, VelocityNedYaw,
};
use crate::Result;

const SWEEP_STEP: f32 = 0.01;
const SWEEP_PERIOD: Duration = Duration::from_millis(10);
const SWEEP_SPEED_M_S: f32 = 5.0;

/// Scripted maneuver pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Maneuver {
    /// Velocity setpoints in the local NED frame
    #[value(name = "ned")]
    VelocityNed,
    /// Velocity setpoints in the body frame
    #[value(name = "body")]
    VelocityBody,
    /// Attitude setpoints
    #[value(name = "attitude")]
    Attitude,
    /// Position setpoints in the local NED frame
    #[value(name = "position-ned")]
    PositionNed,
}

/// One setpoint of a maneuver and how long it is held
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// Logged when the step starts
    pub label: Option<&'static str>,
    /// Setpoint sent at the beginning of the step
    pub setpoint: Setpoint,
    /// Time before the next step
    pub hold: Duration,
}

impl Step {
    fn labelled(label: &'static str, setpoint: Setpoint, hold: Duration) -> Self {
        Self {
            label: Some(label),
            setpoint,
            hold,
        }
    }
}

fn velocity_ned(north_m_s: f32, east_m_s: f32, down_m_s: f32, yaw_deg: f32) -> Setpoint {
    Setpoint::VelocityNed(VelocityNedYaw {
        north_m_s,
        east_m_s,
        down_m_s,
        yaw_deg,
    })
}

fn velocity_body(forward_m_s: f32, right_m_s: f32, down_m_s: f32, yawspeed_deg_s: f32) -> Setpoint {
    Setpoint::VelocityBody(VelocityBodyYawspeed {
        forward_m_s,
        right_m_s,
        down_m_s,
        yawspeed_deg_s,
    })
}

fn attitude(roll_deg: f32, pitch_deg: f32, yaw_deg: f32, thrust_value: f32) -> Setpoint {
    Setpoint::Attitude(Attitude {
        roll_deg,
        pitch_deg,
        yaw_deg,
        thrust_value,
    })
}

fn position_ned(north_m: f32, east_m: f32, down_m: f32, yaw_deg: f32) -> Setpoint {
    Setpoint::PositionNed(PositionNedYaw {
        north_m,
        east_m,
        down_m,
        yaw_deg,
    })
}

impl Maneuver {
    /// Tag prefixing the log lines of the maneuver
    pub fn tag(&self) -> &'static str {
        match self {
            Maneuver::VelocityNed => "NED",
            Maneuver::VelocityBody => "BODY",
            Maneuver::Attitude => "ATTITUDE",
            Maneuver::PositionNed => "POSITION_NED",
        }
    }

    /// Setpoint streamed before switching to offboard
    pub fn initial_setpoint(&self) -> Setpoint {
        match self {
            Maneuver::VelocityNed => velocity_ned(0.0, 0.0, 0.0, 0.0),
            Maneuver::VelocityBody => velocity_body(0.0, 0.0, 0.0, 0.0),
            Maneuver::Attitude => attitude(30.0, 0.0, 0.0, 0.6),
            Maneuver::PositionNed => position_ned(0.0, 0.0, -1.5, 0.0),
        }
    }

    /// The scripted steps
    pub fn steps(&self) -> Vec<Step> {
        let secs = Duration::from_secs;

        match self {
            Maneuver::VelocityNed => {
                let mut steps = vec![Step::labelled(
                    "Turn to face East",
                    velocity_ned(0.0, 0.0, 0.0, 90.0),
                    secs(1),
                )];

                // Two periods of a sine on the north velocity
                let count = 2 * (2.0 * PI / SWEEP_STEP) as usize;
                steps.extend((0..count).map(|i| Step {
                    label: (i == 0).then_some("Go North and back South"),
                    setpoint: velocity_ned(
                        SWEEP_SPEED_M_S * (i as f32 * SWEEP_STEP).sin(),
                        0.0,
                        0.0,
                        90.0,
                    ),
                    hold: SWEEP_PERIOD,
                }));

                steps.extend([
                    Step::labelled("Turn to face West", velocity_ned(0.0, 0.0, 0.0, 270.0), secs(2)),
                    Step::labelled(
                        "Go up 2 m/s, turn to face South",
                        velocity_ned(0.0, 0.0, -2.0, 180.0),
                        secs(4),
                    ),
                    Step::labelled(
                        "Go down 1 m/s, turn to face North",
                        velocity_ned(0.0, 0.0, 1.0, 0.0),
                        secs(4),
                    ),
                ]);
                steps
            }
            Maneuver::VelocityBody => vec![
                Step::labelled("Turn clock-wise and climb", velocity_body(0.0, 0.0, -1.0, 60.0), secs(5)),
                Step::labelled("Turn back anti-clockwise", velocity_body(0.0, 0.0, 0.0, -60.0), secs(5)),
                Step::labelled("Wait for a bit", velocity_body(0.0, 0.0, 0.0, 0.0), secs(2)),
                Step::labelled("Fly a circle", velocity_body(5.0, 0.0, 0.0, 30.0), secs(15)),
                Step::labelled("Wait for a bit", velocity_body(0.0, 0.0, 0.0, 0.0), secs(5)),
                Step::labelled("Fly a circle sideways", velocity_body(0.0, -5.0, 0.0, 30.0), secs(15)),
                Step::labelled("Wait for a bit", velocity_body(0.0, 0.0, 0.0, 0.0), secs(8)),
            ],
            Maneuver::Attitude => vec![
                Step::labelled("ROLL 30", attitude(30.0, 0.0, 0.0, 0.6), secs(2)),
                Step::labelled("ROLL -30", attitude(-30.0, 0.0, 0.0, 0.6), secs(2)),
                Step::labelled("ROLL 0", attitude(0.0, 0.0, 0.0, 0.6), secs(2)),
            ],
            Maneuver::PositionNed => vec![
                Step::labelled("1 0 1.5 0", position_ned(1.0, 0.0, -1.5, 0.0), secs(5)),
                Step::labelled("1 1 1.5 0", position_ned(1.0, 1.0, -1.5, 0.0), secs(5)),
                Step::labelled("2 2 1.5 0", position_ned(2.0, 2.0, -1.5, 0.0), secs(5)),
                Step::labelled("0 0 1.5 0", position_ned(0.0, 0.0, -1.5, 0.0), secs(5)),
            ],
        }
    }
}

/// Fly a maneuver in offboard mode
///
/// Offboard mode is left at the end of the maneuver. Any error stops the maneuver and is returned as is, the vehicle
/// is then left in whatever mode it is.
pub async fn run_maneuver(control: &dyn OffboardControl, maneuver: Maneuver) -> Result<()> {
    let tag = maneuver.tag();

    control.set_setpoint(maneuver.initial_setpoint()).await?;
    control.start().await?;
    log::info!("[{}] Offboard started", tag);

    for step in maneuver.steps() {
        if let Some(label) = step.label {
            log::info!("[{}] {}", tag, label);
        }
        control.set_setpoint(step.setpoint).await?;
        sleep(step.hold).await;
    }

    control.stop().await?;
    log::info!("[{}] Offboard stopped", tag);

    Ok(())
}
