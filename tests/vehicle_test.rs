// Vehicle, action, offboard and telemetry against a simulated autopilot

mod common;

use std::time::Duration;

use common::{eventually, SimAutopilot, SimConfig, AUTOPILOT_ID, SYSTEM_ID};
use futures::StreamExt;
use mav_offboard::subsystems::offboard::VelocityNedYaw;
use mav_offboard::subsystems::telemetry::FlightMode;
use mav_offboard::{ComponentType, Error, Vehicle};
use mavlink::common::{MavCmd, MavMessage, MavResult, MavType};
use tokio::time::timeout;

const DISCOVERY: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_secs(2);

#[tokio::test]
async fn discovers_autopilot_and_components() -> Result<(), Box<dyn std::error::Error>> {
    let (sim, link) = SimAutopilot::start(SimConfig {
        extra_components: vec![100],
        ..Default::default()
    });

    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;
    assert_eq!(vehicle.system_id(), SYSTEM_ID);

    let mut components = Box::pin(vehicle.components());
    let first = timeout(SETTLE, components.next()).await?.unwrap();
    assert_eq!(first.component_id, AUTOPILOT_ID);
    assert_eq!(first.component_type, ComponentType::Autopilot);

    let second = timeout(SETTLE, components.next()).await?.unwrap();
    assert_eq!(second.component_id, 100);
    assert_eq!(second.component_type, ComponentType::Camera);

    // The ground station announces itself
    eventually(
        || {
            sim.state.lock().received.iter().any(|m| {
                matches!(m, MavMessage::HEARTBEAT(h) if h.mavtype == MavType::MAV_TYPE_GCS)
            })
        },
        SETTLE,
    )
    .await;

    vehicle.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn silent_link_finds_no_system() {
    let (_sim, link) = SimAutopilot::start(SimConfig {
        silent: true,
        ..Default::default()
    });

    let result = Vehicle::connect_from_link(link, Duration::from_millis(300)).await;
    assert!(matches!(result, Err(Error::NoSystemFound)));
}

#[tokio::test]
async fn arm_is_reflected_in_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    let (sim, link) = SimAutopilot::start(SimConfig::default());
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    vehicle.action.arm().await?;
    assert!(sim.state.lock().armed);
    eventually(|| vehicle.telemetry.armed(), SETTLE).await;

    vehicle.action.disarm().await?;
    eventually(|| !vehicle.telemetry.armed(), SETTLE).await;
    Ok(())
}

#[tokio::test]
async fn denied_command_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let (_sim, link) = SimAutopilot::start(SimConfig {
        denied: vec![MavCmd::MAV_CMD_COMPONENT_ARM_DISARM],
        ..Default::default()
    });
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    match vehicle.action.arm().await {
        Err(Error::CommandDenied { command, result }) => {
            assert_eq!(command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
            assert_eq!(result, MavResult::MAV_RESULT_DENIED);
        }
        other => panic!("unexpected arm result {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn unanswered_command_is_retried_then_times_out() -> Result<(), Box<dyn std::error::Error>> {
    let (sim, link) = SimAutopilot::start(SimConfig {
        ignored: vec![MavCmd::MAV_CMD_NAV_TAKEOFF],
        ..Default::default()
    });
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    assert!(matches!(vehicle.action.takeoff().await, Err(Error::Timeout)));

    eventually(
        || {
            let state = sim.state.lock();
            state
                .commands()
                .iter()
                .filter(|&&c| c == MavCmd::MAV_CMD_NAV_TAKEOFF)
                .count()
                == 3
        },
        SETTLE,
    )
    .await;
    Ok(())
}

#[tokio::test]
async fn takeoff_altitude_is_written() -> Result<(), Box<dyn std::error::Error>> {
    let (sim, link) = SimAutopilot::start(SimConfig::default());
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    vehicle.action.set_takeoff_altitude(2.5).await?;
    assert_eq!(sim.state.lock().params.get("MIS_TAKEOFF_ALT"), Some(&2.5));
    Ok(())
}

#[tokio::test]
async fn takeoff_altitude_mismatch_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let (_sim, link) = SimAutopilot::start(SimConfig {
        param_override: Some(2.5),
        ..Default::default()
    });
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    let result = vehicle.action.set_takeoff_altitude(1.5).await;
    assert!(matches!(result, Err(Error::ParamRejected(name)) if name == "MIS_TAKEOFF_ALT"));
    Ok(())
}

#[tokio::test]
async fn offboard_needs_a_setpoint() -> Result<(), Box<dyn std::error::Error>> {
    let (sim, link) = SimAutopilot::start(SimConfig::default());
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    assert!(matches!(vehicle.offboard.start().await, Err(Error::NoSetpointSet)));
    assert!(!sim
        .state
        .lock()
        .commands()
        .contains(&MavCmd::MAV_CMD_DO_SET_MODE));
    Ok(())
}

#[tokio::test]
async fn offboard_streams_setpoints_until_stopped() -> Result<(), Box<dyn std::error::Error>> {
    let (sim, link) = SimAutopilot::start(SimConfig::default());
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    vehicle
        .offboard
        .set_velocity_ned(VelocityNedYaw::default())
        .await?;
    vehicle.offboard.start().await?;
    assert_eq!(sim.state.lock().main_mode(), 6);
    eventually(|| vehicle.offboard.is_active(), SETTLE).await;

    // Re-sent at 20 Hz
    let before = sim.state.lock().setpoint_count();
    eventually(|| sim.state.lock().setpoint_count() >= before + 5, SETTLE).await;

    vehicle.offboard.stop().await?;
    assert_eq!(sim.state.lock().main_mode(), 4);
    eventually(
        || vehicle.telemetry.flight_mode() == FlightMode::Hold,
        SETTLE,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = sim.state.lock().setpoint_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sim.state.lock().setpoint_count(), stopped);
    Ok(())
}

#[tokio::test]
async fn telemetry_follows_the_vehicle() -> Result<(), Box<dyn std::error::Error>> {
    let (_sim, link) = SimAutopilot::start(SimConfig::default());
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    vehicle.telemetry.set_rate_position(10.0).await?;
    vehicle.telemetry.request_home_position().await?;

    eventually(|| vehicle.telemetry.health_all_ok(), SETTLE).await;
    assert!(vehicle.telemetry.rc_status().is_available);
    assert!(!vehicle.telemetry.in_air());

    let mut positions = Box::pin(vehicle.telemetry.position_stream());
    let position = timeout(SETTLE, positions.next()).await?.unwrap();
    assert!((position.latitude_deg - 47.397742).abs() < 1e-6);
    assert_eq!(position.relative_altitude_m, 0.0);

    vehicle.action.takeoff().await?;
    eventually(|| vehicle.telemetry.in_air(), SETTLE).await;
    eventually(
        || vehicle.telemetry.position_velocity_ned().position.down_m < -1.0,
        SETTLE,
    )
    .await;
    Ok(())
}

#[tokio::test]
async fn unhealthy_vehicle_reports_failing_checks() -> Result<(), Box<dyn std::error::Error>> {
    let (_sim, link) = SimAutopilot::start(SimConfig {
        unhealthy: true,
        ..Default::default()
    });
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = vehicle.telemetry.health();
    assert!(!health.all_ok());
    assert!(!health.is_gyrometer_calibration_ok);
    assert!(!health.is_global_position_ok);
    Ok(())
}

#[tokio::test]
async fn disconnected_vehicle_refuses_commands() -> Result<(), Box<dyn std::error::Error>> {
    let (_sim, link) = SimAutopilot::start(SimConfig::default());
    let vehicle = Vehicle::connect_from_link(link, DISCOVERY).await?;

    vehicle.disconnect().await;
    assert!(vehicle.action.arm().await.is_err());
    Ok(())
}
