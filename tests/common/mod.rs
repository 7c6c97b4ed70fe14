// Simulated PX4 autopilot used by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use mav_offboard::link::MavLink;
use mav_offboard::{Error, Result};
use mavlink::common::*;
use mavlink::MavHeader;
use parking_lot::Mutex;

pub const SYSTEM_ID: u8 = 1;
pub const AUTOPILOT_ID: u8 = 1;

const TICK: Duration = Duration::from_millis(10);
const TELEMETRY_PERIOD: Duration = Duration::from_millis(100);

/// Vehicle side of the simulated link
pub struct SimLink {
    to_autopilot: Sender<MavMessage>,
    from_autopilot: Receiver<(MavHeader, MavMessage)>,
}

impl MavLink for SimLink {
    fn send(&self, message: &MavMessage) -> Result<()> {
        self.to_autopilot
            .send(message.clone())
            .map_err(|_| Error::Disconnected)
    }

    fn recv(&self) -> Result<(MavHeader, MavMessage)> {
        self.from_autopilot.recv().map_err(|_| Error::Disconnected)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Never send anything
    pub silent: bool,
    /// Report failing sensors and no GPS fix
    pub unhealthy: bool,
    /// Commands answered with MAV_RESULT_DENIED
    pub denied: Vec<MavCmd>,
    /// Commands never answered
    pub ignored: Vec<MavCmd>,
    /// Value echoed for every parameter write instead of the written one
    pub param_override: Option<f32>,
    /// Heartbeats of other components of the system
    pub extra_components: Vec<u8>,
    /// Time from an accepted land command to touchdown
    pub land_delay: Duration,
}

#[derive(Debug, Default)]
pub struct SimState {
    pub received: Vec<MavMessage>,
    pub armed: bool,
    pub in_air: bool,
    pub custom_mode: u32,
    pub params: HashMap<String, f32>,
    pub landed_at: Option<Instant>,
}

impl SimState {
    pub fn commands(&self) -> Vec<MavCmd> {
        self.received
            .iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_LONG(c) => Some(c.command),
                _ => None,
            })
            .collect()
    }

    pub fn setpoint_count(&self) -> usize {
        self.received
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    MavMessage::SET_POSITION_TARGET_LOCAL_NED(_) | MavMessage::SET_ATTITUDE_TARGET(_)
                )
            })
            .count()
    }

    pub fn main_mode(&self) -> u8 {
        ((self.custom_mode >> 16) & 0xff) as u8
    }
}

pub struct SimAutopilot {
    pub state: Arc<Mutex<SimState>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimAutopilot {
    pub fn start(config: SimConfig) -> (Self, Arc<SimLink>) {
        let (to_autopilot, autopilot_rx) = flume::unbounded();
        let (autopilot_tx, from_autopilot) = flume::unbounded();

        let state: Arc<Mutex<SimState>> = Default::default();
        let stop = Arc::new(AtomicBool::new(false));

        let mut sim = Sim {
            config,
            state: state.clone(),
            stop: stop.clone(),
            tx: autopilot_tx,
            sequence: 0,
            touchdown: None,
        };
        let thread = std::thread::spawn(move || sim.run(autopilot_rx));

        (
            Self {
                state,
                stop,
                thread: Some(thread),
            },
            Arc::new(SimLink {
                to_autopilot,
                from_autopilot,
            }),
        )
    }
}

impl Drop for SimAutopilot {
    fn drop(&mut self) {
        self.stop.store(true, Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Sim {
    config: SimConfig,
    state: Arc<Mutex<SimState>>,
    stop: Arc<AtomicBool>,
    tx: Sender<(MavHeader, MavMessage)>,
    sequence: u8,
    touchdown: Option<Instant>,
}

impl Sim {
    fn run(&mut self, rx: Receiver<MavMessage>) {
        let mut last_telemetry: Option<Instant> = None;

        while !self.stop.load(Relaxed) {
            match rx.recv_timeout(TICK) {
                Ok(message) => {
                    if !self.config.silent && !self.handle(&message) {
                        return;
                    }
                    self.state.lock().received.push(message);
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            if self.config.silent {
                continue;
            }
            if self.touchdown.is_some_and(|t| Instant::now() >= t) {
                self.touchdown = None;
                let mut state = self.state.lock();
                state.in_air = false;
                state.landed_at = Some(Instant::now());
            }
            if last_telemetry.map_or(true, |t| t.elapsed() >= TELEMETRY_PERIOD) {
                last_telemetry = Some(Instant::now());
                if !self.send_telemetry() {
                    return;
                }
            }
        }
    }

    fn send(&mut self, component_id: u8, message: MavMessage) -> bool {
        let header = MavHeader {
            system_id: SYSTEM_ID,
            component_id,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.tx.send((header, message)).is_ok()
    }

    fn send_telemetry(&mut self) -> bool {
        let (armed, in_air, custom_mode) = {
            let state = self.state.lock();
            (state.armed, state.in_air, state.custom_mode)
        };

        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        let heartbeat = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode,
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        });

        let sensors = MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_RC_RECEIVER;
        let sys_status = MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            onboard_control_sensors_present: sensors,
            onboard_control_sensors_enabled: sensors,
            onboard_control_sensors_health: if self.config.unhealthy {
                MavSysStatusSensor::empty()
            } else {
                sensors
            },
            ..Default::default()
        });

        let gps = MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
            fix_type: if self.config.unhealthy {
                GpsFixType::GPS_FIX_TYPE_NO_FIX
            } else {
                GpsFixType::GPS_FIX_TYPE_3D_FIX
            },
            satellites_visible: 12,
            ..Default::default()
        });

        let relative_alt = if in_air { 1500 } else { 0 };
        let global = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 473_977_420,
            lon: 85_455_940,
            alt: 488_000 + relative_alt,
            relative_alt,
            ..Default::default()
        });

        let local = MavMessage::LOCAL_POSITION_NED(LOCAL_POSITION_NED_DATA {
            z: -(relative_alt as f32) / 1000.0,
            ..Default::default()
        });

        let extended = MavMessage::EXTENDED_SYS_STATE(EXTENDED_SYS_STATE_DATA {
            landed_state: if in_air {
                MavLandedState::MAV_LANDED_STATE_IN_AIR
            } else {
                MavLandedState::MAV_LANDED_STATE_ON_GROUND
            },
            ..Default::default()
        });

        let mut messages = vec![heartbeat, sys_status, gps, global, extended];
        if !self.config.unhealthy {
            messages.push(local);
            messages.push(MavMessage::HOME_POSITION(Default::default()));
        }

        for message in messages {
            if !self.send(AUTOPILOT_ID, message) {
                return false;
            }
        }

        for component_id in self.config.extra_components.clone() {
            let heartbeat = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
                custom_mode: 0,
                mavtype: MavType::MAV_TYPE_CAMERA,
                autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
                base_mode: MavModeFlag::empty(),
                system_status: MavState::MAV_STATE_ACTIVE,
                mavlink_version: 3,
            });
            if !self.send(component_id, heartbeat) {
                return false;
            }
        }

        true
    }

    fn handle(&mut self, message: &MavMessage) -> bool {
        match message {
            MavMessage::COMMAND_LONG(command) => {
                if self.config.ignored.contains(&command.command) {
                    return true;
                }
                let result = if self.config.denied.contains(&command.command) {
                    MavResult::MAV_RESULT_DENIED
                } else {
                    self.apply(command);
                    MavResult::MAV_RESULT_ACCEPTED
                };
                self.send(
                    AUTOPILOT_ID,
                    MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                        command: command.command,
                        result,
                        ..Default::default()
                    }),
                )
            }
            MavMessage::PARAM_SET(param) => {
                let name = String::from_utf8_lossy(&param.param_id)
                    .trim_end_matches('\0')
                    .to_owned();
                let value = self.config.param_override.unwrap_or(param.param_value);
                self.state.lock().params.insert(name, value);
                self.send(
                    AUTOPILOT_ID,
                    MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
                        param_value: value,
                        param_count: 1,
                        param_index: 0,
                        param_id: param.param_id,
                        param_type: param.param_type,
                    }),
                )
            }
            _ => true,
        }
    }

    fn apply(&mut self, command: &COMMAND_LONG_DATA) {
        let mut state = self.state.lock();
        match command.command {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => state.armed = command.param1 == 1.0,
            MavCmd::MAV_CMD_NAV_TAKEOFF => state.in_air = true,
            MavCmd::MAV_CMD_NAV_LAND => {
                let now = Instant::now();
                if self.config.land_delay.is_zero() {
                    state.in_air = false;
                    state.landed_at = Some(now);
                } else {
                    self.touchdown = Some(now + self.config.land_delay);
                }
            }
            MavCmd::MAV_CMD_DO_SET_MODE => {
                state.custom_mode = ((command.param2 as u32) << 16) | ((command.param3 as u32) << 24);
            }
            _ => (),
        }
    }
}

/// Wait until `condition` holds, or panic after `limit`
pub async fn eventually<F: FnMut() -> bool>(mut condition: F, limit: Duration) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < limit, "condition not met within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
