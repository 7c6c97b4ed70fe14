use crate::link::{MavLink, MavlinkConnection};
use crate::mavlink_utils::{spawn_uplink, CommandSender, MavlinkDispatch, Target, WaitForMessage};
use crate::subsystems::action::Action;
use crate::subsystems::offboard::Offboard;
use crate::subsystems::telemetry::Telemetry;
use crate::url::ConnectionUrl;
use crate::{Error, Result};
use async_broadcast::{broadcast, InactiveReceiver};
use flume as channel;
use futures::lock::Mutex;
use futures::{Stream, StreamExt};
use mavlink::common::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const GCS_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
const COMPONENT_STREAM_CAPACITY: usize = 16;

/// Kind of component found on the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    /// Component id not known by the lib
    Unknown,
    /// Flight controller
    Autopilot,
    /// Camera
    Camera,
    /// Gimbal
    Gimbal,
}

impl ComponentType {
    /// Classify a MAVLink component id
    pub fn from_component_id(component_id: u8) -> Self {
        match component_id {
            1 => ComponentType::Autopilot,
            100..=105 => ComponentType::Camera,
            154 | 171..=175 => ComponentType::Gimbal,
            _ => ComponentType::Unknown,
        }
    }
}

/// A component of the vehicle that sent its first heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentDiscovered {
    /// MAVLink component id
    pub component_id: u8,
    /// Kind of component
    pub component_type: ComponentType,
}

/// # The vehicle
///
/// This struct is one-time use: Creating it will connect to a vehicle and once disconnected, either as requested
/// by the lib user or as a result of a connection loss, the object cannot be reconnected. A new one need to be created
/// to connect again.
///
/// See the [crate root documentation](crate) for more context and information.
pub struct Vehicle {
    /// Arm/takeoff/land commands
    pub action: Action,
    /// Offboard setpoints and mode
    pub offboard: Offboard,
    /// Vehicle state
    pub telemetry: Telemetry,
    system_id: u8,
    components: Arc<parking_lot::Mutex<Vec<ComponentDiscovered>>>,
    component_receiver: InactiveReceiver<ComponentDiscovered>,
    uplink_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    _dispatch_task: JoinHandle<()>,
    _discovery_task: JoinHandle<()>,
    disconnect: Arc<AtomicBool>,
}

impl Vehicle {
    /// Connect to the vehicle at the given URL
    ///
    /// This function opens a link to the given URL and calls [Vehicle::connect_from_link()] to discover the vehicle.
    /// See [ConnectionUrl] for the accepted formats.
    ///
    /// An error is returned either if the link cannot be opened or if no vehicle is found.
    pub async fn connect_from_url(url: &str, discovery_timeout: Duration) -> Result<Self> {
        let url = ConnectionUrl::parse(url)?;
        let link = MavlinkConnection::open(&url)?;

        Self::connect_from_link(Arc::new(link), discovery_timeout).await
    }

    /// Connect a vehicle using an existing link
    ///
    /// Waits up to `discovery_timeout` for the heartbeat of an autopilot (heartbeats are usually sent at 1 Hz), the
    /// first autopilot found becomes the target of all subsystems. Returns [Error::NoSystemFound] if none shows up.
    pub async fn connect_from_link(link: Arc<dyn MavLink>, discovery_timeout: Duration) -> Result<Self> {
        let disconnect = Arc::new(AtomicBool::new(false));

        // Downlink dispatcher
        let mut dispatcher = MavlinkDispatch::new(link.clone(), disconnect.clone());
        let discovery_downlink = dispatcher.get_receiver(is_heartbeat);
        let telemetry_downlink = dispatcher.get_receiver(Telemetry::is_telemetry);
        let telemetry_ack_downlink = dispatcher.get_receiver(CommandSender::is_command_ack);
        let action_ack_downlink = dispatcher.get_receiver(CommandSender::is_command_ack);
        let offboard_ack_downlink = dispatcher.get_receiver(CommandSender::is_command_ack);
        let param_downlink = dispatcher.get_receiver(Action::is_param_value);
        let dispatch_task = dispatcher.run();

        // Uplink queue
        let (uplink, rx) = channel::unbounded();
        let uplink_task = spawn_uplink(link, rx, disconnect.clone());

        // Let the autopilot know a ground station is there
        let heartbeat_uplink = uplink.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GCS_HEARTBEAT_PERIOD);
            loop {
                interval.tick().await;
                if heartbeat_uplink.send_async(gcs_heartbeat()).await.is_err() {
                    return;
                }
            }
        });

        let found = timeout(
            discovery_timeout,
            discovery_downlink.wait_message(|header, message| match message {
                MavMessage::HEARTBEAT(heartbeat) if is_autopilot(heartbeat) => Some(Target {
                    system_id: header.system_id,
                    component_id: header.component_id,
                }),
                _ => None,
            }),
        )
        .await;

        let target = match found {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                disconnect.store(true, Relaxed);
                heartbeat_task.abort();
                return Err(e);
            }
            Err(_) => {
                disconnect.store(true, Relaxed);
                heartbeat_task.abort();
                return Err(Error::NoSystemFound);
            }
        };
        log::info!("Discovered system {}", target.system_id);

        // Components of the discovered system
        let components: Arc<parking_lot::Mutex<Vec<ComponentDiscovered>>> = Default::default();
        let (mut component_broadcast, component_receiver) = broadcast(COMPONENT_STREAM_CAPACITY);
        component_broadcast.set_overflow(true);
        let component_receiver = component_receiver.deactivate();

        let discovered = ComponentDiscovered {
            component_id: target.component_id,
            component_type: ComponentType::from_component_id(target.component_id),
        };
        components.lock().push(discovered);

        let history = components.clone();
        let discovery_task = tokio::spawn(async move {
            let mut seen = BTreeSet::from([target.component_id]);
            while let Ok((header, _)) = discovery_downlink.recv_async().await {
                if header.system_id != target.system_id || !seen.insert(header.component_id) {
                    continue;
                }
                let discovered = ComponentDiscovered {
                    component_id: header.component_id,
                    component_type: ComponentType::from_component_id(header.component_id),
                };
                // Under the lock so that components() sees each one exactly once
                {
                    let mut history = history.lock();
                    history.push(discovered);
                    let _ = component_broadcast.try_broadcast(discovered);
                }
            }
        });

        let telemetry = Telemetry::new(
            uplink.clone(),
            telemetry_downlink,
            telemetry_ack_downlink,
            target,
        );
        let action = Action::new(uplink.clone(), action_ack_downlink, param_downlink, target);
        let offboard = Offboard::new(
            uplink,
            offboard_ack_downlink,
            target,
            telemetry.shared_state(),
        );

        Ok(Vehicle {
            action,
            offboard,
            telemetry,
            system_id: target.system_id,
            components,
            component_receiver,
            uplink_task: Mutex::new(Some(uplink_task)),
            heartbeat_task: Mutex::new(Some(heartbeat_task)),
            _dispatch_task: dispatch_task,
            _discovery_task: discovery_task,
            disconnect,
        })
    }

    /// MAVLink system id of the vehicle
    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    /// Components discovered so far, followed by the ones discovered later
    ///
    /// The autopilot is always the first component of the stream.
    pub fn components(&self) -> impl Stream<Item = ComponentDiscovered> {
        let history = self.components.lock();
        let live = self.component_receiver.activate_cloned();
        futures::stream::iter(history.clone()).chain(live)
    }

    /// Disconnect the vehicle
    ///
    /// The Connection can be ended in two ways: either by dropping the [Vehicle] object or by calling this
    /// disconnect() function. Once this function return, no more messages are sent to the vehicle.
    ///
    /// Once disconnected, any methods that uses the communication to the vehicle will return the error
    /// [Error::Disconnected]
    pub async fn disconnect(&self) {
        self.offboard.stop_streaming();

        // Set disconnect to true, will make uplink and dispatcher quit
        self.disconnect.store(true, Relaxed);

        if let Some(heartbeat_task) = self.heartbeat_task.lock().await.take() {
            heartbeat_task.abort();
        }
        if let Some(uplink_task) = self.uplink_task.lock().await.take() {
            let _ = uplink_task.await;
        }
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        self.disconnect.store(true, Relaxed);
        if let Some(heartbeat_task) = self.heartbeat_task.get_mut().take() {
            heartbeat_task.abort();
        }
        self._discovery_task.abort();
    }
}

fn is_heartbeat(message: &MavMessage) -> bool {
    matches!(message, MavMessage::HEARTBEAT(_))
}

fn is_autopilot(heartbeat: &HEARTBEAT_DATA) -> bool {
    heartbeat.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID && heartbeat.mavtype != MavType::MAV_TYPE_GCS
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}
