//! MAVLink plumbing shared by the subsystems
//!
//! Downlink dispatch, uplink queue and acknowledged commands. All private for now, to be made public if user code
//! ends up needing them.

use crate::link::MavLink;
use crate::{Error, Result};
use async_trait::async_trait;
use flume as channel;
use flume::{Receiver, RecvTimeoutError, Sender};
use futures::lock::Mutex;
use mavlink::common::{MavCmd, MavMessage, MavResult, COMMAND_LONG_DATA};
use mavlink::MavHeader;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Message as received from the link, with the header of the sender
pub(crate) type Received = (MavHeader, MavMessage);

/// Selects the messages a subsystem wants to receive
pub(crate) type MessageFilter = fn(&MavMessage) -> bool;

const UPLINK_POLL: Duration = Duration::from_millis(100);

pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const COMMAND_RETRIES: u8 = 3;

/// System and component the commands are addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    pub system_id: u8,
    pub component_id: u8,
}

pub(crate) struct MavlinkDispatch {
    link: Arc<dyn MavLink>,
    subscribers: Vec<(MessageFilter, Sender<Received>)>,
    disconnect: Arc<AtomicBool>,
}

impl MavlinkDispatch {
    pub fn new(link: Arc<dyn MavLink>, disconnect: Arc<AtomicBool>) -> Self {
        MavlinkDispatch {
            link,
            subscribers: Vec::new(),
            disconnect,
        }
    }

    /// Register a new downlink receiver getting all messages accepted by `filter`
    ///
    /// Receivers must be registered before the dispatcher is started.
    pub fn get_receiver(&mut self, filter: MessageFilter) -> Receiver<Received> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.push((filter, tx));
        rx
    }

    pub fn run(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            while !self.disconnect.load(Relaxed) {
                match self.link.recv() {
                    Ok(received) => {
                        for (filter, channel) in &self.subscribers {
                            if filter(&received.1) {
                                let _ = channel.send(received.clone());
                            }
                        }
                    }
                    Err(Error::ProtocolError(reason)) => {
                        log::trace!("Dropping undecodable frame: {}", reason);
                    }
                    Err(_) => return, // Link closed
                }
            }
        })
    }
}

/// Drain the uplink queue into the link until disconnected
pub(crate) fn spawn_uplink(
    link: Arc<dyn MavLink>,
    uplink: Receiver<MavMessage>,
    disconnect: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !disconnect.load(Relaxed) {
            match uplink.recv_timeout(UPLINK_POLL) {
                Ok(message) => {
                    if link.send(&message).is_err() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

#[async_trait]
pub(crate) trait WaitForMessage {
    async fn wait_message<T, F>(&self, select: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&MavHeader, &MavMessage) -> Option<T> + Send;
}

#[async_trait]
impl WaitForMessage for channel::Receiver<Received> {
    async fn wait_message<T, F>(&self, mut select: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&MavHeader, &MavMessage) -> Option<T> + Send,
    {
        loop {
            let (header, message) = self.recv_async().await?;
            if let Some(value) = select(&header, &message) {
                return Ok(value);
            }
        }
    }
}

/// Sends `COMMAND_LONG` and waits for the matching `COMMAND_ACK`
///
/// Every attempt waits [COMMAND_TIMEOUT] for an acknowledgment, the command is sent at most
/// [COMMAND_RETRIES] times. An `IN_PROGRESS` acknowledgment restarts the wait without resending.
#[derive(Debug)]
pub(crate) struct CommandSender {
    uplink: Sender<MavMessage>,
    ack_downlink: Mutex<Receiver<Received>>,
    target: Target,
}

impl CommandSender {
    pub fn new(uplink: Sender<MavMessage>, ack_downlink: Receiver<Received>, target: Target) -> Self {
        Self {
            uplink,
            ack_downlink: Mutex::new(ack_downlink),
            target,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn is_command_ack(message: &MavMessage) -> bool {
        matches!(message, MavMessage::COMMAND_ACK(_))
    }

    pub async fn send_command_long(&self, command: MavCmd, params: [f32; 7]) -> Result<()> {
        let downlink = self.ack_downlink.lock().await;

        // Acks from earlier commands that timed out
        while downlink.try_recv().is_ok() {}

        let target = self.target;
        for attempt in 0..COMMAND_RETRIES {
            let message = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                param5: params[4],
                param6: params[5],
                param7: params[6],
                command,
                target_system: target.system_id,
                target_component: target.component_id,
                confirmation: attempt,
            });
            self.uplink.send_async(message).await?;

            loop {
                let ack = timeout(
                    COMMAND_TIMEOUT,
                    downlink.wait_message(|header, message| match message {
                        MavMessage::COMMAND_ACK(ack)
                            if ack.command == command && header.system_id == target.system_id =>
                        {
                            Some(ack.result)
                        }
                        _ => None,
                    }),
                )
                .await;

                match ack {
                    Ok(Ok(MavResult::MAV_RESULT_ACCEPTED)) => return Ok(()),
                    Ok(Ok(MavResult::MAV_RESULT_IN_PROGRESS)) => continue,
                    Ok(Ok(result)) => return Err(Error::CommandDenied { command, result }),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        log::debug!("No ack for {:?} (attempt {})", command, attempt + 1);
                        break;
                    }
                }
            }
        }

        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::COMMAND_ACK_DATA;

    const TARGET: Target = Target {
        system_id: 1,
        component_id: 1,
    };

    fn ack(command: MavCmd, result: MavResult) -> Received {
        (
            MavHeader {
                system_id: TARGET.system_id,
                component_id: TARGET.component_id,
                sequence: 0,
            },
            MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                command,
                result,
                ..Default::default()
            }),
        )
    }

    /// Answers every command with the given acks, in order
    fn autopilot(
        uplink: Receiver<MavMessage>,
        acks: Sender<Received>,
        answers: Vec<MavResult>,
    ) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let mut confirmations = Vec::new();
            let mut answers = answers.into_iter();
            while let Ok(MavMessage::COMMAND_LONG(command)) = uplink.recv_async().await {
                confirmations.push(command.confirmation);
                if let Some(result) = answers.next() {
                    let _ = acks.send(ack(command.command, result));
                }
            }
            confirmations
        })
    }

    #[tokio::test]
    async fn in_progress_keeps_waiting_for_the_final_ack() {
        let (uplink, uplink_rx) = channel::unbounded();
        let (ack_tx, ack_rx) = channel::unbounded();
        // Left over from an earlier attempt, must not complete the new command
        ack_tx
            .send(ack(MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_ACCEPTED))
            .unwrap();
        let autopilot = autopilot(
            uplink_rx,
            ack_tx.clone(),
            vec![MavResult::MAV_RESULT_IN_PROGRESS],
        );
        let sender = CommandSender::new(uplink, ack_rx, TARGET);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = ack_tx.send(ack(MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_FAILED));
        });

        let result = sender
            .send_command_long(MavCmd::MAV_CMD_NAV_LAND, [0.0; 7])
            .await;
        assert!(matches!(
            result,
            Err(Error::CommandDenied {
                result: MavResult::MAV_RESULT_FAILED,
                ..
            })
        ));

        drop(sender);
        assert_eq!(autopilot.await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn lost_acks_are_retried() {
        let (uplink, uplink_rx) = channel::unbounded();
        let (ack_tx, ack_rx) = channel::unbounded();
        let autopilot = autopilot(uplink_rx, ack_tx, vec![]);
        let sender = CommandSender::new(uplink, ack_rx, TARGET);

        let result = sender
            .send_command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        drop(sender);
        assert_eq!(autopilot.await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn acks_for_other_commands_are_ignored() {
        let (uplink, uplink_rx) = channel::unbounded();
        let (ack_tx, ack_rx) = channel::unbounded();
        let sender = CommandSender::new(uplink, ack_rx, TARGET);

        tokio::spawn(async move {
            while let Ok(MavMessage::COMMAND_LONG(command)) = uplink_rx.recv_async().await {
                let _ = ack_tx.send(ack(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_DENIED));
                let _ = ack_tx.send(ack(command.command, MavResult::MAV_RESULT_TEMPORARILY_REJECTED));
            }
        });

        match sender.send_command_long(MavCmd::MAV_CMD_NAV_LAND, [0.0; 7]).await {
            Err(Error::CommandDenied { command, result }) => {
                assert_eq!(command, MavCmd::MAV_CMD_NAV_LAND);
                assert_eq!(result, MavResult::MAV_RESULT_TEMPORARILY_REJECTED);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
