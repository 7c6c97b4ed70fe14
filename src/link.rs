//! # Vehicle link
//!
//! The [MavLink] trait is the byte-level boundary of the lib: it sends and receives whole MAVLink
//! messages. [MavlinkConnection] implements it on top of the `mavlink` crate transports (TCP, UDP
//! and serial). Anything else that speaks MAVLink, for example a simulated autopilot in tests,
//! can be plugged in [Vehicle::connect_from_link()](crate::Vehicle::connect_from_link).

use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::{MavConnection, MavHeader, MavlinkVersion};

use crate::url::ConnectionUrl;
use crate::{Error, Result, GCS_COMPONENT_ID, GCS_SYSTEM_ID};

/// Blocking MAVLink message transport
///
/// `recv()` blocks until a message is available. It returns [Error::ProtocolError] for frames that
/// could not be decoded (the link stays usable) and [Error::Disconnected] when the link is gone.
pub trait MavLink: Send + Sync {
    /// Send one message to the vehicle
    fn send(&self, message: &MavMessage) -> Result<()>;
    /// Receive the next message from the vehicle
    fn recv(&self) -> Result<(MavHeader, MavMessage)>;
}

/// MAVLink connection opened with the `mavlink` crate
pub struct MavlinkConnection {
    connection: Box<dyn MavConnection<MavMessage> + Sync + Send>,
    header: MavHeader,
}

impl MavlinkConnection {
    /// Open a connection to the given URL
    ///
    /// The connection speaks MAVLink v2 and identifies itself as a ground station.
    pub fn open(url: &ConnectionUrl) -> Result<Self> {
        let address = url.to_mavlink_address();
        log::debug!("Opening MAVLink connection {}", address);

        let mut connection =
            mavlink::connect::<MavMessage>(&address).map_err(Error::ConnectionFailed)?;
        connection.set_protocol_version(MavlinkVersion::V2);

        Ok(Self {
            connection,
            header: MavHeader {
                system_id: GCS_SYSTEM_ID,
                component_id: GCS_COMPONENT_ID,
                sequence: 0,
            },
        })
    }
}

impl MavLink for MavlinkConnection {
    fn send(&self, message: &MavMessage) -> Result<()> {
        self.connection
            .send(&self.header, message)
            .map_err(|e| {
                log::debug!("MAVLink send failed: {}", e);
                Error::Disconnected
            })?;
        Ok(())
    }

    fn recv(&self) -> Result<(MavHeader, MavMessage)> {
        match self.connection.recv() {
            Ok(message) => Ok(message),
            Err(MessageReadError::Parse(e)) => Err(Error::ProtocolError(e.to_string())),
            Err(MessageReadError::Io(e)) => {
                log::debug!("MAVLink receive failed: {}", e);
                Err(Error::Disconnected)
            }
        }
    }
}
