use mavlink::common::{MavCmd, MavResult};

/// [Result] alias for return types of the crate API
pub type Result<T> = std::result::Result<T, Error>;

/// Error enum type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection URL could not be understood. The String contains the reason.
    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),
    /// The link to the vehicle could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),
    /// No autopilot heartbeat was received within the discovery timeout.
    #[error("no system found")]
    NoSystemFound,
    /// Unexpected protocol error. The String contains the reason.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// The vehicle answered a command with something else than `MAV_RESULT_ACCEPTED`.
    #[error("{command:?} denied: {result:?}")]
    CommandDenied {
        /// Command that was refused
        command: MavCmd,
        /// Result reported in the `COMMAND_ACK`
        result: MavResult,
    },
    /// A parameter write was not confirmed with the requested value.
    #[error("parameter {0} rejected")]
    ParamRejected(String),
    /// Offboard mode cannot be started before a setpoint has been set.
    #[error("no setpoint set")]
    NoSetpointSet,
    /// Terminal configuration or read error.
    #[error("terminal error: {0}")]
    Terminal(#[source] std::io::Error),
    /// The vehicle link is closed.
    #[error("disconnected")]
    Disconnected,
    /// Operation timed out waiting for response.
    #[error("timeout")]
    Timeout,
    /// The flight was interrupted with Ctrl-C.
    #[error("interrupted")]
    Interrupted,
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        self::Error::Disconnected
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        self::Error::Disconnected
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        self::Error::Timeout
    }
}
