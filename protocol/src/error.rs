use std::{io, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Clone, Debug)]
pub enum TransportError {
    #[error("IO Error: {0:?}")]
    Io(Arc<io::Error>),
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(x: anyhow::Error) -> Self {
        TransportError::Other(Arc::new(x))
    }
}

#[derive(Error, Clone, Debug)]
pub enum ProtocolError {
    #[error("Timeout")]
    Timeout,
    #[error("Unexpected Response: {0:?}")]
    UnexpectedResponse(String),
    #[error("Unknown {kind}: {value:?}")]
    UnknownToken { kind: &'static str, value: String },
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for ProtocolError {
    fn from(x: anyhow::Error) -> Self {
        ProtocolError::Other(Arc::new(x))
    }
}

/// An entry of the firmware error queue, as returned by `SYSTem:ERRor?`.
///
/// The firmware signals faults on its RGB indicator and buzzer. The queue is the
/// only part of that state which is visible over the wire.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code},\"{message}\"")]
pub struct DeviceError {
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new<T: Into<String>>(code: i32, message: T) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn no_error() -> Self {
        Self::new(0, "No error")
    }

    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    /// SCPI reserves -100..-199 for malformed commands.
    pub fn is_command_error(&self) -> bool {
        (-199..=-100).contains(&self.code)
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Transport Error {0}")]
    Transport(TransportError),
    #[error("Protocol Error {0}")]
    Protocol(ProtocolError),
    #[error("Device Error {0}")]
    Device(DeviceError),
    #[error("Argument Error {0}")]
    Argument(Arc<anyhow::Error>),
    #[error("Internal Error {0}")]
    Internal(Arc<anyhow::Error>),
}

impl Error {
    pub fn transport<T: Into<TransportError>>(err: T) -> Self {
        Self::Transport(err.into())
    }

    pub fn protocol<T: Into<ProtocolError>>(err: T) -> Self {
        Self::Protocol(err.into())
    }

    pub fn protocol_timeout() -> Self {
        Error::Protocol(ProtocolError::Timeout)
    }

    pub fn unexpected_response<T: Into<String>>(reply: T) -> Self {
        Error::Protocol(ProtocolError::UnexpectedResponse(reply.into()))
    }

    pub fn internal<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Internal(Arc::new(err.into()))
    }

    pub fn argument<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Argument(Arc::new(err.into()))
    }

    /// True if the serial link itself failed, as opposed to the device
    /// answering something we could not use.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Protocol(ProtocolError::Timeout))
    }
}

impl From<io::Error> for Error {
    fn from(x: io::Error) -> Self {
        Error::Transport(TransportError::Io(Arc::new(x)))
    }
}

impl From<ProtocolError> for Error {
    fn from(x: ProtocolError) -> Self {
        Error::Protocol(x)
    }
}

impl From<DeviceError> for Error {
    fn from(x: DeviceError) -> Self {
        Error::Device(x)
    }
}
