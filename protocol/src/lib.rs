//! Wire protocol of the SPDev instruments.
//!
//! Typed commands render into SCPI lines and received lines parse back into
//! the same types, so both the host drivers and the simulated firmware share
//! one codec.

#[macro_use]
mod util;

pub mod dac;
pub mod error;
pub mod scpi;
pub mod smu;

pub use crate::error::{DeviceError, Error, ProtocolError, TransportError};
pub use crate::scpi::{CommonCommand, FirmwareVersion, Identity, ScpiRequest, ScpiResponse};

pub type Result<T> = std::result::Result<T, Error>;
