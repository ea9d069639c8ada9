use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

pub use spdev_protocol as protocol;
pub use spdev_protocol::{DeviceError, Error, Identity, ProtocolError, TransportError};

pub mod address;
pub mod arrangement;
pub mod bytestream;
pub mod instrument;
pub mod iotask;
pub mod params;
pub mod sim;
pub mod snapshot;
pub mod spdac;
pub mod spsmu;
pub mod transport;

pub use crate::address::Address;
pub use crate::instrument::{Instrument, SessionOptions};
pub use crate::spdac::SpDac;
pub use crate::spsmu::SpSmu;

pub type Result<T> = std::result::Result<T, Error>;

/// The instrument families of the SPDev product line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    SpDac,
    SpSmu,
}

impl Model {
    /// Model field of the `*IDN?` reply.
    pub fn idn_model(&self) -> &'static str {
        match self {
            Model::SpDac => protocol::dac::MODEL,
            Model::SpSmu => protocol::smu::MODEL,
        }
    }
}

impl Display for Model {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.idn_model())
    }
}

impl FromStr for Model {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(protocol::dac::MODEL) {
            Ok(Model::SpDac)
        } else if s.eq_ignore_ascii_case(protocol::smu::MODEL) {
            Ok(Model::SpSmu)
        } else {
            Err(Error::argument(anyhow!("Unknown instrument model `{}`", s)))
        }
    }
}

/// Settings of a device driver on top of its session.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// How long the firmware needs to settle after `*RST`.
    pub reset_delay: std::time::Duration,
    /// Number of ADC sub-boards chained to an SPDac (1 or 2).
    pub adc_boards: u8,
    /// Refuse firmware older than [`MIN_FIRMWARE`].
    pub check_firmware: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            reset_delay: std::time::Duration::from_secs(5),
            adc_boards: 1,
            check_firmware: true,
        }
    }
}

/// Oldest firmware the drivers are written against.
pub const MIN_FIRMWARE: &str = "1.0";

/// Query the identity and make sure it matches `model` and a supported firmware.
pub(crate) async fn check_identity(instrument: &Instrument, model: Model, options: &DeviceOptions) -> Result<Identity> {
    let idn = instrument.identify().await?;
    if !idn.model.eq_ignore_ascii_case(model.idn_model()) {
        return Err(Error::unexpected_response(format!(
            "Expected a {} but found {}",
            model, idn
        )));
    }
    if options.check_firmware {
        let version = idn.firmware_version()?;
        let min: protocol::FirmwareVersion = MIN_FIRMWARE.parse()?;
        if version < min {
            return Err(Error::protocol(anyhow!(
                "Firmware {} of {} is older than {}",
                version,
                idn.serial,
                min
            )));
        }
    }
    log::info!("Connected to {} at {}", idn, instrument.address());
    Ok(idn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_model() {
        assert_eq!("spdac".parse::<Model>().unwrap(), Model::SpDac);
        assert_eq!("SPSMU".parse::<Model>().unwrap(), Model::SpSmu);
        assert!("scope".parse::<Model>().is_err());
        assert_eq!(Model::SpSmu.to_string(), "SPSMU");
    }
}
