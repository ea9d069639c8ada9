/// This module implements `Address` which is used for parsing
/// address strings of the form "serial::/dev/ttyUSB0::921600::8N1"
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;

use crate::transport::serial::SerialParams;
use crate::{Error, Model};

/// Represents a parsed address string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Serial { path: String, params: SerialParams },
    /// Built-in simulated firmware of the given instrument.
    Sim { model: Model },
}

fn invalid_address(addr: &str) -> Error {
    Error::argument(anyhow!("Invalid Address: `{}`", addr))
}

impl Address {
    /// Create a new `Address` by parsing the given address string.
    ///
    /// Accepted forms:
    ///  * `serial::/dev/ttyUSB0[::921600[::8N1]]`
    ///  * `ASRL/dev/ttyUSB0::INSTR` and `ASRL3::INSTR` (which is `COM3`)
    ///  * a bare port name such as `/dev/ttyACM0` or `COM3`
    ///  * `sim::spdac` or `sim::spsmu`
    pub fn parse(addr: &str) -> crate::Result<Self> {
        let addr = addr.trim();
        let splits: Vec<&str> = addr.split("::").collect();
        if splits.iter().any(|x| x.is_empty()) {
            return Err(invalid_address(addr));
        }
        let kind = splits[0].to_lowercase();

        if kind == "serial" {
            // serial::/dev/ttyUSB0::9600::8N1
            if splits.len() < 2 {
                return Err(invalid_address(addr));
            }
            let params = SerialParams::from_address(&splits[2..])?;
            Ok(Address::Serial {
                path: splits[1].to_string(),
                params,
            })
        } else if kind == "sim" {
            if splits.len() != 2 {
                return Err(invalid_address(addr));
            }
            let model = splits[1].parse().map_err(|_| invalid_address(addr))?;
            Ok(Address::Sim { model })
        } else if kind.starts_with("asrl") {
            if splits.len() != 2 || !splits[1].eq_ignore_ascii_case("instr") {
                return Err(invalid_address(addr));
            }
            let resource = &splits[0][4..];
            if resource.is_empty() {
                return Err(invalid_address(addr));
            }
            let path = match resource.parse::<u32>() {
                Ok(num) => format!("COM{}", num),
                Err(_) => resource.to_string(),
            };
            Ok(Address::Serial {
                path,
                params: SerialParams::default(),
            })
        } else if splits.len() == 1 {
            Ok(Address::Serial {
                path: splits[0].to_string(),
                params: SerialParams::default(),
            })
        } else {
            Err(invalid_address(addr))
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::Serial { path, params } => write!(f, "serial::{}::{}", path, params),
            Address::Sim { model } => write!(f, "sim::{}", model.to_string().to_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::serial::params::{DataBits, FlowControl, Parity, StopBits};

    #[test]
    fn parse_serial() {
        let addr = Address::parse("serial::COM1::115200::8N1").unwrap();
        match addr {
            Address::Serial { path, params } => {
                assert_eq!(path, "COM1");
                assert_eq!(
                    params,
                    SerialParams {
                        baud: 115200,
                        data_bits: DataBits::Eight,
                        stop_bits: StopBits::One,
                        parity: Parity::None,
                        flow_control: FlowControl::NoFlowControl,
                    }
                );
            }
            _ => panic!(),
        }

        let addr = Address::parse("serial::/dev/ttyUSB0").unwrap();
        match addr {
            Address::Serial { path, params } => {
                assert_eq!(path, "/dev/ttyUSB0");
                assert_eq!(params.baud, 921600);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parse_visa_resource() {
        let addr = Address::parse("ASRL/dev/ttyUSB1::INSTR").unwrap();
        match addr {
            Address::Serial { path, params } => {
                assert_eq!(path, "/dev/ttyUSB1");
                assert_eq!(params, SerialParams::default());
            }
            _ => panic!(),
        }

        let addr = Address::parse("ASRL3::INSTR").unwrap();
        match addr {
            Address::Serial { path, .. } => assert_eq!(path, "COM3"),
            _ => panic!(),
        }

        assert!(Address::parse("ASRL3::SOCKET").is_err());
        assert!(Address::parse("ASRL::INSTR").is_err());
    }

    #[test]
    fn parse_bare_path() {
        let addr = Address::parse("/dev/ttyACM0").unwrap();
        assert_eq!(addr.to_string(), "serial::/dev/ttyACM0::921600::8N1");
    }

    #[test]
    fn parse_sim() {
        assert_eq!(Address::parse("sim::spdac").unwrap(), Address::Sim { model: Model::SpDac });
        assert_eq!(Address::parse("SIM::SPSMU").unwrap(), Address::Sim { model: Model::SpSmu });
        assert_eq!(Address::Sim { model: Model::SpSmu }.to_string(), "sim::spsmu");
        assert!(Address::parse("sim::scope").is_err());
    }

    #[test]
    fn reject_malformed() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("serial::").is_err());
        assert!(Address::parse("tcp::192.168.1.1:123").is_err());
        let err = Address::parse("serial::COM1::fast").unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }
}
