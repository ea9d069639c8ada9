use std::fmt::{self, Display, Formatter};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Both instruments enumerate as USB virtual COM ports running at this rate.
pub const DEFAULT_BAUD: u32 = 921_600;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum FlowControl {
    NoFlowControl,
    Software,
    Hardware,
}

impl Default for FlowControl {
    fn default() -> Self {
        FlowControl::NoFlowControl
    }
}

fn invalid_address(x: &str) -> crate::Error {
    crate::Error::argument(anyhow!("Invalid Address: `{}`", x))
}

pub fn parse_serial_settings(settings: &str) -> crate::Result<(DataBits, Parity, StopBits)> {
    let lower = settings.to_lowercase();
    let chars = lower.as_bytes();
    if chars.len() != 3 {
        return Err(invalid_address(settings));
    }
    let data_bits = match chars[0] as char {
        '8' => DataBits::Eight,
        '7' => DataBits::Seven,
        _ => return Err(invalid_address(settings)),
    };
    let parity = match chars[1] as char {
        'n' => Parity::None,
        'o' => Parity::Odd,
        'e' => Parity::Even,
        _ => return Err(invalid_address(settings)),
    };
    let stop_bits = match chars[2] as char {
        '1' => StopBits::One,
        '2' => StopBits::Two,
        _ => return Err(invalid_address(settings)),
    };
    Ok((data_bits, parity, stop_bits))
}

#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize, Hash)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::NoFlowControl,
        }
    }
}

impl SerialParams {
    /// Parse the optional `<baud>[::<8N1>]` tail of a serial address.
    pub fn from_address(addr_parts: &[&str]) -> crate::Result<SerialParams> {
        let mut ret = SerialParams::default();
        match addr_parts {
            [] => {}
            [baud] => {
                ret.baud = baud.parse().map_err(|_| invalid_address(baud))?;
            }
            [baud, settings] => {
                ret.baud = baud.parse().map_err(|_| invalid_address(baud))?;
                let (data_bits, parity, stop_bits) = parse_serial_settings(settings)?;
                ret.data_bits = data_bits;
                ret.parity = parity;
                ret.stop_bits = stop_bits;
            }
            _ => return Err(invalid_address(&addr_parts.join("::"))),
        }
        if ret.baud == 0 {
            return Err(invalid_address("0"));
        }
        Ok(ret)
    }
}

impl Display for SerialParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}{}{}", self.baud, self.data_bits, self.parity, self.stop_bits)
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(x: StopBits) -> Self {
        match x {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(x: Parity) -> Self {
        match x {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(x: DataBits) -> Self {
        match x {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(x: FlowControl) -> Self {
        match x {
            FlowControl::NoFlowControl => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

impl Display for DataBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            DataBits::Seven => "7",
            DataBits::Eight => "8",
        };
        f.write_str(x)
    }
}

impl Display for Parity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            Parity::None => "N",
            Parity::Odd => "O",
            Parity::Even => "E",
        };
        f.write_str(x)
    }
}

impl Display for StopBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            StopBits::One => "1",
            StopBits::Two => "2",
        };
        f.write_str(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_parts() {
        assert_eq!(SerialParams::from_address(&[]).unwrap(), SerialParams::default());
        let params = SerialParams::from_address(&["115200"]).unwrap();
        assert_eq!(params.baud, 115200);
        assert_eq!(params.data_bits, DataBits::Eight);
        let params = SerialParams::from_address(&["9600", "7e2"]).unwrap();
        assert_eq!(params.data_bits, DataBits::Seven);
        assert_eq!(params.parity, Parity::Even);
        assert_eq!(params.stop_bits, StopBits::Two);
        assert_eq!(params.to_string(), "9600::7E2");
    }

    #[test]
    fn reject_bad_settings() {
        assert!(SerialParams::from_address(&["fast"]).is_err());
        assert!(SerialParams::from_address(&["9600", "8X1"]).is_err());
        assert!(SerialParams::from_address(&["9600", "8N1", "extra"]).is_err());
        assert!(SerialParams::from_address(&["0"]).is_err());
    }
}
