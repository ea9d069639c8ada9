use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::task;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

pub use params::SerialParams;

use crate::Model;

pub mod params;

#[cfg(target_os = "linux")]
mod linux_low_latency;

/// USB vendor ID of FTDI, the SPDac uses an FT232 bridge.
pub const FTDI_VID: u16 = 0x0403;

/// USB vendor ID of WCH, the SPSMU uses a CH343 bridge.
pub const WCH_VID: u16 = 0x1a86;

pub async fn open(path: &str, params: &SerialParams) -> crate::Result<SerialStream> {
    log::debug!("Opening {} with {}", path, params);
    let serial_stream = tokio_serial::new(path, params.baud)
        .parity(params.parity.into())
        .stop_bits(params.stop_bits.into())
        .data_bits(params.data_bits.into())
        .flow_control(params.flow_control.into())
        .open_native_async()
        .map_err(map_tokio_serial_error)?;

    #[cfg(target_os = "linux")]
    {
        match linux_low_latency::apply_low_latency(&serial_stream) {
            Ok(_) => log::info!("Applied ASYNC_LOW_LATENCY to {}", path),
            Err(x) => log::error!("Cannot set ASYNC_LOW_LATENCY on serial port: {}", x),
        }
    }
    Ok(serial_stream)
}

fn map_tokio_serial_error(err: tokio_serial::Error) -> crate::Error {
    crate::Error::transport(anyhow!(err))
}

/// The instrument a USB vendor ID most likely belongs to.
///
/// Port names change between machines and reconnects, the bridge chip is the
/// only stable hint before talking to the device.
pub fn hint_for_vid(vid: u16) -> Option<Model> {
    match vid {
        FTDI_VID => Some(Model::SpDac),
        WCH_VID => Some(Model::SpSmu),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    pub hint: Option<Model>,
}

pub async fn list_devices() -> crate::Result<Vec<PortInfo>> {
    let ports = task::spawn_blocking(tokio_serial::available_ports)
        .await
        .map_err(crate::Error::internal)?
        .map_err(map_tokio_serial_error)?;
    let ret = ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: port.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                product: usb.product,
                hint: hint_for_vid(usb.vid),
            },
            _ => PortInfo {
                name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                product: None,
                hint: None,
            },
        })
        .collect();
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_chip_hints() {
        assert_eq!(hint_for_vid(0x0403), Some(Model::SpDac));
        assert_eq!(hint_for_vid(0x1a86), Some(Model::SpSmu));
        assert_eq!(hint_for_vid(0x2341), None);
    }
}
