use spdev_protocol::scpi::{Line, ParseError};
use spdev_protocol::smu::{self, ClampLimits, ForceMode, Quantity, RoutingMode, SmuCommand, SourceMode};
use spdev_protocol::Identity;

use super::spdac::{number, quoted};
use super::Firmware;

pub const SERIAL: &str = "SP-0002";
pub const FIRMWARE: &str = "0.3-1.2";

/// Every channel drives a 1 MOhm load, so 1 V corresponds to 1 uA.
pub const LOAD_MOHM: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelState {
    pub mode: SourceMode,
    pub voltage: f64,
    pub current: f64,
    pub last_voltage: f64,
    pub last_current: f64,
    pub voltage_clamp: ClampLimits,
    pub current_clamp: ClampLimits,
}

impl ChannelState {
    fn current_full_scale(&self) -> f64 {
        self.mode.range.full_scale()
    }

    fn present(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Voltage => self.voltage_clamp.apply(self.voltage, smu::VOLTAGE_FULL_SCALE),
            Quantity::Current => self.current_clamp.apply(self.current, self.current_full_scale()),
        }
    }

    /// Voltage in V and current in uA at the load.
    fn operating_point(&self) -> (f64, f64) {
        match self.mode.force {
            ForceMode::HizV | ForceMode::HizI => (0.0, 0.0),
            ForceMode::Fv => {
                let volts = self.present(Quantity::Voltage);
                let amps = self.current_clamp.apply(volts / LOAD_MOHM, self.current_full_scale());
                (amps * LOAD_MOHM, amps)
            }
            ForceMode::Fi | ForceMode::SinkI => {
                let amps = self.present(Quantity::Current);
                let volts = self.voltage_clamp.apply(amps * LOAD_MOHM, smu::VOLTAGE_FULL_SCALE);
                (volts, volts / LOAD_MOHM)
            }
        }
    }

    fn set_mode(&mut self, mode: SourceMode) {
        if self.mode.zeroes_output(&mode) {
            self.voltage = 0.0;
            self.current = 0.0;
        }
        self.mode = mode;
    }

    fn set_level(&mut self, quantity: Quantity, value: f64) -> Result<(), ParseError> {
        let limit = match quantity {
            Quantity::Voltage => smu::VOLTAGE_FULL_SCALE,
            Quantity::Current => self.current_full_scale(),
        };
        if value.abs() > limit {
            return Err(ParseError::OutOfRange(value.to_string()));
        }
        match quantity {
            Quantity::Voltage => {
                self.voltage = value;
                self.last_voltage = value;
            }
            Quantity::Current => {
                self.current = value;
                self.last_current = value;
            }
        }
        Ok(())
    }

    fn clamp(&mut self, quantity: Quantity) -> &mut ClampLimits {
        match quantity {
            Quantity::Voltage => &mut self.voltage_clamp,
            Quantity::Current => &mut self.current_clamp,
        }
    }
}

pub struct SpSmuFirmware {
    pub channels: Vec<ChannelState>,
    pub routing: [[RoutingMode; smu::PMU_CHANNELS as usize]; smu::CHIP_SELECTS as usize],
}

impl Default for SpSmuFirmware {
    fn default() -> Self {
        Self {
            channels: vec![ChannelState::default(); smu::CHANNELS as usize],
            routing: [[RoutingMode::Hiz; smu::PMU_CHANNELS as usize]; smu::CHIP_SELECTS as usize],
        }
    }
}

impl SpSmuFirmware {
    fn channel(&mut self, channel: u8) -> &mut ChannelState {
        &mut self.channels[channel as usize - 1]
    }

    fn apply(&mut self, cmd: SmuCommand) -> Result<Option<String>, ParseError> {
        let ret = match cmd {
            SmuCommand::SetSourceMode { channel, mode } => {
                self.channel(channel).set_mode(mode);
                None
            }
            SmuCommand::QuerySourceMode { channel } => {
                let mode = self.channel(channel).mode;
                let tokens = [mode.force.token(), mode.measure.token(), mode.range.token()];
                let tokens: Vec<String> = tokens.iter().map(|x| quoted(x)).collect();
                Some(tokens.join(","))
            }
            SmuCommand::SetLevel {
                channel,
                quantity,
                value,
            } => {
                self.channel(channel).set_level(quantity, value)?;
                None
            }
            SmuCommand::QueryLevel { channel, quantity } => Some(number(self.channel(channel).present(quantity))),
            SmuCommand::QueryLastLevel { channel, quantity } => {
                let state = self.channel(channel);
                let x = match quantity {
                    Quantity::Voltage => state.last_voltage,
                    Quantity::Current => state.last_current,
                };
                Some(number(x))
            }
            SmuCommand::SetClamp {
                channel,
                quantity,
                limits,
            } => {
                *self.channel(channel).clamp(quantity) = limits;
                None
            }
            SmuCommand::QueryClamp { channel, quantity } => {
                let limits = *self.channel(channel).clamp(quantity);
                Some(format!("{},{}", number(limits.low), number(limits.high)))
            }
            SmuCommand::Measure { channel, quantity } => {
                let (volts, amps) = self.channel(channel).operating_point();
                match quantity {
                    Quantity::Voltage => Some(number(volts)),
                    Quantity::Current => Some(number(amps)),
                }
            }
            SmuCommand::SetRouting {
                chip_select,
                pmu_channel,
                mode,
            } => {
                self.routing[chip_select as usize - 1][pmu_channel as usize - 1] = mode;
                None
            }
            SmuCommand::QueryRouting {
                chip_select,
                pmu_channel,
            } => Some(quoted(
                self.routing[chip_select as usize - 1][pmu_channel as usize - 1].token(),
            )),
        };
        Ok(ret)
    }
}

impl Firmware for SpSmuFirmware {
    fn identity(&self) -> Identity {
        Identity::new(smu::MODEL, SERIAL, FIRMWARE)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn execute(&mut self, line: &Line) -> Option<Result<Option<String>, ParseError>> {
        let ret = match SmuCommand::parse(line)? {
            Ok(cmd) => self.apply(cmd),
            Err(err) => Err(err),
        };
        Some(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;

    #[test]
    fn force_mode_change_zeroes_output() {
        let mut sim = Simulator::new(SpSmuFirmware::default());
        sim.process_line("SOUR:MODE 1,FV,MI,UA5");
        sim.process_line("SOUR:VOLT 1,1.25");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("1.25".to_string()));

        sim.process_line("SOUR:MODE 1,FV,MV,UA5");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("1.25".to_string()));

        sim.process_line("SOUR:MODE 1,FI,MV,UA5");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("0".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT:LAST? 1"), Some("1.25".to_string()));
        assert_eq!(sim.process_line("SOUR:MODE? 1"), Some("\"FI\",\"MV\",\"UA5\"".to_string()));
    }

    #[test]
    fn range_change_zeroes_current_output() {
        let mut sim = Simulator::new(SpSmuFirmware::default());
        sim.process_line("SOUR:MODE 2,FI,MV,UA5");
        sim.process_line("SOUR:CURR 2,3");
        sim.process_line("SOUR:MODE 2,FI,MV,UA20");
        assert_eq!(sim.process_line("SOUR:CURR? 2"), Some("0".to_string()));
        assert_eq!(sim.process_line("SOUR:CURR:LAST? 2"), Some("3".to_string()));
    }

    #[test]
    fn load_relates_voltage_and_current() {
        let mut sim = Simulator::new(SpSmuFirmware::default());
        sim.process_line("SOUR:MODE 3,FV,MI,UA5");
        sim.process_line("SOUR:VOLT 3,2");
        assert_eq!(sim.process_line("MEAS:CURR? 3"), Some("2".to_string()));
        assert_eq!(sim.process_line("MEAS:VOLT? 3"), Some("2".to_string()));

        // 8 uA exceeds the 5 uA range, the current limit takes over
        sim.process_line("SOUR:VOLT 3,8");
        assert_eq!(sim.process_line("MEAS:CURR? 3"), Some("5".to_string()));
        assert_eq!(sim.process_line("MEAS:VOLT? 3"), Some("5".to_string()));

        sim.process_line("SOUR:MODE 4,HIZV,HIZ,UA5");
        assert_eq!(sim.process_line("MEAS:VOLT? 4"), Some("0".to_string()));
    }

    #[test]
    fn clamps_limit_present_output() {
        let mut sim = Simulator::new(SpSmuFirmware::default());
        sim.process_line("SOUR:MODE 1,FV,MI,MA2");
        sim.process_line("SOUR:CLAM:VOLT 1,-0.5,0.5");
        sim.process_line("SOUR:VOLT 1,8");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("5".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT:LAST? 1"), Some("8".to_string()));
        assert_eq!(sim.process_line("SOUR:CLAM:VOLT? 1"), Some("-0.5,0.5".to_string()));
        assert_eq!(sim.process_line("SOUR:CLAM:CURR? 1"), Some("-1,1".to_string()));
    }

    #[test]
    fn current_beyond_range_is_rejected() {
        let mut sim = Simulator::new(SpSmuFirmware::default());
        sim.process_line("SOUR:MODE 1,FI,MV,UA5");
        assert_eq!(sim.process_line("SOUR:CURR 1,6"), None);
        assert_eq!(sim.process_line("SYST:ERR?"), Some("-222,\"Data out of range\"".to_string()));
    }

    #[test]
    fn admin_routing() {
        let mut sim = Simulator::new(SpSmuFirmware::default());
        assert_eq!(sim.process_line("ADM:ROUT? 1,1"), Some("\"HIZ\"".to_string()));
        sim.process_line("ADM:ROUT 4,2,SENSE");
        assert_eq!(sim.process_line("ADM:ROUT? 4,2"), Some("\"SENSE\"".to_string()));
        sim.process_line("*RST");
        assert_eq!(sim.process_line("ADM:ROUT? 4,2"), Some("\"HIZ\"".to_string()));
    }
}
