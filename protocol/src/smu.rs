//! Command set of the SPSMU 16-channel source-measure unit.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::scpi::{format_number, split_reply, Line, ParseError};
use crate::util::{check_channel, check_magnitude};
use crate::{Error, ProtocolError};

pub const MODEL: &str = "SPSMU";

pub const CHANNELS: u8 = 16;

/// Full scale of the voltage output, used for setpoint checks and clamps.
pub const VOLTAGE_FULL_SCALE: f64 = 10.0;

/// Analog switch addressing of the admin routing command.
pub const CHIP_SELECTS: u8 = 4;
pub const PMU_CHANNELS: u8 = 4;

scpi_enum! {
    pub enum ForceMode: "force mode" {
        /// Force voltage
        Fv => "FV",
        /// Force current
        Fi => "FI",
        HizV => "HIZV",
        HizI => "HIZI",
        /// Sink current
        SinkI => "SINKI",
    }
}

impl ForceMode {
    /// Force modes in which the setpoint is a current.
    pub fn sources_current(&self) -> bool {
        matches!(self, ForceMode::Fi | ForceMode::SinkI)
    }
}

scpi_enum! {
    pub enum MeasureMode: "measure mode" {
        /// Measure current
        Mi => "MI",
        /// Measure voltage
        Mv => "MV",
        /// Measure temperature
        Mtemp => "MTEMP",
        Hiz => "HIZ",
    }
}

scpi_enum! {
    pub enum CurrentRange: "current range" {
        Ua5 => "UA5",
        Ua20 => "UA20",
        Ua200 => "UA200",
        Ma2 => "MA2",
        Ma50 => "MA50",
    }
}

impl CurrentRange {
    /// Full scale current in uA.
    pub fn full_scale(&self) -> f64 {
        match self {
            CurrentRange::Ua5 => 5.0,
            CurrentRange::Ua20 => 20.0,
            CurrentRange::Ua200 => 200.0,
            CurrentRange::Ma2 => 2_000.0,
            CurrentRange::Ma50 => 50_000.0,
        }
    }
}

scpi_enum! {
    /// Switch state of the admin-level analog routing.
    pub enum RoutingMode: "routing mode" {
        Hiz => "HIZ",
        Sense => "SENSE",
        Force => "FORCE",
        All => "ALL",
    }
}

scpi_enum! {
    /// What a setpoint, clamp or measurement refers to.
    pub enum Quantity: "quantity" {
        Voltage => "VOLT" | "VOLTAGE",
        Current => "CURR" | "CURRENT",
    }
}

impl Quantity {
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "uA",
        }
    }
}

/// Source/measure configuration of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceMode {
    pub force: ForceMode,
    pub measure: MeasureMode,
    pub range: CurrentRange,
}

impl SourceMode {
    pub fn new(force: ForceMode, measure: MeasureMode, range: CurrentRange) -> Self {
        Self { force, measure, range }
    }

    /// Whether switching from `self` to `next` makes the firmware zero the output.
    ///
    /// A new force mode always does. A new current range does when the channel
    /// sources current. The measure sub-mode never does.
    pub fn zeroes_output(&self, next: &SourceMode) -> bool {
        if self.force != next.force {
            return true;
        }
        self.range != next.range && next.force.sources_current()
    }

    pub fn setpoint_quantity(&self) -> Quantity {
        if self.force.sources_current() {
            Quantity::Current
        } else {
            Quantity::Voltage
        }
    }
}

/// Power-on and reset state: high impedance, 5uA range.
impl Default for SourceMode {
    fn default() -> Self {
        Self::new(ForceMode::HizV, MeasureMode::Hiz, CurrentRange::Ua5)
    }
}

impl Display for SourceMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.force, self.measure, self.range)
    }
}

impl FromStr for SourceMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_reply(s);
        if parts.len() != 3 {
            return Err(ProtocolError::UnexpectedResponse(s.to_string()));
        }
        Ok(SourceMode {
            force: parts[0].parse()?,
            measure: parts[1].parse()?,
            range: parts[2].parse()?,
        })
    }
}

/// Protective clamp expressed as fractions of full scale, e.g. -0.5..0.5.
///
/// The firmware does not calibrate clamps, expect errors of up to a tenth of the
/// requested fraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampLimits {
    pub low: f64,
    pub high: f64,
}

impl ClampLimits {
    pub fn new(low: f64, high: f64) -> crate::Result<Self> {
        check_magnitude("clamp fraction", low, 1.0)?;
        check_magnitude("clamp fraction", high, 1.0)?;
        if low > high {
            return Err(Error::argument(anyhow!("clamp low {} above high {}", low, high)));
        }
        Ok(Self { low, high })
    }

    pub fn apply(&self, value: f64, full_scale: f64) -> f64 {
        value.max(self.low * full_scale).min(self.high * full_scale)
    }
}

impl Default for ClampLimits {
    fn default() -> Self {
        Self { low: -1.0, high: 1.0 }
    }
}

impl Display for ClampLimits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.low, self.high)
    }
}

impl FromStr for ClampLimits {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_reply(s);
        let unexpected = || ProtocolError::UnexpectedResponse(s.to_string());
        if parts.len() != 2 {
            return Err(unexpected());
        }
        let low = parts[0].parse::<f64>().map_err(|_| unexpected())?;
        let high = parts[1].parse::<f64>().map_err(|_| unexpected())?;
        ClampLimits::new(low, high).map_err(|_| unexpected())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmuCommand {
    SetSourceMode {
        channel: u8,
        mode: SourceMode,
    },
    QuerySourceMode {
        channel: u8,
    },
    SetLevel {
        channel: u8,
        quantity: Quantity,
        value: f64,
    },
    QueryLevel {
        channel: u8,
        quantity: Quantity,
    },
    QueryLastLevel {
        channel: u8,
        quantity: Quantity,
    },
    SetClamp {
        channel: u8,
        quantity: Quantity,
        limits: ClampLimits,
    },
    QueryClamp {
        channel: u8,
        quantity: Quantity,
    },
    Measure {
        channel: u8,
        quantity: Quantity,
    },
    SetRouting {
        chip_select: u8,
        pmu_channel: u8,
        mode: RoutingMode,
    },
    QueryRouting {
        chip_select: u8,
        pmu_channel: u8,
    },
}

impl SmuCommand {
    pub fn is_query(&self) -> bool {
        !matches!(
            self,
            SmuCommand::SetSourceMode { .. }
                | SmuCommand::SetLevel { .. }
                | SmuCommand::SetClamp { .. }
                | SmuCommand::SetRouting { .. }
        )
    }

    /// Validate the arguments and render the command line (without terminator).
    pub fn to_scpi(&self) -> crate::Result<String> {
        let ch = |x: u8| check_channel("SMU", x, CHANNELS);
        let route = |cs: u8, pmu: u8| {
            check_channel("chip select", cs, CHIP_SELECTS)?;
            check_channel("PMU", pmu, PMU_CHANNELS)
        };
        let ret = match self {
            SmuCommand::SetSourceMode { channel, mode } => {
                ch(*channel)?;
                format!("SOUR:MODE {},{}", channel, mode)
            }
            SmuCommand::QuerySourceMode { channel } => {
                ch(*channel)?;
                format!("SOUR:MODE? {}", channel)
            }
            SmuCommand::SetLevel {
                channel,
                quantity,
                value,
            } => {
                ch(*channel)?;
                let limit = match quantity {
                    Quantity::Voltage => VOLTAGE_FULL_SCALE,
                    Quantity::Current => CurrentRange::Ma50.full_scale(),
                };
                check_magnitude(quantity.unit(), *value, limit)?;
                format!("SOUR:{} {},{}", quantity, channel, format_number(*value)?)
            }
            SmuCommand::QueryLevel { channel, quantity } => {
                ch(*channel)?;
                format!("SOUR:{}? {}", quantity, channel)
            }
            SmuCommand::QueryLastLevel { channel, quantity } => {
                ch(*channel)?;
                format!("SOUR:{}:LAST? {}", quantity, channel)
            }
            SmuCommand::SetClamp {
                channel,
                quantity,
                limits,
            } => {
                ch(*channel)?;
                let limits = ClampLimits::new(limits.low, limits.high)?;
                format!(
                    "SOUR:CLAM:{} {},{},{}",
                    quantity,
                    channel,
                    format_number(limits.low)?,
                    format_number(limits.high)?
                )
            }
            SmuCommand::QueryClamp { channel, quantity } => {
                ch(*channel)?;
                format!("SOUR:CLAM:{}? {}", quantity, channel)
            }
            SmuCommand::Measure { channel, quantity } => {
                ch(*channel)?;
                format!("MEAS:{}? {}", quantity, channel)
            }
            SmuCommand::SetRouting {
                chip_select,
                pmu_channel,
                mode,
            } => {
                route(*chip_select, *pmu_channel)?;
                format!("ADM:ROUT {},{},{}", chip_select, pmu_channel, mode)
            }
            SmuCommand::QueryRouting {
                chip_select,
                pmu_channel,
            } => {
                route(*chip_select, *pmu_channel)?;
                format!("ADM:ROUT? {},{}", chip_select, pmu_channel)
            }
        };
        Ok(ret)
    }

    /// Returns `None` if the header does not belong to the SPSMU command set.
    pub fn parse(line: &Line) -> Option<Result<Self, ParseError>> {
        for quantity in Quantity::ALL.iter().copied() {
            let node = match quantity {
                Quantity::Voltage => "VOLTage",
                Quantity::Current => "CURRent",
            };
            if line.is(&format!("SOURce:{}", node)) {
                return Some(parse_level(line, quantity));
            } else if line.is(&format!("SOURce:{}?", node)) {
                return Some(parse_channel(line).map(|channel| SmuCommand::QueryLevel { channel, quantity }));
            } else if line.is(&format!("SOURce:{}:LAST?", node)) {
                return Some(parse_channel(line).map(|channel| SmuCommand::QueryLastLevel { channel, quantity }));
            } else if line.is(&format!("SOURce:CLAMp:{}", node)) {
                return Some(parse_clamp(line, quantity));
            } else if line.is(&format!("SOURce:CLAMp:{}?", node)) {
                return Some(parse_channel(line).map(|channel| SmuCommand::QueryClamp { channel, quantity }));
            } else if line.is(&format!("MEASure:{}?", node)) {
                return Some(parse_channel(line).map(|channel| SmuCommand::Measure { channel, quantity }));
            }
        }
        let ret = if line.is("SOURce:MODE") {
            parse_source_mode(line)
        } else if line.is("SOURce:MODE?") {
            parse_channel(line).map(|channel| SmuCommand::QuerySourceMode { channel })
        } else if line.is("ADMin:ROUTe") {
            line.expect_args(3).and_then(|_| {
                Ok(SmuCommand::SetRouting {
                    chip_select: line.channel(0, CHIP_SELECTS)?,
                    pmu_channel: line.channel(1, PMU_CHANNELS)?,
                    mode: line.arg(2)?,
                })
            })
        } else if line.is("ADMin:ROUTe?") {
            line.expect_args(2).and_then(|_| {
                Ok(SmuCommand::QueryRouting {
                    chip_select: line.channel(0, CHIP_SELECTS)?,
                    pmu_channel: line.channel(1, PMU_CHANNELS)?,
                })
            })
        } else {
            return None;
        };
        Some(ret)
    }
}

fn parse_channel(line: &Line) -> Result<u8, ParseError> {
    line.expect_args(1)?;
    line.channel(0, CHANNELS)
}

fn parse_source_mode(line: &Line) -> Result<SmuCommand, ParseError> {
    line.expect_args(4)?;
    Ok(SmuCommand::SetSourceMode {
        channel: line.channel(0, CHANNELS)?,
        mode: SourceMode {
            force: line.arg(1)?,
            measure: line.arg(2)?,
            range: line.arg(3)?,
        },
    })
}

fn parse_level(line: &Line, quantity: Quantity) -> Result<SmuCommand, ParseError> {
    line.expect_args(2)?;
    let channel = line.channel(0, CHANNELS)?;
    let value = line.number(1)?;
    Ok(SmuCommand::SetLevel {
        channel,
        quantity,
        value,
    })
}

fn parse_clamp(line: &Line, quantity: Quantity) -> Result<SmuCommand, ParseError> {
    line.expect_args(3)?;
    let channel = line.channel(0, CHANNELS)?;
    let low = line.number(1)?;
    let high = line.number(2)?;
    let limits = ClampLimits::new(low, high).map_err(|_| ParseError::OutOfRange(format!("{},{}", low, high)))?;
    Ok(SmuCommand::SetClamp {
        channel,
        quantity,
        limits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_commands() {
        let mode = SourceMode::new(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua5);
        let cmd = SmuCommand::SetSourceMode { channel: 1, mode };
        assert_eq!(cmd.to_scpi().unwrap(), "SOUR:MODE 1,FV,MI,UA5");

        let cmd = SmuCommand::SetLevel {
            channel: 16,
            quantity: Quantity::Current,
            value: 12.5,
        };
        assert_eq!(cmd.to_scpi().unwrap(), "SOUR:CURR 16,12.5");

        let cmd = SmuCommand::QueryLastLevel {
            channel: 2,
            quantity: Quantity::Voltage,
        };
        assert_eq!(cmd.to_scpi().unwrap(), "SOUR:VOLT:LAST? 2");

        let cmd = SmuCommand::SetClamp {
            channel: 3,
            quantity: Quantity::Voltage,
            limits: ClampLimits::new(-0.5, 0.5).unwrap(),
        };
        assert_eq!(cmd.to_scpi().unwrap(), "SOUR:CLAM:VOLT 3,-0.5,0.5");

        let cmd = SmuCommand::SetRouting {
            chip_select: 1,
            pmu_channel: 4,
            mode: RoutingMode::Sense,
        };
        assert_eq!(cmd.to_scpi().unwrap(), "ADM:ROUT 1,4,SENSE");
        assert!(!cmd.is_query());

        let cmd = SmuCommand::Measure {
            channel: 5,
            quantity: Quantity::Current,
        };
        assert_eq!(cmd.to_scpi().unwrap(), "MEAS:CURR? 5");
        assert!(cmd.is_query());
    }

    #[test]
    fn reject_invalid_arguments() {
        let cmd = SmuCommand::QuerySourceMode { channel: 17 };
        assert!(matches!(cmd.to_scpi(), Err(Error::Argument(_))));
        let cmd = SmuCommand::SetRouting {
            chip_select: 5,
            pmu_channel: 1,
            mode: RoutingMode::All,
        };
        assert!(matches!(cmd.to_scpi(), Err(Error::Argument(_))));
        assert!(ClampLimits::new(0.5, -0.5).is_err());
        assert!(ClampLimits::new(-1.5, 0.5).is_err());
        let cmd = SmuCommand::SetLevel {
            channel: 1,
            quantity: Quantity::Voltage,
            value: f64::NAN,
        };
        assert!(matches!(cmd.to_scpi(), Err(Error::Argument(_))));
    }

    #[test]
    fn parse_lines() {
        let parse = |x: &str| SmuCommand::parse(&Line::parse(x));
        assert_eq!(
            parse("sour:mode 4,fi,mv,ua20"),
            Some(Ok(SmuCommand::SetSourceMode {
                channel: 4,
                mode: SourceMode::new(ForceMode::Fi, MeasureMode::Mv, CurrentRange::Ua20),
            }))
        );
        assert_eq!(
            parse("sour:curr 2,3.000000"),
            Some(Ok(SmuCommand::SetLevel {
                channel: 2,
                quantity: Quantity::Current,
                value: 3.0,
            }))
        );
        assert_eq!(
            parse("MEAS:VOLT? 16"),
            Some(Ok(SmuCommand::Measure {
                channel: 16,
                quantity: Quantity::Voltage,
            }))
        );
        assert_eq!(
            parse("SOURCE:CLAMP:CURRENT? 1"),
            Some(Ok(SmuCommand::QueryClamp {
                channel: 1,
                quantity: Quantity::Current,
            }))
        );
        assert_eq!(
            parse("ADM:ROUT 2,3,force"),
            Some(Ok(SmuCommand::SetRouting {
                chip_select: 2,
                pmu_channel: 3,
                mode: RoutingMode::Force,
            }))
        );
        assert_eq!(
            parse("sour:mode 1,fv,mi,ua7"),
            Some(Err(ParseError::IllegalParameter("ua7".to_string())))
        );
        assert_eq!(parse("SOUR:CLAM:VOLT 1,0.5,-0.5"), Some(Err(ParseError::OutOfRange("0.5,-0.5".to_string()))));
        assert_eq!(parse("SOUR:RANG 1,LOW"), None);
    }

    #[test]
    fn mode_switch_side_effects() {
        let fv_mi = SourceMode::new(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua5);
        let fv_mv = SourceMode::new(ForceMode::Fv, MeasureMode::Mv, CurrentRange::Ua5);
        let fi_mi = SourceMode::new(ForceMode::Fi, MeasureMode::Mi, CurrentRange::Ua5);
        let fi_mi_20 = SourceMode::new(ForceMode::Fi, MeasureMode::Mi, CurrentRange::Ua20);
        let fv_mi_20 = SourceMode::new(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua20);

        assert!(fv_mi.zeroes_output(&fi_mi));
        assert!(!fv_mi.zeroes_output(&fv_mv));
        assert!(fi_mi.zeroes_output(&fi_mi_20));
        assert!(!fv_mi.zeroes_output(&fv_mi_20));
        assert!(!fi_mi.zeroes_output(&fi_mi));
    }

    #[test]
    fn source_mode_replies() {
        let mode: SourceMode = "\"FV\",\"MI\",\"UA5\"".parse().unwrap();
        assert_eq!(mode, SourceMode::new(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua5));
        let mode: SourceMode = "fi,mv,ua20".parse().unwrap();
        assert_eq!(mode.to_string(), "FI,MV,UA20");
        assert_eq!(SourceMode::default().to_string(), "HIZV,HIZ,UA5");
        assert!("FV,MI".parse::<SourceMode>().is_err());
        let mode: SourceMode = "\"SINKI,MTEMP,MA50\"".parse().unwrap();
        assert_eq!(mode, SourceMode::new(ForceMode::SinkI, MeasureMode::Mtemp, CurrentRange::Ma50));
        let clamp: ClampLimits = "\"-0.5\",\"0.25\"".parse().unwrap();
        assert_eq!(clamp, ClampLimits::new(-0.5, 0.25).unwrap());
        let clamp: ClampLimits = "-0.5,0.25".parse().unwrap();
        assert_eq!(clamp, ClampLimits::new(-0.5, 0.25).unwrap());
        assert_eq!(clamp.apply(10.0, 10.0), 2.5);
        assert_eq!(clamp.apply(-10.0, 10.0), -5.0);
    }
}
