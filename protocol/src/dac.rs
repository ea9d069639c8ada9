//! Command set of the SPDac precision DAC/ADC unit.

use std::time::Duration;

use crate::scpi::{format_number, Line, ParseError};
use crate::util::{check_channel, check_magnitude};

pub const MODEL: &str = "SPDAC";

/// Number of DAC output channels.
pub const OUTPUT_CHANNELS: u8 = 2;

/// ADC inputs per chained sub-board.
pub const INPUTS_PER_BOARD: u8 = 4;

pub const MAX_ADC_BOARDS: u8 = 2;

pub const MAX_INPUT_CHANNELS: u8 = INPUTS_PER_BOARD * MAX_ADC_BOARDS;

/// Largest magnitude accepted for a voltage setpoint.
pub const VOLTAGE_LIMIT: f64 = 10.0;

scpi_enum! {
    pub enum OutputRange: "output range" {
        /// +-5V
        Low => "LOW",
        /// +-10V
        High => "HIGH",
    }
}

impl OutputRange {
    pub fn full_scale(&self) -> f64 {
        match self {
            OutputRange::Low => 5.0,
            OutputRange::High => 10.0,
        }
    }
}

impl Default for OutputRange {
    fn default() -> Self {
        OutputRange::Low
    }
}

scpi_enum! {
    /// Output impedance of a DAC channel.
    pub enum OutputMode: "output mode" {
        Normal => "NORMAL",
        Clamped6k => "CLAMPED6K" | "CLAMPED_6K",
        Tristate => "TRISTATE",
    }
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Clamped6k
    }
}

scpi_enum! {
    pub enum DcMode: "DC mode" {
        Fixed => "FIX" | "FIXED",
        List => "LIST",
        Sweep => "SWE" | "SWEEP",
    }
}

impl Default for DcMode {
    fn default() -> Self {
        DcMode::Fixed
    }
}

scpi_enum! {
    /// One of the two automatic DC generators.
    pub enum Generator: "generator" {
        List => "LIST",
        Sweep => "SWE" | "SWEEP",
    }
}

impl From<Generator> for DcMode {
    fn from(x: Generator) -> Self {
        match x {
            Generator::List => DcMode::List,
            Generator::Sweep => DcMode::Sweep,
        }
    }
}

scpi_enum! {
    /// Shape of a sweep: a staircase, or a linear ramp.
    pub enum SweepGeneration: "sweep generation" {
        Step => "STEP",
        Analog => "ANAL" | "ANALOG",
    }
}

scpi_enum! {
    /// `Step` advances the list by one point per trigger, `Auto` runs it through.
    pub enum ListTriggerMode: "list trigger mode" {
        Step => "STEP",
        Auto => "AUTO",
    }
}

scpi_enum! {
    pub enum Direction: "list direction" {
        Up => "UP",
        Down => "DOWN",
    }
}

scpi_enum! {
    /// What starts an initiated DC generator. `Bus` waits for `*TRG`.
    pub enum TriggerSource: "trigger source" {
        Hold => "HOLD",
        Immediate => "IMM" | "IMMEDIATE",
        Bus => "BUS",
    }
}

/// How often a list or sweep is run. Sent as `-1` when it runs until aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetitions {
    Count(u32),
    Forever,
}

impl Repetitions {
    pub fn to_wire(&self) -> i64 {
        match self {
            Repetitions::Count(x) => *x as i64,
            Repetitions::Forever => -1,
        }
    }

    pub fn from_wire(x: i64) -> Option<Self> {
        match x {
            -1 => Some(Repetitions::Forever),
            x if x >= 1 && x <= u32::MAX as i64 => Some(Repetitions::Count(x as u32)),
            _ => None,
        }
    }
}

impl Default for Repetitions {
    fn default() -> Self {
        Repetitions::Count(1)
    }
}

/// Conversion speed class of an ADC input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcSpeed {
    Precise,
    Fast,
}

impl AdcSpeed {
    /// The first two inputs of every sub-board are the slow, precise ones.
    pub fn of_input(channel: u8) -> Self {
        if (channel.saturating_sub(1) % INPUTS_PER_BOARD) < 2 {
            AdcSpeed::Precise
        } else {
            AdcSpeed::Fast
        }
    }

    pub fn conversion_time(&self) -> Duration {
        match self {
            AdcSpeed::Precise => Duration::from_millis(100),
            AdcSpeed::Fast => Duration::from_micros(161),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DacCommand {
    SetRange { channel: u8, range: OutputRange },
    QueryRange { channel: u8 },
    SetOutputMode { channel: u8, mode: OutputMode },
    QueryOutputMode { channel: u8 },
    SetVoltage { channel: u8, volts: f64 },
    QueryVoltage { channel: u8 },
    QueryLastVoltage { channel: u8 },
    SetSlewRate { channel: u8, volts_per_second: f64 },
    QuerySlewRate { channel: u8 },
    SetDcMode { channel: u8, mode: DcMode },
    QueryDcMode { channel: u8 },
    MeasureVoltage { channel: u8 },
    SetSweepStart { channel: u8, volts: f64 },
    QuerySweepStart { channel: u8 },
    SetSweepStop { channel: u8, volts: f64 },
    QuerySweepStop { channel: u8 },
    SetSweepPoints { channel: u8, points: u32 },
    SetSweepGeneration { channel: u8, generation: SweepGeneration },
    /// Duration of one sweep run in seconds.
    QuerySweepTime { channel: u8 },
    SetListVoltages { channel: u8, volts: Vec<f64>, append: bool },
    QueryListVoltages { channel: u8 },
    SetListTriggerMode { channel: u8, mode: ListTriggerMode },
    SetListDirection { channel: u8, direction: Direction },
    SetDwell { channel: u8, generator: Generator, seconds: f64 },
    SetCount { channel: u8, generator: Generator, repetitions: Repetitions },
    QueryPoints { channel: u8, generator: Generator },
    QueryCyclesRemaining { channel: u8, generator: Generator },
    /// Delay between the trigger and the first point.
    SetDcDelay { channel: u8, seconds: f64 },
    SetDcTriggerSource { channel: u8, source: TriggerSource },
    SetDcContinuous { channel: u8, on: bool },
    DcInitiate { channel: u8 },
    DcAbort { channel: u8 },
}

impl DacCommand {
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            DacCommand::QueryRange { .. }
                | DacCommand::QueryOutputMode { .. }
                | DacCommand::QueryVoltage { .. }
                | DacCommand::QueryLastVoltage { .. }
                | DacCommand::QuerySlewRate { .. }
                | DacCommand::QueryDcMode { .. }
                | DacCommand::MeasureVoltage { .. }
                | DacCommand::QuerySweepStart { .. }
                | DacCommand::QuerySweepStop { .. }
                | DacCommand::QuerySweepTime { .. }
                | DacCommand::QueryListVoltages { .. }
                | DacCommand::QueryPoints { .. }
                | DacCommand::QueryCyclesRemaining { .. }
        )
    }

    /// Validate the arguments and render the command line (without terminator).
    pub fn to_scpi(&self) -> crate::Result<String> {
        let out = |ch: u8| check_channel("output", ch, OUTPUT_CHANNELS);
        let ret = match self {
            DacCommand::SetRange { channel, range } => {
                out(*channel)?;
                format!("SOUR:RANG {},{}", channel, range)
            }
            DacCommand::QueryRange { channel } => {
                out(*channel)?;
                format!("SOUR:RANG? {}", channel)
            }
            DacCommand::SetOutputMode { channel, mode } => {
                out(*channel)?;
                format!("SOUR:OUTP {},{}", channel, mode)
            }
            DacCommand::QueryOutputMode { channel } => {
                out(*channel)?;
                format!("SOUR:OUTP? {}", channel)
            }
            DacCommand::SetVoltage { channel, volts } => {
                out(*channel)?;
                check_magnitude("voltage", *volts, VOLTAGE_LIMIT)?;
                format!("SOUR:VOLT {},{}", channel, format_number(*volts)?)
            }
            DacCommand::QueryVoltage { channel } => {
                out(*channel)?;
                format!("SOUR:VOLT? {}", channel)
            }
            DacCommand::QueryLastVoltage { channel } => {
                out(*channel)?;
                format!("SOUR:VOLT:LAST? {}", channel)
            }
            DacCommand::SetSlewRate {
                channel,
                volts_per_second,
            } => {
                out(*channel)?;
                check_magnitude("slew rate", *volts_per_second, f64::MAX)?;
                if *volts_per_second <= 0.0 {
                    return Err(crate::Error::argument(anyhow::anyhow!(
                        "slew rate must be positive, got {}",
                        volts_per_second
                    )));
                }
                format!("SOUR:VOLT:SLEW {},{}", channel, format_number(*volts_per_second)?)
            }
            DacCommand::QuerySlewRate { channel } => {
                out(*channel)?;
                format!("SOUR:VOLT:SLEW? {}", channel)
            }
            DacCommand::SetDcMode { channel, mode } => {
                out(*channel)?;
                format!("SOUR:VOLT:MODE {},{}", channel, mode)
            }
            DacCommand::QueryDcMode { channel } => {
                out(*channel)?;
                format!("SOUR:VOLT:MODE? {}", channel)
            }
            DacCommand::MeasureVoltage { channel } => {
                check_channel("input", *channel, MAX_INPUT_CHANNELS)?;
                format!("MEAS:VOLT? {}", channel)
            }
            DacCommand::SetSweepStart { channel, volts } => {
                out(*channel)?;
                check_magnitude("sweep start", *volts, VOLTAGE_LIMIT)?;
                format!("SOUR:SWE:STAR {},{}", channel, format_number(*volts)?)
            }
            DacCommand::QuerySweepStart { channel } => {
                out(*channel)?;
                format!("SOUR:SWE:STAR? {}", channel)
            }
            DacCommand::SetSweepStop { channel, volts } => {
                out(*channel)?;
                check_magnitude("sweep stop", *volts, VOLTAGE_LIMIT)?;
                format!("SOUR:SWE:STOP {},{}", channel, format_number(*volts)?)
            }
            DacCommand::QuerySweepStop { channel } => {
                out(*channel)?;
                format!("SOUR:SWE:STOP? {}", channel)
            }
            DacCommand::SetSweepPoints { channel, points } => {
                out(*channel)?;
                if *points < MIN_SWEEP_POINTS {
                    return Err(crate::Error::argument(anyhow::anyhow!(
                        "A sweep needs at least {} points, got {}",
                        MIN_SWEEP_POINTS,
                        points
                    )));
                }
                format!("SOUR:SWE:POIN {},{}", channel, points)
            }
            DacCommand::SetSweepGeneration { channel, generation } => {
                out(*channel)?;
                format!("SOUR:SWE:GEN {},{}", channel, generation)
            }
            DacCommand::QuerySweepTime { channel } => {
                out(*channel)?;
                format!("SOUR:SWE:TIME? {}", channel)
            }
            DacCommand::SetListVoltages { channel, volts, append } => {
                out(*channel)?;
                if volts.is_empty() {
                    return Err(crate::Error::argument(anyhow::anyhow!("Empty voltage list")));
                }
                let mut values = Vec::with_capacity(volts.len());
                for x in volts {
                    check_magnitude("list voltage", *x, VOLTAGE_LIMIT)?;
                    values.push(format_number(*x)?);
                }
                let header = if *append { "SOUR:LIST:VOLT:APP" } else { "SOUR:LIST:VOLT" };
                format!("{} {},{}", header, channel, values.join(","))
            }
            DacCommand::QueryListVoltages { channel } => {
                out(*channel)?;
                format!("SOUR:LIST:VOLT? {}", channel)
            }
            DacCommand::SetListTriggerMode { channel, mode } => {
                out(*channel)?;
                format!("SOUR:LIST:TMOD {},{}", channel, mode)
            }
            DacCommand::SetListDirection { channel, direction } => {
                out(*channel)?;
                format!("SOUR:LIST:DIR {},{}", channel, direction)
            }
            DacCommand::SetDwell {
                channel,
                generator,
                seconds,
            } => {
                out(*channel)?;
                check_duration("dwell time", *seconds)?;
                if *seconds == 0.0 {
                    return Err(crate::Error::argument(anyhow::anyhow!("Dwell time must be positive")));
                }
                format!("SOUR:{}:DWEL {},{}", generator, channel, format_number(*seconds)?)
            }
            DacCommand::SetCount {
                channel,
                generator,
                repetitions,
            } => {
                out(*channel)?;
                if *repetitions == Repetitions::Count(0) {
                    return Err(crate::Error::argument(anyhow::anyhow!("Repetition count must be at least 1")));
                }
                format!("SOUR:{}:COUN {},{}", generator, channel, repetitions.to_wire())
            }
            DacCommand::QueryPoints { channel, generator } => {
                out(*channel)?;
                format!("SOUR:{}:POIN? {}", generator, channel)
            }
            DacCommand::QueryCyclesRemaining { channel, generator } => {
                out(*channel)?;
                format!("SOUR:{}:NCL? {}", generator, channel)
            }
            DacCommand::SetDcDelay { channel, seconds } => {
                out(*channel)?;
                check_duration("delay", *seconds)?;
                format!("SOUR:DC:DEL {},{}", channel, format_number(*seconds)?)
            }
            DacCommand::SetDcTriggerSource { channel, source } => {
                out(*channel)?;
                format!("SOUR:DC:TRIG:SOUR {},{}", channel, source)
            }
            DacCommand::SetDcContinuous { channel, on } => {
                out(*channel)?;
                format!("SOUR:DC:INIT:CONT {},{}", channel, if *on { "ON" } else { "OFF" })
            }
            DacCommand::DcInitiate { channel } => {
                out(*channel)?;
                format!("SOUR:DC:INIT {}", channel)
            }
            DacCommand::DcAbort { channel } => {
                out(*channel)?;
                format!("SOUR:DC:ABOR {}", channel)
            }
        };
        Ok(ret)
    }

    /// Returns `None` if the header does not belong to the SPDac command set.
    pub fn parse(line: &Line) -> Option<Result<Self, ParseError>> {
        let ret = if line.is("SOURce:RANGe") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetRange {
                    channel,
                    range: x.parse().map_err(|_| ParseError::IllegalParameter(x.to_string()))?,
                })
            })
        } else if line.is("SOURce:RANGe?") {
            parse_query(line, |channel| DacCommand::QueryRange { channel })
        } else if line.is("SOURce:OUTPut") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetOutputMode {
                    channel,
                    mode: x.parse().map_err(|_| ParseError::IllegalParameter(x.to_string()))?,
                })
            })
        } else if line.is("SOURce:OUTPut?") {
            parse_query(line, |channel| DacCommand::QueryOutputMode { channel })
        } else if line.is("SOURce:VOLTage") {
            parse_set(line, |channel, x| {
                let volts = parse_number(x)?;
                if volts.abs() > VOLTAGE_LIMIT {
                    return Err(ParseError::OutOfRange(x.to_string()));
                }
                Ok(DacCommand::SetVoltage { channel, volts })
            })
        } else if line.is("SOURce:VOLTage?") {
            parse_query(line, |channel| DacCommand::QueryVoltage { channel })
        } else if line.is("SOURce:VOLTage:LAST?") {
            parse_query(line, |channel| DacCommand::QueryLastVoltage { channel })
        } else if line.is("SOURce:VOLTage:SLEW") {
            parse_set(line, |channel, x| {
                let volts_per_second = parse_number(x)?;
                if volts_per_second <= 0.0 {
                    return Err(ParseError::OutOfRange(x.to_string()));
                }
                Ok(DacCommand::SetSlewRate {
                    channel,
                    volts_per_second,
                })
            })
        } else if line.is("SOURce:VOLTage:SLEW?") {
            parse_query(line, |channel| DacCommand::QuerySlewRate { channel })
        } else if line.is("SOURce:VOLTage:MODE") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetDcMode {
                    channel,
                    mode: x.parse().map_err(|_| ParseError::IllegalParameter(x.to_string()))?,
                })
            })
        } else if line.is("SOURce:VOLTage:MODE?") {
            parse_query(line, |channel| DacCommand::QueryDcMode { channel })
        } else if line.is("MEASure:VOLTage?") {
            line.expect_args(1)
                .and_then(|_| line.channel(0, MAX_INPUT_CHANNELS))
                .map(|channel| DacCommand::MeasureVoltage { channel })
        } else if line.is("SOURce:SWEep:STARt") {
            parse_set(line, |channel, x| {
                let volts = parse_voltage(x)?;
                Ok(DacCommand::SetSweepStart { channel, volts })
            })
        } else if line.is("SOURce:SWEep:STARt?") {
            parse_query(line, |channel| DacCommand::QuerySweepStart { channel })
        } else if line.is("SOURce:SWEep:STOP") {
            parse_set(line, |channel, x| {
                let volts = parse_voltage(x)?;
                Ok(DacCommand::SetSweepStop { channel, volts })
            })
        } else if line.is("SOURce:SWEep:STOP?") {
            parse_query(line, |channel| DacCommand::QuerySweepStop { channel })
        } else if line.is("SOURce:SWEep:POINts") {
            parse_set(line, |channel, x| {
                let points: u32 = x.parse().map_err(|_| ParseError::IllegalParameter(x.to_string()))?;
                if points < MIN_SWEEP_POINTS {
                    return Err(ParseError::OutOfRange(x.to_string()));
                }
                Ok(DacCommand::SetSweepPoints { channel, points })
            })
        } else if line.is("SOURce:SWEep:GENeration") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetSweepGeneration {
                    channel,
                    generation: parse_token(x)?,
                })
            })
        } else if line.is("SOURce:SWEep:TIME?") {
            parse_query(line, |channel| DacCommand::QuerySweepTime { channel })
        } else if line.is("SOURce:LIST:VOLTage") || line.is("SOURce:LIST:VOLTage:APPend") {
            let append = line.is("SOURce:LIST:VOLTage:APPend");
            parse_list(line).map(|(channel, volts)| DacCommand::SetListVoltages { channel, volts, append })
        } else if line.is("SOURce:LIST:VOLTage?") {
            parse_query(line, |channel| DacCommand::QueryListVoltages { channel })
        } else if line.is("SOURce:LIST:TMODe") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetListTriggerMode {
                    channel,
                    mode: parse_token(x)?,
                })
            })
        } else if line.is("SOURce:LIST:DIRection") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetListDirection {
                    channel,
                    direction: parse_token(x)?,
                })
            })
        } else if let Some(generator) = generator_node(line, "DWELl") {
            parse_set(line, |channel, x| {
                let seconds = parse_number(x)?;
                if seconds <= 0.0 {
                    return Err(ParseError::OutOfRange(x.to_string()));
                }
                Ok(DacCommand::SetDwell {
                    channel,
                    generator,
                    seconds,
                })
            })
        } else if let Some(generator) = generator_node(line, "COUNt") {
            parse_set(line, |channel, x| {
                let count: i64 = x.parse().map_err(|_| ParseError::IllegalParameter(x.to_string()))?;
                let repetitions = Repetitions::from_wire(count).ok_or_else(|| ParseError::OutOfRange(x.to_string()))?;
                Ok(DacCommand::SetCount {
                    channel,
                    generator,
                    repetitions,
                })
            })
        } else if let Some(generator) = generator_node(line, "POINts?") {
            parse_query(line, |channel| DacCommand::QueryPoints { channel, generator })
        } else if let Some(generator) = generator_node(line, "NCL?") {
            parse_query(line, |channel| DacCommand::QueryCyclesRemaining { channel, generator })
        } else if line.is("SOURce:DC:DELay") {
            parse_set(line, |channel, x| {
                let seconds = parse_number(x)?;
                if seconds < 0.0 {
                    return Err(ParseError::OutOfRange(x.to_string()));
                }
                Ok(DacCommand::SetDcDelay { channel, seconds })
            })
        } else if line.is("SOURce:DC:TRIGger:SOURce") {
            parse_set(line, |channel, x| {
                Ok(DacCommand::SetDcTriggerSource {
                    channel,
                    source: parse_token(x)?,
                })
            })
        } else if line.is("SOURce:DC:INITiate:CONTinuous") {
            parse_set(line, |channel, x| {
                let on = match x.to_ascii_uppercase().as_str() {
                    "ON" | "1" => true,
                    "OFF" | "0" => false,
                    _ => return Err(ParseError::IllegalParameter(x.to_string())),
                };
                Ok(DacCommand::SetDcContinuous { channel, on })
            })
        } else if line.is("SOURce:DC:INITiate") {
            parse_query(line, |channel| DacCommand::DcInitiate { channel })
        } else if line.is("SOURce:DC:ABORt") {
            parse_query(line, |channel| DacCommand::DcAbort { channel })
        } else {
            return None;
        };
        Some(ret)
    }
}

/// Smallest point count of a sweep.
pub const MIN_SWEEP_POINTS: u32 = 2;

fn check_duration(what: &str, seconds: f64) -> crate::Result<()> {
    check_magnitude(what, seconds, f64::MAX)?;
    if seconds < 0.0 {
        return Err(crate::Error::argument(anyhow::anyhow!("{} must not be negative, got {}", what, seconds)));
    }
    Ok(())
}

/// Which generator a `SOURce:LIST:<suffix>` or `SOURce:SWEep:<suffix>` header addresses.
fn generator_node(line: &Line, suffix: &str) -> Option<Generator> {
    if line.is(&format!("SOURce:LIST:{}", suffix)) {
        Some(Generator::List)
    } else if line.is(&format!("SOURce:SWEep:{}", suffix)) {
        Some(Generator::Sweep)
    } else {
        None
    }
}

fn parse_number(x: &str) -> Result<f64, ParseError> {
    match x.parse::<f64>() {
        Ok(x) if x.is_finite() => Ok(x),
        _ => Err(ParseError::IllegalParameter(x.to_string())),
    }
}

fn parse_voltage(x: &str) -> Result<f64, ParseError> {
    let volts = parse_number(x)?;
    if volts.abs() > VOLTAGE_LIMIT {
        return Err(ParseError::OutOfRange(x.to_string()));
    }
    Ok(volts)
}

fn parse_token<T: std::str::FromStr>(x: &str) -> Result<T, ParseError> {
    x.parse().map_err(|_| ParseError::IllegalParameter(x.to_string()))
}

/// A channel followed by at least one voltage.
fn parse_list(line: &Line) -> Result<(u8, Vec<f64>), ParseError> {
    if line.args.len() < 2 {
        return Err(ParseError::MissingParameter);
    }
    let channel = line.channel(0, OUTPUT_CHANNELS)?;
    let volts = line.args[1..]
        .iter()
        .map(|x| parse_voltage(x))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((channel, volts))
}

fn parse_set<F>(line: &Line, f: F) -> Result<DacCommand, ParseError>
where
    F: FnOnce(u8, &str) -> Result<DacCommand, ParseError>,
{
    line.expect_args(2)?;
    let channel = line.channel(0, OUTPUT_CHANNELS)?;
    f(channel, &line.args[1])
}

fn parse_query<F>(line: &Line, f: F) -> Result<DacCommand, ParseError>
where
    F: FnOnce(u8) -> DacCommand,
{
    line.expect_args(1)?;
    Ok(f(line.channel(0, OUTPUT_CHANNELS)?))
}
