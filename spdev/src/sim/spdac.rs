use spdev_protocol::dac::{
    self, DacCommand, DcMode, Direction, Generator, ListTriggerMode, OutputMode, OutputRange, Repetitions,
    SweepGeneration, TriggerSource,
};
use spdev_protocol::scpi::{format_number, Line, ParseError};
use spdev_protocol::Identity;

use super::Firmware;

pub const SERIAL: &str = "SP-0001";
pub const FIRMWARE: &str = "0.3-1.2";

/// Power-on slew rate in V/s.
pub const DEFAULT_SLEW_RATE: f64 = 1000.0;

/// Power-on dwell time of both generators in s.
pub const DEFAULT_DWELL: f64 = 1e-3;

/// Settings of the list and sweep generators of one output.
///
/// Time is not simulated. An immediately triggered finite run completes at
/// once and leaves the output at its final point. A run repeated forever
/// holds the first point until it is aborted.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorState {
    pub sweep_start: f64,
    pub sweep_stop: f64,
    pub sweep_points: u32,
    pub sweep_generation: SweepGeneration,
    pub sweep_dwell: f64,
    pub sweep_count: Repetitions,
    pub list: Vec<f64>,
    pub list_dwell: f64,
    pub list_count: Repetitions,
    pub list_mode: ListTriggerMode,
    pub list_direction: Direction,
    pub delay: f64,
    pub source: TriggerSource,
    pub continuous: bool,
    /// Next list point in step mode.
    pub position: usize,
    /// Cycles left of the running generator, -1 while it runs forever.
    pub cycles_remaining: i64,
}

impl Default for GeneratorState {
    fn default() -> Self {
        Self {
            sweep_start: 0.0,
            sweep_stop: 0.0,
            sweep_points: dac::MIN_SWEEP_POINTS,
            sweep_generation: SweepGeneration::Step,
            sweep_dwell: DEFAULT_DWELL,
            sweep_count: Repetitions::default(),
            list: Vec::new(),
            list_dwell: DEFAULT_DWELL,
            list_count: Repetitions::default(),
            list_mode: ListTriggerMode::Auto,
            list_direction: Direction::Up,
            delay: 0.0,
            source: TriggerSource::Immediate,
            continuous: false,
            position: 0,
            cycles_remaining: 0,
        }
    }
}

impl GeneratorState {
    fn points(&self, generator: Generator) -> usize {
        match generator {
            Generator::List => self.list.len(),
            Generator::Sweep => self.sweep_points as usize,
        }
    }

    /// Output sequence of one cycle of `generator`.
    fn sequence(&self, generator: Generator) -> Vec<f64> {
        match generator {
            Generator::List => {
                let mut ret = self.list.clone();
                if self.list_direction == Direction::Down {
                    ret.reverse();
                }
                ret
            }
            Generator::Sweep => {
                let n = self.sweep_points.max(2);
                let step = (self.sweep_stop - self.sweep_start) / (n - 1) as f64;
                (0..n).map(|idx| self.sweep_start + step * idx as f64).collect()
            }
        }
    }

    fn count(&self, generator: Generator) -> Repetitions {
        match generator {
            Generator::List => self.list_count,
            Generator::Sweep => self.sweep_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputState {
    pub range: OutputRange,
    pub mode: OutputMode,
    pub dc_mode: DcMode,
    /// Voltage present at the output.
    pub voltage: f64,
    /// Last accepted setpoint.
    pub last: f64,
    pub slew_rate: f64,
    pub generator: GeneratorState,
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            range: OutputRange::default(),
            mode: OutputMode::default(),
            dc_mode: DcMode::default(),
            voltage: 0.0,
            last: 0.0,
            slew_rate: DEFAULT_SLEW_RATE,
            generator: GeneratorState::default(),
        }
    }
}

impl OutputState {
    fn active_generator(&self) -> Option<Generator> {
        match self.dc_mode {
            DcMode::Fixed => None,
            DcMode::List => Some(Generator::List),
            DcMode::Sweep => Some(Generator::Sweep),
        }
    }

    /// Run the selected generator if it is triggered immediately. Other
    /// trigger sources only arm it.
    fn initiate(&mut self) -> Result<(), ParseError> {
        let generator = match self.active_generator() {
            Some(x) => x,
            None => return Ok(()),
        };
        if self.generator.source != TriggerSource::Immediate {
            return Ok(());
        }
        let values = self.generator.sequence(generator);
        let full_scale = self.range.full_scale();
        if values.is_empty() {
            return Err(ParseError::MissingParameter);
        }
        if let Some(x) = values.iter().find(|x| x.abs() > full_scale) {
            return Err(ParseError::OutOfRange(x.to_string()));
        }
        let count = self.generator.count(generator);
        let state = &mut self.generator;
        if generator == Generator::List && state.list_mode == ListTriggerMode::Step {
            let len = values.len();
            self.voltage = values[state.position % len];
            state.position += 1;
            state.cycles_remaining = match count {
                Repetitions::Forever => -1,
                Repetitions::Count(n) => (n as i64 - (state.position / len) as i64).max(0),
            };
            return Ok(());
        }
        match count {
            Repetitions::Forever => {
                self.voltage = values[0];
                state.cycles_remaining = -1;
            }
            Repetitions::Count(_) => {
                self.voltage = values[values.len() - 1];
                state.cycles_remaining = 0;
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.generator.cycles_remaining = 0;
        self.generator.position = 0;
    }
}

/// SPDac with both ADC sub-boards fitted. Inputs 1/2 and 5/6 are wired back
/// to outputs 1/2, all other inputs read 0 V.
pub struct SpDacFirmware {
    pub outputs: [OutputState; dac::OUTPUT_CHANNELS as usize],
    pub adc_boards: u8,
}

impl Default for SpDacFirmware {
    fn default() -> Self {
        Self {
            outputs: Default::default(),
            adc_boards: dac::MAX_ADC_BOARDS,
        }
    }
}

impl SpDacFirmware {
    fn output(&mut self, channel: u8) -> &mut OutputState {
        &mut self.outputs[channel as usize - 1]
    }

    fn measure(&self, input: u8) -> Result<f64, ParseError> {
        if input > self.adc_boards * dac::INPUTS_PER_BOARD {
            return Err(ParseError::OutOfRange(format!("channel {}", input)));
        }
        let ret = match (input - 1) % dac::INPUTS_PER_BOARD {
            idx @ 0..=1 => {
                let output = &self.outputs[idx as usize];
                if output.mode == OutputMode::Tristate {
                    0.0
                } else {
                    output.voltage
                }
            }
            _ => 0.0,
        };
        Ok(ret)
    }

    fn apply(&mut self, cmd: DacCommand) -> Result<Option<String>, ParseError> {
        let ret = match cmd {
            DacCommand::SetRange { channel, range } => {
                let output = self.output(channel);
                // the DAC code is kept, so the output scales with the range
                output.voltage *= range.full_scale() / output.range.full_scale();
                output.range = range;
                None
            }
            DacCommand::QueryRange { channel } => Some(quoted(self.output(channel).range.token())),
            DacCommand::SetOutputMode { channel, mode } => {
                self.output(channel).mode = mode;
                None
            }
            DacCommand::QueryOutputMode { channel } => Some(quoted(self.output(channel).mode.token())),
            DacCommand::SetVoltage { channel, volts } => {
                let output = self.output(channel);
                if volts.abs() > output.range.full_scale() {
                    return Err(ParseError::OutOfRange(volts.to_string()));
                }
                output.voltage = volts;
                output.last = volts;
                None
            }
            DacCommand::QueryVoltage { channel } => Some(number(self.output(channel).voltage)),
            DacCommand::QueryLastVoltage { channel } => Some(number(self.output(channel).last)),
            DacCommand::SetSlewRate {
                channel,
                volts_per_second,
            } => {
                self.output(channel).slew_rate = volts_per_second;
                None
            }
            DacCommand::QuerySlewRate { channel } => Some(number(self.output(channel).slew_rate)),
            DacCommand::SetDcMode { channel, mode } => {
                self.output(channel).dc_mode = mode;
                None
            }
            DacCommand::QueryDcMode { channel } => Some(quoted(self.output(channel).dc_mode.token())),
            DacCommand::MeasureVoltage { channel } => Some(number(self.measure(channel)?)),
            DacCommand::SetSweepStart { channel, volts } => {
                self.output(channel).generator.sweep_start = volts;
                None
            }
            DacCommand::QuerySweepStart { channel } => Some(number(self.output(channel).generator.sweep_start)),
            DacCommand::SetSweepStop { channel, volts } => {
                self.output(channel).generator.sweep_stop = volts;
                None
            }
            DacCommand::QuerySweepStop { channel } => Some(number(self.output(channel).generator.sweep_stop)),
            DacCommand::SetSweepPoints { channel, points } => {
                self.output(channel).generator.sweep_points = points;
                None
            }
            DacCommand::SetSweepGeneration { channel, generation } => {
                self.output(channel).generator.sweep_generation = generation;
                None
            }
            DacCommand::QuerySweepTime { channel } => {
                let state = &self.output(channel).generator;
                Some(number(state.sweep_dwell * state.sweep_points as f64))
            }
            DacCommand::SetListVoltages { channel, volts, append } => {
                let state = &mut self.output(channel).generator;
                if !append {
                    state.list.clear();
                }
                state.list.extend(volts);
                state.position = 0;
                None
            }
            DacCommand::QueryListVoltages { channel } => {
                let list = &self.output(channel).generator.list;
                Some(list.iter().map(|x| number(*x)).collect::<Vec<_>>().join(","))
            }
            DacCommand::SetListTriggerMode { channel, mode } => {
                self.output(channel).generator.list_mode = mode;
                None
            }
            DacCommand::SetListDirection { channel, direction } => {
                self.output(channel).generator.list_direction = direction;
                None
            }
            DacCommand::SetDwell {
                channel,
                generator,
                seconds,
            } => {
                let state = &mut self.output(channel).generator;
                match generator {
                    Generator::List => state.list_dwell = seconds,
                    Generator::Sweep => state.sweep_dwell = seconds,
                }
                None
            }
            DacCommand::SetCount {
                channel,
                generator,
                repetitions,
            } => {
                let state = &mut self.output(channel).generator;
                match generator {
                    Generator::List => state.list_count = repetitions,
                    Generator::Sweep => state.sweep_count = repetitions,
                }
                None
            }
            DacCommand::QueryPoints { channel, generator } => {
                Some(self.output(channel).generator.points(generator).to_string())
            }
            DacCommand::QueryCyclesRemaining { channel, generator } => {
                let output = self.output(channel);
                let ret = if output.active_generator() == Some(generator) {
                    output.generator.cycles_remaining
                } else {
                    0
                };
                Some(ret.to_string())
            }
            DacCommand::SetDcDelay { channel, seconds } => {
                self.output(channel).generator.delay = seconds;
                None
            }
            DacCommand::SetDcTriggerSource { channel, source } => {
                self.output(channel).generator.source = source;
                None
            }
            DacCommand::SetDcContinuous { channel, on } => {
                self.output(channel).generator.continuous = on;
                None
            }
            DacCommand::DcInitiate { channel } => {
                self.output(channel).initiate()?;
                None
            }
            DacCommand::DcAbort { channel } => {
                self.output(channel).abort();
                None
            }
        };
        Ok(ret)
    }
}

impl Firmware for SpDacFirmware {
    fn identity(&self) -> Identity {
        Identity::new(dac::MODEL, SERIAL, FIRMWARE)
    }

    fn reset(&mut self) {
        self.outputs = Default::default();
    }

    fn execute(&mut self, line: &Line) -> Option<Result<Option<String>, ParseError>> {
        let ret = match DacCommand::parse(line)? {
            Ok(cmd) => self.apply(cmd),
            Err(err) => Err(err),
        };
        Some(ret)
    }
}

pub(crate) fn quoted(x: &str) -> String {
    format!("\"{}\"", x)
}

pub(crate) fn number(x: f64) -> String {
    format_number(x).unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;

    #[test]
    fn outputs_loop_back_to_inputs() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        assert_eq!(sim.process_line("SOUR:VOLT 1,1.5"), None);
        assert_eq!(sim.process_line("SOUR:VOLT 2,-2"), None);
        assert_eq!(sim.process_line("MEAS:VOLT? 1"), Some("1.5".to_string()));
        assert_eq!(sim.process_line("MEAS:VOLT? 6"), Some("-2".to_string()));
        assert_eq!(sim.process_line("MEAS:VOLT? 3"), Some("0".to_string()));
        assert_eq!(sim.process_line("SOUR:OUTP 1,TRISTATE"), None);
        assert_eq!(sim.process_line("MEAS:VOLT? 5"), Some("0".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("1.5".to_string()));
    }

    #[test]
    fn range_switch_scales_output() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        sim.process_line("SOUR:VOLT 1,2");
        sim.process_line("SOUR:RANG 1,HIGH");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("4".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT:LAST? 1"), Some("2".to_string()));
        assert_eq!(sim.process_line("SOUR:RANG? 1"), Some("\"HIGH\"".to_string()));
    }

    #[test]
    fn reject_setpoint_beyond_range() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        assert_eq!(sim.process_line("SOUR:VOLT 1,7"), None);
        assert_eq!(sim.process_line("SYST:ERR?"), Some("-222,\"Data out of range\"".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT:LAST? 1"), Some("0".to_string()));
        assert_eq!(sim.process_line("*RST"), None);
        assert_eq!(sim.process_line("SOUR:OUTP? 2"), Some("\"CLAMPED6K\"".to_string()));
    }

    #[test]
    fn list_runs_to_final_point() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        sim.process_line("SOUR:VOLT:MODE 1,LIST");
        sim.process_line("SOUR:LIST:VOLT 1,0.5,1,1.5");
        sim.process_line("SOUR:LIST:VOLT:APP 1,2");
        assert_eq!(sim.process_line("SOUR:LIST:POIN? 1"), Some("4".to_string()));
        assert_eq!(sim.process_line("SOUR:LIST:VOLT? 1"), Some("0.5,1,1.5,2".to_string()));
        sim.process_line("SOUR:DC:INIT 1");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("2".to_string()));
        assert_eq!(sim.process_line("SOUR:LIST:NCL? 1"), Some("0".to_string()));

        sim.process_line("SOUR:LIST:DIR 1,DOWN");
        sim.process_line("SOUR:DC:INIT 1");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("0.5".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT:LAST? 1"), Some("0".to_string()));
    }

    #[test]
    fn stepped_list_advances_per_trigger() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        sim.process_line("SOUR:VOLT:MODE 2,LIST");
        sim.process_line("SOUR:LIST:VOLT 2,1,2");
        sim.process_line("SOUR:LIST:TMOD 2,STEP");
        sim.process_line("SOUR:LIST:COUN 2,2");
        sim.process_line("SOUR:DC:INIT 2");
        assert_eq!(sim.process_line("SOUR:VOLT? 2"), Some("1".to_string()));
        sim.process_line("SOUR:DC:INIT 2");
        assert_eq!(sim.process_line("SOUR:VOLT? 2"), Some("2".to_string()));
        assert_eq!(sim.process_line("SOUR:LIST:NCL? 2"), Some("1".to_string()));
        sim.process_line("SOUR:DC:INIT 2");
        assert_eq!(sim.process_line("SOUR:VOLT? 2"), Some("1".to_string()));
    }

    #[test]
    fn perpetual_sweep_holds_until_aborted() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        sim.process_line("SOUR:VOLT:MODE 1,SWE");
        sim.process_line("SOUR:SWE:STAR 1,-1");
        sim.process_line("SOUR:SWE:STOP 1,1");
        sim.process_line("SOUR:SWE:POIN 1,5");
        sim.process_line("SOUR:SWE:DWEL 1,0.01");
        sim.process_line("SOUR:SWE:COUN 1,-1");
        assert_eq!(sim.process_line("SOUR:SWE:TIME? 1"), Some("0.05".to_string()));
        sim.process_line("SOUR:DC:INIT 1");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("-1".to_string()));
        assert_eq!(sim.process_line("SOUR:SWE:NCL? 1"), Some("-1".to_string()));
        assert_eq!(sim.process_line("SOUR:LIST:NCL? 1"), Some("0".to_string()));
        sim.process_line("SOUR:DC:ABOR 1");
        assert_eq!(sim.process_line("SOUR:SWE:NCL? 1"), Some("0".to_string()));
        assert_eq!(sim.process_line("SOUR:SWE:STOP? 1"), Some("1".to_string()));
    }

    #[test]
    fn generator_respects_range() {
        let mut sim = Simulator::new(SpDacFirmware::default());
        sim.process_line("SOUR:VOLT:MODE 1,SWE");
        sim.process_line("SOUR:SWE:STOP 1,8");
        sim.process_line("SOUR:DC:INIT 1");
        assert_eq!(sim.process_line("SYST:ERR?"), Some("-222,\"Data out of range\"".to_string()));
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("0".to_string()));

        sim.process_line("SOUR:DC:TRIG:SOUR 1,BUS");
        sim.process_line("SOUR:RANG 1,HIGH");
        sim.process_line("SOUR:DC:INIT 1");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("0".to_string()));
        sim.process_line("SOUR:DC:TRIG:SOUR 1,IMM");
        sim.process_line("SOUR:DC:INIT 1");
        assert_eq!(sim.process_line("SOUR:VOLT? 1"), Some("8".to_string()));
    }

    #[test]
    fn single_board_has_four_inputs() {
        let mut firmware = SpDacFirmware::default();
        firmware.adc_boards = 1;
        let mut sim = Simulator::new(firmware);
        assert_eq!(sim.process_line("MEAS:VOLT? 5"), None);
        assert_eq!(sim.process_line("SYST:ERR:COUN?"), Some("1".to_string()));
    }
}
