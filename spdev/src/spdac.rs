//! Driver for the SPDac precision DAC/ADC unit.

use std::convert::TryFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::{sleep, Instant};

use spdev_protocol::dac::{
    self, AdcSpeed, DacCommand, DcMode, Direction, Generator, ListTriggerMode, OutputMode, OutputRange, Repetitions,
    SweepGeneration, TriggerSource,
};
use spdev_protocol::scpi::{parse_float, parse_int, round_significant, split_reply};
use spdev_protocol::Identity;

use crate::address::Address;
use crate::instrument::{Instrument, SessionOptions};
use crate::params::Cached;
use crate::snapshot::{ChannelSnapshot, Snapshot};
use crate::{check_identity, DeviceOptions, Error, Model};

/// Pause between the relay positions of [`SpDac::self_test`].
pub const RELAY_SETTLE: Duration = Duration::from_millis(100);

async fn send(instrument: &Instrument, cmd: DacCommand) -> crate::Result<()> {
    instrument.write(cmd.to_scpi()?).await
}

async fn ask(instrument: &Instrument, cmd: DacCommand) -> crate::Result<String> {
    instrument.query(cmd.to_scpi()?).await
}

/// Settings of a sweep run by the DC generator of an output.
#[derive(Debug, Clone, PartialEq)]
pub struct DcSweep {
    pub start: f64,
    pub stop: f64,
    pub points: u32,
    pub repetitions: Repetitions,
    /// Time spent on each point.
    pub dwell: Duration,
    /// Time between the trigger and the first point.
    pub delay: Duration,
    pub generation: SweepGeneration,
}

impl DcSweep {
    pub fn new(start: f64, stop: f64, points: u32) -> Self {
        Self {
            start,
            stop,
            points,
            repetitions: Repetitions::default(),
            dwell: DEFAULT_DWELL,
            delay: Duration::from_secs(0),
            generation: SweepGeneration::Step,
        }
    }
}

/// Settings of a voltage list run by the DC generator of an output.
#[derive(Debug, Clone, PartialEq)]
pub struct DcList {
    pub voltages: Vec<f64>,
    pub repetitions: Repetitions,
    pub dwell: Duration,
    pub delay: Duration,
    pub direction: Direction,
    pub trigger_mode: ListTriggerMode,
}

impl DcList {
    pub fn new(voltages: Vec<f64>) -> Self {
        Self {
            voltages,
            repetitions: Repetitions::default(),
            dwell: DEFAULT_DWELL,
            delay: Duration::from_secs(0),
            direction: Direction::Up,
            trigger_mode: ListTriggerMode::Auto,
        }
    }
}

pub const DEFAULT_DWELL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct OutputCache {
    range: Cached<OutputRange>,
    mode: Cached<OutputMode>,
    dc_mode: Cached<DcMode>,
    voltage: Cached<f64>,
    last_voltage: Cached<f64>,
    slew_rate: Cached<f64>,
}

impl OutputCache {
    fn clear(&self) {
        self.range.clear();
        self.mode.clear();
        self.dc_mode.clear();
        self.voltage.clear();
        self.last_voltage.clear();
        self.slew_rate.clear();
    }
}

/// One of the two DAC outputs.
#[derive(Clone)]
pub struct DacOutput {
    channel: u8,
    instrument: Instrument,
    cache: Arc<OutputCache>,
}

impl DacOutput {
    fn new(channel: u8, instrument: Instrument) -> Self {
        Self {
            channel,
            instrument,
            cache: Default::default(),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn name(&self) -> String {
        format!("ch{:02}", self.channel)
    }

    pub async fn set_range(&self, range: OutputRange) -> crate::Result<()> {
        let channel = self.channel;
        send(&self.instrument, DacCommand::SetRange { channel, range }).await?;
        // the present voltage steps by 2x or 0.5x
        self.cache.voltage.clear();
        self.cache.range.set(range);
        Ok(())
    }

    pub async fn range(&self) -> crate::Result<OutputRange> {
        let reply = ask(&self.instrument, DacCommand::QueryRange { channel: self.channel }).await?;
        Ok(self.cache.range.update(reply.parse()?))
    }

    pub async fn set_output_mode(&self, mode: OutputMode) -> crate::Result<()> {
        let channel = self.channel;
        send(&self.instrument, DacCommand::SetOutputMode { channel, mode }).await?;
        self.cache.mode.set(mode);
        Ok(())
    }

    pub async fn output_mode(&self) -> crate::Result<OutputMode> {
        let reply = ask(&self.instrument, DacCommand::QueryOutputMode { channel: self.channel }).await?;
        Ok(self.cache.mode.update(reply.parse()?))
    }

    /// Select range and output impedance in one go.
    pub async fn configure(&self, range: OutputRange, mode: OutputMode) -> crate::Result<()> {
        self.set_range(range).await?;
        self.set_output_mode(mode).await
    }

    pub async fn set_voltage(&self, volts: f64) -> crate::Result<()> {
        let channel = self.channel;
        send(&self.instrument, DacCommand::SetVoltage { channel, volts }).await?;
        let volts = round_significant(volts);
        self.cache.voltage.set(volts);
        self.cache.last_voltage.set(volts);
        Ok(())
    }

    /// Voltage present at the output.
    pub async fn voltage(&self) -> crate::Result<f64> {
        let reply = ask(&self.instrument, DacCommand::QueryVoltage { channel: self.channel }).await?;
        Ok(self.cache.voltage.update(parse_float(&reply)?))
    }

    /// Last accepted setpoint.
    pub async fn last_voltage(&self) -> crate::Result<f64> {
        let reply = ask(&self.instrument, DacCommand::QueryLastVoltage { channel: self.channel }).await?;
        Ok(self.cache.last_voltage.update(parse_float(&reply)?))
    }

    pub async fn set_slew_rate(&self, volts_per_second: f64) -> crate::Result<()> {
        let channel = self.channel;
        send(
            &self.instrument,
            DacCommand::SetSlewRate {
                channel,
                volts_per_second,
            },
        )
        .await?;
        self.cache.slew_rate.set(round_significant(volts_per_second));
        Ok(())
    }

    pub async fn slew_rate(&self) -> crate::Result<f64> {
        let reply = ask(&self.instrument, DacCommand::QuerySlewRate { channel: self.channel }).await?;
        Ok(self.cache.slew_rate.update(parse_float(&reply)?))
    }

    pub async fn set_dc_mode(&self, mode: DcMode) -> crate::Result<()> {
        let channel = self.channel;
        send(&self.instrument, DacCommand::SetDcMode { channel, mode }).await?;
        self.cache.dc_mode.set(mode);
        Ok(())
    }

    pub async fn dc_mode(&self) -> crate::Result<DcMode> {
        let reply = ask(&self.instrument, DacCommand::QueryDcMode { channel: self.channel }).await?;
        Ok(self.cache.dc_mode.update(reply.parse()?))
    }

    /// Switch to the fixed voltage generator and apply `volts`.
    pub async fn dc_constant(&self, volts: f64) -> crate::Result<()> {
        self.set_dc_mode(DcMode::Fixed).await?;
        self.set_voltage(volts).await
    }

    /// Change the range without the 2x/0.5x voltage step by zeroing the output first.
    pub async fn switch_range_safely(&self, range: OutputRange) -> crate::Result<()> {
        log::debug!("Zeroing {} before switching to range {}", self.name(), range);
        self.set_voltage(0.0).await?;
        self.set_range(range).await
    }

    pub async fn zero(&self) -> crate::Result<()> {
        self.set_voltage(0.0).await
    }

    /// Step linearly from `start` to `stop` in `points` setpoints, waiting
    /// `dwell` after each one. The steps are paced by the host.
    pub async fn sweep(&self, start: f64, stop: f64, points: usize, dwell: Duration) -> crate::Result<()> {
        let values = linear_steps(start, stop, points)?;
        self.set_dc_mode(DcMode::Fixed).await?;
        for volts in values {
            self.set_voltage(volts).await?;
            sleep(dwell).await;
        }
        Ok(())
    }

    async fn write_generator(
        &self,
        generator: Generator,
        dwell: Duration,
        delay: Duration,
        repetitions: Repetitions,
    ) -> crate::Result<()> {
        let channel = self.channel;
        let commands = vec![
            DacCommand::SetDwell {
                channel,
                generator,
                seconds: dwell.as_secs_f64(),
            },
            DacCommand::SetDcDelay {
                channel,
                seconds: delay.as_secs_f64(),
            },
            DacCommand::SetCount {
                channel,
                generator,
                repetitions,
            },
            DacCommand::SetDcTriggerSource {
                channel,
                source: TriggerSource::Bus,
            },
        ];
        for cmd in commands {
            send(&self.instrument, cmd).await?;
        }
        Ok(())
    }

    /// Load `sweep` into the DC generator. It runs on [`DacOutput::dc_start`].
    pub async fn dc_sweep(&self, sweep: &DcSweep) -> crate::Result<()> {
        let channel = self.channel;
        // validate everything before the mode changes
        let commands = vec![
            DacCommand::SetSweepStart {
                channel,
                volts: sweep.start,
            },
            DacCommand::SetSweepStop {
                channel,
                volts: sweep.stop,
            },
            DacCommand::SetSweepPoints {
                channel,
                points: sweep.points,
            },
            DacCommand::SetSweepGeneration {
                channel,
                generation: sweep.generation,
            },
        ];
        for cmd in &commands {
            cmd.to_scpi()?;
        }
        self.set_dc_mode(DcMode::Sweep).await?;
        for cmd in commands {
            send(&self.instrument, cmd).await?;
        }
        self.write_generator(Generator::Sweep, sweep.dwell, sweep.delay, sweep.repetitions)
            .await
    }

    /// Load `list` into the DC generator. It runs on [`DacOutput::dc_start`].
    pub async fn dc_list(&self, list: &DcList) -> crate::Result<()> {
        let channel = self.channel;
        let load = DacCommand::SetListVoltages {
            channel,
            volts: list.voltages.clone(),
            append: false,
        };
        load.to_scpi()?;
        self.set_dc_mode(DcMode::List).await?;
        send(&self.instrument, load).await?;
        send(
            &self.instrument,
            DacCommand::SetListTriggerMode {
                channel,
                mode: list.trigger_mode,
            },
        )
        .await?;
        send(
            &self.instrument,
            DacCommand::SetListDirection {
                channel,
                direction: list.direction,
            },
        )
        .await?;
        self.write_generator(Generator::List, list.dwell, list.delay, list.repetitions)
            .await
    }

    /// Extend the loaded list and keep the generator waiting for triggers.
    pub async fn dc_list_append(&self, volts: &[f64]) -> crate::Result<()> {
        let channel = self.channel;
        let cmd = DacCommand::SetListVoltages {
            channel,
            volts: volts.to_vec(),
            append: true,
        };
        send(&self.instrument, cmd).await?;
        send(&self.instrument, DacCommand::SetDcContinuous { channel, on: true }).await
    }

    /// Run the loaded list or sweep once, starting right away.
    pub async fn dc_start(&self) -> crate::Result<()> {
        let channel = self.channel;
        log::debug!("Starting the DC generator of {}", self.name());
        send(&self.instrument, DacCommand::SetDcContinuous { channel, on: false }).await?;
        let source = TriggerSource::Immediate;
        send(&self.instrument, DacCommand::SetDcTriggerSource { channel, source }).await?;
        send(&self.instrument, DacCommand::DcInitiate { channel }).await?;
        self.cache.voltage.clear();
        Ok(())
    }

    /// Stop a running list or sweep. The output holds its present voltage.
    pub async fn dc_abort(&self) -> crate::Result<()> {
        send(&self.instrument, DacCommand::DcAbort { channel: self.channel }).await?;
        self.cache.voltage.clear();
        Ok(())
    }

    pub async fn dc_points(&self, generator: Generator) -> crate::Result<u32> {
        let channel = self.channel;
        let reply = ask(&self.instrument, DacCommand::QueryPoints { channel, generator }).await?;
        let points = parse_int(&reply)?;
        u32::try_from(points).map_err(|_| Error::unexpected_response(reply))
    }

    /// Cycles left of a running generator, `Count(0)` once it finished.
    pub async fn dc_cycles_remaining(&self, generator: Generator) -> crate::Result<Repetitions> {
        let channel = self.channel;
        let reply = ask(&self.instrument, DacCommand::QueryCyclesRemaining { channel, generator }).await?;
        match parse_int(&reply)? {
            -1 => Ok(Repetitions::Forever),
            x => u32::try_from(x)
                .map(Repetitions::Count)
                .map_err(|_| Error::unexpected_response(reply)),
        }
    }

    /// Duration of one run of the loaded sweep.
    pub async fn dc_sweep_time(&self) -> crate::Result<Duration> {
        let reply = ask(&self.instrument, DacCommand::QuerySweepTime { channel: self.channel }).await?;
        let seconds = parse_float(&reply)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::unexpected_response(reply));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    pub async fn dc_sweep_start(&self) -> crate::Result<f64> {
        let reply = ask(&self.instrument, DacCommand::QuerySweepStart { channel: self.channel }).await?;
        Ok(parse_float(&reply)?)
    }

    pub async fn dc_sweep_stop(&self) -> crate::Result<f64> {
        let reply = ask(&self.instrument, DacCommand::QuerySweepStop { channel: self.channel }).await?;
        Ok(parse_float(&reply)?)
    }

    /// Setpoints of the loaded sweep, computed from its start, stop and point count.
    pub async fn dc_sweep_values(&self) -> crate::Result<Vec<f64>> {
        let start = self.dc_sweep_start().await?;
        let stop = self.dc_sweep_stop().await?;
        let points = self.dc_points(Generator::Sweep).await?;
        linear_steps(start, stop, points as usize)
    }

    pub async fn dc_list_values(&self) -> crate::Result<Vec<f64>> {
        let reply = ask(&self.instrument, DacCommand::QueryListVoltages { channel: self.channel }).await?;
        let mut ret = Vec::new();
        for x in split_reply(&reply) {
            if x.is_empty() {
                continue;
            }
            ret.push(parse_float(x)?);
        }
        Ok(ret)
    }

    pub async fn snapshot(&self, update: bool) -> crate::Result<ChannelSnapshot> {
        if update {
            self.range().await?;
            self.output_mode().await?;
            self.dc_mode().await?;
            self.voltage().await?;
            self.last_voltage().await?;
            self.slew_rate().await?;
        }
        let mut ret = ChannelSnapshot::new(self.name());
        ret.push("output_range", self.cache.range.get().map(|x| x.to_string()), None);
        ret.push("output_mode", self.cache.mode.get().map(|x| x.to_string()), None);
        ret.push("dc_mode", self.cache.dc_mode.get().map(|x| x.to_string()), None);
        ret.push("dc_constant", self.cache.voltage.get(), Some("V"));
        ret.push("dc_last", self.cache.last_voltage.get(), Some("V"));
        ret.push("dc_slew_rate", self.cache.slew_rate.get(), Some("V/s"));
        Ok(ret)
    }
}

/// `points` equally spaced values from `start` to `stop`, both included.
pub fn linear_steps(start: f64, stop: f64, points: usize) -> crate::Result<Vec<f64>> {
    if points < 2 {
        return Err(Error::argument(anyhow!("A sweep needs at least 2 points, got {}", points)));
    }
    let step = (stop - start) / (points - 1) as f64;
    Ok((0..points)
        .map(|idx| if idx == points - 1 { stop } else { start + step * idx as f64 })
        .collect())
}

/// One ADC input.
#[derive(Clone)]
pub struct DacInput {
    channel: u8,
    instrument: Instrument,
    voltage: Arc<Cached<f64>>,
    last_conversion: Arc<Mutex<Option<Instant>>>,
}

impl DacInput {
    fn new(channel: u8, instrument: Instrument) -> Self {
        Self {
            channel,
            instrument,
            voltage: Default::default(),
            last_conversion: Default::default(),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn name(&self) -> String {
        format!("in{:02}", self.channel)
    }

    pub fn speed(&self) -> AdcSpeed {
        AdcSpeed::of_input(self.channel)
    }

    fn remaining_conversion_time(&self) -> Option<Duration> {
        let last = self.last_conversion.lock().unwrap_or_else(|err| err.into_inner());
        let elapsed = last.as_ref()?.elapsed();
        self.speed().conversion_time().checked_sub(elapsed)
    }

    /// Sample the input. Back to back reads wait for the ADC to finish the
    /// previous conversion.
    pub async fn measure(&self) -> crate::Result<f64> {
        if let Some(remaining) = self.remaining_conversion_time() {
            log::debug!("Waiting {:?} for conversion on {}", remaining, self.name());
            sleep(remaining).await;
        }
        let reply = ask(&self.instrument, DacCommand::MeasureVoltage { channel: self.channel }).await;
        *self.last_conversion.lock().unwrap_or_else(|err| err.into_inner()) = Some(Instant::now());
        Ok(self.voltage.update(parse_float(&reply?)?))
    }

    pub async fn snapshot(&self, update: bool) -> crate::Result<ChannelSnapshot> {
        if update {
            self.measure().await?;
        }
        let mut ret = ChannelSnapshot::new(self.name());
        ret.push("ad_sample", self.voltage.get(), Some("V"));
        Ok(ret)
    }
}

#[derive(Clone)]
pub struct SpDac {
    instrument: Instrument,
    identity: Identity,
    options: DeviceOptions,
    outputs: Vec<DacOutput>,
    inputs: Vec<DacInput>,
}

impl SpDac {
    /// Check the identity of the device behind `instrument` and set up the channels.
    pub async fn connect(instrument: Instrument, options: DeviceOptions) -> crate::Result<Self> {
        if options.adc_boards == 0 || options.adc_boards > dac::MAX_ADC_BOARDS {
            return Err(Error::argument(anyhow!(
                "SPDac supports 1 to {} ADC boards, got {}",
                dac::MAX_ADC_BOARDS,
                options.adc_boards
            )));
        }
        let identity = check_identity(&instrument, Model::SpDac, &options).await?;
        let outputs = (1..=dac::OUTPUT_CHANNELS)
            .map(|ch| DacOutput::new(ch, instrument.clone()))
            .collect();
        let inputs = (1..=options.adc_boards * dac::INPUTS_PER_BOARD)
            .map(|ch| DacInput::new(ch, instrument.clone()))
            .collect();
        Ok(Self {
            instrument,
            identity,
            options,
            outputs,
            inputs,
        })
    }

    pub async fn open(addr: &Address, session: SessionOptions, options: DeviceOptions) -> crate::Result<Self> {
        let instrument = Instrument::connect(addr, session).await?;
        Self::connect(instrument, options).await
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn outputs(&self) -> &[DacOutput] {
        &self.outputs
    }

    pub fn inputs(&self) -> &[DacInput] {
        &self.inputs
    }

    pub fn output(&self, channel: u8) -> crate::Result<&DacOutput> {
        channel
            .checked_sub(1)
            .and_then(|idx| self.outputs.get(idx as usize))
            .ok_or_else(|| Error::argument(anyhow!("No DAC output {}, valid are 1..={}", channel, self.outputs.len())))
    }

    pub fn input(&self, channel: u8) -> crate::Result<&DacInput> {
        channel
            .checked_sub(1)
            .and_then(|idx| self.inputs.get(idx as usize))
            .ok_or_else(|| Error::argument(anyhow!("No ADC input {}, valid are 1..={}", channel, self.inputs.len())))
    }

    /// Restore power-on defaults and forget all cached values.
    pub async fn reset(&self) -> crate::Result<()> {
        self.instrument.reset(self.options.reset_delay).await?;
        for output in &self.outputs {
            output.cache.clear();
        }
        for input in &self.inputs {
            input.voltage.clear();
        }
        Ok(())
    }

    pub async fn zero_all(&self) -> crate::Result<()> {
        for output in &self.outputs {
            output.zero().await?;
        }
        Ok(())
    }

    /// Cycle the range and output relays of all outputs so they can be heard
    /// switching. Ends in the low range with the clamped output.
    pub async fn self_test(&self) -> crate::Result<()> {
        for range in &[OutputRange::High, OutputRange::Low] {
            for output in &self.outputs {
                log::info!("Switching {} to {}/{}", output.name(), range, OutputMode::Clamped6k);
                output.configure(*range, OutputMode::Clamped6k).await?;
                sleep(RELAY_SETTLE).await;
            }
        }
        Ok(())
    }

    pub async fn snapshot(&self, update: bool) -> crate::Result<Snapshot> {
        let mut channels = Vec::new();
        for output in &self.outputs {
            channels.push(output.snapshot(update).await?);
        }
        for input in &self.inputs {
            channels.push(input.snapshot(update).await?);
        }
        Ok(Snapshot {
            address: self.instrument.address().to_string(),
            identity: self.identity.clone(),
            live: update,
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use crate::sim;

    async fn simulated(adc_boards: u8) -> SpDac {
        let instrument = Instrument::new(
            sim::spawn(Model::SpDac),
            "sim::spdac".to_string(),
            SessionOptions {
                timeout: Duration::from_millis(200),
            },
        );
        let options = DeviceOptions {
            reset_delay: Duration::from_millis(1),
            adc_boards,
            check_firmware: true,
        };
        SpDac::connect(instrument, options).await.unwrap()
    }

    #[tokio::test]
    async fn range_round_trip() {
        let dac = simulated(1).await;
        let ch = dac.output(1).unwrap();
        ch.set_range(OutputRange::Low).await.unwrap();
        assert_eq!(ch.range().await.unwrap(), OutputRange::Low);
        ch.set_range(OutputRange::High).await.unwrap();
        assert_eq!(ch.range().await.unwrap(), OutputRange::High);
        assert_eq!(dac.identity().serial, "SP-0001");
    }

    #[tokio::test]
    async fn last_voltage_matches_setpoint() {
        let dac = simulated(1).await;
        let ch = dac.output(1).unwrap();
        ch.set_voltage(1.114514).await.unwrap();
        assert_eq!(ch.last_voltage().await.unwrap(), 1.114514);
        ch.dc_constant(-0.5).await.unwrap();
        assert_eq!(ch.voltage().await.unwrap(), -0.5);
        assert_eq!(ch.dc_mode().await.unwrap(), DcMode::Fixed);
    }

    #[tokio::test]
    async fn cached_setpoint_matches_sent_digits() {
        let dac = simulated(1).await;
        let ch = dac.output(1).unwrap();
        ch.set_voltage(1.123456789).await.unwrap();
        ch.set_slew_rate(12.3456789012).await.unwrap();
        let cached = ch.snapshot(false).await.unwrap();
        assert_eq!(cached.get("dc_constant"), Some(&ParamValue::Number(1.1234568)));
        assert_eq!(cached.get("dc_last"), Some(&ParamValue::Number(1.1234568)));
        assert_eq!(cached.get("dc_slew_rate"), Some(&ParamValue::Number(12.345679)));
        assert_eq!(ch.last_voltage().await.unwrap(), 1.1234568);
        assert_eq!(ch.slew_rate().await.unwrap(), 12.345679);
    }

    #[tokio::test]
    async fn sweep_on_generator() {
        let dac = simulated(1).await;
        let ch = dac.output(1).unwrap();
        let mut sweep = DcSweep::new(-1.0, 1.0, 5);
        sweep.repetitions = Repetitions::Forever;
        sweep.dwell = Duration::from_millis(10);
        ch.dc_sweep(&sweep).await.unwrap();
        assert_eq!(ch.dc_mode().await.unwrap(), DcMode::Sweep);
        assert_eq!(ch.dc_points(Generator::Sweep).await.unwrap(), 5);
        assert_eq!(ch.dc_sweep_values().await.unwrap(), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(ch.dc_sweep_time().await.unwrap(), Duration::from_millis(50));

        ch.dc_start().await.unwrap();
        assert_eq!(ch.voltage().await.unwrap(), -1.0);
        assert_eq!(ch.dc_cycles_remaining(Generator::Sweep).await.unwrap(), Repetitions::Forever);
        ch.dc_abort().await.unwrap();
        assert_eq!(ch.dc_cycles_remaining(Generator::Sweep).await.unwrap(), Repetitions::Count(0));

        let bad = DcSweep::new(0.0, 11.0, 3);
        dac.instrument().start_recording().await.unwrap();
        assert!(matches!(ch.dc_sweep(&bad).await, Err(Error::Argument(_))));
        assert!(dac.instrument().take_recording().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_on_generator() {
        let dac = simulated(1).await;
        let ch = dac.output(2).unwrap();
        let mut list = DcList::new(vec![0.25, 0.5]);
        list.direction = Direction::Down;
        dac.instrument().start_recording().await.unwrap();
        ch.dc_list(&list).await.unwrap();
        let lines = dac.instrument().take_recording().await.unwrap();
        assert_eq!(
            lines,
            vec![
                "SOUR:VOLT:MODE 2,LIST",
                "SOUR:LIST:VOLT 2,0.25,0.5",
                "SOUR:LIST:TMOD 2,AUTO",
                "SOUR:LIST:DIR 2,DOWN",
                "SOUR:LIST:DWEL 2,0.001",
                "SOUR:DC:DEL 2,0",
                "SOUR:LIST:COUN 2,1",
                "SOUR:DC:TRIG:SOUR 2,BUS",
            ]
        );
        ch.dc_list_append(&[0.75]).await.unwrap();
        assert_eq!(ch.dc_list_values().await.unwrap(), vec![0.25, 0.5, 0.75]);
        assert_eq!(ch.dc_points(Generator::List).await.unwrap(), 3);
        ch.dc_start().await.unwrap();
        assert_eq!(ch.voltage().await.unwrap(), 0.25);
        assert_eq!(ch.dc_cycles_remaining(Generator::List).await.unwrap(), Repetitions::Count(0));
        assert!(dac.instrument().check_error().await.is_ok());
    }

    #[tokio::test]
    async fn measure_loopback() {
        let dac = simulated(2).await;
        dac.output(2).unwrap().set_voltage(0.75).await.unwrap();
        assert_eq!(dac.input(2).unwrap().measure().await.unwrap(), 0.75);
        assert_eq!(dac.input(6).unwrap().measure().await.unwrap(), 0.75);
        assert_eq!(dac.input(4).unwrap().measure().await.unwrap(), 0.0);
        dac.output(2).unwrap().set_output_mode(OutputMode::Tristate).await.unwrap();
        assert_eq!(dac.input(2).unwrap().measure().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn precise_inputs_are_paced() {
        let dac = simulated(1).await;
        let input = dac.input(1).unwrap();
        let start = Instant::now();
        input.measure().await.unwrap();
        input.measure().await.unwrap();
        assert!(start.elapsed() >= AdcSpeed::Precise.conversion_time());
    }

    #[tokio::test]
    async fn safe_range_switch_avoids_step() {
        let dac = simulated(1).await;
        let ch = dac.output(1).unwrap();
        ch.set_voltage(2.0).await.unwrap();
        ch.set_range(OutputRange::High).await.unwrap();
        assert_eq!(ch.voltage().await.unwrap(), 4.0);
        ch.set_voltage(2.0).await.unwrap();
        ch.switch_range_safely(OutputRange::Low).await.unwrap();
        assert_eq!(ch.voltage().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn invalid_channels_send_nothing() {
        let dac = simulated(1).await;
        assert!(matches!(dac.output(3), Err(Error::Argument(_))));
        assert!(matches!(dac.input(5), Err(Error::Argument(_))));
        let instrument = dac.instrument();
        instrument.start_recording().await.unwrap();
        let err = dac.output(1).unwrap().set_voltage(12.0).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        let err = dac.output(1).unwrap().set_voltage(f64::NAN).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(instrument.take_recording().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_and_self_test() {
        let dac = simulated(1).await;
        let ch = dac.output(2).unwrap();
        dac.instrument().start_recording().await.unwrap();
        ch.sweep(0.0, 1.0, 3, Duration::from_millis(1)).await.unwrap();
        let lines = dac.instrument().take_recording().await.unwrap();
        assert_eq!(
            lines,
            vec!["SOUR:VOLT:MODE 2,FIX", "SOUR:VOLT 2,0", "SOUR:VOLT 2,0.5", "SOUR:VOLT 2,1"]
        );

        dac.self_test().await.unwrap();
        for output in dac.outputs() {
            assert_eq!(output.range().await.unwrap(), OutputRange::Low);
            assert_eq!(output.output_mode().await.unwrap(), OutputMode::Clamped6k);
        }
        assert!(linear_steps(0.0, 1.0, 1).is_err());
    }

    #[tokio::test]
    async fn snapshot_cached_and_live() {
        let dac = simulated(1).await;
        dac.output(1).unwrap().set_voltage(1.25).await.unwrap();

        let cached = dac.snapshot(false).await.unwrap();
        let ch = cached.channel("ch01").unwrap();
        assert_eq!(ch.get("dc_constant"), Some(&ParamValue::Number(1.25)));
        assert_eq!(ch.get("output_range"), Some(&ParamValue::None));

        let live = dac.snapshot(true).await.unwrap();
        let ch = live.channel("ch01").unwrap();
        assert_eq!(ch.get("output_range"), Some(&ParamValue::Text("LOW".to_string())));
        assert_eq!(ch.get("output_mode"), Some(&ParamValue::Text("CLAMPED6K".to_string())));
        assert_eq!(live.channel("in01").unwrap().get("ad_sample"), Some(&ParamValue::Number(1.25)));
        assert_eq!(live.channels.len(), 2 + 4);
    }

    #[tokio::test]
    async fn reject_wrong_model() {
        let instrument = Instrument::new(sim::spawn(Model::SpSmu), "sim::spsmu".to_string(), SessionOptions::default());
        let err = SpDac::connect(instrument, DeviceOptions::default()).await.err().unwrap();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn reset_forgets_cache() {
        let dac = simulated(1).await;
        let ch = dac.output(1).unwrap();
        ch.set_voltage(1.0).await.unwrap();
        dac.reset().await.unwrap();
        assert_eq!(ch.snapshot(false).await.unwrap().get("dc_constant"), Some(&ParamValue::None));
        assert_eq!(ch.voltage().await.unwrap(), 0.0);
    }
}
