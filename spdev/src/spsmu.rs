//! Driver for the SPSMU 16-channel source-measure unit.

use std::sync::Arc;

use anyhow::anyhow;

use spdev_protocol::scpi::{parse_float, round_significant};
use spdev_protocol::smu::{self, ClampLimits, CurrentRange, Quantity, RoutingMode, SmuCommand, SourceMode};
use spdev_protocol::Identity;

use crate::address::Address;
use crate::instrument::{Instrument, SessionOptions};
use crate::params::Cached;
use crate::snapshot::{ChannelSnapshot, Snapshot};
use crate::{check_identity, DeviceOptions, Error, Model};

async fn send(instrument: &Instrument, cmd: SmuCommand) -> crate::Result<()> {
    instrument.write(cmd.to_scpi()?).await
}

async fn ask(instrument: &Instrument, cmd: SmuCommand) -> crate::Result<String> {
    instrument.query(cmd.to_scpi()?).await
}

#[derive(Debug, Default)]
struct ChannelCache {
    mode: Cached<SourceMode>,
    voltage: Cached<f64>,
    current: Cached<f64>,
    last_voltage: Cached<f64>,
    last_current: Cached<f64>,
    voltage_clamp: Cached<ClampLimits>,
    current_clamp: Cached<ClampLimits>,
    measured_voltage: Cached<f64>,
    measured_current: Cached<f64>,
}

impl ChannelCache {
    fn level(&self, quantity: Quantity) -> &Cached<f64> {
        match quantity {
            Quantity::Voltage => &self.voltage,
            Quantity::Current => &self.current,
        }
    }

    fn last_level(&self, quantity: Quantity) -> &Cached<f64> {
        match quantity {
            Quantity::Voltage => &self.last_voltage,
            Quantity::Current => &self.last_current,
        }
    }

    fn clamp(&self, quantity: Quantity) -> &Cached<ClampLimits> {
        match quantity {
            Quantity::Voltage => &self.voltage_clamp,
            Quantity::Current => &self.current_clamp,
        }
    }

    fn measured(&self, quantity: Quantity) -> &Cached<f64> {
        match quantity {
            Quantity::Voltage => &self.measured_voltage,
            Quantity::Current => &self.measured_current,
        }
    }

    fn clear(&self) {
        self.mode.clear();
        for quantity in Quantity::ALL.iter().copied() {
            self.level(quantity).clear();
            self.last_level(quantity).clear();
            self.clamp(quantity).clear();
            self.measured(quantity).clear();
        }
    }
}

/// One source-measure channel.
#[derive(Clone)]
pub struct SmuChannel {
    channel: u8,
    instrument: Instrument,
    cache: Arc<ChannelCache>,
}

impl SmuChannel {
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

    /// Switch force mode, measure sub-mode and current range.
    ///
    /// The firmware zeroes the output on a new force mode, and on a new range
    /// while forcing current. The cached present output follows these rules.
    pub async fn set_source_mode(&self, mode: SourceMode) -> crate::Result<()> {
        let channel = self.channel;
        send(&self.instrument, SmuCommand::SetSourceMode { channel, mode }).await?;
        match self.cache.mode.get() {
            Some(old) if old.zeroes_output(&mode) => {
                log::debug!("{} output zeroed by switching from {} to {}", self.name(), old, mode);
                self.cache.voltage.set(0.0);
                self.cache.current.set(0.0);
            }
            Some(_) => {}
            None => {
                self.cache.voltage.clear();
                self.cache.current.clear();
            }
        }
        self.cache.mode.set(mode);
        Ok(())
    }

    pub async fn source_mode(&self) -> crate::Result<SourceMode> {
        let reply = ask(&self.instrument, SmuCommand::QuerySourceMode { channel: self.channel }).await?;
        Ok(self.cache.mode.update(reply.parse()?))
    }

    async fn set_level(&self, quantity: Quantity, value: f64) -> crate::Result<()> {
        if quantity == Quantity::Current {
            let range = self.cache.mode.get().map(|x| x.range).unwrap_or(CurrentRange::Ma50);
            if !value.is_finite() || value.abs() > range.full_scale() {
                return Err(Error::argument(anyhow!(
                    "{} uA exceeds the {} range of {}",
                    value,
                    range,
                    self.name()
                )));
            }
        }
        let channel = self.channel;
        send(
            &self.instrument,
            SmuCommand::SetLevel {
                channel,
                quantity,
                value,
            },
        )
        .await?;
        let value = round_significant(value);
        self.cache.level(quantity).set(value);
        self.cache.last_level(quantity).set(value);
        Ok(())
    }

    async fn level(&self, quantity: Quantity) -> crate::Result<f64> {
        let channel = self.channel;
        let reply = ask(&self.instrument, SmuCommand::QueryLevel { channel, quantity }).await?;
        Ok(self.cache.level(quantity).update(parse_float(&reply)?))
    }

    async fn last_level(&self, quantity: Quantity) -> crate::Result<f64> {
        let channel = self.channel;
        let reply = ask(&self.instrument, SmuCommand::QueryLastLevel { channel, quantity }).await?;
        Ok(self.cache.last_level(quantity).update(parse_float(&reply)?))
    }

    async fn measure(&self, quantity: Quantity) -> crate::Result<f64> {
        let channel = self.channel;
        let reply = ask(&self.instrument, SmuCommand::Measure { channel, quantity }).await?;
        Ok(self.cache.measured(quantity).update(parse_float(&reply)?))
    }

    /// Voltage setpoint in V, limited to +-10 V.
    pub async fn set_voltage(&self, volts: f64) -> crate::Result<()> {
        self.set_level(Quantity::Voltage, volts).await
    }

    pub async fn voltage(&self) -> crate::Result<f64> {
        self.level(Quantity::Voltage).await
    }

    pub async fn last_voltage(&self) -> crate::Result<f64> {
        self.last_level(Quantity::Voltage).await
    }

    /// Current setpoint in uA, limited to the full scale of the selected range.
    pub async fn set_current(&self, micro_amps: f64) -> crate::Result<()> {
        self.set_level(Quantity::Current, micro_amps).await
    }

    pub async fn current(&self) -> crate::Result<f64> {
        self.level(Quantity::Current).await
    }

    pub async fn last_current(&self) -> crate::Result<f64> {
        self.last_level(Quantity::Current).await
    }

    /// Limit the output to `low..high`, given as fractions of full scale.
    pub async fn set_clamp(&self, quantity: Quantity, low: f64, high: f64) -> crate::Result<()> {
        let limits = ClampLimits::new(low, high)?;
        let channel = self.channel;
        send(
            &self.instrument,
            SmuCommand::SetClamp {
                channel,
                quantity,
                limits,
            },
        )
        .await?;
        let limits = ClampLimits {
            low: round_significant(limits.low),
            high: round_significant(limits.high),
        };
        self.cache.clamp(quantity).set(limits);
        Ok(())
    }

    pub async fn clamp(&self, quantity: Quantity) -> crate::Result<ClampLimits> {
        let channel = self.channel;
        let reply = ask(&self.instrument, SmuCommand::QueryClamp { channel, quantity }).await?;
        Ok(self.cache.clamp(quantity).update(reply.parse()?))
    }

    pub async fn measure_voltage(&self) -> crate::Result<f64> {
        self.measure(Quantity::Voltage).await
    }

    /// Measured current in uA.
    pub async fn measure_current(&self) -> crate::Result<f64> {
        self.measure(Quantity::Current).await
    }

    pub async fn snapshot(&self, update: bool) -> crate::Result<ChannelSnapshot> {
        if update {
            self.source_mode().await?;
            for quantity in Quantity::ALL.iter().copied() {
                self.level(quantity).await?;
                self.last_level(quantity).await?;
                self.clamp(quantity).await?;
                self.measure(quantity).await?;
            }
        }
        let cache = &self.cache;
        let mode = cache.mode.get();
        let mut ret = ChannelSnapshot::new(self.name());
        ret.push("force_mode", mode.map(|x| x.force.to_string()), None);
        ret.push("measure_mode", mode.map(|x| x.measure.to_string()), None);
        ret.push("current_range", mode.map(|x| x.range.to_string()), None);
        ret.push("voltage", cache.voltage.get(), Some("V"));
        ret.push("last_voltage", cache.last_voltage.get(), Some("V"));
        ret.push("current", cache.current.get(), Some("uA"));
        ret.push("last_current", cache.last_current.get(), Some("uA"));
        ret.push("voltage_clamp", cache.voltage_clamp.get().map(|x| x.to_string()), None);
        ret.push("current_clamp", cache.current_clamp.get().map(|x| x.to_string()), None);
        ret.push("measured_voltage", cache.measured_voltage.get(), Some("V"));
        ret.push("measured_current", cache.measured_current.get(), Some("uA"));
        Ok(ret)
    }
}

#[derive(Clone)]
pub struct SpSmu {
    instrument: Instrument,
    identity: Identity,
    options: DeviceOptions,
    channels: Vec<SmuChannel>,
}

impl SpSmu {
    /// Check the identity of the device behind `instrument` and set up the channels.
    pub async fn connect(instrument: Instrument, options: DeviceOptions) -> crate::Result<Self> {
        let identity = check_identity(&instrument, Model::SpSmu, &options).await?;
        let channels = (1..=smu::CHANNELS)
            .map(|ch| SmuChannel::new(ch, instrument.clone()))
            .collect();
        Ok(Self {
            instrument,
            identity,
            options,
            channels,
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

    pub fn channels(&self) -> &[SmuChannel] {
        &self.channels
    }

    pub fn channel(&self, channel: u8) -> crate::Result<&SmuChannel> {
        channel
            .checked_sub(1)
            .and_then(|idx| self.channels.get(idx as usize))
            .ok_or_else(|| Error::argument(anyhow!("No SMU channel {}, valid are 1..={}", channel, smu::CHANNELS)))
    }

    /// Restore power-on defaults and forget all cached values.
    pub async fn reset(&self) -> crate::Result<()> {
        self.instrument.reset(self.options.reset_delay).await?;
        for channel in &self.channels {
            channel.cache.clear();
        }
        Ok(())
    }

    pub async fn set_all_source_modes(&self, mode: SourceMode) -> crate::Result<()> {
        for channel in &self.channels {
            channel.set_source_mode(mode).await?;
        }
        Ok(())
    }

    /// Set an analog switch directly. There are no interlocks, a wrong
    /// combination can short outputs.
    pub async fn set_routing(&self, chip_select: u8, pmu_channel: u8, mode: RoutingMode) -> crate::Result<()> {
        let cmd = SmuCommand::SetRouting {
            chip_select,
            pmu_channel,
            mode,
        };
        let line = cmd.to_scpi()?;
        log::warn!("Admin routing on {}: {}", self.instrument.address(), line);
        self.instrument.write(line).await
    }

    pub async fn routing(&self, chip_select: u8, pmu_channel: u8) -> crate::Result<RoutingMode> {
        let cmd = SmuCommand::QueryRouting {
            chip_select,
            pmu_channel,
        };
        let reply = ask(&self.instrument, cmd).await?;
        Ok(reply.parse()?)
    }

    pub async fn snapshot(&self, update: bool) -> crate::Result<Snapshot> {
        let mut channels = Vec::new();
        for channel in &self.channels {
            channels.push(channel.snapshot(update).await?);
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
    use spdev_protocol::smu::{ForceMode, MeasureMode};
    use std::time::Duration;

    async fn simulated() -> SpSmu {
        let instrument = Instrument::new(
            sim::spawn(Model::SpSmu),
            "sim::spsmu".to_string(),
            SessionOptions {
                timeout: Duration::from_millis(200),
            },
        );
        let options = DeviceOptions {
            reset_delay: Duration::from_millis(1),
            ..Default::default()
        };
        SpSmu::connect(instrument, options).await.unwrap()
    }

    fn mode(force: ForceMode, measure: MeasureMode, range: CurrentRange) -> SourceMode {
        SourceMode::new(force, measure, range)
    }

    #[tokio::test]
    async fn source_mode_round_trip() {
        let smu = simulated().await;
        let ch = smu.channel(1).unwrap();
        assert_eq!(ch.source_mode().await.unwrap(), SourceMode::default());
        let fv_mi = mode(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua5);
        ch.set_source_mode(fv_mi).await.unwrap();
        let reply = ch.source_mode().await.unwrap();
        assert_eq!(reply, fv_mi);
        assert_eq!(
            (reply.force.token(), reply.measure.token(), reply.range.token()),
            ("FV", "MI", "UA5")
        );
        let raw = smu.instrument().query("SOUR:MODE? 1").await.unwrap();
        assert_eq!(raw, "\"FV\",\"MI\",\"UA5\"");
    }

    #[tokio::test]
    async fn cached_level_matches_sent_digits() {
        let smu = simulated().await;
        let ch = smu.channel(4).unwrap();
        ch.set_source_mode(mode(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua5))
            .await
            .unwrap();
        ch.set_voltage(1.123456789).await.unwrap();
        let cached = ch.snapshot(false).await.unwrap();
        assert_eq!(cached.get("voltage"), Some(&ParamValue::Number(1.1234568)));
        assert_eq!(cached.get("last_voltage"), Some(&ParamValue::Number(1.1234568)));
        assert_eq!(ch.last_voltage().await.unwrap(), 1.1234568);
    }

    #[tokio::test]
    async fn force_mode_change_resets_output() {
        let smu = simulated().await;
        let ch = smu.channel(2).unwrap();
        ch.set_source_mode(mode(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ua5))
            .await
            .unwrap();
        ch.set_voltage(1.5).await.unwrap();

        ch.set_source_mode(mode(ForceMode::Fv, MeasureMode::Mv, CurrentRange::Ua5))
            .await
            .unwrap();
        assert_eq!(ch.voltage().await.unwrap(), 1.5);

        ch.set_source_mode(mode(ForceMode::Fi, MeasureMode::Mv, CurrentRange::Ua5))
            .await
            .unwrap();
        let cached = ch.snapshot(false).await.unwrap();
        assert_eq!(cached.get("voltage"), Some(&ParamValue::Number(0.0)));
        assert_eq!(cached.get("last_voltage"), Some(&ParamValue::Number(1.5)));
        assert_eq!(ch.voltage().await.unwrap(), 0.0);
        assert_eq!(ch.last_voltage().await.unwrap(), 1.5);
    }

    #[tokio::test]
    async fn current_limited_by_cached_range() {
        let smu = simulated().await;
        let ch = smu.channel(3).unwrap();
        ch.set_source_mode(mode(ForceMode::Fi, MeasureMode::Mv, CurrentRange::Ua20))
            .await
            .unwrap();
        smu.instrument().start_recording().await.unwrap();
        let err = ch.set_current(25.0).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(smu.instrument().take_recording().await.unwrap().is_empty());

        ch.set_current(12.5).await.unwrap();
        assert_eq!(ch.last_current().await.unwrap(), 12.5);
        assert_eq!(ch.measure_voltage().await.unwrap(), 10.0);
        assert_eq!(ch.measure_current().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn clamp_configuration() {
        let smu = simulated().await;
        let ch = smu.channel(16).unwrap();
        ch.set_source_mode(mode(ForceMode::Fv, MeasureMode::Mi, CurrentRange::Ma2))
            .await
            .unwrap();
        ch.set_clamp(Quantity::Voltage, -0.25, 0.25).await.unwrap();
        assert_eq!(ch.clamp(Quantity::Voltage).await.unwrap(), ClampLimits::new(-0.25, 0.25).unwrap());
        ch.set_voltage(4.0).await.unwrap();
        assert_eq!(ch.voltage().await.unwrap(), 2.5);
        assert_eq!(ch.measure_current().await.unwrap(), 2.5);
        assert!(matches!(
            ch.set_clamp(Quantity::Current, 0.5, 0.1).await,
            Err(Error::Argument(_))
        ));
    }

    #[tokio::test]
    async fn apply_mode_to_all_channels() {
        let smu = simulated().await;
        let fv_mv = mode(ForceMode::Fv, MeasureMode::Mv, CurrentRange::Ua200);
        smu.set_all_source_modes(fv_mv).await.unwrap();
        assert_eq!(smu.channel(9).unwrap().source_mode().await.unwrap(), fv_mv);
        assert!(matches!(smu.channel(17), Err(Error::Argument(_))));
        assert!(matches!(smu.channel(0), Err(Error::Argument(_))));
    }

    #[tokio::test]
    async fn admin_routing() {
        let smu = simulated().await;
        smu.set_routing(2, 3, RoutingMode::Force).await.unwrap();
        assert_eq!(smu.routing(2, 3).await.unwrap(), RoutingMode::Force);
        assert_eq!(smu.routing(1, 1).await.unwrap(), RoutingMode::Hiz);
        assert!(matches!(
            smu.set_routing(0, 1, RoutingMode::All).await,
            Err(Error::Argument(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_reports_all_channels() {
        let smu = simulated().await;
        let cached = smu.snapshot(false).await.unwrap();
        assert_eq!(cached.channels.len(), 16);
        assert_eq!(cached.channel("ch01").unwrap().get("force_mode"), Some(&ParamValue::None));

        let live = smu.snapshot(true).await.unwrap();
        let ch = live.channel("ch16").unwrap();
        assert_eq!(ch.get("force_mode"), Some(&ParamValue::Text("HIZV".to_string())));
        assert_eq!(ch.get("voltage_clamp"), Some(&ParamValue::Text("-1,1".to_string())));
        assert_eq!(ch.get("measured_current"), Some(&ParamValue::Number(0.0)));
    }
}
