use std::fmt::Display;
use std::process::exit;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use clap::{crate_authors, crate_version, App as ClapApp, AppSettings, Arg, ArgMatches};
use env_logger::Env;
use tokio::runtime::Runtime;

use spdev::protocol::dac::{OutputMode, OutputRange, Repetitions};
use spdev::spdac::DcSweep;
use spdev::protocol::smu::{ClampLimits, Quantity, RoutingMode, SourceMode};
use spdev::snapshot::Snapshot;
use spdev::transport::serial;
use spdev::{Address, DeviceOptions, Error, Instrument, Model, SessionOptions, SpDac, SpSmu};

fn channel_arg(help: &'static str) -> Arg<'static> {
    Arg::new("channel").required(true).help(help)
}

fn value_arg(name: &'static str, help: &'static str) -> Arg<'static> {
    Arg::new(name).allow_hyphen_values(true).help(help)
}

fn dac_command() -> ClapApp<'static> {
    ClapApp::new("dac")
        .about("Control an SPDac")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            ClapApp::new("range")
                .about("Query or set the output range (LOW: +-5V, HIGH: +-10V)")
                .arg(channel_arg("Output channel 1..=2"))
                .arg(value_arg("range", "LOW or HIGH"))
                .arg(
                    Arg::new("safe")
                        .long("safe")
                        .help("Zero the output before switching the range"),
                ),
        )
        .subcommand(
            ClapApp::new("mode")
                .about("Query or set the output mode")
                .arg(channel_arg("Output channel 1..=2"))
                .arg(value_arg("mode", "NORMAL, CLAMPED6K or TRISTATE")),
        )
        .subcommand(
            ClapApp::new("voltage")
                .about("Query or set the output voltage")
                .arg(channel_arg("Output channel 1..=2"))
                .arg(value_arg("volts", "Setpoint in V")),
        )
        .subcommand(
            ClapApp::new("last")
                .about("Query the last voltage setpoint")
                .arg(channel_arg("Output channel 1..=2")),
        )
        .subcommand(
            ClapApp::new("measure")
                .about("Measure an ADC input")
                .arg(channel_arg("Input channel, 1..=4 per ADC board")),
        )
        .subcommand(
            ClapApp::new("sweep")
                .about("Step an output from start to stop")
                .arg(channel_arg("Output channel 1..=2"))
                .arg(value_arg("start", "First voltage").required(true))
                .arg(value_arg("stop", "Last voltage").required(true))
                .arg(Arg::new("points").required(true).help("Number of points, at least 2"))
                .arg(
                    Arg::new("dwell-ms")
                        .long("dwell-ms")
                        .takes_value(true)
                        .default_value("100")
                        .help("Time spent on each point"),
                ),
        )
        .subcommand(
            ClapApp::new("dc-sweep")
                .about("Run a sweep on the DC generator of an output")
                .arg(channel_arg("Output channel 1..=2"))
                .arg(value_arg("start", "First voltage").required(true))
                .arg(value_arg("stop", "Last voltage").required(true))
                .arg(Arg::new("points").required(true).help("Number of points, at least 2"))
                .arg(
                    Arg::new("dwell-ms")
                        .long("dwell-ms")
                        .takes_value(true)
                        .default_value("1")
                        .help("Time spent on each point"),
                )
                .arg(
                    Arg::new("repeat")
                        .long("repeat")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("1")
                        .help("Number of runs, -1 to repeat until aborted"),
                ),
        )
        .subcommand(
            ClapApp::new("abort")
                .about("Stop the DC generator of an output")
                .arg(channel_arg("Output channel 1..=2")),
        )
        .subcommand(ClapApp::new("self-test").about("Cycle the relays of both outputs"))
        .subcommand(ClapApp::new("zero").about("Set all outputs to 0V"))
}

fn smu_command() -> ClapApp<'static> {
    ClapApp::new("smu")
        .about("Control an SPSMU")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            ClapApp::new("mode")
                .about("Query or set force mode, measure mode and current range")
                .arg(channel_arg("Channel 1..=16"))
                .arg(value_arg("mode", "e.g. FV,MI,UA5")),
        )
        .subcommand(
            ClapApp::new("mode-all")
                .about("Set the source mode of all channels")
                .arg(value_arg("mode", "e.g. FV,MI,UA5").required(true)),
        )
        .subcommand(
            ClapApp::new("voltage")
                .about("Query or set the voltage setpoint")
                .arg(channel_arg("Channel 1..=16"))
                .arg(value_arg("volts", "Setpoint in V")),
        )
        .subcommand(
            ClapApp::new("current")
                .about("Query or set the current setpoint")
                .arg(channel_arg("Channel 1..=16"))
                .arg(value_arg("micro-amps", "Setpoint in uA")),
        )
        .subcommand(
            ClapApp::new("measure")
                .about("Measure voltage or current")
                .arg(channel_arg("Channel 1..=16"))
                .arg(Arg::new("quantity").required(true).help("VOLT or CURR")),
        )
        .subcommand(
            ClapApp::new("clamp")
                .about("Query or set a clamp as fractions of full scale")
                .arg(channel_arg("Channel 1..=16"))
                .arg(Arg::new("quantity").required(true).help("VOLT or CURR"))
                .arg(value_arg("limits", "low,high, e.g. -0.5,0.5")),
        )
        .subcommand(
            ClapApp::new("route")
                .about("Query or set the analog routing (admin, no interlocks)")
                .arg(Arg::new("chip-select").required(true).help("Chip select 1..=4"))
                .arg(Arg::new("pmu").required(true).help("PMU channel 1..=4"))
                .arg(value_arg("mode", "HIZ, SENSE, FORCE or ALL")),
        )
}

fn cli() -> ClapApp<'static> {
    ClapApp::new("SPDev instrument client")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Talk to SPDac and SPSMU instruments over SCPI")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::new("verbose").long("verbose").short('v').help("Log verbose output"))
        .arg(
            Arg::new("address")
                .long("address")
                .short('a')
                .takes_value(true)
                .env("SPDEV_ADDRESS")
                .help("e.g. serial::/dev/ttyUSB0, ASRL3::INSTR or sim::spdac"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .takes_value(true)
                .default_value("1000")
                .help("Reply timeout of queries"),
        )
        .arg(
            Arg::new("adc-boards")
                .long("adc-boards")
                .takes_value(true)
                .default_value("1")
                .help("ADC boards attached to an SPDac"),
        )
        .subcommand(ClapApp::new("list-ports").about("List serial ports and the instrument they likely belong to"))
        .subcommand(ClapApp::new("idn").about("Print the identity of the instrument"))
        .subcommand(ClapApp::new("errors").about("Read and clear the error queue"))
        .subcommand(ClapApp::new("reset").about("Restore power-on defaults"))
        .subcommand(
            ClapApp::new("raw")
                .about("Send a command line as is")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(ClapApp::new("write").arg(Arg::new("line").required(true)))
                .subcommand(ClapApp::new("query").arg(Arg::new("line").required(true))),
        )
        .subcommand(
            ClapApp::new("snapshot")
                .about("Print all channel parameters")
                .arg(
                    Arg::new("update")
                        .long("update")
                        .help("Read every value from the instrument instead of the cache"),
                )
                .arg(Arg::new("json").long("json").help("Print JSON")),
        )
        .subcommand(dac_command())
        .subcommand(smu_command())
}

fn parse_value<T>(matches: &ArgMatches, name: &str) -> spdev::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match matches.value_of(name) {
        Some(x) => x
            .parse()
            .map(Some)
            .map_err(|err| Error::argument(anyhow!("Invalid {} `{}`: {}", name, x, err))),
        None => Ok(None),
    }
}

fn required<T>(matches: &ArgMatches, name: &str) -> spdev::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_value(matches, name)?.ok_or_else(|| Error::argument(anyhow!("Missing argument `{}`", name)))
}

struct Context {
    address: Option<Address>,
    session: SessionOptions,
    options: DeviceOptions,
}

impl Context {
    fn from_matches(matches: &ArgMatches) -> spdev::Result<Self> {
        let timeout: u64 = required(matches, "timeout-ms")?;
        let adc_boards: u8 = required(matches, "adc-boards")?;
        Ok(Self {
            address: parse_value(matches, "address")?,
            session: SessionOptions {
                timeout: Duration::from_millis(timeout),
            },
            options: DeviceOptions {
                adc_boards,
                ..Default::default()
            },
        })
    }

    fn address(&self) -> spdev::Result<&Address> {
        self.address
            .as_ref()
            .ok_or_else(|| Error::argument(anyhow!("No address given, use --address or SPDEV_ADDRESS")))
    }

    async fn instrument(&self) -> spdev::Result<Instrument> {
        Instrument::connect(self.address()?, self.session.clone()).await
    }

    async fn dac(&self) -> spdev::Result<SpDac> {
        SpDac::open(self.address()?, self.session.clone(), self.options.clone()).await
    }

    async fn smu(&self) -> spdev::Result<SpSmu> {
        SpSmu::open(self.address()?, self.session.clone(), self.options.clone()).await
    }
}

async fn list_ports() -> spdev::Result<()> {
    let ports = serial::list_devices().await?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "-".to_string(),
        };
        let hint = port.hint.map(|x| x.to_string()).unwrap_or_default();
        println!(
            "{:<16} {:<10} {:<12} {:<20} {}",
            port.name,
            usb,
            hint,
            port.serial_number.unwrap_or_default(),
            port.product.unwrap_or_default()
        );
    }
    Ok(())
}

async fn snapshot(ctx: &Context, matches: &ArgMatches) -> spdev::Result<()> {
    let update = matches.is_present("update");
    let instrument = ctx.instrument().await?;
    let model: Model = instrument.identify().await?.model.parse()?;
    let snapshot: Snapshot = match model {
        Model::SpDac => SpDac::connect(instrument, ctx.options.clone()).await?.snapshot(update).await?,
        Model::SpSmu => SpSmu::connect(instrument, ctx.options.clone()).await?.snapshot(update).await?,
    };
    if matches.is_present("json") {
        println!("{}", snapshot.to_json()?);
    } else {
        print!("{}", snapshot);
    }
    Ok(())
}

async fn dac(ctx: &Context, matches: &ArgMatches) -> spdev::Result<()> {
    let dac = ctx.dac().await?;
    match matches.subcommand() {
        Some(("range", m)) => {
            let output = dac.output(required(m, "channel")?)?;
            match parse_value::<OutputRange>(m, "range")? {
                Some(range) if m.is_present("safe") => output.switch_range_safely(range).await?,
                Some(range) => output.set_range(range).await?,
                None => println!("{}", output.range().await?),
            }
        }
        Some(("mode", m)) => {
            let output = dac.output(required(m, "channel")?)?;
            match parse_value::<OutputMode>(m, "mode")? {
                Some(mode) => output.set_output_mode(mode).await?,
                None => println!("{}", output.output_mode().await?),
            }
        }
        Some(("voltage", m)) => {
            let output = dac.output(required(m, "channel")?)?;
            match parse_value(m, "volts")? {
                Some(volts) => output.set_voltage(volts).await?,
                None => println!("{}", output.voltage().await?),
            }
        }
        Some(("last", m)) => {
            let output = dac.output(required(m, "channel")?)?;
            println!("{}", output.last_voltage().await?);
        }
        Some(("measure", m)) => {
            let input = dac.input(required(m, "channel")?)?;
            println!("{}", input.measure().await?);
        }
        Some(("sweep", m)) => {
            let output = dac.output(required(m, "channel")?)?;
            let dwell = Duration::from_millis(required(m, "dwell-ms")?);
            output
                .sweep(required(m, "start")?, required(m, "stop")?, required(m, "points")?, dwell)
                .await?;
        }
        Some(("dc-sweep", m)) => {
            let output = dac.output(required(m, "channel")?)?;
            let repeat: i64 = required(m, "repeat")?;
            let repetitions = Repetitions::from_wire(repeat)
                .ok_or_else(|| Error::argument(anyhow!("Invalid repetition count {}", repeat)))?;
            let mut sweep = DcSweep::new(required(m, "start")?, required(m, "stop")?, required(m, "points")?);
            sweep.dwell = Duration::from_millis(required(m, "dwell-ms")?);
            sweep.repetitions = repetitions;
            output.dc_sweep(&sweep).await?;
            output.dc_start().await?;
        }
        Some(("abort", m)) => dac.output(required(m, "channel")?)?.dc_abort().await?,
        Some(("self-test", _)) => {
            dac.self_test().await?;
            println!("Self test passed.");
        }
        Some(("zero", _)) => dac.zero_all().await?,
        _ => return Err(Error::argument(anyhow!("Unknown dac command"))),
    }
    dac.instrument().check_error().await
}

async fn smu(ctx: &Context, matches: &ArgMatches) -> spdev::Result<()> {
    let smu = ctx.smu().await?;
    match matches.subcommand() {
        Some(("mode", m)) => {
            let channel = smu.channel(required(m, "channel")?)?;
            match parse_value::<SourceMode>(m, "mode")? {
                Some(mode) => channel.set_source_mode(mode).await?,
                None => println!("{}", channel.source_mode().await?),
            }
        }
        Some(("mode-all", m)) => smu.set_all_source_modes(required(m, "mode")?).await?,
        Some(("voltage", m)) => {
            let channel = smu.channel(required(m, "channel")?)?;
            match parse_value(m, "volts")? {
                Some(volts) => channel.set_voltage(volts).await?,
                None => println!("{}", channel.voltage().await?),
            }
        }
        Some(("current", m)) => {
            let channel = smu.channel(required(m, "channel")?)?;
            // the range check needs the present mode
            channel.source_mode().await?;
            match parse_value(m, "micro-amps")? {
                Some(micro_amps) => channel.set_current(micro_amps).await?,
                None => println!("{}", channel.current().await?),
            }
        }
        Some(("measure", m)) => {
            let channel = smu.channel(required(m, "channel")?)?;
            let value = match required::<Quantity>(m, "quantity")? {
                Quantity::Voltage => channel.measure_voltage().await?,
                Quantity::Current => channel.measure_current().await?,
            };
            println!("{}", value);
        }
        Some(("clamp", m)) => {
            let channel = smu.channel(required(m, "channel")?)?;
            let quantity: Quantity = required(m, "quantity")?;
            match parse_value::<ClampLimits>(m, "limits")? {
                Some(limits) => channel.set_clamp(quantity, limits.low, limits.high).await?,
                None => println!("{}", channel.clamp(quantity).await?),
            }
        }
        Some(("route", m)) => {
            let chip_select = required(m, "chip-select")?;
            let pmu = required(m, "pmu")?;
            match parse_value::<RoutingMode>(m, "mode")? {
                Some(mode) => smu.set_routing(chip_select, pmu, mode).await?,
                None => println!("{}", smu.routing(chip_select, pmu).await?),
            }
        }
        _ => return Err(Error::argument(anyhow!("Unknown smu command"))),
    }
    smu.instrument().check_error().await
}

async fn run(matches: ArgMatches) -> spdev::Result<()> {
    let ctx = Context::from_matches(&matches)?;
    match matches.subcommand() {
        Some(("list-ports", _)) => list_ports().await?,
        Some(("idn", _)) => {
            let instrument = ctx.instrument().await?;
            println!("{}", instrument.identify().await?);
        }
        Some(("errors", _)) => {
            let instrument = ctx.instrument().await?;
            let errors = instrument.drain_errors().await?;
            if errors.is_empty() {
                println!("0,\"No error\"");
            }
            for err in errors {
                println!("{}", err);
            }
        }
        Some(("reset", _)) => {
            let instrument = ctx.instrument().await?;
            instrument.reset(ctx.options.reset_delay).await?;
        }
        Some(("raw", m)) => {
            let instrument = ctx.instrument().await?;
            match m.subcommand() {
                Some(("write", m)) => instrument.write(required::<String>(m, "line")?).await?,
                Some(("query", m)) => println!("{}", instrument.query(required::<String>(m, "line")?).await?),
                _ => return Err(Error::argument(anyhow!("Unknown raw command"))),
            }
        }
        Some(("snapshot", m)) => snapshot(&ctx, m).await?,
        Some(("dac", m)) => dac(&ctx, m).await?,
        Some(("smu", m)) => smu(&ctx, m).await?,
        _ => return Err(Error::argument(anyhow!("Unknown command"))),
    }
    Ok(())
}

fn main() {
    let matches = cli().get_matches();

    if matches.is_present("verbose") {
        env_logger::Builder::from_env(Env::default().default_filter_or("spdev=debug")).init();
    } else {
        env_logger::init();
    }

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Cannot start the async runtime: {}", err);
            exit(1);
        }
    };
    if let Err(err) = rt.block_on(run(matches)) {
        eprintln!("{}", err);
        exit(1);
    }
}
