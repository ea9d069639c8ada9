//! Simulated firmware for running the drivers without hardware.
//!
//! Each simulator sits on one end of an in-memory duplex pipe and answers
//! lines using the same codec as the host. Only the documented behavior is
//! emulated: command side effects, the error queue and the absence of a reply
//! to a rejected query.

use std::collections::VecDeque;

use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task;

use spdev_protocol::scpi::{CommonCommand, Line, ParseError};
use spdev_protocol::{DeviceError, Identity};

use crate::Model;

pub mod spdac;
pub mod spsmu;

pub use spdac::SpDacFirmware;
pub use spsmu::SpSmuFirmware;

const PIPE_CAPACITY: usize = 4096;

/// Entries beyond this are collapsed into a single overflow entry.
pub const ERROR_QUEUE_CAPACITY: usize = 16;

/// Device specific part of a simulated instrument.
pub trait Firmware: Send + 'static {
    fn identity(&self) -> Identity;

    /// Restore the power-on state.
    fn reset(&mut self);

    /// Execute a device specific command.
    ///
    /// Returns `None` if the header is unknown, otherwise the reply to send,
    /// if any.
    fn execute(&mut self, line: &Line) -> Option<Result<Option<String>, ParseError>>;
}

#[derive(Debug, Default)]
pub struct ErrorQueue {
    entries: VecDeque<DeviceError>,
}

impl ErrorQueue {
    pub fn push(&mut self, err: DeviceError) {
        log::debug!("Simulated firmware error: {}", err);
        if self.entries.len() >= ERROR_QUEUE_CAPACITY {
            if let Some(last) = self.entries.back_mut() {
                *last = DeviceError::new(-350, "Queue overflow");
            }
            return;
        }
        self.entries.push_back(err);
    }

    pub fn pop(&mut self) -> DeviceError {
        self.entries.pop_front().unwrap_or_else(DeviceError::no_error)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the queue, rendered as the reply to `SYSTem:ERRor:ALL?`.
    pub fn drain_all(&mut self) -> String {
        let mut ret: Vec<String> = self.entries.drain(..).map(|x| x.to_string()).collect();
        ret.push(DeviceError::no_error().to_string());
        ret.join(",")
    }
}

/// Line interpreter shared by all simulated instruments.
pub struct Simulator<F: Firmware> {
    firmware: F,
    errors: ErrorQueue,
}

impl<F: Firmware> Simulator<F> {
    pub fn new(firmware: F) -> Self {
        Self {
            firmware,
            errors: ErrorQueue::default(),
        }
    }

    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    /// Process one received line, returning the reply line if there is one.
    pub fn process_line(&mut self, line: &str) -> Option<String> {
        let line = Line::parse(line);
        if line.header.is_empty() {
            return None;
        }
        let result = match CommonCommand::parse(&line) {
            Some(Ok(cmd)) => Ok(self.common(cmd)),
            Some(Err(err)) => Err(err),
            None => match self.firmware.execute(&line) {
                Some(x) => x,
                None => Err(ParseError::UndefinedHeader(line.header.clone())),
            },
        };
        match result {
            Ok(reply) => reply,
            Err(err) => {
                self.errors.push(err.device_error());
                None
            }
        }
    }

    fn common(&mut self, cmd: CommonCommand) -> Option<String> {
        match cmd {
            CommonCommand::Identify => Some(self.firmware.identity().to_string()),
            CommonCommand::Reset => {
                self.firmware.reset();
                None
            }
            CommonCommand::NextError => Some(self.errors.pop().to_string()),
            CommonCommand::AllErrors => Some(self.errors.drain_all()),
            CommonCommand::ErrorCount => Some(self.errors.len().to_string()),
        }
    }
}

/// Start the simulated firmware of `model` and return the host end of its pipe.
///
/// The simulator stops once the host end is dropped.
pub fn spawn(model: Model) -> DuplexStream {
    match model {
        Model::SpDac => spawn_firmware(SpDacFirmware::default()),
        Model::SpSmu => spawn_firmware(SpSmuFirmware::default()),
    }
}

pub fn spawn_firmware<F: Firmware>(firmware: F) -> DuplexStream {
    let (host, device) = io::duplex(PIPE_CAPACITY);
    let sim = Simulator::new(firmware);
    task::spawn(run(device, sim));
    host
}

async fn run<F: Firmware>(stream: DuplexStream, mut sim: Simulator<F>) {
    let model = sim.firmware().identity().model;
    log::debug!("Simulated {} started", model);
    let (read, mut write) = io::split(stream);
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                log::error!("Simulated {} cannot read: {}", model, err);
                break;
            }
        };
        if let Some(mut reply) = sim.process_line(line.trim_end_matches('\r')) {
            reply.push('\n');
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }
    log::debug!("Simulated {} stopped", model);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Firmware for Echo {
        fn identity(&self) -> Identity {
            Identity::new("ECHO", "0", "1.0")
        }

        fn reset(&mut self) {}

        fn execute(&mut self, line: &Line) -> Option<Result<Option<String>, ParseError>> {
            if line.is("ECHO?") {
                Some(line.expect_args(1).map(|_| Some(line.args[0].clone())))
            } else {
                None
            }
        }
    }

    #[test]
    fn rejected_lines_fill_error_queue() {
        let mut sim = Simulator::new(Echo);
        assert_eq!(sim.process_line("ECHO? hello"), Some("hello".to_string()));
        assert_eq!(sim.process_line("ECHO?"), None);
        assert_eq!(sim.process_line("FOO:BAR 1"), None);
        assert_eq!(sim.process_line("SYST:ERR:COUN?"), Some("2".to_string()));
        assert_eq!(sim.process_line("SYST:ERR?"), Some("-109,\"Missing parameter\"".to_string()));
        assert_eq!(
            sim.process_line("SYST:ERR:ALL?"),
            Some("-113,\"Undefined header\",0,\"No error\"".to_string())
        );
        assert_eq!(sim.process_line("SYST:ERR?"), Some("0,\"No error\"".to_string()));
        assert_eq!(sim.process_line("*IDN?"), Some("SPDev,ECHO,0,1.0".to_string()));
        assert_eq!(sim.process_line(""), None);
    }

    #[test]
    fn error_queue_overflow() {
        let mut queue = ErrorQueue::default();
        for _ in 0..ERROR_QUEUE_CAPACITY + 5 {
            queue.push(DeviceError::new(-222, "Data out of range"));
        }
        assert_eq!(queue.len(), ERROR_QUEUE_CAPACITY);
        let all: Vec<_> = (0..ERROR_QUEUE_CAPACITY).map(|_| queue.pop()).collect();
        assert_eq!(all.last().unwrap().code, -350);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), DeviceError::no_error());
    }
}
