//! Base types and functions shared by all SCPI-based SPDev instruments.
//!
//! Both directions of the wire protocol live here: rendering typed commands into
//! lines for the host, and splitting received lines back into header and
//! arguments for the simulated firmware.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::{Error, ProtocolError};

/// Line terminator used in both directions.
pub const TERMINATOR: u8 = b'\n';

/// The firmware stores setpoints with this many significant digits. Longer
/// numbers are truncated in an unspecified way, so we round before sending.
pub const SIGNIFICANT_DIGITS: usize = 8;

pub const MANUFACTURER: &str = "SPDev";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScpiRequest {
    Write(String),
    QueryString(String),
    ReadAll,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScpiResponse {
    Done,
    String(String),
    Lines(Vec<String>),
}

/// Round `value` to [`SIGNIFICANT_DIGITS`] significant digits.
pub fn round_significant(value: f64) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let x = format!("{:.*e}", SIGNIFICANT_DIGITS - 1, value);
    x.parse().unwrap_or(value)
}

/// Render a numeric parameter as plain decimal text.
pub fn format_number(value: f64) -> crate::Result<String> {
    if !value.is_finite() {
        return Err(Error::argument(anyhow!("Cannot transmit non-finite value {}", value)));
    }
    let rounded = round_significant(value);
    if rounded != value {
        log::debug!(
            "Rounded {} to {} ({} significant digits)",
            value,
            rounded,
            SIGNIFICANT_DIGITS
        );
    }
    if rounded == 0.0 {
        return Ok("0".to_string());
    }
    Ok(format!("{}", rounded))
}

/// Strip whitespace and one pair of surrounding double quotes.
pub fn unquote(x: &str) -> &str {
    let x = x.trim();
    if x.len() >= 2 && x.starts_with('"') && x.ends_with('"') {
        &x[1..x.len() - 1]
    } else {
        x
    }
}

pub fn parse_float(reply: &str) -> Result<f64, ProtocolError> {
    unquote(reply)
        .parse::<f64>()
        .map_err(|_| ProtocolError::UnexpectedResponse(reply.to_string()))
}

pub fn parse_int(reply: &str) -> Result<i64, ProtocolError> {
    unquote(reply)
        .parse::<i64>()
        .map_err(|_| ProtocolError::UnexpectedResponse(reply.to_string()))
}

/// Split a comma separated list, keeping commas inside quoted strings.
pub fn split_list(x: &str) -> Vec<&str> {
    let mut ret = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (idx, c) in x.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                ret.push(x[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let last = x[start..].trim();
    if !last.is_empty() || !ret.is_empty() {
        ret.push(last);
    }
    ret
}

/// Split a reply list and strip the quotes of every element. A list sent as a
/// single quoted string (`"FV,MI,UA5"`) is split as well.
pub fn split_reply(x: &str) -> Vec<&str> {
    let mut parts = split_list(x);
    if parts.len() == 1 {
        parts = split_list(unquote(parts[0]));
    }
    parts.into_iter().map(unquote).collect()
}

/// Check a received header against a pattern written in SCPI notation, where
/// the upper-case part of each node is the short form, e.g. `SOURce:VOLTage?`.
pub fn header_matches(header: &str, pattern: &str) -> bool {
    let header = header.trim().trim_start_matches(':');
    if header.starts_with('*') || pattern.starts_with('*') {
        return header.eq_ignore_ascii_case(pattern);
    }
    let (header, header_query) = match header.strip_suffix('?') {
        Some(x) => (x, true),
        None => (header, false),
    };
    let (pattern, pattern_query) = match pattern.strip_suffix('?') {
        Some(x) => (x, true),
        None => (pattern, false),
    };
    if header_query != pattern_query {
        return false;
    }
    let nodes: Vec<_> = header.split(':').collect();
    let expected: Vec<_> = pattern.split(':').collect();
    if nodes.len() != expected.len() {
        return false;
    }
    nodes.iter().zip(expected.iter()).all(|(node, mnemonic)| {
        let short: String = mnemonic.chars().take_while(|c| !c.is_ascii_lowercase()).collect();
        node.eq_ignore_ascii_case(&short) || node.eq_ignore_ascii_case(mnemonic)
    })
}

/// Reasons a received line is rejected, as reported in the error queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    UndefinedHeader(String),
    MissingParameter,
    ParameterNotAllowed,
    IllegalParameter(String),
    OutOfRange(String),
}

impl ParseError {
    pub fn device_error(&self) -> DeviceError {
        match self {
            ParseError::UndefinedHeader(_) => DeviceError::new(-113, "Undefined header"),
            ParseError::MissingParameter => DeviceError::new(-109, "Missing parameter"),
            ParseError::ParameterNotAllowed => DeviceError::new(-108, "Parameter not allowed"),
            ParseError::IllegalParameter(_) => DeviceError::new(-224, "Illegal parameter value"),
            ParseError::OutOfRange(_) => DeviceError::new(-222, "Data out of range"),
        }
    }
}

/// A received program message split into header and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub header: String,
    pub args: Vec<String>,
}

impl Line {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (header, rest) = match line.find(char::is_whitespace) {
            Some(idx) => (&line[..idx], line[idx..].trim()),
            None => (line, ""),
        };
        let args = split_list(rest).into_iter().map(|x| x.to_string()).collect();
        Line {
            header: header.to_string(),
            args,
        }
    }

    pub fn is(&self, pattern: &str) -> bool {
        header_matches(&self.header, pattern)
    }

    pub fn expect_args(&self, count: usize) -> Result<(), ParseError> {
        match self.args.len().cmp(&count) {
            Ordering::Less => Err(ParseError::MissingParameter),
            Ordering::Greater => Err(ParseError::ParameterNotAllowed),
            Ordering::Equal => Ok(()),
        }
    }

    pub fn arg<T: FromStr>(&self, idx: usize) -> Result<T, ParseError> {
        let x = self.args.get(idx).ok_or(ParseError::MissingParameter)?;
        x.parse().map_err(|_| ParseError::IllegalParameter(x.clone()))
    }

    pub fn channel(&self, idx: usize, max: u8) -> Result<u8, ParseError> {
        let ch: u8 = self.arg(idx)?;
        if ch == 0 || ch > max {
            return Err(ParseError::OutOfRange(format!("channel {}", ch)));
        }
        Ok(ch)
    }

    pub fn number(&self, idx: usize) -> Result<f64, ParseError> {
        let x: f64 = self.arg(idx)?;
        if !x.is_finite() {
            return Err(ParseError::IllegalParameter(x.to_string()));
        }
        Ok(x)
    }
}

/// Dotted firmware version, compared component by component. Missing
/// trailing components count as zero, so `1` equals `1.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareVersion(pub Vec<u32>);

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        let component = |x: &FirmwareVersion, idx: usize| x.0.get(idx).copied().unwrap_or(0);
        (0..len)
            .map(|idx| component(self, idx).cmp(&component(other, idx)))
            .find(|x| *x != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl FromStr for FirmwareVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Result<Vec<u32>, _> = s.trim().split('.').map(|x| x.parse::<u32>()).collect();
        match parts {
            Ok(parts) if !parts.is_empty() => Ok(FirmwareVersion(parts)),
            _ => Err(ProtocolError::UnknownToken {
                kind: "firmware version",
                value: s.to_string(),
            }),
        }
    }
}

impl Display for FirmwareVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x: Vec<String> = self.0.iter().map(|x| x.to_string()).collect();
        f.write_str(&x.join("."))
    }
}

/// Reply to `*IDN?`: `SPDev,<model>,<serial>,<firmware>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    pub fn new(model: &str, serial: &str, firmware: &str) -> Self {
        Self {
            manufacturer: MANUFACTURER.to_string(),
            model: model.to_string(),
            serial: serial.to_string(),
            firmware: firmware.to_string(),
        }
    }

    /// The firmware field may be prefixed by an FPGA version, separated by `-`.
    pub fn firmware_version(&self) -> Result<FirmwareVersion, ProtocolError> {
        let x = self.firmware.rsplit('-').next().unwrap_or(&self.firmware);
        x.parse()
    }
}

impl FromStr for Identity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_reply(s);
        if parts.len() != 4 || parts.iter().any(|x| x.is_empty()) {
            return Err(ProtocolError::UnexpectedResponse(s.to_string()));
        }
        Ok(Identity {
            manufacturer: parts[0].to_string(),
            model: parts[1].to_string(),
            serial: parts[2].to_string(),
            firmware: parts[3].to_string(),
        })
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.manufacturer, self.model, self.serial, self.firmware)
    }
}

/// Parse one `<code>,"<message>"` error queue entry.
pub fn parse_device_error(reply: &str) -> Result<DeviceError, ProtocolError> {
    let parts = split_list(reply);
    parse_error_pair(&parts).ok_or_else(|| ProtocolError::UnexpectedResponse(reply.to_string()))
}

/// Parse the reply of `SYSTem:ERRor:ALL?`, dropping the "No error" terminator.
pub fn parse_device_errors(reply: &str) -> Result<Vec<DeviceError>, ProtocolError> {
    let parts = split_list(reply);
    if parts.len() % 2 != 0 {
        return Err(ProtocolError::UnexpectedResponse(reply.to_string()));
    }
    let mut ret = Vec::new();
    for pair in parts.chunks(2) {
        let err = parse_error_pair(pair).ok_or_else(|| ProtocolError::UnexpectedResponse(reply.to_string()))?;
        if err.is_error() {
            ret.push(err);
        }
    }
    Ok(ret)
}

fn parse_error_pair(parts: &[&str]) -> Option<DeviceError> {
    if parts.len() != 2 {
        return None;
    }
    let code = parts[0].trim().parse::<i32>().ok()?;
    Some(DeviceError::new(code, unquote(parts[1])))
}

/// IEEE-488.2 and SCPI system commands understood by every SPDev instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonCommand {
    Identify,
    Reset,
    NextError,
    AllErrors,
    ErrorCount,
}

impl CommonCommand {
    pub fn to_scpi(&self) -> String {
        match self {
            CommonCommand::Identify => "*IDN?",
            CommonCommand::Reset => "*RST",
            CommonCommand::NextError => "SYST:ERR?",
            CommonCommand::AllErrors => "SYST:ERR:ALL?",
            CommonCommand::ErrorCount => "SYST:ERR:COUN?",
        }
        .to_string()
    }

    pub fn is_query(&self) -> bool {
        !matches!(self, CommonCommand::Reset)
    }

    /// Returns `None` if the line is not a common command at all.
    pub fn parse(line: &Line) -> Option<Result<Self, ParseError>> {
        let cmd = if line.is("*IDN?") {
            CommonCommand::Identify
        } else if line.is("*RST") {
            CommonCommand::Reset
        } else if line.is("SYSTem:ERRor?") || line.is("SYSTem:ERRor:NEXT?") {
            CommonCommand::NextError
        } else if line.is("SYSTem:ERRor:ALL?") {
            CommonCommand::AllErrors
        } else if line.is("SYSTem:ERRor:COUNt?") {
            CommonCommand::ErrorCount
        } else {
            return None;
        };
        Some(line.expect_args(0).map(|_| cmd))
    }
}
