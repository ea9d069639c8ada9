//! Structured dump of all channel parameters of an instrument.

use std::fmt::{self, Display, Formatter};

use serde::Serialize;

use spdev_protocol::Identity;

use crate::params::ParamValue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: &'static str,
    pub value: ParamValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
}

impl Parameter {
    pub fn new<T: Into<ParamValue>>(name: &'static str, value: T, unit: Option<&'static str>) -> Self {
        Self {
            name,
            value: value.into(),
            unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub parameters: Vec<Parameter>,
}

impl ChannelSnapshot {
    pub fn new(name: String) -> Self {
        Self {
            name,
            parameters: Vec::new(),
        }
    }

    pub fn push<T: Into<ParamValue>>(&mut self, name: &'static str, value: T, unit: Option<&'static str>) {
        self.parameters.push(Parameter::new(name, value, unit));
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.parameters.iter().find(|x| x.name == name).map(|x| &x.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub address: String,
    pub identity: Identity,
    /// Whether the values were read from the instrument or taken from the cache.
    pub live: bool,
    pub channels: Vec<ChannelSnapshot>,
}

impl Snapshot {
    pub fn channel(&self, name: &str) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|x| x.name == name)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(crate::Error::internal)
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let source = if self.live { "live" } else { "cached" };
        writeln!(f, "{} @ {} ({})", self.identity, self.address, source)?;
        let width = self
            .channels
            .iter()
            .flat_map(|x| x.parameters.iter())
            .map(|x| x.name.len())
            .max()
            .unwrap_or(0);
        for channel in &self.channels {
            writeln!(f, "{}:", channel.name)?;
            for param in &channel.parameters {
                write!(f, "    {:width$} : {}", param.name, param.value, width = width)?;
                match param.unit {
                    Some(unit) if !param.value.is_none() => writeln!(f, " ({})", unit)?,
                    _ => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut ch = ChannelSnapshot::new("ch01".to_string());
        ch.push("output_range", Some("LOW".to_string()), None);
        ch.push("voltage", Some(1.5), Some("V"));
        ch.push("slew_rate", None::<f64>, Some("V/s"));
        Snapshot {
            address: "sim::spdac".to_string(),
            identity: Identity::new("SPDAC", "SP-0001", "0.3-1.2"),
            live: false,
            channels: vec![ch],
        }
    }

    #[test]
    fn print_table() {
        let text = sample().to_string();
        let expected = "SPDev,SPDAC,SP-0001,0.3-1.2 @ sim::spdac (cached)\n\
                        ch01:\n    \
                        output_range : LOW\n    \
                        voltage      : 1.5 (V)\n    \
                        slew_rate    : None\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn serialize_json() {
        let snapshot = sample();
        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["channels"][0]["parameters"][1]["value"], serde_json::json!(1.5));
        assert_eq!(json["channels"][0]["parameters"][1]["unit"], "V");
        assert!(json["channels"][0]["parameters"][2]["value"].is_null());
        assert_eq!(json["identity"]["model"], "SPDAC");
        assert_eq!(snapshot.channel("ch01").unwrap().get("voltage"), Some(&ParamValue::Number(1.5)));
    }
}
