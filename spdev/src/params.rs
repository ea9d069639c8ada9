//! Host side mirror of instrument parameters.

use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Best-effort copy of a value last sent to or read from the instrument.
///
/// The firmware owns the real state. A cached value goes stale after a front
/// panel reset or when another program talks to the device.
#[derive(Debug)]
pub struct Cached<T> {
    inner: Mutex<Option<T>>,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self { inner: Mutex::new(None) }
    }
}

impl<T: Clone> Cached<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.lock() = Some(value);
    }

    /// Store `value` and return it, for use at the end of a query.
    pub fn update(&self, value: T) -> T {
        self.set(value.clone());
        value
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}

/// A parameter value as it appears in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
    None,
}

impl ParamValue {
    pub fn is_none(&self) -> bool {
        matches!(self, ParamValue::None)
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Number(x)
    }
}

impl From<String> for ParamValue {
    fn from(x: String) -> Self {
        ParamValue::Text(x)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(x: Option<T>) -> Self {
        x.map(Into::into).unwrap_or(ParamValue::None)
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(x) => write!(f, "{}", x),
            ParamValue::Text(x) => f.write_str(x),
            ParamValue::None => f.write_str("None"),
        }
    }
}
