//! Identifiers and reading types shared by devices, groups and queries

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a device group
pub type GroupId = String;

/// Name of a device, unique within its group
pub type DeviceId = String;

/// Caller-chosen id echoed in every reply so requests and replies can be matched
pub type RequestId = u64;

/// Final status of one device in an aggregated group query
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "kebab-case")]
pub enum TemperatureReading {
    /// The device answered with a recorded temperature
    Temperature(f64),

    /// The device answered but has no temperature recorded yet
    NotAvailable,

    /// The device stopped before answering
    DeviceNotAvailable,

    /// The device neither answered nor stopped before the deadline
    TimedOut,
}

impl TemperatureReading {
    /// Build the reading for an answer the device actually gave
    pub fn from_value(value: Option<f64>) -> Self {
        match value {
            Some(value) => Self::Temperature(value),
            None => Self::NotAvailable,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Temperature(value) => Some(*value),
            _ => None,
        }
    }

    /// Whether the device itself produced this reading
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Temperature(_) | Self::NotAvailable)
    }
}

impl fmt::Display for TemperatureReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature(value) => write!(f, "{:.2}", value),
            Self::NotAvailable => write!(f, "not available"),
            Self::DeviceNotAvailable => write!(f, "device not available"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}
