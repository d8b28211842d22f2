//! Query snapshot and aggregated reply

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::device::DeviceHandle;
use crate::domain::{DeviceId, RequestId, TemperatureReading};

/// Devices taking part in one query, fixed for its whole lifetime
pub type QuerySnapshot = HashMap<DeviceId, DeviceHandle>;

/// Aggregated answer of a group query, one reading per snapshot device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondAllTemperatures {
    #[serde(rename = "request-id")]
    pub request_id: RequestId,
    pub temperatures: BTreeMap<DeviceId, TemperatureReading>,
}

impl RespondAllTemperatures {
    pub fn empty(request_id: RequestId) -> Self {
        Self {
            request_id,
            temperatures: BTreeMap::new(),
        }
    }

    /// Number of devices that answered, with or without a temperature
    pub fn answered(&self) -> usize {
        self.temperatures.values().filter(|r| r.is_answered()).count()
    }
}
