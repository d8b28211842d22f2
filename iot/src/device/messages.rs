//! Device messages

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::actor::DeviceHandle;
use crate::domain::{DeviceId, GroupId, RequestId};
use crate::error::IotResult;
use crate::lifecycle::{ActorId, ReplyTo};

/// Answer to a temperature read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondTemperature {
    #[serde(rename = "request-id")]
    pub request_id: RequestId,
    /// The answering device actor
    pub from: ActorId,
    pub value: Option<f64>,
}

/// Acknowledgement of a recorded temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemperatureRecorded {
    #[serde(rename = "request-id")]
    pub request_id: RequestId,
}

/// Commands sent to a device actor
#[derive(Debug)]
pub enum DeviceCommand {
    /// Report the current temperature
    ReadTemperature {
        request_id: RequestId,
        reply_to: ReplyTo<RespondTemperature>,
    },

    /// Overwrite the current temperature
    RecordTemperature {
        request_id: RequestId,
        value: f64,
        reply: oneshot::Sender<TemperatureRecorded>,
    },

    /// Registration request; answered only for the device's own ids
    TrackDevice {
        group_id: GroupId,
        device_id: DeviceId,
        reply: oneshot::Sender<IotResult<DeviceHandle>>,
    },

    /// Stop the actor
    Stop,
}
