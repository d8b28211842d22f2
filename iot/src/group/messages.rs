//! Device group messages

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::device::DeviceHandle;
use crate::domain::{DeviceId, GroupId, RequestId};
use crate::error::IotResult;
use crate::lifecycle::{ActorId, ReplyTo};
use crate::query::{QuerySnapshot, RespondAllTemperatures};

/// Device ids currently registered in a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyDeviceList {
    #[serde(rename = "request-id")]
    pub request_id: RequestId,
    pub ids: BTreeSet<DeviceId>,
}

/// Commands sent to a device group actor
#[derive(Debug)]
pub enum GroupCommand {
    /// Resolve a device, creating it on first use
    TrackDevice {
        group_id: GroupId,
        device_id: DeviceId,
        reply: oneshot::Sender<IotResult<DeviceHandle>>,
    },

    /// List registered device ids
    ListDevices {
        request_id: RequestId,
        reply: oneshot::Sender<ReplyDeviceList>,
    },

    /// Current device mapping
    Snapshot { reply: oneshot::Sender<QuerySnapshot> },

    /// Query every current device for its temperature
    RequestAllTemperatures {
        request_id: RequestId,
        timeout: Duration,
        reply_to: ReplyTo<RespondAllTemperatures>,
    },

    /// A watched device stopped (internal)
    DeviceTerminated { actor_id: ActorId },

    /// Stop the group and all of its devices
    Stop,
}
