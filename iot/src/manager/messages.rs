//! Device manager messages

use std::collections::{BTreeSet, HashSet};

use tokio::sync::oneshot;

use crate::device::DeviceHandle;
use crate::domain::{DeviceId, GroupId, RequestId};
use crate::error::IotResult;
use crate::group::{GroupHandle, ReplyDeviceList};
use crate::lifecycle::ActorId;

/// Groups currently registered with the manager
#[derive(Debug, Clone)]
pub struct ReplyGroupList {
    pub request_id: RequestId,
    pub ids: BTreeSet<GroupId>,
    pub handles: HashSet<GroupHandle>,
}

/// Commands sent to the device manager actor
#[derive(Debug)]
pub enum ManagerCommand {
    /// Resolve a device, creating its group and the device on first use
    TrackDevice {
        group_id: GroupId,
        device_id: DeviceId,
        reply: oneshot::Sender<IotResult<DeviceHandle>>,
    },

    /// List registered groups
    ListGroups {
        request_id: RequestId,
        reply: oneshot::Sender<ReplyGroupList>,
    },

    /// List the devices of one group
    ListDevices {
        request_id: RequestId,
        group_id: GroupId,
        reply: oneshot::Sender<ReplyDeviceList>,
    },

    /// Look up the handle of one group
    GetGroup {
        group_id: GroupId,
        reply: oneshot::Sender<Option<GroupHandle>>,
    },

    /// A watched group stopped (internal)
    GroupTerminated { actor_id: ActorId },

    /// Stop every group and then the manager
    Shutdown,
}
