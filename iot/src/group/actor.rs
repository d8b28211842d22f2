//! GroupHandle and the device group actor loop

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{GroupCommand, ReplyDeviceList};
use crate::device::{DeviceCommand, DeviceHandle};
use crate::domain::{DeviceId, GroupId, RequestId};
use crate::error::{IotError, IotResult};
use crate::lifecycle::{ActorId, DeathWatch, ReplyTo, impl_watchable, post};
use crate::query::{GroupQuery, QuerySnapshot, RespondAllTemperatures};

/// Handle to send commands to a device group actor
#[derive(Debug, Clone)]
pub struct GroupHandle {
    id: ActorId,
    tx: mpsc::Sender<GroupCommand>,
}

impl_watchable!(GroupHandle);

impl GroupHandle {
    /// Spawn a new group actor
    ///
    /// `buffer` sizes the group's mailbox, `device_buffer` the mailbox of each
    /// device it creates.
    pub fn spawn(group_id: &str, buffer: usize, device_buffer: usize) -> Self {
        debug!(%group_id, buffer, device_buffer, "GroupHandle::spawn: called");
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = ActorId::new();
        let group = DeviceGroup {
            group_id: group_id.to_string(),
            device_buffer,
            devices: HashMap::new(),
            device_ids: HashMap::new(),
            watch: DeathWatch::new(tx.downgrade()),
        };
        tokio::spawn(actor_loop(group, rx));
        Self { id, tx }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Resolve `device_id` in this group, creating the device on first use
    pub async fn track_device(&self, group_id: &str, device_id: &str) -> IotResult<DeviceHandle> {
        debug!(actor_id = %self.id, %group_id, %device_id, "track_device: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(GroupCommand::TrackDevice {
            group_id: group_id.to_string(),
            device_id: device_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)?
    }

    /// List the device ids currently registered
    pub async fn list_devices(&self, request_id: RequestId) -> IotResult<ReplyDeviceList> {
        debug!(actor_id = %self.id, request_id, "list_devices: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(GroupCommand::ListDevices {
            request_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Current device-id → handle mapping
    pub async fn snapshot(&self) -> IotResult<QuerySnapshot> {
        debug!(actor_id = %self.id, "snapshot: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(GroupCommand::Snapshot { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Handles of the devices currently registered
    pub async fn device_handles(&self) -> IotResult<HashSet<DeviceHandle>> {
        Ok(self.snapshot().await?.into_values().collect())
    }

    /// Query every current device and wait for the aggregated reply
    pub async fn query(&self, request_id: RequestId, timeout: Duration) -> IotResult<RespondAllTemperatures> {
        debug!(actor_id = %self.id, request_id, ?timeout, "query: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_all_temperatures(request_id, timeout, ReplyTo::Caller(reply_tx))
            .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Start a group query, delivering the aggregated reply to `reply_to`
    pub async fn request_all_temperatures(
        &self,
        request_id: RequestId,
        timeout: Duration,
        reply_to: ReplyTo<RespondAllTemperatures>,
    ) -> IotResult<()> {
        self.send(GroupCommand::RequestAllTemperatures {
            request_id,
            timeout,
            reply_to,
        })
        .await
    }

    /// Stop the group and all of its devices
    pub async fn stop(&self) -> IotResult<()> {
        debug!(actor_id = %self.id, "stop: called");
        self.send(GroupCommand::Stop).await
    }

    /// Deliver a raw command without waiting, handing it back if the mailbox is closed
    pub(crate) fn forward(&self, cmd: GroupCommand) -> Result<(), GroupCommand> {
        post(&self.tx, cmd)
    }

    async fn send(&self, cmd: GroupCommand) -> IotResult<()> {
        self.tx.send(cmd).await.map_err(|_| IotError::ChannelClosed)
    }
}

/// State owned by one group actor
struct DeviceGroup {
    group_id: GroupId,
    device_buffer: usize,
    devices: HashMap<DeviceId, DeviceHandle>,
    device_ids: HashMap<ActorId, DeviceId>,
    watch: DeathWatch<GroupCommand>,
}

impl DeviceGroup {
    fn track_device(&mut self, device_id: DeviceId, reply: oneshot::Sender<IotResult<DeviceHandle>>) {
        let mut cmd = DeviceCommand::TrackDevice {
            group_id: self.group_id.clone(),
            device_id: device_id.clone(),
            reply,
        };

        if let Some(device) = self.devices.get(&device_id).cloned() {
            match device.forward(cmd) {
                Ok(()) => return,
                Err(returned) => {
                    // Stopped, but its termination has not been processed yet.
                    debug!(%device_id, "track_device: known device already stopped, recreating");
                    self.remove_device(device.id());
                    cmd = returned;
                }
            }
        }

        info!(group_id = %self.group_id, %device_id, "Creating device actor for {}", device_id);
        let device = DeviceHandle::spawn(&self.group_id, &device_id, self.device_buffer);
        self.watch.watch(
            &device,
            GroupCommand::DeviceTerminated {
                actor_id: device.id(),
            },
        );
        self.device_ids.insert(device.id(), device_id.clone());
        self.devices.insert(device_id, device.clone());

        if device.forward(cmd).is_err() {
            warn!(group_id = %self.group_id, "track_device: new device stopped before registering");
        }
    }

    /// Remove both directions of a device mapping
    fn remove_device(&mut self, actor_id: ActorId) -> Option<DeviceId> {
        self.watch.unwatch(actor_id);
        let device_id = self.device_ids.remove(&actor_id)?;
        if self.devices.get(&device_id).is_some_and(|d| d.id() == actor_id) {
            self.devices.remove(&device_id);
        }
        Some(device_id)
    }

    fn device_list(&self) -> BTreeSet<DeviceId> {
        self.devices.keys().cloned().collect()
    }
}

/// The actor loop that owns the group's device mapping and processes commands
async fn actor_loop(mut group: DeviceGroup, mut rx: mpsc::Receiver<GroupCommand>) {
    info!(group_id = %group.group_id, "Device group {} started", group.group_id);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            GroupCommand::TrackDevice {
                group_id,
                device_id,
                reply,
            } => {
                debug!(%group_id, %device_id, "actor_loop: TrackDevice command");
                if group_id != group.group_id {
                    warn!(
                        "Ignoring TrackDevice request for {}. This actor is responsible for {}",
                        group_id, group.group_id
                    );
                    let _ = reply.send(Err(IotError::WrongGroup {
                        requested: group_id,
                        actual: group.group_id.clone(),
                    }));
                    continue;
                }
                group.track_device(device_id, reply);
            }

            GroupCommand::ListDevices { request_id, reply } => {
                debug!(request_id, "actor_loop: ListDevices command");
                let _ = reply.send(ReplyDeviceList {
                    request_id,
                    ids: group.device_list(),
                });
            }

            GroupCommand::Snapshot { reply } => {
                debug!("actor_loop: Snapshot command");
                let _ = reply.send(group.devices.clone());
            }

            GroupCommand::RequestAllTemperatures {
                request_id,
                timeout,
                reply_to,
            } => {
                debug!(request_id, ?timeout, "actor_loop: RequestAllTemperatures command");
                GroupQuery::spawn(request_id, group.devices.clone(), reply_to, timeout);
            }

            GroupCommand::DeviceTerminated { actor_id } => {
                if let Some(device_id) = group.remove_device(actor_id) {
                    info!(group_id = %group.group_id, %device_id, "Device actor for {} has been terminated", device_id);
                }
            }

            GroupCommand::Stop => {
                debug!(group_id = %group.group_id, "actor_loop: Stop command");
                break;
            }
        }
    }

    for device in group.devices.values() {
        let _ = device.forward(DeviceCommand::Stop);
    }
    info!(group_id = %group.group_id, "Device group {} stopped", group.group_id);
}
