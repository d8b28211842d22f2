//! DeviceManager - actor that owns the group registry
//!
//! The actor is the only writer of both group maps, so a registration never
//! observes a group that is half removed: it either finds the old group (and
//! forwards to it) or finds nothing and creates a replacement.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{ManagerCommand, ReplyGroupList};
use crate::config::MailboxConfig;
use crate::device::DeviceHandle;
use crate::domain::{GroupId, RequestId};
use crate::error::{IotError, IotResult};
use crate::group::{GroupCommand, GroupHandle, ReplyDeviceList};
use crate::lifecycle::{ActorId, DeathWatch, impl_watchable};
use crate::query::RespondAllTemperatures;

/// Handle to send commands to the DeviceManager
#[derive(Debug, Clone)]
pub struct DeviceManager {
    id: ActorId,
    tx: mpsc::Sender<ManagerCommand>,
}

impl_watchable!(DeviceManager);

impl DeviceManager {
    /// Spawn a new DeviceManager actor
    pub fn spawn(mailbox: MailboxConfig) -> Self {
        debug!(?mailbox, "DeviceManager::spawn: called");
        let (tx, rx) = mpsc::channel(mailbox.manager.max(1));
        let registry = Registry {
            mailbox,
            groups: HashMap::new(),
            group_ids: HashMap::new(),
            watch: DeathWatch::new(tx.downgrade()),
        };
        tokio::spawn(actor_loop(registry, rx));

        info!("DeviceManager spawned");
        Self { id: ActorId::new(), tx }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Resolve a device, creating its group and the device on first use
    ///
    /// Resolving the same pair again returns the same handle.
    pub async fn track_device(&self, group_id: &str, device_id: &str) -> IotResult<DeviceHandle> {
        debug!(%group_id, %device_id, "track_device: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::TrackDevice {
            group_id: group_id.to_string(),
            device_id: device_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)?
    }

    /// List registered groups and their handles
    pub async fn list_groups(&self, request_id: RequestId) -> IotResult<ReplyGroupList> {
        debug!(request_id, "list_groups: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::ListGroups {
            request_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// List the devices of `group_id`; unknown groups list no devices
    pub async fn list_devices(&self, request_id: RequestId, group_id: &str) -> IotResult<ReplyDeviceList> {
        debug!(request_id, %group_id, "list_devices: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::ListDevices {
            request_id,
            group_id: group_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Look up the handle of `group_id`
    pub async fn group(&self, group_id: &str) -> IotResult<Option<GroupHandle>> {
        debug!(%group_id, "group: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::GetGroup {
            group_id: group_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Query every device of `group_id` and wait for the aggregated reply
    pub async fn query_group(
        &self,
        request_id: RequestId,
        group_id: &str,
        timeout: Duration,
    ) -> IotResult<RespondAllTemperatures> {
        debug!(request_id, %group_id, ?timeout, "query_group: called");
        let group = self
            .group(group_id)
            .await?
            .ok_or_else(|| IotError::UnknownGroup(group_id.to_string()))?;
        group.query(request_id, timeout).await
    }

    /// Stop every group and then the manager
    pub async fn shutdown(&self) -> IotResult<()> {
        debug!("shutdown: called");
        self.send(ManagerCommand::Shutdown).await
    }

    async fn send(&self, cmd: ManagerCommand) -> IotResult<()> {
        self.tx.send(cmd).await.map_err(|_| IotError::ChannelClosed)
    }
}

/// Group maps owned by the manager actor
struct Registry {
    mailbox: MailboxConfig,
    groups: HashMap<GroupId, GroupHandle>,
    group_ids: HashMap<ActorId, GroupId>,
    watch: DeathWatch<ManagerCommand>,
}

impl Registry {
    fn track_device(&mut self, group_id: GroupId, device_id: String, reply: oneshot::Sender<IotResult<DeviceHandle>>) {
        let mut cmd = GroupCommand::TrackDevice {
            group_id: group_id.clone(),
            device_id,
            reply,
        };

        if let Some(group) = self.groups.get(&group_id).cloned() {
            match group.forward(cmd) {
                Ok(()) => return,
                Err(returned) => {
                    debug!(%group_id, "track_device: known group already stopped, recreating");
                    self.remove_group(group.id());
                    cmd = returned;
                }
            }
        }

        let group = self.create_group(&group_id);
        if group.forward(cmd).is_err() {
            warn!(%group_id, "track_device: new group stopped before registering");
        }
    }

    fn create_group(&mut self, group_id: &str) -> GroupHandle {
        info!(%group_id, "Creating device group actor for {}", group_id);
        let group = GroupHandle::spawn(group_id, self.mailbox.group, self.mailbox.device);
        self.watch.watch(&group, ManagerCommand::GroupTerminated { actor_id: group.id() });
        self.group_ids.insert(group.id(), group_id.to_string());
        self.groups.insert(group_id.to_string(), group.clone());
        group
    }

    /// Remove both directions of a group mapping
    fn remove_group(&mut self, actor_id: ActorId) -> Option<GroupId> {
        self.watch.unwatch(actor_id);
        let group_id = self.group_ids.remove(&actor_id)?;
        if self.groups.get(&group_id).is_some_and(|g| g.id() == actor_id) {
            self.groups.remove(&group_id);
        }
        Some(group_id)
    }

    fn group_list(&self, request_id: RequestId) -> ReplyGroupList {
        ReplyGroupList {
            request_id,
            ids: self.groups.keys().cloned().collect(),
            handles: self.groups.values().cloned().collect(),
        }
    }
}

/// The actor loop that owns the registry and processes commands
async fn actor_loop(mut registry: Registry, mut rx: mpsc::Receiver<ManagerCommand>) {
    info!("DeviceManager started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            ManagerCommand::TrackDevice {
                group_id,
                device_id,
                reply,
            } => {
                debug!(%group_id, %device_id, "actor_loop: TrackDevice command");
                registry.track_device(group_id, device_id, reply);
            }

            ManagerCommand::ListGroups { request_id, reply } => {
                debug!(request_id, "actor_loop: ListGroups command");
                let _ = reply.send(registry.group_list(request_id));
            }

            ManagerCommand::ListDevices {
                request_id,
                group_id,
                reply,
            } => {
                debug!(request_id, %group_id, "actor_loop: ListDevices command");
                let cmd = GroupCommand::ListDevices { request_id, reply };
                let returned = match registry.groups.get(&group_id) {
                    Some(group) => group.forward(cmd).err(),
                    None => Some(cmd),
                };
                if let Some(GroupCommand::ListDevices { request_id, reply }) = returned {
                    let _ = reply.send(ReplyDeviceList {
                        request_id,
                        ids: BTreeSet::new(),
                    });
                }
            }

            ManagerCommand::GetGroup { group_id, reply } => {
                debug!(%group_id, "actor_loop: GetGroup command");
                let _ = reply.send(registry.groups.get(&group_id).cloned());
            }

            ManagerCommand::GroupTerminated { actor_id } => {
                if let Some(group_id) = registry.remove_group(actor_id) {
                    info!(%group_id, "Device group actor for {} has been terminated", group_id);
                }
            }

            ManagerCommand::Shutdown => {
                info!("DeviceManager shutting down");
                break;
            }
        }
    }

    for group in registry.groups.values() {
        let _ = group.forward(GroupCommand::Stop);
    }
    info!("DeviceManager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Watchable;

    fn spawn_manager() -> DeviceManager {
        DeviceManager::spawn(MailboxConfig::default())
    }

    async fn await_group_count(manager: &DeviceManager, expected: usize) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if manager.list_groups(1).await.unwrap().ids.len() == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("group count never reached expected value");
    }

    #[tokio::test]
    async fn test_register_device_actor() {
        let manager = spawn_manager();

        let device1 = manager.track_device("group", "device1").await.unwrap();
        let device2 = manager.track_device("group", "device2").await.unwrap();
        assert_ne!(device1, device2);

        // Check that the device actors are working
        assert_eq!(device1.record_temperature(0, 1.0).await.unwrap().request_id, 0);
        assert_eq!(device2.record_temperature(1, 2.0).await.unwrap().request_id, 1);
    }

    #[tokio::test]
    async fn test_return_same_actor_for_same_group_id() {
        let manager = spawn_manager();
        manager.track_device("group", "device1").await.unwrap();
        manager.track_device("group", "device2").await.unwrap();

        let reply = manager.list_groups(0).await.unwrap();
        assert_eq!(reply.ids.len(), 1);
    }

    #[tokio::test]
    async fn test_track_is_idempotent() {
        let manager = spawn_manager();

        let first = manager.track_device("group", "device1").await.unwrap();
        let second = manager.track_device("group", "device1").await.unwrap();
        assert_eq!(first, second);

        let devices = manager.list_devices(0, "group").await.unwrap();
        assert_eq!(devices.ids.len(), 1);
    }

    #[tokio::test]
    async fn test_list_active_groups() {
        let manager = spawn_manager();
        manager.track_device("group1", "device1").await.unwrap();
        manager.track_device("group2", "device2").await.unwrap();

        let reply = manager.list_groups(0).await.unwrap();
        assert_eq!(reply.request_id, 0);
        assert_eq!(
            reply.ids,
            ["group1", "group2"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
        );
        assert_eq!(reply.handles.len(), 2);
    }

    #[tokio::test]
    async fn test_list_active_groups_after_one_shutdown() {
        let manager = spawn_manager();
        manager.track_device("group", "device1").await.unwrap();
        manager.track_device("group1", "device1").await.unwrap();

        let reply = manager.list_groups(0).await.unwrap();
        let to_shut_down = reply.handles.iter().next().unwrap().clone();
        to_shut_down.stop().await.unwrap();
        to_shut_down.terminated().await;

        await_group_count(&manager, 1).await;
    }

    #[tokio::test]
    async fn test_recreates_stopped_group() {
        let manager = spawn_manager();
        let device = manager.track_device("group", "device1").await.unwrap();
        let group = manager.group("group").await.unwrap().unwrap();

        group.stop().await.unwrap();
        group.terminated().await;
        device.terminated().await;

        let replacement = manager.track_device("group", "device1").await.unwrap();
        assert_ne!(device, replacement);
        let new_group = manager.group("group").await.unwrap().unwrap();
        assert_ne!(group, new_group);
    }

    #[tokio::test]
    async fn test_list_devices_of_unknown_group() {
        let manager = spawn_manager();

        let reply = manager.list_devices(4, "missing").await.unwrap();
        assert_eq!(reply.request_id, 4);
        assert!(reply.ids.is_empty());
    }

    #[tokio::test]
    async fn test_query_unknown_group() {
        let manager = spawn_manager();

        let err = manager
            .query_group(0, "missing", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, IotError::UnknownGroup("missing".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_groups_and_devices() {
        let manager = spawn_manager();
        let device = manager.track_device("group", "device1").await.unwrap();

        manager.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), manager.terminated())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), device.terminated())
            .await
            .unwrap();
        assert_eq!(
            manager.track_device("group", "device1").await.unwrap_err(),
            IotError::ChannelClosed
        );
    }
}
