//! DeviceHandle and the device actor loop

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{DeviceCommand, RespondTemperature, TemperatureRecorded};
use crate::domain::{DeviceId, GroupId, RequestId};
use crate::error::{IotError, IotResult};
use crate::lifecycle::{ActorId, ReplyTo, impl_watchable, post};

/// Handle to send commands to a device actor
///
/// Cloneable; clones address the same actor. Handles compare equal when they
/// address the same actor instance.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: ActorId,
    tx: mpsc::Sender<DeviceCommand>,
}

impl_watchable!(DeviceHandle);

impl DeviceHandle {
    /// Spawn a new device actor for `group_id`/`device_id`
    pub fn spawn(group_id: &str, device_id: &str, buffer: usize) -> Self {
        debug!(%group_id, %device_id, buffer, "DeviceHandle::spawn: called");
        let (handle, rx) = Self::detached(buffer);
        let device = Device {
            id: handle.id,
            self_tx: handle.tx.downgrade(),
            group_id: group_id.to_string(),
            device_id: device_id.to_string(),
            last_temperature: None,
        };
        tokio::spawn(actor_loop(device, rx));
        handle
    }

    /// Create a handle whose mailbox is drained by the caller
    ///
    /// Used to plug in device implementations other than the built-in actor.
    /// Dropping the receiver terminates the device as seen by watchers.
    pub fn detached(buffer: usize) -> (Self, mpsc::Receiver<DeviceCommand>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { id: ActorId::new(), tx }, rx)
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Ask for the current temperature and wait for the answer
    pub async fn read_temperature(&self, request_id: RequestId) -> IotResult<RespondTemperature> {
        debug!(actor_id = %self.id, request_id, "read_temperature: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_temperature(request_id, ReplyTo::Caller(reply_tx)).await?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Ask for the current temperature, delivering the answer to `reply_to`
    pub async fn request_temperature(
        &self,
        request_id: RequestId,
        reply_to: ReplyTo<RespondTemperature>,
    ) -> IotResult<()> {
        self.tx
            .send(DeviceCommand::ReadTemperature { request_id, reply_to })
            .await
            .map_err(|_| IotError::ChannelClosed)
    }

    /// Record a new temperature and wait for the acknowledgement
    pub async fn record_temperature(&self, request_id: RequestId, value: f64) -> IotResult<TemperatureRecorded> {
        debug!(actor_id = %self.id, request_id, value, "record_temperature: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::RecordTemperature {
                request_id,
                value,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IotError::ChannelClosed)?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)
    }

    /// Ask the device to confirm it handles `group_id`/`device_id`
    pub async fn track(&self, group_id: &str, device_id: &str) -> IotResult<DeviceHandle> {
        debug!(actor_id = %self.id, %group_id, %device_id, "track: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::TrackDevice {
                group_id: group_id.to_string(),
                device_id: device_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| IotError::ChannelClosed)?;
        reply_rx.await.map_err(|_| IotError::ChannelClosed)?
    }

    /// Deliver a raw command without waiting, handing it back if the mailbox is closed
    pub(crate) fn forward(&self, cmd: DeviceCommand) -> Result<(), DeviceCommand> {
        post(&self.tx, cmd)
    }

    /// Deliver a raw command, waiting for mailbox room
    pub(crate) async fn forward_when_ready(&self, cmd: DeviceCommand) -> Result<(), DeviceCommand> {
        self.tx.send(cmd).await.map_err(|e| e.0)
    }

    /// Enqueue a raw command only if the mailbox has room right now
    pub(crate) fn try_forward(&self, cmd: DeviceCommand) -> Result<(), TrySendError<DeviceCommand>> {
        self.tx.try_send(cmd)
    }

    /// Stop the device actor
    pub async fn stop(&self) -> IotResult<()> {
        debug!(actor_id = %self.id, "stop: called");
        self.tx
            .send(DeviceCommand::Stop)
            .await
            .map_err(|_| IotError::ChannelClosed)
    }
}

/// State owned by one device actor
struct Device {
    id: ActorId,
    self_tx: mpsc::WeakSender<DeviceCommand>,
    group_id: GroupId,
    device_id: DeviceId,
    last_temperature: Option<f64>,
}

impl Device {
    fn handle(&self) -> IotResult<DeviceHandle> {
        let tx = self.self_tx.upgrade().ok_or(IotError::ChannelClosed)?;
        Ok(DeviceHandle { id: self.id, tx })
    }
}

/// The actor loop that owns the device state and processes commands
async fn actor_loop(mut device: Device, mut rx: mpsc::Receiver<DeviceCommand>) {
    info!(group_id = %device.group_id, device_id = %device.device_id, "Device actor {}-{} started", device.group_id, device.device_id);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            DeviceCommand::ReadTemperature { request_id, reply_to } => {
                debug!(device_id = %device.device_id, request_id, "actor_loop: ReadTemperature command");
                let response = RespondTemperature {
                    request_id,
                    from: device.id,
                    value: device.last_temperature,
                };
                if !reply_to.send(response) {
                    debug!(request_id, "actor_loop: reader went away before the answer");
                }
            }

            DeviceCommand::RecordTemperature {
                request_id,
                value,
                reply,
            } => {
                info!(device_id = %device.device_id, request_id, value, "Recorded temperature reading");
                device.last_temperature = Some(value);
                let _ = reply.send(TemperatureRecorded { request_id });
            }

            DeviceCommand::TrackDevice {
                group_id,
                device_id,
                reply,
            } => {
                let result = if group_id != device.group_id {
                    warn!(
                        "Ignoring TrackDevice request for {}. This actor is responsible for {}",
                        group_id, device.group_id
                    );
                    Err(IotError::WrongGroup {
                        requested: group_id,
                        actual: device.group_id.clone(),
                    })
                } else if device_id != device.device_id {
                    warn!(
                        "Ignoring TrackDevice request for {}. This actor is responsible for {}",
                        device_id, device.device_id
                    );
                    Err(IotError::WrongDevice {
                        requested: device_id,
                        actual: device.device_id.clone(),
                    })
                } else {
                    device.handle()
                };
                let _ = reply.send(result);
            }

            DeviceCommand::Stop => {
                debug!(device_id = %device.device_id, "actor_loop: Stop command");
                break;
            }
        }
    }

    info!(group_id = %device.group_id, device_id = %device.device_id, "Device actor {}-{} stopped", device.group_id, device.device_id);
}
