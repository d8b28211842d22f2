//! IoT daemon - device registry with fan-out/fan-in group queries
//!
//! Devices remember their latest temperature reading. Devices are registered
//! lazily in named groups, and a group can be asked for the temperature of
//! every device it currently holds. Each such request runs as a short-lived
//! query task that broadcasts to a snapshot of the group, folds answers and
//! device terminations into a per-device status, and replies exactly once,
//! either when every device has resolved or when the deadline fires.
//!
//! # Modules
//!
//! - [`device`] - Device actor holding the latest reading
//! - [`group`] - Device group actor owning the device map of one group
//! - [`manager`] - Device manager actor owning the group map
//! - [`query`] - Group query aggregation
//! - [`lifecycle`] - Actor identity, death watch and reply addressing
//! - [`system`] - Top-level supervisor
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod group;
pub mod lifecycle;
pub mod manager;
pub mod query;
pub mod system;

pub use config::Config;
pub use device::DeviceHandle;
pub use domain::{DeviceId, GroupId, RequestId, TemperatureReading};
pub use error::{IotError, IotResult};
pub use group::GroupHandle;
pub use lifecycle::{ActorId, Watchable};
pub use manager::DeviceManager;
pub use query::{GroupQuery, QuerySnapshot, RespondAllTemperatures};
pub use system::IotSystem;
