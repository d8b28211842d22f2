//! Device group actor
//!
//! Owns the device-id → device mapping of one group, creates devices on first
//! registration, forgets them when they stop, and serves group queries from
//! a snapshot of its current devices.

mod actor;
mod messages;

pub use actor::GroupHandle;
pub use messages::{GroupCommand, ReplyDeviceList};
