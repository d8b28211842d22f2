//! Device manager
//!
//! Top level of the registry: maps group ids to group actors, creates groups
//! on first registration and forgets them when they stop. Registration and
//! device listing are forwarded to the owning group, which answers the
//! caller directly.

mod actor;
mod messages;

pub use actor::DeviceManager;
pub use messages::{ManagerCommand, ReplyGroupList};
