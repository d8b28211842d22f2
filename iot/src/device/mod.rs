//! Device actor
//!
//! A device holds a single optional temperature and answers read, record and
//! registration requests one at a time.

mod actor;
mod messages;

pub use actor::DeviceHandle;
pub use messages::{DeviceCommand, RespondTemperature, TemperatureRecorded};
