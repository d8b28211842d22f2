//! Scatter/gather temperature query over a snapshot of devices
//!
//! A [`GroupQuery`] broadcasts one read to every device in a snapshot and
//! produces exactly one [`RespondAllTemperatures`], once every device has
//! answered or stopped, or when the deadline fires.

mod core;
mod messages;

pub use core::GroupQuery;
pub use messages::{QuerySnapshot, RespondAllTemperatures};
