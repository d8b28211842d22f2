//! Errors returned by actor handles

use thiserror::Error;

/// Errors from device, group and manager operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IotError {
    #[error("Actor mailbox closed")]
    ChannelClosed,

    #[error("Group {requested} is not handled by group actor {actual}")]
    WrongGroup { requested: String, actual: String },

    #[error("Device {requested} is not handled by device actor {actual}")]
    WrongDevice { requested: String, actual: String },

    #[error("Unknown group: {0}")]
    UnknownGroup(String),
}

/// Response from actor operations
pub type IotResult<T> = Result<T, IotError>;
