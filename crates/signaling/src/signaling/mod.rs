//! Signaling protocol and request dispatch

pub mod dispatcher;
pub mod protocol;

pub use dispatcher::Dispatcher;
pub use protocol::{ResponseMessage, SignalingMessage};
