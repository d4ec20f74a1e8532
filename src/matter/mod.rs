//! Device-event side of the bridge: the matter-server websocket
//!
//! - [`protocol`] - request framing and inbound frame decoding
//! - [`connection`] - connection lifecycle, reconnects and dispatch

pub mod connection;
pub mod protocol;

pub use connection::{
    ConnectionError, ConnectionManager, ConnectionSettings, ConnectionState, FrameHandler,
    RequestSink,
};
pub use protocol::{
    AttributePath, AttributeUpdate, DeviceCommand, InboundFrame, MessageId, NodeSnapshot, Request,
    RequestKind,
};
