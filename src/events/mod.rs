//! Outbound event stream: one subscriber at a time, FIFO, never blocking the
//! publisher.

pub mod event;
pub mod sink;

pub use event::BridgeEvent;
pub use sink::{EventSink, EventStream};
