//! The sequenced, replay-capable message layer carried over a socket link.

pub mod messages;
pub mod persistent;

pub use persistent::{PersistentProtocol, ProtocolError, ProtocolEvent};
