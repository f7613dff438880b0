//! WebSocket frame layer: upgrade handshake, RFC 6455 codec, and the
//! permessage-deflate contexts whose state must survive socket hand-off.

pub mod deflate;
pub mod frame;
pub mod handshake;

pub use frame::{SocketError, SocketLink};
pub use handshake::accept_upgrade;
