//! Extension-host worker supervision: fork, IPC, and socket hand-off.

pub mod fd;
pub mod ports;
pub mod supervisor;

pub use supervisor::{PendingHandoff, Supervisor, SupervisorEvent, SupervisorState};
