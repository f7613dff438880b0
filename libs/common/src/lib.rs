pub mod id;
pub mod ipc;

pub use id::PrefixedId;
