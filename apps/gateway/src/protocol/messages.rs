//! Control-channel payloads exchanged during the session handshake.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection kinds a client can request via `connectionType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Management,
    ExtensionHost,
    Tunnel,
}

impl ConnectionType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Management),
            2 => Some(Self::ExtensionHost),
            3 => Some(Self::Tunnel),
            _ => None,
        }
    }
}

/// Control messages the client sends during the handshake.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientControl {
    #[serde(rename = "auth")]
    Auth {
        #[serde(default)]
        auth: Option<String>,
    },
    #[serde(rename = "connectionType")]
    ConnectionType {
        #[serde(rename = "desiredConnectionType")]
        desired_connection_type: u8,
        #[serde(default)]
        commit: Option<String>,
        #[serde(default)]
        args: Option<Value>,
    },
}

/// Control replies the broker writes.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerControl {
    #[serde(rename = "sign")]
    Sign { data: String },
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "error")]
    Error { reason: String },
}

impl ServerControl {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serialization of these closed shapes cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Start parameters for an extension-host session, merged from the
/// `connectionType` args over defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtHostStartParams {
    #[serde(default = "default_language")]
    pub language: String,
    /// Requested inspector port; `0` asks the gateway to allocate one.
    #[serde(default, rename = "port")]
    pub debug_port: Option<u16>,
    /// Pause the worker on entry for the debugger.
    #[serde(default, rename = "break")]
    pub break_on_entry: bool,
}

impl Default for ExtHostStartParams {
    fn default() -> Self {
        Self {
            language: default_language(),
            debug_port: None,
            break_on_entry: false,
        }
    }
}

impl ExtHostStartParams {
    pub fn from_args(args: Option<&Value>) -> Self {
        args.and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

fn default_language() -> String {
    "en".to_string()
}
