//! URI rewriting between client-side and server-side resource spaces.
//!
//! The workbench client addresses remote resources as
//! `vscode-remote://<authority>/path`; on the server side the same resource is
//! a plain `file://` path. Each management session gets a transformer bound to
//! the authority the client connected through.

use serde::{Deserialize, Serialize};

/// The wire shape of a URI as the workbench client serializes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriComponents {
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authority: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fragment: String,
}

impl UriComponents {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            scheme: "file".to_string(),
            authority: String::new(),
            path: path.into(),
            query: String::new(),
            fragment: String::new(),
        }
    }

    pub fn remote(authority: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: "vscode-remote".to_string(),
            authority: authority.into(),
            path: path.into(),
            query: String::new(),
            fragment: String::new(),
        }
    }
}

/// Per-session URI transformer carrying the client-observed authority.
#[derive(Debug, Clone)]
pub struct UriTransformer {
    authority: String,
}

impl UriTransformer {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Rewrite a URI arriving from the client into the server's space.
    ///
    /// `vscode-remote` becomes `file`; a client-side `file` URI refers to the
    /// client machine and becomes `vscode-local`. Everything else passes
    /// through untouched.
    pub fn transform_incoming(&self, uri: &UriComponents) -> UriComponents {
        let mut out = uri.clone();
        match uri.scheme.as_str() {
            "file" => {
                out.scheme = "vscode-local".to_string();
            }
            "vscode-remote" => {
                out.scheme = "file".to_string();
                out.authority = String::new();
            }
            _ => {}
        }
        out
    }

    /// Rewrite a URI leaving the server into the client's space.
    pub fn transform_outgoing(&self, uri: &UriComponents) -> UriComponents {
        let mut out = uri.clone();
        match uri.scheme.as_str() {
            "file" => {
                out.scheme = "vscode-remote".to_string();
                out.authority = self.authority.clone();
            }
            "vscode-local" => {
                out.scheme = "file".to_string();
                out.authority = String::new();
            }
            _ => {}
        }
        out
    }

}
