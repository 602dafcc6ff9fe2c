//! Wire protocol for plugins that run as separate processes.
//!
//! The host writes one [`HostFrame`] per line to the plugin's stdin and the plugin
//! answers with one [`PluginFrame`] per line on stdout. Frames are correlated by `id`.
//!
//! # Example exchange
//!
//! ```text
//! > {"id":1,"message":{"type":"Handshake","params":{"plugin_id":"9f..","protocol_version":1}}}
//! < {"id":1,"message":{"status":"Ready","protocol_version":1}}
//! > {"id":2,"message":{"type":"Deliver","params":{"action":"ping"}}}
//! < {"id":2,"message":{"status":"Reply","action":"ping.reply"}}
//! > {"id":3,"message":{"type":"Shutdown"}}
//! ```

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame sent from the host to a plugin process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFrame {
    /// Unique request ID for correlation.
    pub id: u64,
    pub message: HostMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum HostMessage {
    /// First frame after spawn. The plugin answers `Ready` or `Refused`.
    Handshake {
        plugin_id: String,
        protocol_version: u32,
    },
    /// An envelope for the plugin to handle.
    Deliver(Envelope),
    /// The host is disconnecting; the plugin should exit.
    Shutdown,
}

/// Frame sent from a plugin process back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginFrame {
    /// Request ID this frame answers.
    pub id: u64,
    pub message: PluginMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PluginMessage {
    /// Handshake accepted.
    Ready(HandshakeInfo),
    /// Handshake rejected; the plugin will not serve this host.
    Refused { reason: String },
    /// Response to a delivered envelope.
    Reply(Envelope),
    /// The plugin failed to handle a delivered envelope.
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Protocol version the plugin speaks.
    pub protocol_version: u32,
}

impl HostFrame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl PluginFrame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
