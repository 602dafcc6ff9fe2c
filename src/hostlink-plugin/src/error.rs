//! Error taxonomy for connecting, messaging and discovery.

use crate::catalog::CatalogError;
use crate::descriptor::PluginId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a connection is (or became) unusable. Recorded while SUSPENDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionError {
    /// The platform or the plugin refused the connection.
    NotPermitted,
    /// The plugin did not answer the handshake in time.
    NotResponded,
    /// The remote endpoint went away while connected.
    Terminated,
    /// The wait for the handshake was torn down before it resolved.
    Canceled,
    /// Anything else: missing entry point, construction failure, protocol breakage.
    InternalError,
}

impl ConnectionError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionError::NotPermitted => "not_permitted",
            ConnectionError::NotResponded => "not_responded",
            ConnectionError::Terminated => "terminated",
            ConnectionError::Canceled => "canceled",
            ConnectionError::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised by `Transport::connect`. The connection is already SUSPENDED when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to connect to plugin {plugin_id}: {error}")]
pub struct ConnectingError {
    pub plugin_id: PluginId,
    pub error: ConnectionError,
}

/// Coarse classification of [`MessagingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagingReason {
    NotEnabled,
    NotConnected,
    ConnectionSuspended,
    Other,
}

/// Raised by `send`. Never changes connection state by itself.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessagingError {
    #[error("plugin {plugin_id} is not enabled")]
    NotEnabled { plugin_id: PluginId },
    #[error("plugin {plugin_id} is not connected")]
    NotConnected { plugin_id: PluginId },
    #[error("connection to plugin {plugin_id} is suspended ({})", display_error(.error))]
    ConnectionSuspended {
        plugin_id: PluginId,
        error: Option<ConnectionError>,
    },
    #[error("failed to deliver message to plugin {plugin_id}: {message}")]
    Other { plugin_id: PluginId, message: String },
}

fn display_error(error: &Option<ConnectionError>) -> &'static str {
    error.map(|e| e.as_str()).unwrap_or("unknown")
}

impl MessagingError {
    pub fn reason(&self) -> MessagingReason {
        match self {
            MessagingError::NotEnabled { .. } => MessagingReason::NotEnabled,
            MessagingError::NotConnected { .. } => MessagingReason::NotConnected,
            MessagingError::ConnectionSuspended { .. } => MessagingReason::ConnectionSuspended,
            MessagingError::Other { .. } => MessagingReason::Other,
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        match self {
            MessagingError::NotEnabled { plugin_id }
            | MessagingError::NotConnected { plugin_id }
            | MessagingError::ConnectionSuspended { plugin_id, .. }
            | MessagingError::Other { plugin_id, .. } => plugin_id,
        }
    }
}

/// Coarse classification of [`PluginDetectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionReason {
    TooManyPackages,
    Other,
}

/// Raised by discovery when the catalog cannot be enumerated.
#[derive(Debug, Error)]
pub enum PluginDetectionError {
    #[error("too many installed packages to enumerate plugins: {0}")]
    TooManyPackages(#[source] CatalogError),
    #[error("failed to enumerate installed plugins: {0}")]
    Other(#[source] CatalogError),
}

impl PluginDetectionError {
    pub fn reason(&self) -> DetectionReason {
        match self {
            PluginDetectionError::TooManyPackages(_) => DetectionReason::TooManyPackages,
            PluginDetectionError::Other(_) => DetectionReason::Other,
        }
    }
}

impl From<CatalogError> for PluginDetectionError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::TooManyEntries { .. } => PluginDetectionError::TooManyPackages(err),
            other => PluginDetectionError::Other(other),
        }
    }
}
