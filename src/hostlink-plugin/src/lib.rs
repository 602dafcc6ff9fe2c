//! Plugin connection supervisor for Hostlink.
//!
//! This crate provides:
//! - A registry that discovers plugins through a [`PluginCatalog`], builds one
//!   [`Transport`] per plugin and applies the enabled/disabled policy
//! - A per-plugin connection state machine with ordered, asynchronous listener delivery
//! - Four transports: in-process calls, separate processes over JSON lines on stdio,
//!   fire-and-forget broadcast and constructor-backed direct instances
//! - Bounded reconnection on send and round-trip statistics per plugin
//!
//! # Usage
//!
//! ```rust,ignore
//! use hostlink_plugin::{
//!     DefaultTransportFactory, DirectoryCatalog, EntryPointRegistry, Envelope,
//!     MemorySettingsStore, PluginRegistry,
//! };
//! use std::sync::Arc;
//!
//! let config = hostlink_core::SupervisorConfig::default();
//! let factory = DefaultTransportFactory::from_config(Arc::new(EntryPointRegistry::new()), &config);
//! let registry = PluginRegistry::new(
//!     Arc::new(DirectoryCatalog::new("/var/lib/hostlink/plugins", 512)),
//!     Arc::new(factory),
//!     Arc::new(MemorySettingsStore::new()),
//!     &config,
//! );
//! registry.discover()?;
//! for plugin in registry.plugins() {
//!     let reply = registry.send(plugin.id(), &Envelope::new("ping"))?;
//!     println!("{}: {:?}", plugin.name(), reply);
//! }
//! ```

pub mod catalog;
pub mod connection;
pub mod descriptor;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod history;
pub mod notify;
pub mod plugin;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod transport;

pub use catalog::{CatalogError, CatalogEvent, DirectoryCatalog, PluginCatalog, StaticCatalog};
pub use connection::{
    Connection, ConnectionContext, ConnectionState, ConnectionStateListener, ListenerId,
};
pub use descriptor::{LaunchSpec, PluginDescriptor, PluginId, TransportKind};
pub use endpoint::{EndpointConstructor, EndpointError, EntryPointRegistry, PluginEndpoint};
pub use envelope::{actions, Envelope, FieldValue};
pub use error::{
    ConnectingError, ConnectionError, DetectionReason, MessagingError, MessagingReason,
    PluginDetectionError,
};
pub use history::{CommunicationHistory, HistoryEntry};
pub use notify::StateEvent;
pub use plugin::{Plugin, PluginOptions, RetryPolicy};
pub use registry::{CatalogMonitor, PluginEventListener, PluginRegistry, SubscriberId};
pub use settings::{FileSettingsStore, MemorySettingsStore, SettingsError, SettingsStore};
pub use transport::{DefaultTransportFactory, Reply, Transport, TransportFactory};
