//! Plugin code that runs inside the host process.
//!
//! Entry points are registered explicitly, keyed by the descriptor's `entry_point`, and
//! resolved when the transport is built. Nothing is looked up by type name at runtime.

use crate::descriptor::PluginDescriptor;
use crate::envelope::Envelope;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EndpointError {
    pub message: String,
}

impl EndpointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// In-process plugin code.
pub trait PluginEndpoint: Send + Sync {
    /// Handles one envelope. `Ok(None)` means accepted without a reply.
    fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, EndpointError>;

    /// Called when a direct transport drops its instance.
    fn release(&self) {}
}

impl<F> PluginEndpoint for F
where
    F: Fn(&Envelope) -> Result<Option<Envelope>, EndpointError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, EndpointError> {
        self(envelope)
    }
}

/// Builds a fresh endpoint instance for a direct transport.
pub type EndpointConstructor =
    Arc<dyn Fn(&PluginDescriptor) -> Result<Arc<dyn PluginEndpoint>, EndpointError> + Send + Sync>;

/// Registered in-process entry points.
///
/// `instance` entries back in-process transports and are shared for the process
/// lifetime; `constructor` entries back direct transports and produce one instance per
/// connection.
#[derive(Default)]
pub struct EntryPointRegistry {
    instances: RwLock<HashMap<String, Arc<dyn PluginEndpoint>>>,
    constructors: RwLock<HashMap<String, EndpointConstructor>>,
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_instance(&self, entry_point: impl Into<String>, endpoint: Arc<dyn PluginEndpoint>) {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_point.into(), endpoint);
    }

    pub fn register_constructor<F>(&self, entry_point: impl Into<String>, constructor: F)
    where
        F: Fn(&PluginDescriptor) -> Result<Arc<dyn PluginEndpoint>, EndpointError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_point.into(), Arc::new(constructor));
    }

    pub fn instance(&self, entry_point: &str) -> Option<Arc<dyn PluginEndpoint>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .cloned()
    }

    pub fn constructor(&self, entry_point: &str) -> Option<EndpointConstructor> {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .cloned()
    }
}

impl fmt::Debug for EntryPointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instances: Vec<String> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let constructors: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("EntryPointRegistry")
            .field("instances", &instances)
            .field("constructors", &constructors)
            .finish()
    }
}
