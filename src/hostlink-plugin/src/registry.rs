//! The plugin supervisor: discovery, registration, policy and event fan-out.

use crate::catalog::{CatalogError, CatalogEvent, PluginCatalog};
use crate::connection::{ConnectionContext, ConnectionState, ConnectionStateListener, ListenerId};
use crate::descriptor::{PluginDescriptor, PluginId, TransportKind};
use crate::envelope::Envelope;
use crate::error::{MessagingError, PluginDetectionError};
use crate::notify::StateEvent;
use crate::plugin::{Plugin, PluginOptions};
use crate::settings::{SettingsError, SettingsStore};
use crate::transport::{Reply, TransportFactory};
use dashmap::DashMap;
use hostlink_core::SupervisorConfig;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};

/// Receives registry events. Every method defaults to doing nothing.
///
/// Calls arrive on notification worker threads. Events for one plugin arrive in order:
/// found, then its state changes, then lost.
pub trait PluginEventListener: Send + Sync {
    fn on_device_found(&self, _plugin: &Arc<Plugin>) {}

    fn on_device_lost(&self, _plugin: &Arc<Plugin>) {}

    fn on_connection_state_changed(&self, _plugin: &Arc<Plugin>, _state: ConnectionState) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Registered {
    plugin: Arc<Plugin>,
    forwarder: ListenerId,
}

type Subscribers = Vec<(SubscriberId, Arc<dyn PluginEventListener>)>;

struct Inner {
    plugins: DashMap<PluginId, Registered>,
    subscribers: RwLock<Subscribers>,
    next_subscriber: AtomicU64,
    context: ConnectionContext,
    catalog: Arc<dyn PluginCatalog>,
    factory: Arc<dyn TransportFactory>,
    settings: Arc<dyn SettingsStore>,
    options: PluginOptions,
    service_domain: String,
    /// Serializes changes to the plugin map; lookups never take it.
    registration: Mutex<()>,
}

impl Inner {
    fn subscribers(&self) -> Vec<Arc<dyn PluginEventListener>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn plugin(&self, id: &PluginId) -> Option<Arc<Plugin>> {
        self.plugins.get(id).map(|entry| Arc::clone(&entry.plugin))
    }
}

/// Relays one plugin's connection changes to the registry subscribers.
///
/// Holds the plugin it was created for, so changes queued before a removal or a
/// replacement still reach subscribers against the right instance.
struct StateForwarder {
    registry: Weak<Inner>,
    plugin: Weak<Plugin>,
}

impl ConnectionStateListener for StateForwarder {
    fn on_connection_state_changed(&self, _plugin_id: &PluginId, state: ConnectionState) {
        let (Some(inner), Some(plugin)) = (self.registry.upgrade(), self.plugin.upgrade()) else {
            return;
        };
        for subscriber in inner.subscribers() {
            subscriber.on_connection_state_changed(&plugin, state);
        }
    }
}

/// Owns every registered [`Plugin`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<Inner>,
}

impl PluginRegistry {
    pub fn new(
        catalog: Arc<dyn PluginCatalog>,
        factory: Arc<dyn TransportFactory>,
        settings: Arc<dyn SettingsStore>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                plugins: DashMap::new(),
                subscribers: RwLock::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                context: ConnectionContext::with_queue_capacity(
                    config.notification_workers,
                    config.notification_queue_capacity,
                ),
                catalog,
                factory,
                settings,
                options: PluginOptions::from_config(config),
                service_domain: config.service_domain.clone(),
                registration: Mutex::new(()),
            }),
        }
    }

    /// Synchronizes the registry with the catalog and applies every plugin.
    ///
    /// Returns the number of registered plugins. Plugins the catalog no longer lists are
    /// removed. Connecting happens after registration, so this blocks for as long as
    /// the slowest handshakes take.
    pub fn discover(&self) -> Result<usize, PluginDetectionError> {
        let descriptors = self.inner.catalog.list_installed().map_err(|err| {
            tracing::error!(error = %err, "plugin discovery failed");
            PluginDetectionError::from(err)
        })?;
        let selected = dedupe(descriptors);

        let plugins = {
            let _registration = self.lock_registration();
            let keep: HashSet<PluginId> = selected.iter().map(|d| d.id.clone()).collect();
            let stale: Vec<PluginId> = self
                .inner
                .plugins
                .iter()
                .filter(|entry| !keep.contains(entry.key()))
                .map(|entry| entry.key().clone())
                .collect();
            for id in stale {
                self.remove_locked(&id);
            }
            selected
                .into_iter()
                .map(|descriptor| self.register_locked(descriptor))
                .collect::<Vec<_>>()
        };

        for plugin in &plugins {
            apply_logged(plugin);
        }
        tracing::info!(count = plugins.len(), "plugin discovery finished");
        Ok(plugins.len())
    }

    /// Registers (or replaces) one plugin and applies it.
    ///
    /// An identical descriptor keeps the existing plugin; a different one for the same id
    /// replaces it, which reports the old plugin lost.
    pub fn register(&self, descriptor: PluginDescriptor) -> Arc<Plugin> {
        let plugin = {
            let _registration = self.lock_registration();
            self.register_locked(descriptor)
        };
        apply_logged(&plugin);
        plugin
    }

    pub fn apply(&self, id: &PluginId) -> bool {
        match self.get(id) {
            Some(plugin) => {
                apply_logged(&plugin);
                true
            }
            None => false,
        }
    }

    /// Tears the plugin down and evicts it.
    pub fn remove(&self, id: &PluginId) -> Option<Arc<Plugin>> {
        let _registration = self.lock_registration();
        self.remove_locked(id)
    }

    /// Applies one package-level change reported by the catalog.
    pub fn on_catalog_changed(&self, event: &CatalogEvent) -> Result<(), PluginDetectionError> {
        tracing::debug!(event = ?event, "catalog changed");
        let package = match event {
            CatalogEvent::Removed(package) => {
                self.remove_package(package);
                return Ok(());
            }
            CatalogEvent::Added(package) | CatalogEvent::Changed(package) => package,
        };

        let descriptors = match self.inner.catalog.list_package(package) {
            Ok(descriptors) => descriptors,
            Err(CatalogError::PackageNotFound(_)) => {
                self.remove_package(package);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let selected = dedupe(descriptors);

        let plugins = {
            let _registration = self.lock_registration();
            let keep: HashSet<PluginId> = selected.iter().map(|d| d.id.clone()).collect();
            for id in self.package_ids(package) {
                if !keep.contains(&id) {
                    self.remove_locked(&id);
                }
            }
            selected
                .into_iter()
                .map(|descriptor| self.register_locked(descriptor))
                .collect::<Vec<_>>()
        };
        for plugin in &plugins {
            apply_logged(plugin);
        }
        Ok(())
    }

    /// Routes `envelope` to the plugin. Unknown ids fail with NOT_CONNECTED.
    pub fn send(&self, id: &PluginId, envelope: &Envelope) -> Result<Reply, MessagingError> {
        let plugin = self.get(id).ok_or_else(|| MessagingError::NotConnected {
            plugin_id: id.clone(),
        })?;
        plugin.send(envelope)
    }

    pub fn get(&self, id: &PluginId) -> Option<Arc<Plugin>> {
        self.inner.plugin(id)
    }

    /// Every registered plugin, sorted by name.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        let mut plugins: Vec<_> = self
            .inner
            .plugins
            .iter()
            .map(|entry| Arc::clone(&entry.plugin))
            .collect();
        plugins.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        plugins
    }

    pub fn enabled_plugins(&self) -> Vec<Arc<Plugin>> {
        self.plugins()
            .into_iter()
            .filter(|plugin| plugin.is_enabled())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.plugins.is_empty()
    }

    /// Returns `Ok(false)` if no such plugin is registered.
    pub fn set_enabled(&self, id: &PluginId, enabled: bool) -> Result<bool, SettingsError> {
        let Some(plugin) = self.get(id) else {
            return Ok(false);
        };
        if enabled {
            plugin.enable()?;
        } else {
            plugin.disable()?;
        }
        Ok(true)
    }

    pub fn subscribe(&self, listener: Arc<dyn PluginEventListener>) -> SubscriberId {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Process-wide stream of every connection state change.
    pub fn state_events(&self) -> Receiver<StateEvent> {
        self.inner.context.hub().subscribe()
    }

    /// Sends `manager.launched` to every enabled plugin. Returns how many received it.
    pub fn notify_launched(&self) -> usize {
        let plugins = self.enabled_plugins();
        let delivered = plugins.iter().filter(|plugin| plugin.send_launched()).count();
        if delivered < plugins.len() {
            tracing::info!(
                delivered,
                skipped = plugins.len() - delivered,
                "manager launch notification incomplete"
            );
        }
        delivered
    }

    pub fn disconnect_all(&self) {
        for plugin in self.plugins() {
            plugin.disconnect();
        }
    }

    /// Sends `manager.terminated` to every plugin, then removes them all.
    pub fn shutdown(&self) {
        let plugins = self.plugins();
        for plugin in &plugins {
            plugin.send_terminated();
        }
        let _registration = self.lock_registration();
        for plugin in &plugins {
            self.remove_locked(plugin.id());
        }
        tracing::info!(count = plugins.len(), "plugin registry shut down");
    }

    /// `<service>.<plugin id>.<domain>`, or `<plugin id>.<domain>` without a service.
    pub fn append_service_id(&self, plugin_id: &PluginId, service: Option<&str>) -> String {
        match service {
            Some(service) => format!("{service}.{plugin_id}.{}", self.inner.service_domain),
            None => format!("{plugin_id}.{}", self.inner.service_domain),
        }
    }

    /// Strips the plugin part from a full service id. `None` if it belongs to another
    /// plugin; an empty string for the plugin's own id.
    pub fn split_service_id(&self, plugin_id: &PluginId, full: &str) -> Option<String> {
        let suffix = format!("{plugin_id}.{}", self.inner.service_domain);
        if full == suffix {
            return Some(String::new());
        }
        full.strip_suffix(suffix.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .filter(|service| !service.is_empty())
            .map(str::to_string)
    }

    pub fn find_by_service_id(&self, full: &str) -> Option<Arc<Plugin>> {
        self.plugins()
            .into_iter()
            .find(|plugin| self.split_service_id(plugin.id(), full).is_some())
    }

    /// Applies catalog events on a background thread until the sender is dropped.
    pub fn start_monitoring(&self, events: Receiver<CatalogEvent>) -> io::Result<CatalogMonitor> {
        let registry = self.clone();
        let handle = thread::Builder::new()
            .name("hostlink-catalog".to_string())
            .spawn(move || {
                for event in events {
                    if let Err(err) = registry.on_catalog_changed(&event) {
                        tracing::warn!(event = ?event, error = %err, "failed to apply catalog change");
                    }
                }
                tracing::debug!("catalog monitor stopped");
            })?;
        Ok(CatalogMonitor { handle })
    }

    fn lock_registration(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn package_ids(&self, package: &str) -> Vec<PluginId> {
        self.inner
            .plugins
            .iter()
            .filter(|entry| entry.plugin.descriptor().package == package)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn remove_package(&self, package: &str) {
        let _registration = self.lock_registration();
        for id in self.package_ids(package) {
            self.remove_locked(&id);
        }
    }

    fn register_locked(&self, descriptor: PluginDescriptor) -> Arc<Plugin> {
        if let Some(existing) = self.get(&descriptor.id) {
            if existing.descriptor() == &descriptor {
                return existing;
            }
            tracing::info!(plugin_id = %descriptor.id, "plugin descriptor changed; replacing");
            self.remove_locked(&descriptor.id);
        }

        let transport = self.inner.factory.create(&descriptor, &self.inner.context);
        let plugin = Arc::new(Plugin::new(
            descriptor,
            transport,
            Arc::clone(&self.inner.settings),
            self.inner.options.clone(),
        ));
        let forwarder = plugin.subscribe(Arc::new(StateForwarder {
            registry: Arc::downgrade(&self.inner),
            plugin: Arc::downgrade(&plugin),
        }));
        self.inner.plugins.insert(
            plugin.id().clone(),
            Registered {
                plugin: Arc::clone(&plugin),
                forwarder,
            },
        );
        tracing::info!(
            plugin_id = %plugin.id(),
            name = %plugin.name(),
            transport = %plugin.transport_kind(),
            "plugin registered"
        );
        self.notify(&plugin, |listener, plugin| listener.on_device_found(plugin));
        plugin
    }

    fn remove_locked(&self, id: &PluginId) -> Option<Arc<Plugin>> {
        let (_, Registered { plugin, forwarder }) = self.inner.plugins.remove(id)?;
        plugin.unsubscribe(forwarder);
        plugin.dispose();
        tracing::info!(plugin_id = %id, name = %plugin.name(), "plugin removed");
        self.notify(&plugin, |listener, plugin| listener.on_device_lost(plugin));
        Some(plugin)
    }

    /// Queued behind the plugin's state notifications so per-plugin order holds.
    fn notify<F>(&self, plugin: &Arc<Plugin>, event: F)
    where
        F: Fn(&dyn PluginEventListener, &Arc<Plugin>) + Send + 'static,
    {
        let subscribers = self.inner.subscribers();
        if subscribers.is_empty() {
            return;
        }
        let key = Arc::clone(plugin);
        let plugin = Arc::clone(plugin);
        self.inner
            .context
            .notifications()
            .dispatch(key.id().as_str(), move || {
                for subscriber in &subscribers {
                    event(subscriber.as_ref(), &plugin);
                }
            });
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.inner.plugins.len())
            .field("context", &self.inner.context)
            .finish()
    }
}

/// Handle on the thread started by [`PluginRegistry::start_monitoring`].
#[derive(Debug)]
pub struct CatalogMonitor {
    handle: JoinHandle<()>,
}

impl CatalogMonitor {
    /// Waits for the event sender to be dropped and the queue to drain.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("catalog monitor panicked");
        }
    }
}

fn apply_logged(plugin: &Plugin) {
    if let Err(err) = plugin.apply() {
        tracing::warn!(
            plugin_id = %plugin.id(),
            name = %plugin.name(),
            error = %err.error,
            "plugin is unreachable"
        );
    }
}

/// Keeps one descriptor per (package, manifest id), preferring the IPC component.
fn dedupe(descriptors: Vec<PluginDescriptor>) -> Vec<PluginDescriptor> {
    let mut chosen: Vec<PluginDescriptor> = Vec::with_capacity(descriptors.len());
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    for descriptor in descriptors {
        let key = (descriptor.package.clone(), descriptor.manifest_id.clone());
        match index.get(&key) {
            Some(&slot) => {
                let current = &chosen[slot];
                if current.transport != TransportKind::Ipc
                    && descriptor.transport == TransportKind::Ipc
                {
                    tracing::debug!(
                        package = %descriptor.package,
                        dropped = %current.entry_point,
                        kept = %descriptor.entry_point,
                        "preferring ipc component"
                    );
                    chosen[slot] = descriptor;
                } else {
                    tracing::debug!(
                        package = %descriptor.package,
                        dropped = %descriptor.entry_point,
                        "dropping duplicate component"
                    );
                }
            }
            None => {
                index.insert(key, chosen.len());
                chosen.push(descriptor);
            }
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(entry_point: &str, transport: TransportKind, manifest: &str) -> PluginDescriptor {
        PluginDescriptor::builder("org.example", entry_point, transport)
            .manifest_id(manifest)
            .build()
    }

    #[test]
    fn dedupe_prefers_ipc_regardless_of_order() {
        for descriptors in [
            vec![
                component("Receiver", TransportKind::Broadcast, "m"),
                component("Service", TransportKind::Ipc, "m"),
            ],
            vec![
                component("Service", TransportKind::Ipc, "m"),
                component("Receiver", TransportKind::Broadcast, "m"),
            ],
        ] {
            let chosen = dedupe(descriptors);
            assert_eq!(chosen.len(), 1);
            assert_eq!(chosen[0].entry_point, "Service");
        }
    }

    #[test]
    fn dedupe_keeps_distinct_manifests() {
        let chosen = dedupe(vec![
            component("A", TransportKind::Broadcast, "a"),
            component("B", TransportKind::Broadcast, "b"),
        ]);
        assert_eq!(chosen.len(), 2);
    }
}
