//! Runtime record of one registered plugin.

use crate::connection::{ConnectionState, ConnectionStateListener, ListenerId};
use crate::descriptor::{PluginDescriptor, PluginId, TransportKind};
use crate::envelope::{actions, Envelope, FIELD_ORIGIN, FIELD_PLUGIN_ID};
use crate::error::{ConnectingError, ConnectionError, MessagingError};
use crate::history::CommunicationHistory;
use crate::settings::{SettingsError, SettingsStore};
use crate::transport::{Reply, Transport};
use hostlink_core::SupervisorConfig;
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime};

/// Bounded reconnection used by `apply` and by `send` on a suspended connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay, doubled after every failed attempt. Zero retries back to back.
    pub backoff: Duration,
    /// Upper bound of a random delay added to each pause.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_connect_attempts,
            backoff: config.retry_backoff(),
            jitter: config.retry_jitter(),
        }
    }

    /// Pause after failed attempt number `attempt` (1-based), if any.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.backoff.is_zero() && self.jitter.is_zero() {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.backoff.saturating_mul(1 << exponent);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        Some(base.saturating_add(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Per-plugin settings taken from the supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOptions {
    pub default_enabled: bool,
    pub history_capacity: usize,
    pub retry: RetryPolicy,
}

impl PluginOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            default_enabled: config.default_enabled,
            history_capacity: config.history_capacity,
            retry: RetryPolicy::from_config(config),
        }
    }
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            default_enabled: true,
            history_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

/// A discovered plugin: descriptor, enabled flag, statistics and its one transport.
///
/// `connect`, `disconnect` and `send` on one plugin are serialized by a per-plugin
/// lock; different plugins never contend.
pub struct Plugin {
    descriptor: PluginDescriptor,
    settings: Arc<dyn SettingsStore>,
    options: PluginOptions,
    history: CommunicationHistory,
    transport: Box<dyn Transport>,
    ops: Mutex<()>,
}

impl Plugin {
    pub fn new(
        descriptor: PluginDescriptor,
        transport: Box<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
        options: PluginOptions,
    ) -> Self {
        Self {
            history: CommunicationHistory::new(options.history_capacity),
            descriptor,
            settings,
            options,
            transport,
            ops: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &PluginId {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn history(&self) -> &CommunicationHistory {
        &self.history
    }

    pub fn is_enabled(&self) -> bool {
        self.settings
            .is_enabled(self.id())
            .unwrap_or(self.options.default_enabled)
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn current_error(&self) -> Option<ConnectionError> {
        self.transport.current_error()
    }

    /// Enabled and connected right now.
    pub fn can_communicate(&self) -> bool {
        self.is_enabled() && self.state() == ConnectionState::Connected
    }

    pub fn supports_profile(&self, profile: &str) -> bool {
        self.descriptor.supports_profile(profile)
    }

    pub fn has_provider_authority(&self, authority: &str) -> bool {
        self.descriptor.has_provider_authority(authority)
    }

    pub fn subscribe(&self, listener: Arc<dyn ConnectionStateListener>) -> ListenerId {
        self.transport.connection().subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.transport.connection().unsubscribe(id)
    }

    /// Connects an enabled, disconnected plugin; disconnects a disabled one.
    pub fn apply(&self) -> Result<(), ConnectingError> {
        let _ops = self.lock();
        self.apply_locked()
    }

    /// Connects with the bounded retry policy.
    pub fn try_connection(&self) -> Result<(), ConnectingError> {
        let _ops = self.lock();
        self.try_connection_locked()
    }

    pub fn send(&self, envelope: &Envelope) -> Result<Reply, MessagingError> {
        let _ops = self.lock();
        self.send_locked(envelope)
    }

    /// Persists the flag, connects, then tells the plugin it was enabled.
    pub fn enable(&self) -> Result<(), SettingsError> {
        let _ops = self.lock();
        self.settings.set_enabled(self.id(), true)?;
        if let Err(err) = self.apply_locked() {
            tracing::warn!(plugin_id = %self.id(), error = %err, "enabled plugin is unreachable");
        }
        self.send_lifecycle_locked(actions::PLUGIN_ENABLED, None);
        Ok(())
    }

    /// Tells the plugin it is being disabled, then persists the flag and disconnects.
    pub fn disable(&self) -> Result<(), SettingsError> {
        let _ops = self.lock();
        self.send_lifecycle_locked(actions::PLUGIN_DISABLED, None);
        self.settings.set_enabled(self.id(), false)?;
        if let Err(err) = self.apply_locked() {
            tracing::warn!(plugin_id = %self.id(), error = %err, "failed to apply disabled state");
        }
        Ok(())
    }

    pub fn send_launched(&self) -> bool {
        let _ops = self.lock();
        self.send_lifecycle_locked(actions::MANAGER_LAUNCHED, None)
    }

    pub fn send_terminated(&self) -> bool {
        let _ops = self.lock();
        self.send_lifecycle_locked(actions::MANAGER_TERMINATED, None)
    }

    pub fn send_reset(&self) -> bool {
        let _ops = self.lock();
        self.send_lifecycle_locked(actions::PLUGIN_RESET, None)
    }

    /// Tells the plugin that the event channel of `origin` went away.
    pub fn send_transmit_disconnect(&self, origin: &str) -> bool {
        let _ops = self.lock();
        self.send_lifecycle_locked(actions::TRANSMIT_DISCONNECT, Some(origin))
    }

    pub fn disconnect(&self) {
        let _ops = self.lock();
        self.transport.disconnect();
    }

    /// Final teardown when the plugin leaves the registry.
    pub fn dispose(&self) {
        let _ops = self.lock();
        self.transport.disconnect();
        self.history.clear();
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_locked(&self) -> Result<(), ConnectingError> {
        let state = self.transport.state();
        if self.is_enabled() {
            if state == ConnectionState::Disconnected {
                return self.try_connection_locked();
            }
        } else if matches!(state, ConnectionState::Connected | ConnectionState::Suspended) {
            self.transport.disconnect();
        }
        Ok(())
    }

    fn try_connection_locked(&self) -> Result<(), ConnectingError> {
        let attempts = self.options.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.connect() {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(plugin_id = %self.id(), attempt, "reconnected to plugin");
                    }
                    return Ok(());
                }
                Err(err) if attempt >= attempts => {
                    tracing::warn!(
                        plugin_id = %self.id(),
                        attempts,
                        error = %err.error,
                        "giving up connecting to plugin"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(
                        plugin_id = %self.id(),
                        attempt,
                        error = %err.error,
                        "connection attempt failed"
                    );
                    if let Some(delay) = self.options.retry.delay(attempt) {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn send_locked(&self, envelope: &Envelope) -> Result<Reply, MessagingError> {
        if !self.is_enabled() {
            return Err(MessagingError::NotEnabled {
                plugin_id: self.id().clone(),
            });
        }
        match self.transport.state() {
            ConnectionState::Connected => {}
            ConnectionState::Suspended => {
                if let Err(err) = self.try_connection_locked() {
                    return Err(MessagingError::ConnectionSuspended {
                        plugin_id: self.id().clone(),
                        error: Some(err.error),
                    });
                }
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(MessagingError::NotConnected {
                    plugin_id: self.id().clone(),
                });
            }
        }

        let start = SystemTime::now();
        let result = self.transport.send(envelope);
        match &result {
            Ok(Reply::Response(_) | Reply::Accepted) => {
                self.history.record(
                    envelope.target.clone(),
                    envelope.signature(),
                    start,
                    Some(SystemTime::now()),
                );
            }
            Ok(Reply::TimedOut) => {
                tracing::warn!(
                    plugin_id = %self.id(),
                    action = %envelope.action,
                    "plugin did not answer in time"
                );
                self.history
                    .record(envelope.target.clone(), envelope.signature(), start, None);
            }
            Ok(Reply::Dispatched) => {}
            Err(err) => {
                tracing::warn!(plugin_id = %self.id(), action = %envelope.action, error = %err, "send failed");
            }
        }
        result
    }

    fn send_lifecycle_locked(&self, action: &str, origin: Option<&str>) -> bool {
        if self.transport.state() != ConnectionState::Connected {
            tracing::debug!(
                plugin_id = %self.id(),
                action,
                state = %self.transport.state(),
                "skipping lifecycle notification"
            );
            return false;
        }
        let mut envelope = Envelope::new(action).with_field(FIELD_PLUGIN_ID, self.id().as_str());
        if let Some(origin) = origin {
            envelope = envelope.with_field(FIELD_ORIGIN, origin);
        }
        match self.send_locked(&envelope) {
            Ok(_) => true,
            Err(err) => {
                tracing::info!(plugin_id = %self.id(), action, error = %err, "lifecycle notification not delivered");
                false
            }
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", self.id())
            .field("name", &self.descriptor.name)
            .field("transport", &self.transport.kind())
            .field("state", &self.transport.state())
            .finish()
    }
}
