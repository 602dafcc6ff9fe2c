//! Connection state machine shared by every transport.
//!
//! ```text
//!  DISCONNECTED --connect--> CONNECTING --ok--> CONNECTED
//!        ^                      |    ^             |
//!        |                 fail |    | reconnect   | terminated
//!        |                      v    |             v
//!        +-----disconnect------ SUSPENDED <--------+
//! ```
//!
//! Every accepted transition updates the state synchronously and then queues one
//! notification on the [`NotificationPool`]; listeners and the [`StateHub`] see the
//! change shortly after, in transition order. The status lock is released before the
//! notification is queued, so reading the state never waits on a full queue.

use crate::descriptor::PluginId;
use crate::error::{ConnectingError, ConnectionError};
use crate::notify::{NotificationPool, StateEvent, StateHub, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Suspended => "suspended",
        }
    }

    /// Whether the state machine accepts `self -> next`.
    ///
    /// Leaving DISCONNECTED is only possible through CONNECTING. SUSPENDED may re-enter
    /// CONNECTING so that senders can reconnect.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Suspended, Connecting)
                | (Connecting, Connected)
                | (Connecting, Suspended)
                | (Connected, Suspended)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Suspended, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives `(plugin id, new state)` after each transition.
pub trait ConnectionStateListener: Send + Sync {
    fn on_connection_state_changed(&self, plugin_id: &PluginId, state: ConnectionState);
}

impl<F> ConnectionStateListener for F
where
    F: Fn(&PluginId, ConnectionState) + Send + Sync,
{
    fn on_connection_state_changed(&self, plugin_id: &PluginId, state: ConnectionState) {
        self(plugin_id, state)
    }
}

/// Handle returned by [`Connection::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Shared plumbing every connection needs: the notification workers and the hub.
#[derive(Clone)]
pub struct ConnectionContext {
    notifications: Arc<NotificationPool>,
    hub: Arc<StateHub>,
}

impl ConnectionContext {
    pub fn new(notification_workers: usize) -> Self {
        Self::with_queue_capacity(notification_workers, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(notification_workers: usize, queue_capacity: usize) -> Self {
        Self {
            notifications: Arc::new(NotificationPool::with_queue_capacity(
                notification_workers,
                queue_capacity,
            )),
            hub: Arc::new(StateHub::new()),
        }
    }

    pub fn notifications(&self) -> &Arc<NotificationPool> {
        &self.notifications
    }

    pub fn hub(&self) -> &Arc<StateHub> {
        &self.hub
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("workers", &self.notifications.worker_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ConnectionState,
    error: Option<ConnectionError>,
}

type ListenerList = Vec<(ListenerId, Arc<dyn ConnectionStateListener>)>;

struct Inner {
    plugin_id: PluginId,
    status: Mutex<Status>,
    /// Taken before the status lock is released and held while queueing.
    notify_order: Mutex<()>,
    listeners: Mutex<ListenerList>,
    next_listener: AtomicU64,
    context: ConnectionContext,
}

/// Cloneable handle on one plugin's connection state.
///
/// Clones share state, so a transport can hand one to a helper thread that detects
/// remote termination.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(plugin_id: PluginId, context: &ConnectionContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                plugin_id,
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    error: None,
                }),
                notify_order: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                context: context.clone(),
            }),
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.inner.plugin_id
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// The recorded failure; `Some` exactly while SUSPENDED.
    pub fn current_error(&self) -> Option<ConnectionError> {
        self.status().error
    }

    /// Moves to `next`, clearing any recorded error. `next` must not be SUSPENDED.
    pub fn set_state(&self, next: ConnectionState) -> bool {
        debug_assert_ne!(next, ConnectionState::Suspended, "use suspend()");
        self.apply(self.status(), next, None)
    }

    /// Moves to SUSPENDED and records `error`.
    pub fn suspend(&self, error: ConnectionError) -> bool {
        self.apply(self.status(), ConnectionState::Suspended, Some(error))
    }

    /// Performs the transition only while the state still equals `expected`.
    pub fn transition_if(
        &self,
        expected: ConnectionState,
        next: ConnectionState,
        error: Option<ConnectionError>,
    ) -> bool {
        let status = self.status();
        if status.state != expected {
            return false;
        }
        self.apply(status, next, error)
    }

    /// Suspends with `error` and returns the matching [`ConnectingError`].
    pub fn fail_connecting(&self, error: ConnectionError) -> ConnectingError {
        self.suspend(error);
        ConnectingError {
            plugin_id: self.inner.plugin_id.clone(),
            error,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn ConnectionStateListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerList> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(
        &self,
        mut status: MutexGuard<'_, Status>,
        next: ConnectionState,
        error: Option<ConnectionError>,
    ) -> bool {
        let from = status.state;
        if from == next || !from.can_transition_to(next) {
            if from != next {
                tracing::debug!(
                    plugin_id = %self.inner.plugin_id,
                    from = %from,
                    to = %next,
                    "ignoring invalid connection transition"
                );
            }
            return false;
        }

        let error = match next {
            ConnectionState::Suspended => Some(error.unwrap_or(ConnectionError::InternalError)),
            _ => None,
        };
        status.state = next;
        status.error = error;
        tracing::debug!(
            plugin_id = %self.inner.plugin_id,
            from = %from,
            to = %next,
            error = ?error,
            "connection state changed"
        );

        let listeners: Vec<_> = self
            .listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        let hub = Arc::clone(&self.inner.context.hub);
        let plugin_id = self.inner.plugin_id.clone();
        let event = StateEvent::now(plugin_id.clone(), next, error);

        // Hand over to the order lock so the next transition cannot queue ahead of this one.
        let _order = self
            .inner
            .notify_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(status);
        self.inner
            .context
            .notifications
            .dispatch(self.inner.plugin_id.as_str(), move || {
                for listener in &listeners {
                    listener.on_connection_state_changed(&plugin_id, next);
                }
                hub.publish(&event);
            });
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("Connection")
            .field("plugin_id", &self.inner.plugin_id)
            .field("state", &status.state)
            .field("error", &status.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn connection() -> Connection {
        Connection::new(PluginId::new("plugin-1"), &ConnectionContext::new(1))
    }

    #[test]
    fn starts_disconnected_without_error() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.current_error(), None);
    }

    #[test]
    fn error_present_only_while_suspended() {
        let conn = connection();
        assert!(conn.set_state(ConnectionState::Connecting));
        assert!(conn.suspend(ConnectionError::NotResponded));
        assert_eq!(conn.state(), ConnectionState::Suspended);
        assert_eq!(conn.current_error(), Some(ConnectionError::NotResponded));

        assert!(conn.set_state(ConnectionState::Connecting));
        assert_eq!(conn.current_error(), None);
        assert!(conn.set_state(ConnectionState::Connected));
        assert!(conn.suspend(ConnectionError::Terminated));
        assert_eq!(conn.current_error(), Some(ConnectionError::Terminated));

        assert!(conn.set_state(ConnectionState::Disconnected));
        assert_eq!(conn.current_error(), None);
    }

    #[test]
    fn disconnected_only_leaves_through_connecting() {
        let conn = connection();
        assert!(!conn.set_state(ConnectionState::Connected));
        assert!(!conn.suspend(ConnectionError::Terminated));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.current_error(), None);
    }

    #[test]
    fn transition_if_requires_expected_state() {
        let conn = connection();
        conn.set_state(ConnectionState::Connecting);
        assert!(!conn.transition_if(
            ConnectionState::Connected,
            ConnectionState::Suspended,
            Some(ConnectionError::Terminated)
        ));
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn listeners_receive_transitions_in_order() {
        let conn = connection();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        conn.subscribe(Arc::new(move |_: &PluginId, state: ConnectionState| {
            let _ = tx.lock().unwrap().send(state);
        }));

        conn.set_state(ConnectionState::Connecting);
        conn.set_state(ConnectionState::Connected);
        conn.suspend(ConnectionError::Terminated);
        conn.set_state(ConnectionState::Disconnected);

        let received: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(
            received,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Suspended,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let conn = connection();
        let (tx, rx) = mpsc::channel::<ConnectionState>();
        let tx = Mutex::new(tx);
        let id = conn.subscribe(Arc::new(move |_: &PluginId, state: ConnectionState| {
            let _ = tx.lock().unwrap().send(state);
        }));
        assert!(conn.unsubscribe(id));
        assert!(!conn.unsubscribe(id));

        conn.set_state(ConnectionState::Connecting);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn hub_republishes_with_error() {
        let context = ConnectionContext::new(1);
        let events = context.hub().subscribe();
        let conn = Connection::new(PluginId::new("p"), &context);
        conn.set_state(ConnectionState::Connecting);
        conn.suspend(ConnectionError::NotPermitted);

        let first = events.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.state, ConnectionState::Connecting);
        assert_eq!(second.state, ConnectionState::Suspended);
        assert_eq!(second.error, Some(ConnectionError::NotPermitted));
    }

    #[test]
    fn state_stays_readable_while_notifications_back_up() {
        let context = ConnectionContext::with_queue_capacity(1, 1);
        let conn = Connection::new(PluginId::new("p"), &context);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let (seen_tx, seen_rx) = mpsc::channel::<ConnectionState>();
        let seen_tx = Mutex::new(seen_tx);
        conn.subscribe(Arc::new(move |_: &PluginId, state: ConnectionState| {
            if state == ConnectionState::Connecting {
                let _ = gate_rx.lock().unwrap().recv();
            }
            let _ = seen_tx.lock().unwrap().send(state);
        }));

        let driver = {
            let conn = conn.clone();
            std::thread::spawn(move || {
                conn.set_state(ConnectionState::Connecting);
                conn.set_state(ConnectionState::Connected);
                conn.suspend(ConnectionError::Terminated);
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(conn.state(), ConnectionState::Suspended);
        assert_eq!(conn.current_error(), Some(ConnectionError::Terminated));

        gate_tx.send(()).unwrap();
        driver.join().unwrap();
        let received: Vec<_> = (0..3)
            .map(|_| seen_rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(
            received,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Suspended,
            ]
        );
    }
}
