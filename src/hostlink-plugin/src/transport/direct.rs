use super::{ensure_connected, Reply, Transport};
use crate::connection::{Connection, ConnectionState};
use crate::descriptor::{PluginDescriptor, TransportKind};
use crate::endpoint::{EndpointConstructor, PluginEndpoint};
use crate::envelope::Envelope;
use crate::error::{ConnectingError, ConnectionError, MessagingError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Plugin code constructed in-process on connect and released on disconnect.
pub struct DirectTransport {
    connection: Connection,
    descriptor: PluginDescriptor,
    constructor: Option<EndpointConstructor>,
    instance: Mutex<Option<Arc<dyn PluginEndpoint>>>,
}

impl DirectTransport {
    pub fn new(
        connection: Connection,
        descriptor: PluginDescriptor,
        constructor: Option<EndpointConstructor>,
    ) -> Self {
        Self {
            connection,
            descriptor,
            constructor,
            instance: Mutex::new(None),
        }
    }

    fn instance(&self) -> MutexGuard<'_, Option<Arc<dyn PluginEndpoint>>> {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn connect(&self) -> Result<(), ConnectingError> {
        if self.connection.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connection.set_state(ConnectionState::Connecting);

        let Some(constructor) = self.constructor.as_ref() else {
            tracing::warn!(
                plugin_id = %self.descriptor.id,
                entry_point = %self.descriptor.entry_point,
                "no constructor registered for entry point"
            );
            return Err(self.connection.fail_connecting(ConnectionError::InternalError));
        };

        let built = panic::catch_unwind(AssertUnwindSafe(|| constructor(&self.descriptor)));
        match built {
            Ok(Ok(endpoint)) => {
                *self.instance() = Some(endpoint);
                self.connection.set_state(ConnectionState::Connected);
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    plugin_id = %self.descriptor.id,
                    error = %err,
                    "failed to construct plugin entry point"
                );
                Err(self.connection.fail_connecting(ConnectionError::InternalError))
            }
            Err(_) => {
                tracing::error!(
                    plugin_id = %self.descriptor.id,
                    "plugin constructor panicked"
                );
                Err(self.connection.fail_connecting(ConnectionError::InternalError))
            }
        }
    }

    fn disconnect(&self) {
        if let Some(instance) = self.instance().take() {
            instance.release();
        }
        self.connection.set_state(ConnectionState::Disconnected);
    }

    fn send(&self, envelope: &Envelope) -> Result<Reply, MessagingError> {
        ensure_connected(&self.connection)?;
        let endpoint = self
            .instance()
            .clone()
            .ok_or_else(|| MessagingError::NotConnected {
                plugin_id: self.descriptor.id.clone(),
            })?;
        match endpoint.handle(envelope) {
            Ok(Some(response)) => Ok(Reply::Response(response)),
            Ok(None) => Ok(Reply::Accepted),
            Err(err) => Err(MessagingError::Other {
                plugin_id: self.descriptor.id.clone(),
                message: err.message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionContext;
    use crate::endpoint::EndpointError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        released: Arc<AtomicUsize>,
    }

    impl PluginEndpoint for Counted {
        fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, EndpointError> {
            Ok(Some(Envelope::new(format!("{}.done", envelope.action))))
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor::builder("pkg", "Direct", TransportKind::Direct).build()
    }

    fn transport(constructor: Option<EndpointConstructor>) -> DirectTransport {
        let descriptor = descriptor();
        let connection = Connection::new(descriptor.id.clone(), &ConnectionContext::new(1));
        DirectTransport::new(connection, descriptor, constructor)
    }

    #[test]
    fn constructs_on_connect_and_releases_on_disconnect() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let constructor: EndpointConstructor = Arc::new(
            move |_: &PluginDescriptor| -> Result<Arc<dyn PluginEndpoint>, EndpointError> {
                let endpoint: Arc<dyn PluginEndpoint> = Arc::new(Counted {
                    released: Arc::clone(&counter),
                });
                Ok(endpoint)
            },
        );
        let t = transport(Some(constructor));

        t.connect().unwrap();
        let reply = t.send(&Envelope::new("run")).unwrap();
        assert_eq!(reply.response().unwrap().action, "run.done");

        t.disconnect();
        t.disconnect();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn construction_failure_suspends() {
        let constructor: EndpointConstructor = Arc::new(
            |_: &PluginDescriptor| -> Result<Arc<dyn PluginEndpoint>, EndpointError> {
                Err(EndpointError::new("missing dependency"))
            },
        );
        let t = transport(Some(constructor));
        let err = t.connect().unwrap_err();
        assert_eq!(err.error, ConnectionError::InternalError);
        assert_eq!(t.state(), ConnectionState::Suspended);
    }

    #[test]
    fn constructor_panic_suspends() {
        let constructor: EndpointConstructor = Arc::new(
            |_: &PluginDescriptor| -> Result<Arc<dyn PluginEndpoint>, EndpointError> {
                panic!("constructor bug")
            },
        );
        let t = transport(Some(constructor));
        assert!(t.connect().is_err());
        assert_eq!(t.current_error(), Some(ConnectionError::InternalError));
    }

    #[test]
    fn unknown_entry_point_suspends() {
        let t = transport(None);
        assert!(t.connect().is_err());
        assert_eq!(t.state(), ConnectionState::Suspended);
    }
}
