use super::{ensure_connected, Reply, Transport};
use crate::connection::{Connection, ConnectionState};
use crate::descriptor::TransportKind;
use crate::endpoint::PluginEndpoint;
use crate::envelope::Envelope;
use crate::error::{ConnectingError, ConnectionError, MessagingError};
use std::sync::Arc;

/// Plugin code living in the host process, called synchronously.
pub struct InProcessTransport {
    connection: Connection,
    endpoint: Option<Arc<dyn PluginEndpoint>>,
}

impl InProcessTransport {
    pub fn new(connection: Connection, endpoint: Option<Arc<dyn PluginEndpoint>>) -> Self {
        Self {
            connection,
            endpoint,
        }
    }
}

impl Transport for InProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn connect(&self) -> Result<(), ConnectingError> {
        if self.connection.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connection.set_state(ConnectionState::Connecting);
        if self.endpoint.is_none() {
            tracing::warn!(
                plugin_id = %self.connection.plugin_id(),
                "no in-process entry point registered"
            );
            return Err(self.connection.fail_connecting(ConnectionError::InternalError));
        }
        self.connection.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn disconnect(&self) {
        self.connection.set_state(ConnectionState::Disconnected);
    }

    fn send(&self, envelope: &Envelope) -> Result<Reply, MessagingError> {
        ensure_connected(&self.connection)?;
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| MessagingError::NotConnected {
                plugin_id: self.connection.plugin_id().clone(),
            })?;
        match endpoint.handle(envelope) {
            Ok(Some(response)) => Ok(Reply::Response(response)),
            Ok(None) => Ok(Reply::Accepted),
            Err(err) => Err(MessagingError::Other {
                plugin_id: self.connection.plugin_id().clone(),
                message: err.message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionContext;
    use crate::descriptor::PluginId;
    use crate::endpoint::EndpointError;
    use crate::error::MessagingReason;

    fn transport(endpoint: Option<Arc<dyn PluginEndpoint>>) -> InProcessTransport {
        let connection = Connection::new(PluginId::new("inproc"), &ConnectionContext::new(1));
        InProcessTransport::new(connection, endpoint)
    }

    #[test]
    fn connects_immediately() {
        let t = transport(Some(Arc::new(
            |_: &Envelope| -> Result<Option<Envelope>, EndpointError> { Ok(None) },
        )));
        t.connect().unwrap();
        assert_eq!(t.state(), ConnectionState::Connected);
        assert_eq!(t.send(&Envelope::new("x")).unwrap(), Reply::Accepted);
    }

    #[test]
    fn missing_endpoint_suspends_with_internal_error() {
        let t = transport(None);
        let err = t.connect().unwrap_err();
        assert_eq!(err.error, ConnectionError::InternalError);
        assert_eq!(t.state(), ConnectionState::Suspended);
        assert_eq!(t.current_error(), Some(ConnectionError::InternalError));
    }

    #[test]
    fn endpoint_failure_is_other() {
        let t = transport(Some(Arc::new(
            |_: &Envelope| -> Result<Option<Envelope>, EndpointError> {
                Err(EndpointError::new("boom"))
            },
        )));
        t.connect().unwrap();
        let err = t.send(&Envelope::new("x")).unwrap_err();
        assert_eq!(err.reason(), MessagingReason::Other);
        assert_eq!(t.state(), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let t = transport(Some(Arc::new(
            |_: &Envelope| -> Result<Option<Envelope>, EndpointError> { Ok(None) },
        )));
        t.connect().unwrap();
        t.disconnect();
        t.disconnect();
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert_eq!(
            t.send(&Envelope::new("x")).unwrap_err().reason(),
            MessagingReason::NotConnected
        );
    }
}
