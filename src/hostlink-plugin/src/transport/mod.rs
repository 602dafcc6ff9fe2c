//! Transport strategies behind one contract.
//!
//! Each transport owns a private [`Connection`] and drives it through the state machine
//! as it connects, disconnects or notices that its peer went away. The registry only
//! talks to `dyn Transport`; [`TransportFactory`] picks the implementation from
//! [`TransportKind`].

mod broadcast;
mod direct;
mod in_process;
mod ipc;

pub use broadcast::{BroadcastTransport, Broadcaster, ExecBroadcaster, Recipient};
pub use direct::DirectTransport;
pub use in_process::InProcessTransport;
pub use ipc::IpcTransport;

use crate::connection::{Connection, ConnectionContext, ConnectionState};
use crate::descriptor::{PluginDescriptor, TransportKind};
use crate::endpoint::EntryPointRegistry;
use crate::envelope::Envelope;
use crate::error::{ConnectingError, ConnectionError, MessagingError};
use hostlink_core::SupervisorConfig;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful [`Transport::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The plugin answered.
    Response(Envelope),
    /// The plugin handled the envelope and had nothing to send back.
    Accepted,
    /// Handed off without an acknowledgement channel. Completion is unknown.
    Dispatched,
    /// Delivered, but no response arrived before the response timeout.
    TimedOut,
}

impl Reply {
    pub fn response(&self) -> Option<&Envelope> {
        match self {
            Reply::Response(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// One communication mechanism to one plugin.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn connection(&self) -> &Connection;

    /// Brings the connection to CONNECTED. On failure the connection is already
    /// SUSPENDED when the error is returned. Connecting while CONNECTED is a no-op.
    fn connect(&self) -> Result<(), ConnectingError>;

    /// Tears the connection down. Idempotent.
    fn disconnect(&self);

    /// Delivers `envelope`. Never changes the connection state by itself.
    fn send(&self, envelope: &Envelope) -> Result<Reply, MessagingError>;

    fn state(&self) -> ConnectionState {
        self.connection().state()
    }

    fn current_error(&self) -> Option<ConnectionError> {
        self.connection().current_error()
    }
}

/// Builds the transport for a descriptor.
pub trait TransportFactory: Send + Sync {
    fn create(&self, descriptor: &PluginDescriptor, context: &ConnectionContext)
        -> Box<dyn Transport>;
}

/// Factory covering the four built-in transports.
pub struct DefaultTransportFactory {
    endpoints: Arc<EntryPointRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl DefaultTransportFactory {
    pub fn new(endpoints: Arc<EntryPointRegistry>) -> Self {
        Self {
            endpoints,
            broadcaster: Arc::new(ExecBroadcaster),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(endpoints: Arc<EntryPointRegistry>, config: &SupervisorConfig) -> Self {
        Self::new(endpoints).with_timeouts(config.connect_timeout(), config.response_timeout())
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, response: Duration) -> Self {
        self.connect_timeout = connect;
        self.response_timeout = response;
        self
    }

    pub fn endpoints(&self) -> &Arc<EntryPointRegistry> {
        &self.endpoints
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        descriptor: &PluginDescriptor,
        context: &ConnectionContext,
    ) -> Box<dyn Transport> {
        let connection = Connection::new(descriptor.id.clone(), context);
        match descriptor.transport {
            TransportKind::InProcess => Box::new(InProcessTransport::new(
                connection,
                self.endpoints.instance(&descriptor.entry_point),
            )),
            TransportKind::Ipc => Box::new(IpcTransport::new(
                connection,
                descriptor.launch.clone(),
                self.connect_timeout,
                self.response_timeout,
            )),
            TransportKind::Broadcast => Box::new(BroadcastTransport::new(
                connection,
                Recipient {
                    plugin_id: descriptor.id.clone(),
                    entry_point: descriptor.entry_point.clone(),
                    launch: descriptor.launch.clone(),
                },
                Arc::clone(&self.broadcaster),
            )),
            TransportKind::Direct => Box::new(DirectTransport::new(
                connection,
                descriptor.clone(),
                self.endpoints.constructor(&descriptor.entry_point),
            )),
        }
    }
}

/// Fails with NOT_CONNECTED unless the connection is CONNECTED.
pub(crate) fn ensure_connected(connection: &Connection) -> Result<(), MessagingError> {
    if connection.state() == ConnectionState::Connected {
        Ok(())
    } else {
        Err(MessagingError::NotConnected {
            plugin_id: connection.plugin_id().clone(),
        })
    }
}
