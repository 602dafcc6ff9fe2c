use super::{ensure_connected, Reply, Transport};
use crate::connection::{Connection, ConnectionState};
use crate::descriptor::{LaunchSpec, PluginId, TransportKind};
use crate::envelope::Envelope;
use crate::error::{ConnectingError, MessagingError};
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

/// Addressing information handed to a [`Broadcaster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub plugin_id: PluginId,
    pub entry_point: String,
    pub launch: Option<LaunchSpec>,
}

/// One-way publication mechanism used by [`BroadcastTransport`].
pub trait Broadcaster: Send + Sync {
    fn publish(&self, recipient: &Recipient, envelope: &Envelope) -> io::Result<()>;
}

/// Starts the recipient's executable and writes the envelope as one JSON line to its
/// stdin. The process is reaped in the background; its exit status is not observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecBroadcaster;

impl Broadcaster for ExecBroadcaster {
    fn publish(&self, recipient: &Recipient, envelope: &Envelope) -> io::Result<()> {
        let launch = recipient.launch.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no executable for {}", recipient.entry_point),
            )
        })?;
        let line = serde_json::to_string(envelope).map_err(io::Error::other)?;

        let mut cmd = Command::new(&launch.executable);
        cmd.args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        if let Some(ref dir) = launch.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let written = match child.stdin.take() {
            Some(mut stdin) => writeln!(stdin, "{line}").and_then(|_| stdin.flush()),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "no stdin")),
        };
        let plugin_id = recipient.plugin_id.clone();
        thread::spawn(move || {
            if let Err(err) = child.wait() {
                tracing::debug!(plugin_id = %plugin_id, error = %err, "failed to reap broadcast receiver");
            }
        });
        written
    }
}

/// Fire-and-forget delivery. Always logically available while enabled.
pub struct BroadcastTransport {
    connection: Connection,
    recipient: Recipient,
    broadcaster: Arc<dyn Broadcaster>,
}

impl BroadcastTransport {
    pub fn new(
        connection: Connection,
        recipient: Recipient,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            connection,
            recipient,
            broadcaster,
        }
    }
}

impl Transport for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn connect(&self) -> Result<(), ConnectingError> {
        if self.connection.state() != ConnectionState::Connected {
            self.connection.set_state(ConnectionState::Connecting);
            self.connection.set_state(ConnectionState::Connected);
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.connection.set_state(ConnectionState::Disconnected);
    }

    fn send(&self, envelope: &Envelope) -> Result<Reply, MessagingError> {
        ensure_connected(&self.connection)?;
        // Delivery failures are not reported to the caller.
        if let Err(err) = self.broadcaster.publish(&self.recipient, envelope) {
            tracing::warn!(
                plugin_id = %self.recipient.plugin_id,
                action = %envelope.action,
                error = %err,
                "broadcast delivery failed"
            );
        }
        Ok(Reply::Dispatched)
    }
}
