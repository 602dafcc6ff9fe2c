//! Plugins running as separate processes, reached over JSON lines on stdio.

use super::{ensure_connected, Reply, Transport};
use crate::connection::{Connection, ConnectionState};
use crate::descriptor::{LaunchSpec, TransportKind};
use crate::envelope::Envelope;
use crate::error::{ConnectingError, ConnectionError, MessagingError};
use crate::protocol::{HostFrame, HostMessage, PluginFrame, PluginMessage, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// How long a plugin gets to exit on its own after `Shutdown` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

type Pending = Arc<Mutex<HashMap<u64, Sender<PluginMessage>>>>;

struct Session {
    child: Child,
    stdin: ChildStdin,
    pending: Pending,
    closing: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl Session {
    fn write(&mut self, frame: &HostFrame) -> io::Result<()> {
        let line = frame.to_line().map_err(io::Error::other)?;
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()
    }

    fn close(mut self, shutdown_id: u64) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.write(&HostFrame {
            id: shutdown_id,
            message: HostMessage::Shutdown,
        });
        let Session { mut child, stdin, .. } = self;
        drop(stdin);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => break,
            }
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Spawns the plugin executable and exchanges [`HostFrame`]s and [`PluginFrame`]s with it.
///
/// A reader thread owns the child's stdout and routes each frame to the waiter registered
/// under its id. When stdout closes without the host asking for it, the connection moves
/// from CONNECTED to SUSPENDED(TERMINATED).
pub struct IpcTransport {
    connection: Connection,
    launch: Option<LaunchSpec>,
    connect_timeout: Duration,
    response_timeout: Duration,
    session: Mutex<Option<Session>>,
    next_id: AtomicU64,
}

impl IpcTransport {
    pub fn new(
        connection: Connection,
        launch: Option<LaunchSpec>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            launch,
            connect_timeout,
            response_timeout,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn close_session(&self) {
        let session = self.session().take();
        if let Some(session) = session {
            session.close(self.next_id());
        }
    }

    fn spawn(&self, launch: &LaunchSpec) -> Result<(Session, ChildStdout), ConnectionError> {
        let mut cmd = Command::new(&launch.executable);
        cmd.args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(ref dir) = launch.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            tracing::warn!(
                plugin_id = %self.connection.plugin_id(),
                executable = %launch.executable.display(),
                error = %err,
                "failed to spawn plugin process"
            );
            match err.kind() {
                io::ErrorKind::PermissionDenied => ConnectionError::NotPermitted,
                _ => ConnectionError::InternalError,
            }
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ConnectionError::InternalError);
        };
        let session = Session {
            child,
            stdin,
            pending: Arc::new(Mutex::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
        };
        Ok((session, stdout))
    }

    /// Spawns the process and waits for its handshake answer.
    fn handshake(&self) -> Result<Arc<AtomicBool>, ConnectionError> {
        let launch = self.launch.as_ref().ok_or_else(|| {
            tracing::warn!(
                plugin_id = %self.connection.plugin_id(),
                "ipc plugin has no launch command"
            );
            ConnectionError::InternalError
        })?;
        let (mut session, stdout) = self.spawn(launch)?;

        // Registered before the reader starts, so an early exit drops the waiter.
        let id = self.next_id();
        let (tx, rx) = mpsc::channel();
        lock(&session.pending).insert(id, tx);

        let reader = FrameReader {
            connection: self.connection.clone(),
            pending: Arc::clone(&session.pending),
            closing: Arc::clone(&session.closing),
            alive: Arc::clone(&session.alive),
        };
        let spawned = thread::Builder::new()
            .name(format!("hostlink-ipc-{}", short_id(self.connection.plugin_id().as_str())))
            .spawn(move || reader.run(stdout));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn plugin reader thread");
            session.close(self.next_id());
            return Err(ConnectionError::InternalError);
        }

        let frame = HostFrame {
            id,
            message: HostMessage::Handshake {
                plugin_id: self.connection.plugin_id().to_string(),
                protocol_version: PROTOCOL_VERSION,
            },
        };
        if let Err(err) = session.write(&frame) {
            tracing::warn!(
                plugin_id = %self.connection.plugin_id(),
                error = %err,
                "failed to write handshake"
            );
            session.close(self.next_id());
            return Err(ConnectionError::NotResponded);
        }

        let closing = Arc::clone(&session.closing);
        let alive = Arc::clone(&session.alive);
        // Published before waiting so that a concurrent disconnect can cancel the handshake.
        *self.session() = Some(session);

        let answer = rx.recv_timeout(self.connect_timeout);
        let outcome = match answer {
            Ok(PluginMessage::Ready(info)) if info.protocol_version == PROTOCOL_VERSION => {
                return Ok(alive);
            }
            Ok(PluginMessage::Ready(info)) => {
                tracing::warn!(
                    plugin_id = %self.connection.plugin_id(),
                    expected = PROTOCOL_VERSION,
                    actual = info.protocol_version,
                    "protocol version mismatch"
                );
                ConnectionError::InternalError
            }
            Ok(PluginMessage::Refused { reason }) => {
                tracing::warn!(
                    plugin_id = %self.connection.plugin_id(),
                    reason = %reason,
                    "plugin refused connection"
                );
                ConnectionError::NotPermitted
            }
            Ok(other) => {
                tracing::warn!(
                    plugin_id = %self.connection.plugin_id(),
                    answer = ?other,
                    "unexpected handshake answer"
                );
                ConnectionError::InternalError
            }
            Err(RecvTimeoutError::Timeout) => ConnectionError::NotResponded,
            Err(RecvTimeoutError::Disconnected) if closing.load(Ordering::SeqCst) => {
                ConnectionError::Canceled
            }
            Err(RecvTimeoutError::Disconnected) => ConnectionError::NotResponded,
        };
        self.close_session();
        Err(outcome)
    }
}

impl Transport for IpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ipc
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn connect(&self) -> Result<(), ConnectingError> {
        if self.connection.state() == ConnectionState::Connected {
            return Ok(());
        }
        // A previous process may still be around after a termination.
        self.close_session();
        self.connection.set_state(ConnectionState::Connecting);

        let alive = self
            .handshake()
            .map_err(|error| self.connection.fail_connecting(error))?;
        self.connection.set_state(ConnectionState::Connected);

        // The process may have died between the handshake and the state change, in which
        // case the reader saw CONNECTING and could not suspend.
        if !alive.load(Ordering::SeqCst) {
            self.connection.transition_if(
                ConnectionState::Connected,
                ConnectionState::Suspended,
                Some(ConnectionError::Terminated),
            );
            return Err(ConnectingError {
                plugin_id: self.connection.plugin_id().clone(),
                error: ConnectionError::Terminated,
            });
        }
        tracing::info!(plugin_id = %self.connection.plugin_id(), "plugin process connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.close_session();
        self.connection.set_state(ConnectionState::Disconnected);
    }

    fn send(&self, envelope: &Envelope) -> Result<Reply, MessagingError> {
        ensure_connected(&self.connection)?;
        let not_connected = || MessagingError::NotConnected {
            plugin_id: self.connection.plugin_id().clone(),
        };

        let id = self.next_id();
        let (tx, rx) = mpsc::channel();
        let pending = {
            let mut guard = self.session();
            let session = guard.as_mut().ok_or_else(not_connected)?;
            lock(&session.pending).insert(id, tx);
            let frame = HostFrame {
                id,
                message: HostMessage::Deliver(envelope.clone()),
            };
            if let Err(err) = session.write(&frame) {
                lock(&session.pending).remove(&id);
                tracing::warn!(
                    plugin_id = %self.connection.plugin_id(),
                    error = %err,
                    "failed to write to plugin process"
                );
                return Err(not_connected());
            }
            Arc::clone(&session.pending)
        };

        match rx.recv_timeout(self.response_timeout) {
            Ok(PluginMessage::Reply(response)) => Ok(Reply::Response(response)),
            Ok(PluginMessage::Error { message }) => Err(MessagingError::Other {
                plugin_id: self.connection.plugin_id().clone(),
                message,
            }),
            Ok(other) => Err(MessagingError::Other {
                plugin_id: self.connection.plugin_id().clone(),
                message: format!("unexpected answer: {other:?}"),
            }),
            Err(RecvTimeoutError::Timeout) => {
                lock(&pending).remove(&id);
                Ok(Reply::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Err(not_connected()),
        }
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        self.close_session();
    }
}

struct FrameReader {
    connection: Connection,
    pending: Pending,
    closing: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl FrameReader {
    fn run(self, stdout: ChildStdout) {
        let plugin_id = self.connection.plugin_id().clone();
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::debug!(plugin_id = %plugin_id, error = %err, "plugin stdout read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match PluginFrame::parse(&line) {
                Ok(frame) => {
                    let waiter = lock(&self.pending).remove(&frame.id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(frame.message);
                        }
                        None => {
                            tracing::debug!(plugin_id = %plugin_id, id = frame.id, "dropping unsolicited frame");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(plugin_id = %plugin_id, error = %err, "unparseable frame from plugin");
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        lock(&self.pending).clear();
        if !self.closing.load(Ordering::SeqCst)
            && self.connection.transition_if(
                ConnectionState::Connected,
                ConnectionState::Suspended,
                Some(ConnectionError::Terminated),
            )
        {
            tracing::warn!(plugin_id = %plugin_id, "plugin process terminated");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
