//! Reference plugin for the process transport.
//!
//! Answers the handshake, then replies to every delivered envelope with
//! `<action>.reply`, swapping origin and target and echoing the fields back.
//! Logs go to stderr; stdout carries protocol frames only.

use anyhow::Result;
use hostlink_plugin::protocol::{
    HandshakeInfo, HostFrame, HostMessage, PluginFrame, PluginMessage, PROTOCOL_VERSION,
};
use hostlink_plugin::Envelope;
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

enum Step {
    Answer(PluginFrame),
    Stop,
}

fn handle(frame: HostFrame) -> Step {
    let message = match frame.message {
        HostMessage::Handshake {
            plugin_id,
            protocol_version,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                tracing::warn!(protocol_version, "refusing host with unknown protocol");
                PluginMessage::Refused {
                    reason: format!("unsupported protocol version {protocol_version}"),
                }
            } else {
                tracing::info!(plugin_id = %plugin_id, "host connected");
                PluginMessage::Ready(HandshakeInfo {
                    protocol_version: PROTOCOL_VERSION,
                })
            }
        }
        HostMessage::Deliver(envelope) => {
            tracing::debug!(action = %envelope.action, "envelope received");
            PluginMessage::Reply(echo(envelope))
        }
        HostMessage::Shutdown => return Step::Stop,
    };
    Step::Answer(PluginFrame {
        id: frame.id,
        message,
    })
}

fn echo(envelope: Envelope) -> Envelope {
    Envelope {
        action: format!("{}.reply", envelope.action),
        origin: envelope.target,
        target: envelope.origin,
        fields: envelope.fields,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame = match HostFrame::parse(&line) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable frame");
                continue;
            }
        };
        match handle(frame) {
            Step::Answer(reply) => {
                writeln!(stdout, "{}", reply.to_line()?)?;
                stdout.flush()?;
            }
            Step::Stop => break,
        }
    }
    tracing::info!("host disconnected");
    Ok(())
}
