//! Process-backed plugins, driven by small bash scripts.
#![cfg(unix)]

use hostlink_core::SupervisorConfig;
use hostlink_plugin::{
    ConnectionError, ConnectionState, DefaultTransportFactory, EntryPointRegistry, Envelope,
    LaunchSpec, MemorySettingsStore, MessagingReason, PluginDescriptor, PluginId, PluginRegistry,
    Reply, StaticCatalog, TransportKind,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const READ_ID: &str = r#"id=$(echo "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)"#;

/// Answers the handshake, then runs `on_deliver` for every delivered envelope.
fn script(dir: &Path, name: &str, on_deliver: &str) -> LaunchSpec {
    let body = format!(
        r#"#!/bin/bash
while IFS= read -r line; do
    {READ_ID}
    case "$line" in
        *'"type":"Handshake"'*)
            echo '{{"id":'$id',"message":{{"status":"Ready","protocol_version":1}}}}' ;;
        *'"type":"Shutdown"'*)
            exit 0 ;;
        *)
            {on_deliver} ;;
    esac
done
"#
    );
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    // Run through bash so the freshly written file is never exec'd directly.
    LaunchSpec::new("bash").with_args([path.to_string_lossy().into_owned()])
}

const PONG: &str = r#"echo '{"id":'$id',"message":{"status":"Reply","action":"pong"}}'"#;

fn registry_for(launch: LaunchSpec, response_timeout: Duration) -> (PluginRegistry, PluginId) {
    let descriptor = PluginDescriptor::builder("org.example.script", "ScriptService", TransportKind::Ipc)
        .name("Script")
        .launch(launch)
        .build();
    let id = descriptor.id.clone();
    let config = SupervisorConfig {
        response_timeout_ms: response_timeout.as_millis() as u64,
        ..SupervisorConfig::default()
    };
    let factory = DefaultTransportFactory::from_config(Arc::new(EntryPointRegistry::new()), &config);
    let registry = PluginRegistry::new(
        Arc::new(StaticCatalog::new(vec![descriptor])),
        Arc::new(factory),
        Arc::new(MemorySettingsStore::new()),
        &config,
    );
    (registry, id)
}

fn wait_for_state(registry: &PluginRegistry, id: &PluginId, state: ConnectionState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if registry.get(id).map(|p| p.state()) == Some(state) {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("plugin never reached {state}");
}

#[test]
fn handshake_and_round_trip() {
    let dir = TempDir::new().unwrap();
    let (registry, id) = registry_for(script(dir.path(), "pong.sh", PONG), Duration::from_secs(5));

    registry.discover().unwrap();
    let plugin = registry.get(&id).unwrap();
    assert_eq!(plugin.state(), ConnectionState::Connected);

    for _ in 0..3 {
        let reply = registry.send(&id, &Envelope::new("ping")).unwrap();
        assert_eq!(reply.response().unwrap().action, "pong");
    }
    assert_eq!(plugin.history().len(), 3);
    assert!(plugin.history().entries().iter().all(|e| e.end.is_some()));

    registry.shutdown();
    assert_eq!(plugin.state(), ConnectionState::Disconnected);
}

#[test]
fn unexpected_exit_suspends_then_send_reconnects() {
    let dir = TempDir::new().unwrap();
    let once = format!("{PONG}; exit 0");
    let (registry, id) = registry_for(script(dir.path(), "once.sh", &once), Duration::from_secs(5));

    registry.discover().unwrap();
    let reply = registry.send(&id, &Envelope::new("ping")).unwrap();
    assert_eq!(reply.response().unwrap().action, "pong");

    wait_for_state(&registry, &id, ConnectionState::Suspended);
    let plugin = registry.get(&id).unwrap();
    assert_eq!(plugin.current_error(), Some(ConnectionError::Terminated));

    // The next send restarts the process before delivering.
    let reply = registry.send(&id, &Envelope::new("ping")).unwrap();
    assert_eq!(reply.response().unwrap().action, "pong");
    assert_eq!(plugin.history().len(), 2);
    registry.shutdown();
}

#[test]
fn missing_reply_is_recorded_as_timeout() {
    let dir = TempDir::new().unwrap();
    let (registry, id) =
        registry_for(script(dir.path(), "mute.sh", ":"), Duration::from_millis(300));

    registry.discover().unwrap();
    let reply = registry.send(&id, &Envelope::new("ping").with_target("t")).unwrap();
    assert_eq!(reply, Reply::TimedOut);

    let plugin = registry.get(&id).unwrap();
    let entries = plugin.history().entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_timeout());
    assert_eq!(plugin.history().average(), Duration::ZERO);
    assert_eq!(plugin.state(), ConnectionState::Connected);
    registry.shutdown();
}

#[test]
fn plugin_error_frame_is_other() {
    let dir = TempDir::new().unwrap();
    let fail = r#"echo '{"id":'$id',"message":{"status":"Error","message":"device offline"}}'"#;
    let (registry, id) = registry_for(script(dir.path(), "fail.sh", fail), Duration::from_secs(5));

    registry.discover().unwrap();
    let err = registry.send(&id, &Envelope::new("ping")).unwrap_err();
    assert_eq!(err.reason(), MessagingReason::Other);
    assert!(err.to_string().contains("device offline"));
    assert_eq!(registry.get(&id).unwrap().state(), ConnectionState::Connected);
    registry.shutdown();
}

#[test]
fn disconnect_is_idempotent_and_stops_the_process() {
    let dir = TempDir::new().unwrap();
    let (registry, id) = registry_for(script(dir.path(), "pong.sh", PONG), Duration::from_secs(5));
    registry.discover().unwrap();
    let plugin = registry.get(&id).unwrap();

    plugin.disconnect();
    plugin.disconnect();
    assert_eq!(plugin.state(), ConnectionState::Disconnected);
    assert_eq!(plugin.current_error(), None);
    assert_eq!(
        registry.send(&id, &Envelope::new("ping")).unwrap_err().reason(),
        MessagingReason::NotConnected
    );

    // Applying again brings it back.
    assert!(registry.apply(&id));
    assert_eq!(plugin.state(), ConnectionState::Connected);
    registry.shutdown();
}
