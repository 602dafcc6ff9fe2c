use hostlink_core::SupervisorConfig;
use hostlink_plugin::{
    actions, CatalogEvent, ConnectionState, DefaultTransportFactory, DetectionReason,
    EndpointError, EntryPointRegistry, Envelope, MemorySettingsStore, MessagingReason, Plugin,
    PluginDescriptor, PluginEventListener, PluginId, PluginRegistry, Reply, SettingsStore,
    StaticCatalog, TransportKind,
};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    registry: PluginRegistry,
    catalog: Arc<StaticCatalog>,
    endpoints: Arc<EntryPointRegistry>,
    settings: Arc<MemorySettingsStore>,
}

fn harness(descriptors: Vec<PluginDescriptor>) -> Harness {
    harness_with(StaticCatalog::new(descriptors))
}

fn harness_with(catalog: StaticCatalog) -> Harness {
    harness_configured(catalog, SupervisorConfig::default())
}

fn harness_configured(catalog: StaticCatalog, config: SupervisorConfig) -> Harness {
    let catalog = Arc::new(catalog);
    let endpoints = Arc::new(EntryPointRegistry::new());
    let settings = Arc::new(MemorySettingsStore::new());
    let factory = DefaultTransportFactory::from_config(Arc::clone(&endpoints), &config);
    let registry = PluginRegistry::new(
        catalog.clone(),
        Arc::new(factory),
        settings.clone(),
        &config,
    );
    Harness {
        registry,
        catalog,
        endpoints,
        settings,
    }
}

fn echo_endpoint(endpoints: &EntryPointRegistry, entry_point: &str) {
    endpoints.register_instance(
        entry_point,
        Arc::new(
            |envelope: &Envelope| -> Result<Option<Envelope>, EndpointError> {
                Ok(Some(Envelope::new(format!("{}.reply", envelope.action))))
            },
        ),
    );
}

fn in_process(package: &str, entry_point: &str) -> PluginDescriptor {
    PluginDescriptor::builder(package, entry_point, TransportKind::InProcess)
        .name(entry_point)
        .build()
}

/// Turns registry callbacks into strings on a channel.
struct Recorder {
    events: Mutex<Sender<String>>,
}

impl Recorder {
    fn new() -> (Arc<Self>, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Self {
                events: Mutex::new(tx),
            }),
            rx,
        )
    }

    fn push(&self, event: String) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl PluginEventListener for Recorder {
    fn on_device_found(&self, plugin: &Arc<Plugin>) {
        self.push(format!("found {}", plugin.name()));
    }

    fn on_device_lost(&self, plugin: &Arc<Plugin>) {
        self.push(format!("lost {}", plugin.name()));
    }

    fn on_connection_state_changed(&self, plugin: &Arc<Plugin>, state: ConnectionState) {
        self.push(format!("{} {}", plugin.name(), state));
    }
}

fn next(rx: &Receiver<String>) -> String {
    rx.recv_timeout(WAIT).expect("timed out waiting for event")
}

#[test]
fn in_process_plugin_end_to_end() {
    let h = harness(vec![in_process("org.example.echo", "Echo")]);
    echo_endpoint(&h.endpoints, "Echo");

    assert_eq!(h.registry.discover().unwrap(), 1);
    let plugin = h.registry.plugins().pop().unwrap();
    assert_eq!(plugin.state(), ConnectionState::Connected);
    assert!(plugin.can_communicate());

    let reply = h
        .registry
        .send(plugin.id(), &Envelope::new("ping"))
        .unwrap();
    assert_eq!(reply.response().unwrap().action, "ping.reply");

    let entries = plugin.history().entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].end.is_some());
    assert_eq!(entries[0].signature, "ping");
}

#[test]
fn subscribers_see_found_state_changes_and_lost_in_order() {
    let h = harness(vec![in_process("org.example.echo", "Echo")]);
    echo_endpoint(&h.endpoints, "Echo");
    let (recorder, events) = Recorder::new();
    h.registry.subscribe(recorder);

    h.registry.discover().unwrap();
    assert_eq!(next(&events), "found Echo");
    assert_eq!(next(&events), "Echo connecting");
    assert_eq!(next(&events), "Echo connected");

    let id = PluginId::derive("org.example.echo", "Echo");
    assert!(h.registry.remove(&id).is_some());
    assert_eq!(next(&events), "lost Echo");
    assert!(h.registry.get(&id).is_none());
}

/// Holds up the notification worker on the first found event.
struct SlowRecorder {
    inner: Arc<Recorder>,
}

impl PluginEventListener for SlowRecorder {
    fn on_device_found(&self, plugin: &Arc<Plugin>) {
        thread::sleep(Duration::from_millis(200));
        self.inner.on_device_found(plugin);
    }

    fn on_device_lost(&self, plugin: &Arc<Plugin>) {
        self.inner.on_device_lost(plugin);
    }

    fn on_connection_state_changed(&self, plugin: &Arc<Plugin>, state: ConnectionState) {
        self.inner.on_connection_state_changed(plugin, state);
    }
}

#[test]
fn queued_state_changes_survive_removal() {
    let config = SupervisorConfig {
        notification_workers: 1,
        ..SupervisorConfig::default()
    };
    let h = harness_configured(
        StaticCatalog::new(vec![in_process("org.example.echo", "Echo")]),
        config,
    );
    echo_endpoint(&h.endpoints, "Echo");
    let (recorder, events) = Recorder::new();
    h.registry.subscribe(Arc::new(SlowRecorder { inner: recorder }));

    h.registry.discover().unwrap();
    let id = PluginId::derive("org.example.echo", "Echo");
    assert!(h.registry.remove(&id).is_some());

    assert_eq!(next(&events), "found Echo");
    assert_eq!(next(&events), "Echo connecting");
    assert_eq!(next(&events), "Echo connected");
    assert_eq!(next(&events), "lost Echo");
}

#[test]
fn state_events_reach_out_of_process_observers() {
    let h = harness(vec![in_process("org.example.echo", "Echo")]);
    echo_endpoint(&h.endpoints, "Echo");
    let events = h.registry.state_events();

    h.registry.discover().unwrap();
    let first = events.recv_timeout(WAIT).unwrap();
    let second = events.recv_timeout(WAIT).unwrap();
    assert_eq!(first.state, ConnectionState::Connecting);
    assert_eq!(second.state, ConnectionState::Connected);
    assert_eq!(second.plugin_id, PluginId::derive("org.example.echo", "Echo"));
    assert!(serde_json::to_string(&second).unwrap().contains("\"connected\""));
}

#[test]
fn discovery_prefers_ipc_component_of_same_manifest() {
    let receiver = PluginDescriptor::builder("org.example.hue", "HueReceiver", TransportKind::Broadcast)
        .manifest_id("hue")
        .build();
    let service = PluginDescriptor::builder("org.example.hue", "HueService", TransportKind::Ipc)
        .manifest_id("hue")
        .build();
    let h = harness(vec![receiver, service.clone()]);

    assert_eq!(h.registry.discover().unwrap(), 1);
    let plugins = h.registry.plugins();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].id(), &service.id);
    assert_eq!(plugins[0].transport_kind(), TransportKind::Ipc);
    // No launch command: it stays listed but unreachable.
    assert_eq!(plugins[0].state(), ConnectionState::Suspended);
    assert_eq!(
        h.registry
            .send(&service.id, &Envelope::new("ping"))
            .unwrap_err()
            .reason(),
        MessagingReason::ConnectionSuspended
    );
}

#[test]
fn too_many_entries_is_reported_distinctly() {
    let h = harness_with(
        StaticCatalog::new(vec![in_process("a", "A"), in_process("b", "B")]).with_max_entries(1),
    );
    let err = h.registry.discover().unwrap_err();
    assert_eq!(err.reason(), DetectionReason::TooManyPackages);
    assert!(h.registry.is_empty());
}

#[test]
fn unknown_and_disabled_plugins_fail_fast() {
    let h = harness(vec![in_process("org.example.echo", "Echo")]);
    echo_endpoint(&h.endpoints, "Echo");
    let id = PluginId::derive("org.example.echo", "Echo");
    h.settings.set_enabled(&id, false).unwrap();

    h.registry.discover().unwrap();
    let plugin = h.registry.get(&id).unwrap();
    assert_eq!(plugin.state(), ConnectionState::Disconnected);
    assert_eq!(
        h.registry.send(&id, &Envelope::new("ping")).unwrap_err().reason(),
        MessagingReason::NotEnabled
    );
    assert_eq!(
        h.registry
            .send(&PluginId::new("missing"), &Envelope::new("ping"))
            .unwrap_err()
            .reason(),
        MessagingReason::NotConnected
    );

    assert!(h.registry.set_enabled(&id, true).unwrap());
    assert_eq!(plugin.state(), ConnectionState::Connected);
    assert!(h.registry.send(&id, &Envelope::new("ping")).is_ok());
    assert!(!h.registry.set_enabled(&PluginId::new("missing"), true).unwrap());
}

#[test]
fn removal_during_send_completes_without_deadlock() {
    let h = harness(vec![in_process("org.example.slow", "Slow")]);
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    h.endpoints.register_instance(
        "Slow",
        Arc::new(
            move |_: &Envelope| -> Result<Option<Envelope>, EndpointError> {
                let _ = entered_tx.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(200));
                Ok(Some(Envelope::new("done")))
            },
        ),
    );
    h.registry.discover().unwrap();
    let id = PluginId::derive("org.example.slow", "Slow");

    let registry = h.registry.clone();
    let sender_id = id.clone();
    let in_flight = thread::spawn(move || registry.send(&sender_id, &Envelope::new("work")));
    entered_rx.recv_timeout(WAIT).unwrap();
    let removed = h.registry.remove(&id).unwrap();

    match in_flight.join().unwrap() {
        Ok(reply) => assert_eq!(reply.response().unwrap().action, "done"),
        Err(err) => assert_eq!(err.reason(), MessagingReason::NotConnected),
    }
    assert_eq!(removed.state(), ConnectionState::Disconnected);
    assert_eq!(
        h.registry.send(&id, &Envelope::new("work")).unwrap_err().reason(),
        MessagingReason::NotConnected
    );
}

#[test]
fn catalog_events_add_replace_and_remove() {
    let h = harness(Vec::new());
    echo_endpoint(&h.endpoints, "Echo");
    echo_endpoint(&h.endpoints, "Echo2");
    let (recorder, events) = Recorder::new();
    h.registry.subscribe(recorder);

    h.catalog.add(in_process("org.example.echo", "Echo"));
    h.registry
        .on_catalog_changed(&CatalogEvent::Added("org.example.echo".to_string()))
        .unwrap();
    assert_eq!(h.registry.len(), 1);
    assert_eq!(next(&events), "found Echo");

    // A new version drops the old component and adds another.
    h.catalog.remove_package("org.example.echo");
    h.catalog.add(in_process("org.example.echo", "Echo2"));
    h.registry
        .on_catalog_changed(&CatalogEvent::Changed("org.example.echo".to_string()))
        .unwrap();
    let names: Vec<_> = h
        .registry
        .plugins()
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    assert_eq!(names, vec!["Echo2"]);

    h.catalog.remove_package("org.example.echo");
    h.registry
        .on_catalog_changed(&CatalogEvent::Removed("org.example.echo".to_string()))
        .unwrap();
    assert!(h.registry.is_empty());

    // Different plugins may land on different workers, so only presence is checked.
    let expected = ["lost Echo", "found Echo2", "lost Echo2"];
    let mut seen: Vec<String> = Vec::new();
    while !expected.iter().all(|e| seen.iter().any(|s| s == e)) {
        seen.push(next(&events));
    }
}

#[test]
fn catalog_monitor_applies_events_in_background() {
    let h = harness(Vec::new());
    echo_endpoint(&h.endpoints, "Echo");
    let (tx, rx) = mpsc::channel();
    let monitor = h.registry.start_monitoring(rx).unwrap();

    h.catalog.add(in_process("org.example.echo", "Echo"));
    tx.send(CatalogEvent::Added("org.example.echo".to_string()))
        .unwrap();
    drop(tx);
    monitor.join();

    let plugin = h.registry.plugins().pop().unwrap();
    assert_eq!(plugin.state(), ConnectionState::Connected);
}

#[test]
fn lifecycle_fan_out_reaches_connected_plugins() {
    let h = harness(vec![
        in_process("org.example.a", "A"),
        in_process("org.example.b", "B"),
    ]);
    let (seen_tx, seen_rx) = mpsc::channel();
    let seen_tx = Mutex::new(seen_tx);
    h.endpoints.register_instance(
        "A",
        Arc::new(
            move |envelope: &Envelope| -> Result<Option<Envelope>, EndpointError> {
                let _ = seen_tx.lock().unwrap().send(envelope.clone());
                Ok(None)
            },
        ),
    );
    // "B" has no endpoint and never connects.
    h.registry.discover().unwrap();

    assert_eq!(h.registry.notify_launched(), 1);
    let launched = seen_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(launched.action, actions::MANAGER_LAUNCHED);
    assert_eq!(
        launched.field_str("plugin_id"),
        Some(PluginId::derive("org.example.a", "A").as_str())
    );

    let a = h.registry.get(&PluginId::derive("org.example.a", "A")).unwrap();
    assert!(a.send_transmit_disconnect("app.example"));
    let dropped = seen_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(dropped.action, actions::TRANSMIT_DISCONNECT);
    assert_eq!(dropped.field_str("origin"), Some("app.example"));

    h.registry.shutdown();
    assert_eq!(
        seen_rx.recv_timeout(WAIT).unwrap().action,
        actions::MANAGER_TERMINATED
    );
    assert!(h.registry.is_empty());
    assert_eq!(a.state(), ConnectionState::Disconnected);
}

#[test]
fn service_ids_round_trip_through_plugin() {
    let h = harness(vec![in_process("org.example.echo", "Echo")]);
    echo_endpoint(&h.endpoints, "Echo");
    h.registry.discover().unwrap();
    let id = PluginId::derive("org.example.echo", "Echo");

    let full = h.registry.append_service_id(&id, Some("lamp-1"));
    assert_eq!(full, format!("lamp-1.{id}.localhost.hostlink"));
    assert_eq!(h.registry.split_service_id(&id, &full).as_deref(), Some("lamp-1"));
    assert_eq!(
        h.registry
            .split_service_id(&id, &h.registry.append_service_id(&id, None))
            .as_deref(),
        Some("")
    );
    assert_eq!(h.registry.split_service_id(&PluginId::new("other"), &full), None);
    assert_eq!(h.registry.find_by_service_id(&full).unwrap().id(), &id);
    assert!(h.registry.find_by_service_id("lamp-1.unknown.localhost.hostlink").is_none());
}

#[test]
fn broadcast_sends_are_dispatched_without_history() {
    let descriptor =
        PluginDescriptor::builder("org.example.legacy", "Receiver", TransportKind::Broadcast)
            .build();
    let h = harness(vec![descriptor.clone()]);
    h.registry.discover().unwrap();

    // No launch command, so publishing fails; that is not visible to the caller.
    let reply = h
        .registry
        .send(&descriptor.id, &Envelope::new("notify"))
        .unwrap();
    assert_eq!(reply, Reply::Dispatched);
    assert!(h.registry.get(&descriptor.id).unwrap().history().is_empty());
}
