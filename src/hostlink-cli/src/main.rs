use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hostlink_core::{init_logging, AppDirs, Config};
use hostlink_plugin::{
    DefaultTransportFactory, DirectoryCatalog, EntryPointRegistry, Envelope, FieldValue,
    FileSettingsStore, Plugin, PluginRegistry, Reply,
};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "hostlink", version, about = "Plugin connection supervisor")]
struct Cli {
    /// Plugin manifest directory (takes precedence over config)
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover plugins and show their connection state
    Plugins,
    /// Send one envelope to a plugin and print the reply
    Send(SendCommand),
    /// Enable a plugin and persist the choice
    Enable {
        /// Plugin id, entry point or name
        plugin: String,
    },
    /// Disable a plugin and persist the choice
    Disable {
        /// Plugin id, entry point or name
        plugin: String,
    },
    /// Stream connection state changes as JSON lines
    Watch {
        /// Stop after this many seconds (runs until interrupted otherwise)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Debug, Parser, Clone)]
struct SendCommand {
    /// Plugin id, entry point or name
    plugin: String,
    /// Action name of the envelope
    action: String,
    /// Origin of the envelope
    #[arg(long)]
    origin: Option<String>,
    /// Target of the envelope
    #[arg(long)]
    target: Option<String>,
    /// Envelope field as key=value (repeatable)
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, FieldValue)>,
}

impl SendCommand {
    fn envelope(&self) -> Envelope {
        let mut envelope = Envelope::new(self.action.clone());
        if let Some(origin) = &self.origin {
            envelope = envelope.with_origin(origin.clone());
        }
        if let Some(target) = &self.target {
            envelope = envelope.with_target(target.clone());
        }
        for (key, value) in &self.fields {
            envelope = envelope.with_field(key.clone(), value.clone());
        }
        envelope
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ArgError {
    #[error("field must be key=value, got '{0}'")]
    MalformedField(String),
    #[error("field key must not be empty")]
    EmptyKey,
    #[error("no plugin matches '{0}'")]
    UnknownPlugin(String),
    #[error("'{query}' is ambiguous: {candidates}")]
    AmbiguousPlugin { query: String, candidates: String },
}

/// `true`/`false` become booleans, numbers become ints or floats, and a comma-separated
/// value in brackets becomes a list. Anything else is text.
fn parse_field(raw: &str) -> Result<(String, FieldValue), ArgError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ArgError::MalformedField(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ArgError::EmptyKey);
    }
    Ok((key.to_string(), parse_value(value)))
}

fn parse_value(value: &str) -> FieldValue {
    if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let items = inner
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect();
        return FieldValue::List(items);
    }
    match value {
        "true" => return FieldValue::Bool(true),
        "false" => return FieldValue::Bool(false),
        _ => {}
    }
    if let Ok(int) = value.parse::<i64>() {
        return FieldValue::Int(int);
    }
    if let Ok(float) = value.parse::<f64>() {
        if float.is_finite() {
            return FieldValue::Float(float);
        }
    }
    FieldValue::Text(value.to_string())
}

/// Exact id or entry point first, then a unique id prefix, then a case-insensitive name.
fn resolve_plugin(plugins: &[Arc<Plugin>], query: &str) -> Result<Arc<Plugin>, ArgError> {
    let exact: Vec<_> = plugins
        .iter()
        .filter(|p| p.id().as_str() == query || p.descriptor().entry_point == query)
        .collect();
    let by_prefix: Vec<_> = plugins
        .iter()
        .filter(|p| p.id().as_str().starts_with(query))
        .collect();
    let by_name: Vec<_> = plugins
        .iter()
        .filter(|p| p.name().eq_ignore_ascii_case(query))
        .collect();

    for candidates in [exact, by_prefix, by_name] {
        match candidates.as_slice() {
            [] => continue,
            [plugin] => return Ok(Arc::clone(plugin)),
            many => {
                return Err(ArgError::AmbiguousPlugin {
                    query: query.to_string(),
                    candidates: many
                        .iter()
                        .map(|p| format!("{} ({})", p.name(), short_id(p)))
                        .collect::<Vec<_>>()
                        .join(", "),
                })
            }
        }
    }
    Err(ArgError::UnknownPlugin(query.to_string()))
}

fn short_id(plugin: &Plugin) -> &str {
    let id = plugin.id().as_str();
    id.get(..12).unwrap_or(id)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    let plugins_dir = cli
        .plugins_dir
        .clone()
        .unwrap_or_else(|| config.catalog.resolve_plugins_dir(&dirs));
    let settings = FileSettingsStore::open(dirs.plugin_settings_path())?;
    let factory =
        DefaultTransportFactory::from_config(Arc::new(EntryPointRegistry::new()), &config.supervisor);
    let registry = PluginRegistry::new(
        Arc::new(DirectoryCatalog::new(&plugins_dir, config.catalog.max_entries)),
        Arc::new(factory),
        Arc::new(settings),
        &config.supervisor,
    );
    tracing::info!(plugins_dir = %plugins_dir.display(), "starting hostlink");

    let outcome = run(cli.command, &registry);
    registry.shutdown();
    outcome
}

fn run(command: Command, registry: &PluginRegistry) -> Result<()> {
    match command {
        Command::Plugins => {
            registry.discover()?;
            print_plugins(registry);
        }
        Command::Send(send) => {
            registry.discover()?;
            registry.notify_launched();
            let plugin = resolve_plugin(&registry.plugins(), &send.plugin)?;
            let envelope = send.envelope();
            match registry.send(plugin.id(), &envelope)? {
                Reply::Response(reply) => {
                    println!("{}", serde_json::to_string_pretty(&reply)?);
                    let history = plugin.history();
                    println!(
                        "round trip: average {:?}, worst {:?}",
                        history.average(),
                        history.worst()
                    );
                }
                Reply::Accepted => println!("{} accepted '{}'", plugin.name(), envelope.action),
                Reply::Dispatched => println!("dispatched to {} (no reply expected)", plugin.name()),
                Reply::TimedOut => bail!("{} did not answer '{}' in time", plugin.name(), envelope.action),
            }
        }
        Command::Enable { plugin } => toggle(registry, &plugin, true)?,
        Command::Disable { plugin } => toggle(registry, &plugin, false)?,
        Command::Watch { seconds } => {
            let events = registry.state_events();
            let count = registry.discover()?;
            tracing::info!(count, "watching plugin connections");
            let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
            loop {
                let wait = match deadline {
                    Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                        Some(left) => left,
                        None => break,
                    },
                    None => Duration::from_secs(3600),
                };
                match events.recv_timeout(wait) {
                    Ok(event) => println!("{}", serde_json::to_string(&event)?),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }
    Ok(())
}

fn toggle(registry: &PluginRegistry, query: &str, enabled: bool) -> Result<()> {
    registry.discover()?;
    let plugin = resolve_plugin(&registry.plugins(), query)?;
    registry.set_enabled(plugin.id(), enabled)?;
    println!(
        "{} is now {} ({})",
        plugin.name(),
        if enabled { "enabled" } else { "disabled" },
        plugin.state()
    );
    Ok(())
}

fn print_plugins(registry: &PluginRegistry) {
    let plugins = registry.plugins();
    if plugins.is_empty() {
        println!("No plugins installed. Add manifests to the plugins directory.");
        return;
    }

    for plugin in plugins {
        let descriptor = plugin.descriptor();
        let marker = if plugin.is_enabled() { "" } else { " (disabled)" };
        println!("{} [{}]{}", plugin.name(), short_id(&plugin), marker);
        println!("  package:   {} {}", descriptor.package, descriptor.version);
        println!("  transport: {}", plugin.transport_kind());
        match plugin.current_error() {
            Some(error) => println!("  state:     {} ({error})", plugin.state()),
            None => println!("  state:     {}", plugin.state()),
        }
        if !descriptor.profiles.is_empty() {
            println!("  profiles:  {}", descriptor.profiles.join(", "));
        }
    }
}
