//! Static identity and capability record of a discovered plugin.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Stable plugin identifier derived from package and entry-point identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Hashes `package` and `entry_point` so the id survives reinstalls and restarts.
    pub fn derive(package: &str, entry_point: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(package.as_bytes());
        hasher.update(entry_point.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which transport strategy reaches a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Plugin code living in the host process.
    InProcess,
    /// Separate process reached over a request/response channel.
    Ipc,
    /// One-way delivery without acknowledgement.
    Broadcast,
    /// Plugin code constructed in-process on connect from a registered constructor.
    Direct,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::InProcess => "in_process",
            TransportKind::Ipc => "ipc",
            TransportKind::Broadcast => "broadcast",
            TransportKind::Direct => "direct",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to start a plugin that lives in its own executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Path to the plugin executable.
    pub executable: PathBuf,
    /// Arguments to pass to the plugin.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the plugin process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set for the plugin.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Immutable description of one discovered plugin.
///
/// A re-discovered plugin with different content gets a new descriptor; descriptors are
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub name: String,
    pub package: String,
    pub entry_point: String,
    pub version: String,
    pub sdk_version: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub provider_authorities: Vec<String>,
    pub transport: TransportKind,
    /// Identity of the capability declaration. Components of one package that share it
    /// are the same plugin exposed twice.
    pub manifest_id: String,
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
}

impl PluginDescriptor {
    /// Starts a descriptor with the id derived from `package` and `entry_point`.
    pub fn builder(
        package: impl Into<String>,
        entry_point: impl Into<String>,
        transport: TransportKind,
    ) -> DescriptorBuilder {
        let package = package.into();
        let entry_point = entry_point.into();
        DescriptorBuilder {
            descriptor: PluginDescriptor {
                id: PluginId::derive(&package, &entry_point),
                name: entry_point.clone(),
                manifest_id: entry_point.clone(),
                package,
                entry_point,
                version: "0.0.0".to_string(),
                sdk_version: DEFAULT_SDK_VERSION.to_string(),
                icon: None,
                profiles: Vec::new(),
                provider_authorities: Vec::new(),
                transport,
                launch: None,
            },
        }
    }

    /// Case-insensitive profile lookup.
    pub fn supports_profile(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p.eq_ignore_ascii_case(profile))
    }

    pub fn has_provider_authority(&self, authority: &str) -> bool {
        self.provider_authorities.iter().any(|a| a == authority)
    }
}

/// SDK compatibility version assumed when a plugin does not declare one.
pub const DEFAULT_SDK_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    descriptor: PluginDescriptor,
}

impl DescriptorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.descriptor.version = version.into();
        self
    }

    pub fn sdk_version(mut self, sdk_version: impl Into<String>) -> Self {
        self.descriptor.sdk_version = sdk_version.into();
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.descriptor.icon = Some(icon.into());
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.descriptor.profiles.push(profile.into());
        self
    }

    pub fn provider_authority(mut self, authority: impl Into<String>) -> Self {
        self.descriptor.provider_authorities.push(authority.into());
        self
    }

    pub fn manifest_id(mut self, manifest_id: impl Into<String>) -> Self {
        self.descriptor.manifest_id = manifest_id.into();
        self
    }

    pub fn launch(mut self, launch: LaunchSpec) -> Self {
        self.descriptor.launch = Some(launch);
        self
    }

    pub fn build(self) -> PluginDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_and_distinguishes_entry_points() {
        let a = PluginId::derive("org.example.hue", "HueService");
        let b = PluginId::derive("org.example.hue", "HueService");
        let c = PluginId::derive("org.example.hue", "HueReceiver");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn profile_lookup_ignores_case() {
        let descriptor = PluginDescriptor::builder("pkg", "Entry", TransportKind::Ipc)
            .profile("mediaPlayer")
            .provider_authority("pkg.files")
            .build();
        assert!(descriptor.supports_profile("MEDIAPLAYER"));
        assert!(!descriptor.supports_profile("camera"));
        assert!(descriptor.has_provider_authority("pkg.files"));
        assert!(!descriptor.has_provider_authority("PKG.FILES"));
    }

    #[test]
    fn builder_defaults_manifest_to_entry_point() {
        let descriptor = PluginDescriptor::builder("pkg", "Entry", TransportKind::Broadcast).build();
        assert_eq!(descriptor.manifest_id, "Entry");
        assert_eq!(descriptor.sdk_version, DEFAULT_SDK_VERSION);
        assert_eq!(descriptor.id, PluginId::derive("pkg", "Entry"));
    }
}
