//! Sources of plugin descriptors.
//!
//! The supervisor only consumes descriptors. [`DirectoryCatalog`] reads one TOML manifest
//! per package:
//!
//! ```toml
//! package = "org.example.echo"
//! name = "Echo"
//! version = "1.2.0"
//!
//! [[component]]
//! entry_point = "EchoService"
//! transport = "ipc"
//! manifest = "echo"
//! profiles = ["echo"]
//! executable = "bin/echo-plugin"
//! ```

use crate::descriptor::{LaunchSpec, PluginDescriptor, TransportKind, DEFAULT_SDK_VERSION};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog holds {found} entries, more than the limit of {limit}")]
    TooManyEntries { found: usize, limit: usize },
    #[error("failed to read plugin catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse plugin manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("package {0} is not installed")]
    PackageNotFound(String),
}

/// Change notification from the platform's package inventory, keyed by package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    Added(String),
    Removed(String),
    Changed(String),
}

pub trait PluginCatalog: Send + Sync {
    /// Every descriptor currently installed.
    fn list_installed(&self) -> Result<Vec<PluginDescriptor>, CatalogError>;

    /// Descriptors of one package; [`CatalogError::PackageNotFound`] if it is gone.
    fn list_package(&self, package: &str) -> Result<Vec<PluginDescriptor>, CatalogError>;
}

/// In-memory catalog, for embedding hosts that know their plugins up front.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    descriptors: RwLock<Vec<PluginDescriptor>>,
    max_entries: Option<usize>,
}

impl StaticCatalog {
    pub fn new(descriptors: Vec<PluginDescriptor>) -> Self {
        Self {
            descriptors: RwLock::new(descriptors),
            max_entries: None,
        }
    }

    pub fn with_max_entries(mut self, limit: usize) -> Self {
        self.max_entries = Some(limit);
        self
    }

    pub fn add(&self, descriptor: PluginDescriptor) {
        let mut descriptors = self.descriptors.write().unwrap_or_else(PoisonError::into_inner);
        descriptors.retain(|d| d.id != descriptor.id);
        descriptors.push(descriptor);
    }

    pub fn remove_package(&self, package: &str) {
        self.descriptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|d| d.package != package);
    }

    pub fn set(&self, descriptors: Vec<PluginDescriptor>) {
        *self.descriptors.write().unwrap_or_else(PoisonError::into_inner) = descriptors;
    }
}

impl PluginCatalog for StaticCatalog {
    fn list_installed(&self) -> Result<Vec<PluginDescriptor>, CatalogError> {
        let descriptors = self.descriptors.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = self.max_entries {
            if descriptors.len() > limit {
                return Err(CatalogError::TooManyEntries {
                    found: descriptors.len(),
                    limit,
                });
            }
        }
        Ok(descriptors.clone())
    }

    fn list_package(&self, package: &str) -> Result<Vec<PluginDescriptor>, CatalogError> {
        let found: Vec<_> = self
            .descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| d.package == package)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(CatalogError::PackageNotFound(package.to_string()));
        }
        Ok(found)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    package: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "default_sdk_version")]
    sdk_version: String,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    provider_authorities: Vec<String>,
    #[serde(default, rename = "component")]
    components: Vec<ComponentManifest>,
}

#[derive(Debug, Deserialize)]
struct ComponentManifest {
    entry_point: String,
    transport: TransportKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    manifest: Option<String>,
    #[serde(default)]
    profiles: Vec<String>,
    #[serde(default)]
    executable: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_sdk_version() -> String {
    DEFAULT_SDK_VERSION.to_string()
}

impl Manifest {
    fn into_descriptors(self, base_dir: &Path) -> Vec<PluginDescriptor> {
        let Manifest {
            package,
            name,
            version,
            sdk_version,
            icon,
            provider_authorities,
            components,
        } = self;

        components
            .into_iter()
            .map(|component| {
                let mut builder = PluginDescriptor::builder(
                    package.clone(),
                    component.entry_point.clone(),
                    component.transport,
                )
                .version(version.clone())
                .sdk_version(sdk_version.clone());
                if let Some(name) = component.name.or_else(|| name.clone()) {
                    builder = builder.name(name);
                }
                if let Some(manifest) = component.manifest {
                    builder = builder.manifest_id(manifest);
                }
                if let Some(ref icon) = icon {
                    builder = builder.icon(icon.clone());
                }
                for profile in component.profiles {
                    builder = builder.profile(profile);
                }
                for authority in &provider_authorities {
                    builder = builder.provider_authority(authority.clone());
                }
                if let Some(executable) = component.executable {
                    let executable = resolve(base_dir, executable);
                    let mut launch = LaunchSpec::new(executable).with_args(component.args);
                    launch.working_dir = component.working_dir.map(|dir| resolve(base_dir, dir));
                    launch.env = component.env.into_iter().collect();
                    builder = builder.launch(launch);
                }
                builder.build()
            })
            .collect()
    }
}

/// Relative paths with a directory component are taken relative to the manifest; bare
/// command names are left for `PATH` lookup.
fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() && path.components().count() > 1 {
        base_dir.join(path)
    } else {
        path
    }
}

/// Catalog backed by a directory of `*.toml` manifests.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
    max_entries: usize,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            dir: dir.into(),
            max_entries,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_paths(&self) -> Result<Vec<PathBuf>, CatalogError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %self.dir.display(), "plugin directory does not exist");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CatalogError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        if paths.len() > self.max_entries {
            return Err(CatalogError::TooManyEntries {
                found: paths.len(),
                limit: self.max_entries,
            });
        }
        paths.sort();
        Ok(paths)
    }

    fn load(path: &Path) -> Result<Manifest, CatalogError> {
        let contents = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn manifests(&self) -> Result<Vec<(PathBuf, Manifest)>, CatalogError> {
        let mut manifests = Vec::new();
        for path in self.manifest_paths()? {
            match Self::load(&path) {
                Ok(manifest) => manifests.push((path, manifest)),
                Err(err) => tracing::warn!(error = %err, "skipping plugin manifest"),
            }
        }
        Ok(manifests)
    }
}

impl PluginCatalog for DirectoryCatalog {
    fn list_installed(&self) -> Result<Vec<PluginDescriptor>, CatalogError> {
        let mut descriptors = Vec::new();
        for (path, manifest) in self.manifests()? {
            let base = path.parent().unwrap_or(&self.dir).to_path_buf();
            descriptors.extend(manifest.into_descriptors(&base));
        }
        tracing::debug!(
            dir = %self.dir.display(),
            count = descriptors.len(),
            "listed installed plugins"
        );
        Ok(descriptors)
    }

    fn list_package(&self, package: &str) -> Result<Vec<PluginDescriptor>, CatalogError> {
        let descriptors: Vec<_> = self
            .manifests()?
            .into_iter()
            .filter(|(_, manifest)| manifest.package == package)
            .flat_map(|(path, manifest)| {
                let base = path.parent().unwrap_or(&self.dir).to_path_buf();
                manifest.into_descriptors(&base)
            })
            .collect();
        if descriptors.is_empty() {
            return Err(CatalogError::PackageNotFound(package.to_string()));
        }
        Ok(descriptors)
    }
}
