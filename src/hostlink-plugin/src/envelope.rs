//! The message unit exchanged between the host and a plugin.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Actions the host sends to plugins about its own lifecycle.
pub mod actions {
    pub const MANAGER_LAUNCHED: &str = "manager.launched";
    pub const MANAGER_TERMINATED: &str = "manager.terminated";
    pub const PLUGIN_ENABLED: &str = "plugin.enabled";
    pub const PLUGIN_DISABLED: &str = "plugin.disabled";
    pub const PLUGIN_RESET: &str = "plugin.reset";
    pub const TRANSMIT_DISCONNECT: &str = "event.transmit_disconnect";
}

/// Field carrying the recipient plugin id on lifecycle envelopes.
pub const FIELD_PLUGIN_ID: &str = "plugin_id";
/// Field carrying the origin of a dropped event channel.
pub const FIELD_ORIGIN: &str = "origin";

/// A single typed value in an envelope's flat field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

/// A named action plus a flat set of typed fields.
///
/// Envelopes are plain values: every send clones or builds its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Envelope {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            origin: None,
            target: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(FieldValue::as_str)
    }

    /// Short description used to identify the message in communication statistics.
    pub fn signature(&self) -> String {
        match &self.target {
            Some(target) => format!("{} {}", self.action, target),
            None => self.action.clone(),
        }
    }
}
