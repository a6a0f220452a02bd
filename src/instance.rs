//! Provider instances stored in `settings.instances`.
//!
//! An instance is a named credential bundle for one provider (a WhatsApp number, an
//! assistant). Names are unique per provider, not globally. Bulk merges only ever append
//! instances that are new by `(name, provider)`; changing an existing instance goes
//! through [`InstanceSettingsManager::replace_at`].

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{FlowError, FlowResult};
use crate::util::whole_number;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub credencias: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    pub fn new(name: impl Into<String>, credencias: Credentials) -> Self {
        Self {
            name: name.into(),
            credencias,
            status: None,
            last_connected: None,
            extra: Map::new(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.credencias.provider()
    }

    /// The identity used by merges and uniqueness checks.
    pub fn key(&self) -> (&str, Provider) {
        (self.name.as_str(), self.provider())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Whatsapp,
    Assistant,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Whatsapp => f.pad("whatsapp"),
            Provider::Assistant => f.pad("assistant"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whatsapp" => Ok(Provider::Whatsapp),
            "assistant" => Ok(Provider::Assistant),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Inactive,
    Connecting,
    Error,
}

/// Credentials, tagged by `provider` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum Credentials {
    Whatsapp(WhatsAppCredentials),
    Assistant(AssistantCredentials),
}

impl Credentials {
    pub fn provider(&self) -> Provider {
        match self {
            Credentials::Whatsapp(_) => Provider::Whatsapp,
            Credentials::Assistant(_) => Provider::Assistant,
        }
    }

    /// The blank credential shape shown when a provider is picked.
    pub fn defaults(provider: Provider) -> Self {
        match provider {
            Provider::Whatsapp => Credentials::Whatsapp(WhatsAppCredentials::default()),
            Provider::Assistant => Credentials::Assistant(AssistantCredentials::default()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppCredentials {
    #[serde(default)]
    pub api_key: String,
    /// Sender phone number.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub webhook: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AssistantCredentials {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub idassistente: String,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ModelSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_temperature", serialize_with = "whole_number")]
    #[schemars(with = "f64")]
    pub temperature: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "gpt-4o-mini".to_string(),
            temperature: default_temperature(),
        }
    }
}

fn default_temperature() -> f64 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemorySettings {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Hours the conversation memory is kept.
    #[serde(default = "default_retention")]
    pub retention_period: u32,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            retention_period: default_retention(),
        }
    }
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_retention() -> u32 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `current` followed by every `incoming` instance whose `(name, provider)` is not yet
/// present. Existing entries are never overwritten, and repeated merges of the same
/// incoming set add nothing.
pub fn merge_instances(current: &[Instance], incoming: &[Instance]) -> Vec<Instance> {
    let mut merged = current.to_vec();
    for candidate in incoming {
        if merged.iter().any(|existing| existing.key() == candidate.key()) {
            debug!(name = %candidate.name, provider = %candidate.provider(), "instance already present, skipping");
            continue;
        }
        merged.push(candidate.clone());
    }
    merged
}

/// Editing operations over one `settings.instances` list.
pub struct InstanceSettingsManager<'a> {
    instances: &'a mut Vec<Instance>,
}

impl<'a> InstanceSettingsManager<'a> {
    pub fn new(instances: &'a mut Vec<Instance>) -> Self {
        Self { instances }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances[..]
    }

    pub fn merge(&mut self, incoming: &[Instance]) {
        *self.instances = merge_instances(&self.instances[..], incoming);
    }

    /// Appends one instance, refusing a second one with the same name and provider.
    pub fn add(&mut self, instance: Instance) -> FlowResult<()> {
        if self.instances.iter().any(|i| i.key() == instance.key()) {
            let provider = instance.provider().to_string();
            return Err(FlowError::DuplicateInstance {
                name: instance.name,
                provider,
            });
        }
        self.instances.push(instance);
        Ok(())
    }

    pub fn replace_at(&mut self, index: usize, instance: Instance) -> FlowResult<()> {
        self.check_index(index)?;
        let clash = self
            .instances
            .iter()
            .enumerate()
            .any(|(i, other)| i != index && other.key() == instance.key());
        if clash {
            let provider = instance.provider().to_string();
            return Err(FlowError::DuplicateInstance {
                name: instance.name,
                provider,
            });
        }
        self.instances[index] = instance;
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> FlowResult<Instance> {
        self.check_index(index)?;
        Ok(self.instances.remove(index))
    }

    /// Swaps the credential block for the provider's defaults. Only the name survives.
    pub fn change_provider(&mut self, index: usize, provider: Provider) -> FlowResult<()> {
        self.check_index(index)?;
        let name = self.instances[index].name.clone();
        let clash = self
            .instances
            .iter()
            .enumerate()
            .any(|(i, other)| i != index && other.key() == (name.as_str(), provider));
        if clash {
            return Err(FlowError::DuplicateInstance {
                name,
                provider: provider.to_string(),
            });
        }
        self.instances[index] = Instance::new(name, Credentials::defaults(provider));
        Ok(())
    }

    fn check_index(&self, index: usize) -> FlowResult<()> {
        if index < self.instances.len() {
            Ok(())
        } else {
            Err(FlowError::InstanceIndexOutOfRange {
                index,
                len: self.instances.len(),
            })
        }
    }
}
