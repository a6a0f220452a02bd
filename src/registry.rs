use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::RegistryError;
use crate::flow::{NodeInput, NodeType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    /// Steps that talk to an external provider (WhatsApp, assistants).
    App,
    /// Flow control handled by the runtime itself.
    Internal,
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionCategory::App => f.pad("app"),
            ActionCategory::Internal => f.pad("internal"),
        }
    }
}

impl std::str::FromStr for ActionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "app" => Ok(ActionCategory::App),
            "internal" => Ok(ActionCategory::Internal),
            other => Err(format!("unknown action category `{other}`")),
        }
    }
}

/// One catalog entry. Only used to seed new nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ActionDefinition {
    pub id: String,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: NodeType,
    pub category: ActionCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    /// Default payload. May carry the reserved keys the factory routes elsewhere.
    #[serde(default)]
    pub config: Map<String, Value>,
    pub icon: String,
    pub color: String,
}

type LookupKey = (ActionCategory, Option<String>, String);

/// Read-only catalog keyed by `(category, subcategory, key)`.
#[derive(Debug, Clone)]
pub struct ActionDefinitionRegistry {
    definitions: Vec<ActionDefinition>,
    by_key: HashMap<LookupKey, usize>,
    by_id: HashMap<String, usize>,
}

static BUILTIN: Lazy<ActionDefinitionRegistry> = Lazy::new(|| {
    ActionDefinitionRegistry::new(builtin_definitions())
        .unwrap_or_else(|err| panic!("builtin action catalog is inconsistent: {err}"))
});

impl ActionDefinitionRegistry {
    pub fn new(definitions: Vec<ActionDefinition>) -> Result<Self, RegistryError> {
        let mut by_key = HashMap::with_capacity(definitions.len());
        let mut by_id = HashMap::with_capacity(definitions.len());
        for (idx, def) in definitions.iter().enumerate() {
            let key = (def.category, def.subcategory.clone(), def.key.clone());
            if by_key.insert(key, idx).is_some() || by_id.insert(def.id.clone(), idx).is_some() {
                return Err(RegistryError::DuplicateDefinition(def.id.clone()));
            }
            if let Some(input) = def.config.get("input") {
                serde_json::from_value::<NodeInput>(input.clone()).map_err(|err| {
                    RegistryError::InvalidInput {
                        id: def.id.clone(),
                        reason: err.to_string(),
                    }
                })?;
            }
        }
        Ok(Self {
            definitions,
            by_key,
            by_id,
        })
    }

    /// The catalog that ships with the editor.
    pub fn builtin() -> &'static ActionDefinitionRegistry {
        &BUILTIN
    }

    pub fn lookup(
        &self,
        category: ActionCategory,
        subcategory: Option<&str>,
        key: &str,
    ) -> Result<&ActionDefinition, RegistryError> {
        let lookup = (category, subcategory.map(str::to_string), key.to_string());
        self.by_key
            .get(&lookup)
            .map(|&idx| &self.definitions[idx])
            .ok_or_else(|| RegistryError::DefinitionNotFound {
                category,
                subcategory: subcategory.map(str::to_string),
                key: key.to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Option<&ActionDefinition> {
        self.by_id.get(id).map(|&idx| &self.definitions[idx])
    }

    pub fn list_by_category(&self, category: ActionCategory) -> Vec<&ActionDefinition> {
        self.definitions
            .iter()
            .filter(|d| d.category == category)
            .collect()
    }

    pub fn all_definitions(&self) -> &[ActionDefinition] {
        &self.definitions
    }

    /// Case-insensitive match for the add-node menu.
    pub fn search(&self, query: &str) -> Vec<&ActionDefinition> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.definitions.iter().collect();
        }
        self.definitions
            .iter()
            .filter(|d| {
                d.id.to_lowercase().contains(&needle)
                    || d.name.to_lowercase().contains(&needle)
                    || d.key.to_lowercase().contains(&needle)
                    || d
                        .subcategory
                        .as_deref()
                        .is_some_and(|s| s.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn definition(
    category: ActionCategory,
    subcategory: Option<&str>,
    key: &str,
    kind: NodeType,
    name: &str,
    description: &str,
    icon: &str,
    color: &str,
    config: Value,
) -> ActionDefinition {
    let id = match subcategory {
        Some(sub) => format!("{sub}_{key}"),
        None => key.to_string(),
    };
    let config = match config {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ActionDefinition {
        id,
        key: key.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        kind,
        category,
        subcategory: subcategory.map(str::to_string),
        config,
        icon: icon.to_string(),
        color: color.to_string(),
    }
}

const WHATSAPP_GREEN: &str = "#25D366";
const ASSISTANT_PURPLE: &str = "#8B5CF6";
const INTERNAL_SLATE: &str = "#64748B";

fn builtin_definitions() -> Vec<ActionDefinition> {
    use ActionCategory::{App, Internal};

    vec![
        definition(
            App,
            Some("whatsapp"),
            "incoming_message",
            NodeType::Trigger,
            "Incoming message",
            "Starts the flow when a WhatsApp message arrives",
            "message-square",
            WHATSAPP_GREEN,
            json!({"type": "trigger", "instance": "", "keyword": "", "output": {"message": "", "from": ""}}),
        ),
        definition(
            App,
            Some("whatsapp"),
            "send_message",
            NodeType::Action,
            "Send message",
            "Sends a text message",
            "message-circle",
            WHATSAPP_GREEN,
            json!({"type": "action", "message": "", "to": ""}),
        ),
        definition(
            App,
            Some("whatsapp"),
            "send_media",
            NodeType::Action,
            "Send media",
            "Sends an image, document or audio file",
            "image",
            WHATSAPP_GREEN,
            json!({"to": "", "mediaType": "image", "url": "", "caption": ""}),
        ),
        definition(
            App,
            Some("whatsapp"),
            "send_template",
            NodeType::Action,
            "Send template",
            "Sends an approved message template",
            "layout-template",
            WHATSAPP_GREEN,
            json!({"to": "", "template": "", "language": "pt_BR", "parameters": []}),
        ),
        definition(
            App,
            Some("assistant"),
            "ask_assistant",
            NodeType::Action,
            "Ask assistant",
            "Sends the conversation to an AI assistant and stores the reply",
            "bot",
            ASSISTANT_PURPLE,
            json!({
                "prompt": "",
                "instance": "",
                "input": {"variables": []},
                "output": {"response": ""},
                "credentials": {"provider": "assistant"}
            }),
        ),
        definition(
            App,
            Some("assistant"),
            "classify_intent",
            NodeType::Action,
            "Classify intent",
            "Maps the last message to one of a set of intents",
            "tags",
            ASSISTANT_PURPLE,
            json!({"instance": "", "intents": [], "output": {"intent": ""}}),
        ),
        definition(
            Internal,
            None,
            "start",
            NodeType::Trigger,
            "Start",
            "Entry point of the flow",
            "play",
            INTERNAL_SLATE,
            json!({}),
        ),
        definition(
            Internal,
            None,
            "delay",
            NodeType::Action,
            "Delay",
            "Waits before running the next step",
            "clock",
            INTERNAL_SLATE,
            json!({"duration": 5, "unit": "seconds"}),
        ),
        definition(
            Internal,
            None,
            "condition",
            NodeType::Condition,
            "Condition",
            "Routes to the true or false branch",
            "git-branch",
            "#F59E0B",
            json!({"type": "condition", "config": {"variable": "", "operator": "equals", "value": ""}}),
        ),
        definition(
            Internal,
            None,
            "user_input",
            NodeType::Input,
            "User input",
            "Asks a question and waits for the answer",
            "text-cursor-input",
            "#0EA5E9",
            json!({"question": "", "variable": "", "timeout": 300, "input": {"variables": []}}),
        ),
        definition(
            Internal,
            None,
            "stop_flow",
            NodeType::Action,
            "End flow",
            "Stops the conversation",
            "square",
            INTERNAL_SLATE,
            json!({"reason": ""}),
        ),
        definition(
            Internal,
            None,
            "error_handler",
            NodeType::Error,
            "On error",
            "Runs when a step fails",
            "alert-triangle",
            "#EF4444",
            json!({"message": "", "notify": false}),
        ),
    ]
}
