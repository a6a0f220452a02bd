use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::flow::{Node, NodeData, NodeInput, Position};
use crate::registry::{ActionCategory, ActionDefinition, ActionDefinitionRegistry};

/// Definition-config keys that have their own slot on the node.
pub const RESERVED_CONFIG_KEYS: [&str; 5] = ["type", "input", "output", "credentials", "config"];

static NODE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Pan offset and zoom of the canvas as seen on screen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ViewportTransform {
    pub pan: Position,
    pub zoom: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self {
            pan: Position::default(),
            zoom: 1.0,
            width: 1280.0,
            height: 720.0,
        }
    }
}

impl ViewportTransform {
    pub fn new(pan: Position, zoom: f64, width: f64, height: f64) -> Self {
        Self {
            pan,
            zoom,
            width,
            height,
        }
    }

    fn effective_zoom(&self) -> f64 {
        if self.zoom.is_finite() && self.zoom > 0.0 {
            self.zoom
        } else {
            1.0
        }
    }

    pub fn screen_center(&self) -> Position {
        Position::new(self.width / 2.0, self.height / 2.0)
    }

    /// Screen point to canvas point: `(screen - pan) / zoom`.
    pub fn to_canvas(&self, screen: Position) -> Position {
        let zoom = self.effective_zoom();
        Position::new(
            (screen.x - self.pan.x) / zoom,
            (screen.y - self.pan.y) / zoom,
        )
    }
}

/// Turns catalog entries into concrete nodes. Inserting them is the session's job.
pub struct NodeFactory;

impl NodeFactory {
    pub fn create(
        definition: &ActionDefinition,
        position: Option<Position>,
        viewport: &ViewportTransform,
    ) -> Node {
        let position = position.unwrap_or_else(|| viewport.to_canvas(viewport.screen_center()));
        let id = Self::next_id(&definition.id);
        debug!(node_id = %id, definition = %definition.id, x = position.x, y = position.y, "creating node");

        Node {
            id,
            kind: definition.kind,
            position,
            data: Self::seed_data(definition),
            extra: Map::new(),
        }
    }

    pub fn create_from_registry(
        registry: &ActionDefinitionRegistry,
        category: ActionCategory,
        subcategory: Option<&str>,
        key: &str,
        position: Option<Position>,
        viewport: &ViewportTransform,
    ) -> Result<Node, RegistryError> {
        let definition = registry.lookup(category, subcategory, key).inspect_err(|err| {
            warn!(%err, "node creation aborted");
        })?;
        Ok(Self::create(definition, position, viewport))
    }

    /// `{definition}-{unix millis}-{sequence}-{random}`. The sequence keeps ids apart when
    /// the clock does not move between two creations.
    fn next_id(definition_id: &str) -> String {
        let millis = Utc::now().timestamp_millis();
        let seq = NODE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("{definition_id}-{millis}-{seq}-{}", &random[..6])
    }

    fn seed_data(definition: &ActionDefinition) -> NodeData {
        let defaults = &definition.config;

        let mut config: Map<String, Value> = defaults
            .iter()
            .filter(|(key, _)| !RESERVED_CONFIG_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if let Some(Value::Object(nested)) = defaults.get("config") {
            config.extend(nested.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let input = defaults.get("input").and_then(|v| {
            serde_json::from_value::<NodeInput>(v.clone())
                .inspect_err(|err| {
                    warn!(definition = %definition.id, %err, "input default ignored");
                })
                .ok()
        });
        let output = match defaults.get("output") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };

        NodeData {
            name: definition.name.clone(),
            label: definition.name.clone(),
            icon: definition.icon.clone(),
            color: definition.color.clone(),
            config,
            input,
            output,
            credentials: defaults.get("credentials").cloned(),
            stop: None,
            extra: Map::new(),
        }
    }
}
