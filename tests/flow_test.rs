// tests/flow_test.rs
use std::time::Duration;

use flow_studio::config::{ConfigManager, MapConfigManager, SAVE_DEBOUNCE_MS, SessionConfig};
use flow_studio::factory::{NodeFactory, ViewportTransform};
use flow_studio::flow::manager::FlowManager;
use flow_studio::flow::session::{FlowEditingSession, SessionEvent, SessionStatus};
use flow_studio::flow::store::{FileFlowStore, FlowStore, FlowUpdate, InMemoryFlowStore, NewFlow};
use flow_studio::flow::{Connection, Edge, FlowData, Node, NodeData, NodeType, Position};
use flow_studio::instance::{Credentials, Instance, Provider, WhatsAppCredentials, merge_instances};
use flow_studio::registry::{ActionCategory, ActionDefinitionRegistry};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

fn whatsapp(name: &str, api_key: &str) -> Instance {
    Instance::new(
        name,
        Credentials::Whatsapp(WhatsAppCredentials {
            api_key: api_key.to_string(),
            ..Default::default()
        }),
    )
}

fn plain_node(id: &str) -> Node {
    Node {
        id: id.to_string(),
        kind: NodeType::Action,
        position: Position::default(),
        data: NodeData::default(),
        extra: Map::new(),
    }
}

async fn file_manager(debounce_ms: &str) -> (TempDir, FlowManager) {
    let dir = TempDir::new().unwrap();
    let store = FileFlowStore::open(dir.path().join("flows")).await.unwrap();
    let config = ConfigManager(MapConfigManager::new().with(SAVE_DEBOUNCE_MS, debounce_ms));
    let manager = FlowManager::new(store, SessionConfig::from_config(&config).await);
    (dir, manager)
}

#[test]
fn test_factory_seeds_send_message() {
    let def = ActionDefinitionRegistry::builtin()
        .lookup(ActionCategory::App, Some("whatsapp"), "send_message")
        .unwrap();
    let node = NodeFactory::create(def, Some(Position::new(10.0, 20.0)), &ViewportTransform::default());

    assert_eq!(node.position, Position::new(10.0, 20.0));
    assert_eq!(Value::Object(node.data.config.clone()), json!({"message": "", "to": ""}));
    assert!(!node.data.config.contains_key("type"));
}

#[tokio::test]
async fn test_delete_node_cascades_to_edges() {
    let store = InMemoryFlowStore::new();
    let flow = store
        .create_flow(NewFlow {
            data: FlowData {
                nodes: vec![plain_node("A"), plain_node("B")],
                edges: vec![Edge {
                    id: "e1".into(),
                    source: "A".into(),
                    target: "B".into(),
                    source_handle: None,
                    target_handle: None,
                    extra: Map::new(),
                }],
                ..Default::default()
            },
            ..NewFlow::named("two nodes")
        })
        .await
        .unwrap();

    let session = FlowEditingSession::new(flow.id.clone(), store.clone(), SessionConfig::default());
    session.load().await.unwrap();
    session.delete_node("A").unwrap();
    session.flush().await.unwrap();

    let nodes: Vec<String> = session.nodes().into_iter().map(|n| n.id).collect();
    assert_eq!(nodes, vec!["B".to_string()]);
    assert!(session.edges().is_empty());

    let stored = store.get_flow(&flow.id).await.unwrap();
    assert_eq!(stored.data.nodes.len(), 1);
    assert!(stored.data.edges.is_empty());
}

#[test]
fn test_merge_appends_only_new_instances() {
    let current = vec![whatsapp("WA-1", "original")];
    let incoming = vec![whatsapp("WA-1", "stale"), whatsapp("WA-2", "new")];

    let merged = merge_instances(&current, &incoming);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0], current[0]);
    assert_eq!(merged[1].name, "WA-2");

    // merging again changes nothing
    assert_eq!(merge_instances(&merged, &incoming), merged);

    // same name, other provider, is a different instance
    let bot = Instance::new("WA-1", Credentials::defaults(Provider::Assistant));
    assert_eq!(merge_instances(&merged, &[bot]).len(), 3);
}

#[tokio::test]
async fn test_debounced_save_reaches_disk() {
    let (_dir, manager) = file_manager("50").await;
    let flow = manager.create_flow("Welcome", None).await.unwrap();
    let session = manager.open(&flow.id).await.unwrap();
    let mut events = session.subscribe();

    let registry = ActionDefinitionRegistry::builtin();
    let trigger = NodeFactory::create_from_registry(
        registry,
        ActionCategory::App,
        Some("whatsapp"),
        "incoming_message",
        Some(Position::new(0.0, 0.0)),
        &ViewportTransform::default(),
    )
    .unwrap();
    let reply = NodeFactory::create_from_registry(
        registry,
        ActionCategory::App,
        Some("whatsapp"),
        "send_message",
        None,
        &ViewportTransform::default(),
    )
    .unwrap();
    session.add_node(trigger.clone()).unwrap();
    session.add_node(reply.clone()).unwrap();
    session.add_edge(Connection::new(&trigger.id, &reply.id)).unwrap();

    let saved = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SessionEvent::Saved { version }) = events.recv().await {
                break version;
            }
        }
    })
    .await
    .expect("no save within five seconds");
    assert_eq!(saved, 2);

    let stored = manager.store().get_flow(&flow.id).await.unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.data.nodes.len(), 2);
    assert_eq!(stored.data.edges.len(), 1);
    assert!(!session.has_pending_changes());
    manager.close(&flow.id).await.unwrap();
}

#[tokio::test]
async fn test_two_writers_conflict_instead_of_overwriting() {
    let (_dir, manager) = file_manager("10000").await;
    let flow = manager.create_flow("Shared", None).await.unwrap();
    let session = manager.open(&flow.id).await.unwrap();

    // another client saves first
    manager
        .store()
        .update_flow(
            &flow.id,
            FlowUpdate {
                name: Some("Theirs".into()),
                expected_version: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    session.rename("Mine").unwrap();
    let err = session.flush().await.unwrap_err();
    assert!(matches!(
        err,
        flow_studio::error::FlowError::Conflict { expected: 1, actual: 2 }
    ));

    assert_eq!(manager.store().get_flow(&flow.id).await.unwrap().name, "Theirs");
    assert!(session.has_pending_changes());

    // reloading drops the local edit and picks up the other write
    session.load().await.unwrap();
    assert_eq!(session.snapshot().unwrap().name, "Theirs");
    assert_eq!(session.version(), Some(2));
    assert!(!session.has_pending_changes());
}

#[tokio::test]
async fn test_document_survives_reopen() {
    let (dir, manager) = file_manager("10000").await;
    let flow = manager.create_flow("Kept", Some("round trip".into())).await.unwrap();
    let session = manager.open(&flow.id).await.unwrap();
    session.add_instance(whatsapp("WA-1", "k")).unwrap();
    session
        .import_graph(
            r#"{"nodes":[{"id":"n1","type":"trigger","position":{"x":1,"y":2},"width":150,"data":{"name":"Start"}}],"edges":[]}"#,
        )
        .unwrap();
    manager.close(&flow.id).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);

    let store = FileFlowStore::open(dir.path().join("flows")).await.unwrap();
    let reopened = FlowManager::new(store, SessionConfig::default());
    let session = reopened.open(&flow.id).await.unwrap();
    let snapshot = session.snapshot().unwrap();

    assert_eq!(snapshot.description.as_deref(), Some("round trip"));
    assert_eq!(snapshot.data.settings.instances, vec![whatsapp("WA-1", "k")]);
    assert_eq!(snapshot.data.nodes[0].extra.get("width"), Some(&json!(150)));

    let raw = std::fs::read_to_string(dir.path().join("flows").join(format!("{}.json", flow.id))).unwrap();
    let doc: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["data"]["nodes"][0]["position"], json!({"x": 1, "y": 2}));
}

#[tokio::test]
async fn test_session_save_keeps_whole_document() {
    let data = json!({
        "nodes": [
            {
                "id": "whatsapp_send_message-1",
                "type": "action",
                "position": {"x": 10, "y": 20.5},
                "width": 180,
                "selected": false,
                "data": {
                    "name": "Send message",
                    "label": "Send message",
                    "icon": "message-circle",
                    "color": "#25D366",
                    "config": {"message": "hi", "to": ""},
                    "input": {"variables": []},
                    "stop": false,
                    "notes": "keep me"
                }
            },
            {
                "id": "condition-2",
                "type": "condition",
                "position": {"x": 300, "y": 20},
                "data": {"name": "If", "label": "If", "icon": "split", "color": "#f59e0b", "config": {}}
            }
        ],
        "edges": [
            {"id": "e1", "source": "condition-2", "target": "whatsapp_send_message-1", "sourceHandle": "true", "animated": true, "style": {"stroke": "#999"}}
        ],
        "settings": {
            "instances": [
                {
                    "name": "WA-1",
                    "credencias": {"provider": "whatsapp", "apiKey": "k", "source": "5511", "appName": "app", "webhook": ""},
                    "status": "active",
                    "lastConnected": "2024-05-01T10:00:00.000Z"
                }
            ],
            "theme": "dark"
        }
    });
    let flow = serde_json::from_value(json!({
        "id": "flow-1",
        "name": "Welcome",
        "status": "active",
        "data": data.clone(),
        "version": 4
    }))
    .unwrap();
    let store = InMemoryFlowStore::new();
    store.insert(flow);

    let session = FlowEditingSession::new("flow-1", store.clone(), SessionConfig::default());
    session.load().await.unwrap();
    session
        .move_node("whatsapp_send_message-1", Position::new(99.0, 99.0))
        .unwrap();
    session
        .move_node("whatsapp_send_message-1", Position::new(10.0, 20.5))
        .unwrap();
    assert_eq!(session.flush().await.unwrap(), 5);

    let stored = store.get_flow("flow-1").await.unwrap();
    assert_eq!(serde_json::to_value(&stored.data).unwrap(), data);
    assert_eq!(serde_json::to_value(session.snapshot().unwrap().data).unwrap(), data);
}
