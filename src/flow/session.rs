//! The single editing session of one open flow.
//!
//! A session loads the flow once, applies graph and settings edits locally and saves
//! the whole document after a quiet period. Saves carry the version the session last
//! saw, so a document changed elsewhere comes back as a conflict instead of being
//! overwritten. Local edits are never dropped: a failed or conflicting save leaves
//! them pending.
//!
//! ```text
//! Unloaded --load--> Loading --ok--> Ready <--> Saving
//!    ^                  |              |
//!    +------error-------+            close --> Closed
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Map, Value, json};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{FlowError, FlowResult};
use crate::factory::{NodeFactory, ViewportTransform};
use crate::flow::graph::{self, EdgeChange, Graph, NodeChange};
use crate::flow::import;
use crate::flow::store::{FlowStoreRef, FlowUpdate};
use crate::flow::{
    Connection, Edge, Flow, FlowData, FlowStatus, Node, Position, Settings, SettingsUpdate,
};
use crate::instance::{Instance, InstanceSettingsManager, Provider};
use crate::registry::ActionDefinition;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Unloaded,
    Loading,
    Ready,
    /// A save is in flight. Edits are still accepted.
    Saving,
    Closed,
}

impl SessionStatus {
    fn accepts_edits(self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Saving)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Loaded { version: u64 },
    Changed { revision: u64 },
    Saved { version: u64 },
    SaveFailed { error: FlowError },
    Conflict { expected: u64, actual: u64 },
    Closed,
}

struct SessionState {
    status: SessionStatus,
    flow: Option<Flow>,
    /// Bumped by every accepted edit.
    revision: u64,
    /// Latest revision the store has acknowledged.
    saved_revision: u64,
    timer: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
    last_error: Option<FlowError>,
}

impl SessionState {
    fn editable_flow(&mut self) -> FlowResult<&mut Flow> {
        match self.status {
            SessionStatus::Closed => Err(FlowError::Closed),
            status if !status.accepts_edits() => Err(FlowError::NotReady(status)),
            status => self.flow.as_mut().ok_or(FlowError::NotReady(status)),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct SessionInner {
    flow_id: String,
    store: FlowStoreRef,
    config: SessionConfig,
    state: Mutex<SessionState>,
    // one save at a time, in the order they were asked for
    persist_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        state.cancel_timer();
    }
}

/// Handle to the editing session of one flow. Clones share the same session.
#[derive(Clone)]
pub struct FlowEditingSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for FlowEditingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("FlowEditingSession")
            .field("flow_id", &self.inner.flow_id)
            .field("status", &state.status)
            .field("revision", &state.revision)
            .field("saved_revision", &state.saved_revision)
            .finish()
    }
}

impl FlowEditingSession {
    pub fn new(flow_id: impl Into<String>, store: FlowStoreRef, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                flow_id: flow_id.into(),
                store,
                config,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Unloaded,
                    flow: None,
                    revision: 0,
                    saved_revision: 0,
                    timer: None,
                    runtime: Handle::try_current().ok(),
                    last_error: None,
                }),
                persist_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.inner.flow_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Fetches the flow from the store. Also valid on a ready session, where it
    /// throws away unsaved edits and reloads.
    pub async fn load(&self) -> FlowResult<()> {
        {
            let mut state = self.inner.lock();
            match state.status {
                SessionStatus::Closed => return Err(FlowError::Closed),
                SessionStatus::Unloaded | SessionStatus::Ready => {}
                other => return Err(FlowError::NotReady(other)),
            }
            state.cancel_timer();
            state.status = SessionStatus::Loading;
            if state.runtime.is_none() {
                state.runtime = Handle::try_current().ok();
            }
        }
        debug!(flow_id = %self.inner.flow_id, "loading flow");

        let result = self.inner.store.get_flow(&self.inner.flow_id).await;

        let mut state = self.inner.lock();
        if state.status == SessionStatus::Closed {
            return Err(FlowError::Closed);
        }
        match result {
            Ok(flow) => {
                let version = flow.version;
                info!(flow_id = %flow.id, version, nodes = flow.data.nodes.len(), edges = flow.data.edges.len(), "flow loaded");
                state.flow = Some(flow);
                state.saved_revision = state.revision;
                state.status = SessionStatus::Ready;
                state.last_error = None;
                drop(state);
                self.emit(SessionEvent::Loaded { version });
                Ok(())
            }
            Err(err) => {
                let err = FlowError::from(err);
                error!(flow_id = %self.inner.flow_id, %err, "flow load failed");
                state.flow = None;
                state.status = SessionStatus::Unloaded;
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn last_error(&self) -> Option<FlowError> {
        self.inner.lock().last_error.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    pub fn has_pending_changes(&self) -> bool {
        let state = self.inner.lock();
        state.revision != state.saved_revision
    }

    /// The current local document, including unsaved edits.
    pub fn snapshot(&self) -> Option<Flow> {
        self.inner.lock().flow.clone()
    }

    pub fn version(&self) -> Option<u64> {
        self.inner.lock().flow.as_ref().map(|f| f.version)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.read(|data| data.nodes.clone())
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.read(|data| data.edges.clone())
    }

    pub fn settings(&self) -> Settings {
        self.read(|data| data.settings.clone())
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.read(|data| data.node(id).cloned())
    }

    fn read<T: Default>(&self, f: impl FnOnce(&FlowData) -> T) -> T {
        self.inner
            .lock()
            .flow
            .as_ref()
            .map(|flow| f(&flow.data))
            .unwrap_or_default()
    }

    /// Runs `edit` against the local document. On success the revision moves on and a
    /// save is scheduled; on error nothing changed.
    fn edit<T>(&self, what: &str, edit: impl FnOnce(&mut Flow) -> FlowResult<T>) -> FlowResult<T> {
        let (out, revision) = {
            let mut state = self.inner.lock();
            let flow = state.editable_flow()?;
            let out = edit(flow).inspect_err(|err| {
                debug!(flow_id = %self.inner.flow_id, edit = what, %err, "edit rejected");
            })?;
            state.revision += 1;
            (out, state.revision)
        };
        debug!(flow_id = %self.inner.flow_id, edit = what, revision, "edit applied");
        self.emit(SessionEvent::Changed { revision });
        self.schedule_save();
        Ok(out)
    }

    pub fn apply_node_change(&self, change: NodeChange) -> FlowResult<()> {
        self.edit("node change", |flow| {
            Graph::new(&mut flow.data).apply_node_change(change)
        })
    }

    /// Applies the whole batch or nothing.
    pub fn apply_node_changes(&self, changes: Vec<NodeChange>) -> FlowResult<()> {
        self.edit("node changes", |flow| {
            let mut data = flow.data.clone();
            let mut graph = Graph::new(&mut data);
            for change in changes {
                graph.apply_node_change(change)?;
            }
            flow.data = data;
            Ok(())
        })
    }

    pub fn apply_edge_change(&self, change: EdgeChange) -> FlowResult<()> {
        self.edit("edge change", |flow| {
            Graph::new(&mut flow.data).apply_edge_change(change)
        })
    }

    pub fn add_node(&self, node: Node) -> FlowResult<()> {
        self.apply_node_change(NodeChange::Add(node))
    }

    /// Creates a node from a catalog entry and inserts it.
    pub fn add_action(
        &self,
        definition: &ActionDefinition,
        position: Option<Position>,
        viewport: &ViewportTransform,
    ) -> FlowResult<Node> {
        let node = NodeFactory::create(definition, position, viewport);
        self.add_node(node.clone())?;
        Ok(node)
    }

    pub fn move_node(&self, id: &str, position: Position) -> FlowResult<()> {
        self.apply_node_change(NodeChange::Move {
            id: id.to_string(),
            position,
        })
    }

    /// Removes the node and every edge attached to it.
    pub fn delete_node(&self, id: &str) -> FlowResult<()> {
        self.apply_node_change(NodeChange::Remove { id: id.to_string() })
    }

    pub fn add_edge(&self, connection: Connection) -> FlowResult<Edge> {
        let mut extra = Map::new();
        extra.insert("type".to_string(), json!("smoothstep"));
        extra.insert("animated".to_string(), Value::Bool(true));
        let edge = Edge {
            id: format!("edge-{}", uuid::Uuid::new_v4()),
            source: connection.source,
            target: connection.target,
            source_handle: connection.source_handle,
            target_handle: connection.target_handle,
            extra,
        };
        self.apply_edge_change(EdgeChange::Add(edge.clone()))?;
        Ok(edge)
    }

    pub fn delete_edge(&self, id: &str) -> FlowResult<()> {
        self.apply_edge_change(EdgeChange::Remove { id: id.to_string() })
    }

    /// Instances are merged by `(name, provider)`; every other key overwrites.
    pub fn update_settings(&self, update: SettingsUpdate) -> FlowResult<()> {
        self.edit("settings", |flow| {
            let settings = &mut flow.data.settings;
            if let Some(incoming) = update.instances {
                InstanceSettingsManager::new(&mut settings.instances).merge(&incoming);
            }
            settings.extra.extend(update.extra);
            Ok(())
        })
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.read(|data| data.settings.instances.clone())
    }

    pub fn add_instance(&self, instance: Instance) -> FlowResult<()> {
        self.edit("add instance", |flow| {
            InstanceSettingsManager::new(&mut flow.data.settings.instances).add(instance)
        })
    }

    pub fn replace_instance_at(&self, index: usize, instance: Instance) -> FlowResult<()> {
        self.edit("replace instance", |flow| {
            InstanceSettingsManager::new(&mut flow.data.settings.instances)
                .replace_at(index, instance)
        })
    }

    pub fn remove_instance_at(&self, index: usize) -> FlowResult<Instance> {
        self.edit("remove instance", |flow| {
            InstanceSettingsManager::new(&mut flow.data.settings.instances).remove_at(index)
        })
    }

    pub fn change_instance_provider(&self, index: usize, provider: Provider) -> FlowResult<()> {
        self.edit("change provider", |flow| {
            InstanceSettingsManager::new(&mut flow.data.settings.instances)
                .change_provider(index, provider)
        })
    }

    pub fn rename(&self, name: impl Into<String>) -> FlowResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FlowError::Validation("flow name cannot be empty".into()));
        }
        self.edit("rename", |flow| {
            flow.name = name;
            Ok(())
        })
    }

    pub fn set_status(&self, status: FlowStatus) -> FlowResult<()> {
        self.edit("status", |flow| {
            flow.status = status;
            Ok(())
        })
    }

    pub fn set_description(&self, description: Option<String>) -> FlowResult<()> {
        self.edit("description", |flow| {
            flow.description = description;
            Ok(())
        })
    }

    /// Replaces nodes and edges with a pasted document. Settings in the document, if
    /// any, go through the usual instance merge.
    pub fn import_graph(&self, text: &str) -> FlowResult<()> {
        let imported = import::parse_graph(text)?;
        let mut data = FlowData {
            nodes: imported.nodes,
            edges: imported.edges,
            settings: Settings::default(),
        };
        graph::check_integrity(&data)?;

        self.edit("import", move |flow| {
            let mut settings = std::mem::take(&mut flow.data.settings);
            if let Some(incoming) = imported.settings {
                InstanceSettingsManager::new(&mut settings.instances).merge(&incoming.instances);
                settings.extra.extend(incoming.extra);
            }
            data.settings = settings;
            flow.data = data;
            Ok(())
        })
    }

    pub fn export_graph(&self) -> FlowResult<String> {
        let state = self.inner.lock();
        match &state.flow {
            Some(flow) => import::export_graph(&flow.data),
            None => Err(FlowError::NotReady(state.status)),
        }
    }

    /// (Re)arms the save timer. Earlier pending timers are cancelled, so a burst of
    /// edits ends in a single save.
    pub fn schedule_save(&self) {
        let mut state = self.inner.lock();
        if !state.status.accepts_edits() {
            return;
        }
        state.cancel_timer();
        let Some(runtime) = state.runtime.clone() else {
            warn!(flow_id = %self.inner.flow_id, "no tokio runtime, save must be flushed explicitly");
            return;
        };

        let delay = self.inner.config.debounce;
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        debug!(flow_id = %self.inner.flow_id, delay_ms = delay.as_millis() as u64, "save scheduled");
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let session = FlowEditingSession { inner };
            // detached, so re-arming the timer cannot abort a save already under way
            tokio::spawn(async move {
                let _ = session.persist().await;
            });
        }));
    }

    /// Cancels the timer and saves right away.
    pub async fn flush(&self) -> FlowResult<u64> {
        self.inner.lock().cancel_timer();
        self.persist().await
    }

    /// Sends the whole document with the last seen version. Returns the version the
    /// store holds afterwards. When everything is already saved this is a no-op.
    pub async fn persist(&self) -> FlowResult<u64> {
        let _guard = self.inner.persist_lock.lock().await;

        let (update, revision) = {
            let mut state = self.inner.lock();
            if state.status == SessionStatus::Closed {
                return Err(FlowError::Closed);
            }
            if !state.status.accepts_edits() {
                return Err(FlowError::NotReady(state.status));
            }
            let flow = state
                .flow
                .as_ref()
                .ok_or(FlowError::NotReady(state.status))?;
            if state.revision == state.saved_revision {
                return Ok(flow.version);
            }
            let update = FlowUpdate {
                name: Some(flow.name.clone()),
                status: Some(flow.status),
                description: Some(flow.description.clone()),
                data: flow.data.clone(),
                expected_version: Some(flow.version),
            };
            state.status = SessionStatus::Saving;
            (update, state.revision)
        };
        info!(flow_id = %self.inner.flow_id, revision, expected_version = ?update.expected_version, "saving flow");

        let result = self.save_with_retry(update).await;

        let mut state = self.inner.lock();
        if state.status == SessionStatus::Closed {
            debug!(flow_id = %self.inner.flow_id, "session closed during save, result discarded");
            return Err(FlowError::Closed);
        }
        state.status = SessionStatus::Ready;

        match result {
            Ok(saved) => {
                let version = saved.version;
                let local = state.revision;
                if local == revision {
                    state.flow = Some(saved);
                } else if let Some(flow) = state.flow.as_mut() {
                    // newer local edits win over the echoed document
                    debug!(flow_id = %self.inner.flow_id, sent = revision, local, "keeping newer local edits");
                    flow.version = saved.version;
                    flow.updated_at = saved.updated_at;
                }
                state.saved_revision = revision;
                state.last_error = None;
                drop(state);
                info!(flow_id = %self.inner.flow_id, version, "flow saved");
                self.emit(SessionEvent::Saved { version });
                Ok(version)
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                drop(state);
                match &err {
                    FlowError::Conflict { expected, actual } => {
                        warn!(flow_id = %self.inner.flow_id, expected, actual, "flow was changed elsewhere, edits kept");
                        self.emit(SessionEvent::Conflict {
                            expected: *expected,
                            actual: *actual,
                        });
                    }
                    FlowError::Closed => {}
                    other => {
                        error!(flow_id = %self.inner.flow_id, err = %other, "flow save failed, edits kept");
                        self.emit(SessionEvent::SaveFailed { error: err.clone() });
                    }
                }
                Err(err)
            }
        }
    }

    async fn save_with_retry(&self, update: FlowUpdate) -> FlowResult<Flow> {
        let policy = self.inner.config.retry;
        let mut attempt = 1;
        loop {
            let result = self
                .inner
                .store
                .update_flow(&self.inner.flow_id, update.clone())
                .await
                .map_err(FlowError::from);
            match result {
                Ok(flow) => return Ok(flow),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(flow_id = %self.inner.flow_id, attempt, %err, retry_in_ms = delay.as_millis() as u64, "save attempt failed");
                    tokio::time::sleep(delay).await;
                    if self.status() == SessionStatus::Closed {
                        return Err(FlowError::Closed);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stops the session. The timer is cancelled and a save still in flight will
    /// have its result ignored.
    pub fn close(&self) {
        {
            let mut state = self.inner.lock();
            if state.status == SessionStatus::Closed {
                return;
            }
            state.cancel_timer();
            state.status = SessionStatus::Closed;
            if state.revision != state.saved_revision {
                warn!(flow_id = %self.inner.flow_id, pending = state.revision - state.saved_revision, "closing with unsaved edits");
            }
        }
        info!(flow_id = %self.inner.flow_id, "session closed");
        self.emit(SessionEvent::Closed);
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::StoreError;
    use crate::flow::NodeType;
    use crate::flow::store::{FlowStore, FlowSummary, InMemoryFlowStore, NewFlow};
    use crate::instance::{Credentials, InstanceStatus};
    use crate::registry::{ActionCategory, ActionDefinitionRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    /// In-memory store that records saves and can fail or hold them.
    #[derive(Debug)]
    struct ScriptedStore {
        inner: InMemoryFlowStore,
        updates: Mutex<Vec<FlowUpdate>>,
        failures: AtomicUsize,
        fail_loads: AtomicBool,
        gated: AtomicBool,
        gate: Semaphore,
        entered: Notify,
    }

    impl ScriptedStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryFlowStore::default(),
                updates: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
                fail_loads: AtomicBool::new(false),
                gated: AtomicBool::new(false),
                gate: Semaphore::new(0),
                entered: Notify::new(),
            })
        }

        fn update_count(&self) -> usize {
            self.updates.lock().unwrap().len()
        }

        fn last_update(&self) -> FlowUpdate {
            self.updates.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl FlowStore for ScriptedStore {
        async fn get_flow(&self, id: &str) -> Result<Flow, StoreError> {
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("offline".into()));
            }
            self.inner.get_flow(id).await
        }

        async fn create_flow(&self, flow: NewFlow) -> Result<Flow, StoreError> {
            self.inner.create_flow(flow).await
        }

        async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError> {
            self.updates.lock().unwrap().push(update.clone());
            self.entered.notify_one();
            if self.gated.load(Ordering::SeqCst) {
                self.gate.acquire().await.unwrap().forget();
            }
            let pending = self.failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures.store(pending - 1, Ordering::SeqCst);
                return Err(StoreError::Io("connection reset".into()));
            }
            self.inner.update_flow(id, update).await
        }

        async fn delete_flow(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_flow(id).await
        }

        async fn list_flows(&self) -> Result<Vec<FlowSummary>, StoreError> {
            self.inner.list_flows().await
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            debounce: Duration::from_millis(1000),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(400),
            },
        }
    }

    async fn open() -> (Arc<ScriptedStore>, FlowEditingSession) {
        let store = ScriptedStore::new();
        let flow = store.create_flow(NewFlow::named("Welcome")).await.unwrap();
        let session = FlowEditingSession::new(flow.id, store.clone(), config());
        session.load().await.unwrap();
        (store, session)
    }

    fn send_message() -> &'static ActionDefinition {
        ActionDefinitionRegistry::builtin()
            .lookup(ActionCategory::App, Some("whatsapp"), "send_message")
            .unwrap()
    }

    fn add(session: &FlowEditingSession, x: f64) -> Node {
        session
            .add_action(send_message(), Some(Position::new(x, 0.0)), &ViewportTransform::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_edits_before_load_are_rejected() {
        let store = ScriptedStore::new();
        let session = FlowEditingSession::new("missing", store, config());
        let err = session.rename("x").unwrap_err();
        assert_eq!(err, FlowError::NotReady(SessionStatus::Unloaded));
    }

    #[tokio::test]
    async fn test_failed_load_goes_back_to_unloaded() {
        let store = ScriptedStore::new();
        store.fail_loads.store(true, Ordering::SeqCst);
        let session = FlowEditingSession::new("f", store.clone(), config());

        assert!(session.load().await.is_err());
        assert_eq!(session.status(), SessionStatus::Unloaded);
        assert!(matches!(
            session.last_error(),
            Some(FlowError::Persistence(StoreError::Unavailable(_)))
        ));

        let missing = FlowEditingSession::new("nope", ScriptedStore::new(), config());
        assert_eq!(
            missing.load().await.unwrap_err(),
            FlowError::Persistence(StoreError::NotFound("nope".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_is_saved_once() {
        let (store, session) = open().await;
        let node = add(&session, 0.0);
        for step in 1..=5 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            session
                .move_node(&node.id, Position::new(step as f64 * 10.0, 5.0))
                .unwrap();
        }
        assert_eq!(store.update_count(), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.update_count(), 1);
        let saved = store.last_update();
        assert_eq!(saved.data.nodes[0].position, Position::new(50.0, 5.0));
        assert_eq!(saved.expected_version, Some(1));
        assert!(!session.has_pending_changes());
        assert_eq!(session.version(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_save_without_edits() {
        let (store, session) = open().await;
        assert_eq!(session.flush().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_cleared_description_stays_cleared() {
        let store = ScriptedStore::new();
        let flow = store
            .create_flow(NewFlow::named("Welcome").with_description("old"))
            .await
            .unwrap();
        let session = FlowEditingSession::new(flow.id.clone(), store.clone(), config());
        session.load().await.unwrap();

        session.set_description(None).unwrap();
        session.flush().await.unwrap();

        assert_eq!(store.last_update().description, Some(None));
        assert_eq!(session.snapshot().unwrap().description, None);
        assert_eq!(store.get_flow(&flow.id).await.unwrap().description, None);
    }

    #[tokio::test]
    async fn test_delete_node_removes_its_edges() {
        let (_store, session) = open().await;
        let a = add(&session, 0.0);
        let b = add(&session, 200.0);
        let c = add(&session, 400.0);
        let e1 = session.add_edge(Connection::new(&a.id, &b.id)).unwrap();
        session.add_edge(Connection::new(&b.id, &c.id)).unwrap();

        assert!(e1.id.starts_with("edge-"));
        assert_eq!(e1.extra.get("type"), Some(&json!("smoothstep")));
        assert_eq!(e1.extra.get("animated"), Some(&json!(true)));

        session.delete_node(&b.id).unwrap();
        assert_eq!(session.nodes().len(), 2);
        assert!(session.edges().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_edit_changes_nothing() {
        let (_store, session) = open().await;
        let a = add(&session, 0.0);
        let revision = session.revision();

        let err = session.add_edge(Connection::new(&a.id, "ghost")).unwrap_err();
        assert!(matches!(err, FlowError::ReferentialViolation { .. }));

        let batch = vec![
            NodeChange::Move {
                id: a.id.clone(),
                position: Position::new(99.0, 99.0),
            },
            NodeChange::Remove { id: "ghost".into() },
        ];
        assert!(session.apply_node_changes(batch).is_err());
        assert_eq!(session.node(&a.id).unwrap().position, Position::new(0.0, 0.0));
        assert_eq!(session.revision(), revision);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_keeps_local_edits() {
        let (store, session) = open().await;
        let mut events = session.subscribe();

        // someone else saves the flow first
        store
            .inner
            .update_flow(session.flow_id(), FlowUpdate::default())
            .await
            .unwrap();

        session.rename("Mine").unwrap();
        let err = session.flush().await.unwrap_err();
        assert_eq!(err, FlowError::Conflict { expected: 1, actual: 2 });
        assert!(session.has_pending_changes());
        assert_eq!(session.snapshot().unwrap().name, "Mine");
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(store.update_count(), 1);

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            saw_conflict |= event == SessionEvent::Conflict { expected: 1, actual: 2 };
        }
        assert!(saw_conflict);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (store, session) = open().await;
        store.failures.store(2, Ordering::SeqCst);

        session.rename("Retried").unwrap();
        assert_eq!(session.flush().await.unwrap(), 2);
        assert_eq!(store.update_count(), 3);
        assert!(!session.has_pending_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_edits() {
        let (store, session) = open().await;
        store.failures.store(10, Ordering::SeqCst);
        let mut events = session.subscribe();

        let node = add(&session, 0.0);
        let err = session.flush().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.update_count(), 3);
        assert!(session.has_pending_changes());
        assert_eq!(session.last_error(), Some(err.clone()));
        assert!(session.node(&node.id).is_some());

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, SessionEvent::SaveFailed { .. });
        }
        assert!(failed);

        // the store recovers, the pending edit goes out on the next save
        store.failures.store(0, Ordering::SeqCst);
        session.flush().await.unwrap();
        assert_eq!(store.inner.get_flow(session.flow_id()).await.unwrap().data.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_late_response_does_not_clobber_newer_edits() {
        let (store, session) = open().await;
        let node = add(&session, 0.0);
        store.gated.store(true, Ordering::SeqCst);

        let saving = tokio::spawn({
            let session = session.clone();
            async move { session.flush().await }
        });
        store.entered.notified().await;
        assert_eq!(session.status(), SessionStatus::Saving);

        // edit while the save is still out
        session.move_node(&node.id, Position::new(300.0, 40.0)).unwrap();
        store.gate.add_permits(1);
        assert_eq!(saving.await.unwrap().unwrap(), 2);

        assert_eq!(session.version(), Some(2));
        assert_eq!(session.node(&node.id).unwrap().position, Position::new(300.0, 40.0));
        assert!(session.has_pending_changes());
        session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_save() {
        let (store, session) = open().await;
        session.rename("Never saved").unwrap();
        session.close();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.update_count(), 0);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(session.rename("again"), Err(FlowError::Closed));
    }

    #[tokio::test]
    async fn test_close_discards_in_flight_result() {
        let (store, session) = open().await;
        session.rename("Racing").unwrap();
        store.gated.store(true, Ordering::SeqCst);

        let saving = tokio::spawn({
            let session = session.clone();
            async move { session.flush().await }
        });
        store.entered.notified().await;
        session.close();
        store.gate.add_permits(1);

        assert_eq!(saving.await.unwrap(), Err(FlowError::Closed));
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_session_cancels_timer() {
        let (store, session) = open().await;
        session.rename("Dropped").unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_settings_merge_appends_new_instances_only() {
        let (_store, session) = open().await;
        let mut existing = Instance::new("WA-1", Credentials::defaults(Provider::Whatsapp));
        existing.status = Some(InstanceStatus::Active);
        session.add_instance(existing.clone()).unwrap();

        let mut stale = existing.clone();
        stale.status = Some(InstanceStatus::Error);
        let fresh = Instance::new("Bot", Credentials::defaults(Provider::Assistant));
        let mut extra = Map::new();
        extra.insert("theme".into(), json!("dark"));

        session
            .update_settings(SettingsUpdate {
                instances: Some(vec![stale, fresh.clone()]),
                extra,
            })
            .unwrap();

        let settings = session.settings();
        assert_eq!(settings.instances, vec![existing, fresh]);
        assert_eq!(settings.extra.get("theme"), Some(&json!("dark")));
    }

    #[tokio::test]
    async fn test_import_replaces_graph_or_nothing() {
        let (_store, session) = open().await;
        let kept = add(&session, 0.0);

        let broken = r#"{"nodes":[{"id":"a","type":"action","position":{"x":0,"y":0},"data":{}}],
                         "edges":[{"id":"e","source":"a","target":"zzz"}]}"#;
        assert!(session.import_graph(broken).is_err());
        assert_eq!(session.nodes(), vec![kept]);

        let good = r#"
nodes:
  - { id: a, type: trigger, position: { x: 0, y: 0 }, data: {} }
  - { id: b, type: condition, position: { x: 100, y: 0 }, data: {} }
  - { id: c, type: action, position: { x: 200, y: 0 }, data: {} }
edges:
  - { id: e1, source: a, target: b }
  - { id: e2, source: b, target: c, sourceHandle: "true" }
"#;
        session.import_graph(good).unwrap();
        assert_eq!(session.nodes().len(), 3);
        assert_eq!(session.nodes()[1].kind, NodeType::Condition);
        assert_eq!(session.edges().len(), 2);

        let exported = session.export_graph().unwrap();
        assert!(exported.contains("\"sourceHandle\": \"true\""));
    }
}
