use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::FlowResult;
use crate::flow::Flow;
use crate::flow::session::{FlowEditingSession, SessionStatus};
use crate::flow::store::{FlowStoreRef, FlowSummary, NewFlow};

/// Keeps at most one editing session per flow id.
#[derive(Clone, Debug)]
pub struct FlowManager {
    store: FlowStoreRef,
    config: SessionConfig,
    sessions: Arc<DashMap<String, FlowEditingSession>>,
    open_lock: Arc<Mutex<()>>,
}

impl FlowManager {
    pub fn new(store: FlowStoreRef, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            sessions: Arc::new(DashMap::new()),
            open_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &FlowStoreRef {
        &self.store
    }

    /// Returns the open session for `flow_id`, loading one if needed.
    pub async fn open(&self, flow_id: &str) -> FlowResult<FlowEditingSession> {
        let _guard = self.open_lock.lock().await;
        let session = {
            let mut entry = self
                .sessions
                .entry(flow_id.to_string())
                .or_insert_with(|| self.new_session(flow_id));
            if entry.status() == SessionStatus::Closed {
                // closed through another handle, start over
                *entry = self.new_session(flow_id);
            }
            entry.clone()
        };

        if session.status() == SessionStatus::Unloaded {
            if let Err(err) = session.load().await {
                self.sessions.remove(flow_id);
                return Err(err);
            }
            info!(%flow_id, open = self.sessions.len(), "session opened");
        }
        Ok(session)
    }

    fn new_session(&self, flow_id: &str) -> FlowEditingSession {
        FlowEditingSession::new(flow_id, self.store.clone(), self.config)
    }

    /// Flushes pending edits, then closes and forgets the session. Opens of the same
    /// flow wait until the flush is done.
    pub async fn close(&self, flow_id: &str) -> FlowResult<()> {
        let _guard = self.open_lock.lock().await;
        let Some((_, session)) = self.sessions.remove(flow_id) else {
            return Ok(());
        };
        let flushed = if session.has_pending_changes() {
            session.flush().await.map(|_| ())
        } else {
            Ok(())
        };
        session.close();
        if let Err(err) = &flushed {
            warn!(%flow_id, %err, "closed with unsaved edits");
        }
        flushed
    }

    pub async fn create_flow(&self, name: &str, description: Option<String>) -> FlowResult<Flow> {
        let mut new = NewFlow::named(name);
        new.description = description;
        let flow = self.store.create_flow(new).await?;
        info!(flow_id = %flow.id, name = %flow.name, "flow created");
        Ok(flow)
    }

    pub async fn delete_flow(&self, flow_id: &str) -> FlowResult<()> {
        let _guard = self.open_lock.lock().await;
        if let Some((_, session)) = self.sessions.remove(flow_id) {
            session.close();
        }
        self.store.delete_flow(flow_id).await?;
        info!(%flow_id, "flow deleted");
        Ok(())
    }

    pub async fn list_flows(&self) -> FlowResult<Vec<FlowSummary>> {
        Ok(self.store.list_flows().await?)
    }

    pub fn open_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Flushes and closes every session.
    pub async fn shutdown(&self) {
        for flow_id in self.open_sessions() {
            let _ = self.close(&flow_id).await;
        }
        info!("all sessions closed");
    }
}
