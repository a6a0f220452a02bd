use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::flow::{Flow, FlowData, FlowStatus};

pub type FlowStoreRef = Arc<dyn FlowStore>;

/// Where flow documents live. Implementations own versioning: every accepted write
/// bumps `version` and stamps `updated_at`.
#[async_trait]
pub trait FlowStore: Send + Sync + Debug {
    async fn get_flow(&self, id: &str) -> Result<Flow, StoreError>;

    async fn create_flow(&self, flow: NewFlow) -> Result<Flow, StoreError>;

    /// Full replace of `data`. Fails with [`StoreError::Conflict`] when
    /// `expected_version` is set and does not match.
    async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError>;

    async fn delete_flow(&self, id: &str) -> Result<(), StoreError>;

    async fn list_flows(&self) -> Result<Vec<FlowSummary>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NewFlow {
    pub name: String,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: FlowData,
}

impl NewFlow {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FlowStatus>,
    /// `None` leaves the stored description alone, `Some(None)` clears it.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::util::double_option"
    )]
    pub description: Option<Option<String>>,
    pub data: FlowData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub status: FlowStatus,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Flow> for FlowSummary {
    fn from(flow: &Flow) -> Self {
        Self {
            id: flow.id.clone(),
            name: flow.name.clone(),
            status: flow.status,
            version: flow.version,
            updated_at: flow.updated_at,
        }
    }
}

fn new_document(id: String, flow: NewFlow) -> Flow {
    Flow {
        id,
        name: flow.name,
        status: flow.status,
        description: flow.description,
        data: flow.data,
        version: 1,
        updated_at: Some(Utc::now()),
    }
}

/// Applies `update` to `current` in place, enforcing the version check.
fn apply_update(current: &mut Flow, update: FlowUpdate) -> Result<(), StoreError> {
    if let Some(expected) = update.expected_version {
        if expected != current.version {
            return Err(StoreError::Conflict {
                id: current.id.clone(),
                expected,
                actual: current.version,
            });
        }
    }
    if let Some(name) = update.name {
        current.name = name;
    }
    if let Some(status) = update.status {
        current.status = status;
    }
    if let Some(description) = update.description {
        current.description = description;
    }
    current.data = update.data;
    current.version += 1;
    current.updated_at = Some(Utc::now());
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<String, Flow>,
}

impl InMemoryFlowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Puts a document in as-is, keeping its id and version.
    pub fn insert(&self, flow: Flow) {
        self.flows.insert(flow.id.clone(), flow);
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn get_flow(&self, id: &str) -> Result<Flow, StoreError> {
        self.flows
            .get(id)
            .map(|f| f.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create_flow(&self, flow: NewFlow) -> Result<Flow, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let doc = new_document(id.clone(), flow);
        self.flows.insert(id, doc.clone());
        Ok(doc)
    }

    async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError> {
        let mut entry = self
            .flows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_update(entry.value_mut(), update)?;
        Ok(entry.value().clone())
    }

    async fn delete_flow(&self, id: &str) -> Result<(), StoreError> {
        self.flows
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_flows(&self) -> Result<Vec<FlowSummary>, StoreError> {
        let mut summaries: Vec<FlowSummary> =
            self.flows.iter().map(|f| FlowSummary::from(f.value())).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

/// One pretty JSON document per flow under `root`.
#[derive(Debug)]
pub struct FileFlowStore {
    root: PathBuf,
    // read-modify-write of a document must not interleave with another writer
    write_lock: Mutex<()>,
}

impl FileFlowStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "file flow store opened");
        Ok(Arc::new(Self {
            root,
            write_lock: Mutex::new(()),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn read(&self, id: &str) -> Result<Flow, StoreError> {
        let path = self.path_for(id)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    async fn write(&self, flow: &Flow) -> Result<(), StoreError> {
        let path = self.path_for(&flow.id)?;
        let contents = serde_json::to_string_pretty(flow)?;
        // write then rename, so a crash never leaves half a document behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        debug!(flow_id = %flow.id, version = flow.version, "flow document written");
        Ok(())
    }
}

#[async_trait]
impl FlowStore for FileFlowStore {
    async fn get_flow(&self, id: &str) -> Result<Flow, StoreError> {
        self.read(id).await
    }

    async fn create_flow(&self, flow: NewFlow) -> Result<Flow, StoreError> {
        let _guard = self.write_lock.lock().await;
        let doc = new_document(uuid::Uuid::new_v4().to_string(), flow);
        self.write(&doc).await?;
        Ok(doc)
    }

    async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read(id).await?;
        apply_update(&mut doc, update)?;
        self.write(&doc).await?;
        Ok(doc)
    }

    async fn delete_flow(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_flows(&self) -> Result<Vec<FlowSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read(id).await {
                Ok(flow) => summaries.push(FlowSummary::from(&flow)),
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable flow document"),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_create_and_update() {
        let store = InMemoryFlowStore::new();
        let created = store.create_flow(NewFlow::named("Welcome")).await.unwrap();
        assert_eq!(created.status, FlowStatus::Draft);
        assert_eq!(created.version, 1);
        assert!(created.data.nodes.is_empty());

        let updated = store
            .update_flow(
                &created.id,
                FlowUpdate {
                    name: Some("Welcome v2".into()),
                    expected_version: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.name, "Welcome v2");
        assert_eq!(store.get_flow(&created.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict() {
        let store = InMemoryFlowStore::new();
        let created = store.create_flow(NewFlow::named("f")).await.unwrap();
        store
            .update_flow(&created.id, FlowUpdate::default())
            .await
            .unwrap();

        let err = store
            .update_flow(
                &created.id,
                FlowUpdate {
                    expected_version: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                id: created.id.clone(),
                expected: 1,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_description_is_kept_set_or_cleared() {
        let store = InMemoryFlowStore::new();
        let created = store
            .create_flow(NewFlow::named("f").with_description("old"))
            .await
            .unwrap();

        let kept = store.update_flow(&created.id, FlowUpdate::default()).await.unwrap();
        assert_eq!(kept.description.as_deref(), Some("old"));

        let cleared = store
            .update_flow(
                &created.id,
                FlowUpdate {
                    description: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.description, None);

        let update: FlowUpdate = serde_json::from_str(r#"{"description":null,"data":{}}"#).unwrap();
        assert_eq!(update.description, Some(None));
    }

    #[tokio::test]
    async fn test_missing_flow() {
        let store = InMemoryFlowStore::new();
        assert_eq!(
            store.get_flow("nope").await.unwrap_err(),
            StoreError::NotFound("nope".into())
        );
        assert!(store.delete_flow("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::open(dir.path()).await.unwrap();

        let created = store
            .create_flow(NewFlow::named("On disk").with_description("kept in json"))
            .await
            .unwrap();
        assert!(dir.path().join(format!("{}.json", created.id)).exists());

        let loaded = store.get_flow(&created.id).await.unwrap();
        assert_eq!(loaded, created);

        let list = store.list_flows().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "On disk");

        store.delete_flow(&created.id).await.unwrap();
        assert!(store.list_flows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get_flow("../etc/passwd").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
