use thiserror::Error;

use crate::flow::session::SessionStatus;
use crate::registry::ActionCategory;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("no action definition for {category}/{}/{key}", subcategory.as_deref().unwrap_or("-"))]
    DefinitionNotFound {
        category: ActionCategory,
        subcategory: Option<String>,
        key: String,
    },
    #[error("action definition `{0}` is registered twice")]
    DuplicateDefinition(String),
    #[error("action definition `{id}` has an unusable `input` default: {reason}")]
    InvalidInput { id: String, reason: String },
}

/// Failures reported by a [`FlowStore`](crate::flow::store::FlowStore).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("flow `{0}` not found")]
    NotFound(String),
    #[error("flow `{id}` was modified elsewhere (expected version {expected}, found {actual})")]
    Conflict { id: String, expected: u64, actual: u64 },
    #[error("storage I/O failed: {0}")]
    Io(String),
    #[error("flow document could not be (de)serialized: {0}")]
    Serialization(String),
    #[error("flow store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error(transparent)]
    DefinitionNotFound(#[from] RegistryError),
    #[error("invalid flow data: {0}")]
    Validation(String),
    #[error("could not persist flow: {0}")]
    Persistence(StoreError),
    #[error("flow changed remotely (expected version {expected}, found {actual})")]
    Conflict { expected: u64, actual: u64 },
    #[error("edge `{edge}` references missing node `{node}`")]
    ReferentialViolation { edge: String, node: String },
    #[error("node `{0}` not found")]
    NodeNotFound(String),
    #[error("edge `{0}` not found")]
    EdgeNotFound(String),
    #[error("no instance at index {index} ({len} configured)")]
    InstanceIndexOutOfRange { index: usize, len: usize },
    #[error("instance `{name}` already exists for provider {provider}")]
    DuplicateInstance { name: String, provider: String },
    #[error("session is not ready for edits (status: {0:?})")]
    NotReady(SessionStatus),
    #[error("session is closed")]
    Closed,
}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { expected, actual, .. } => FlowError::Conflict { expected, actual },
            other => FlowError::Persistence(other),
        }
    }
}

impl FlowError {
    /// Only transient store failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::Persistence(StoreError::Io(_) | StoreError::Unavailable(_))
        )
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
