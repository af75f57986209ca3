//! Durable storage interface for workflow execution state.
//!
//! The engine persists every state transition through [`DataAccess`] so a
//! crashed run can be resumed from its last durable snapshot. The physical
//! schema lives behind the trait; [`memory::MemoryStore`] is the in-process
//! implementation used by tests and local runs.

pub mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{CallStatus, ExecutionSlot};
use crate::lang::Fqn;
use crate::options::WorkflowOptions;
use crate::symbols::Symbol;
use crate::values::WorkflowValue;
use crate::workflow::WorkflowDescriptor;

pub use memory::MemoryStore;

/// Identity of one workflow run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkflowId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted workflow lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Submitted,
    Running,
    Aborting,
    Failed,
    Succeeded,
    Aborted,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Failed | WorkflowState::Succeeded | WorkflowState::Aborted
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Submitted => "Submitted",
            WorkflowState::Running => "Running",
            WorkflowState::Aborting => "Aborting",
            WorkflowState::Failed => "Failed",
            WorkflowState::Succeeded => "Succeeded",
            WorkflowState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),
    #[error("execution entry {slot} not found in workflow {workflow_id}")]
    SlotNotFound {
        workflow_id: WorkflowId,
        slot: ExecutionSlot,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable storage capability set. Implementations must externally serialize
/// writes for a single `(workflow_id, slot)` and persist each operation
/// atomically; a partially persisted call completion is a correctness bug.
#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Register a new workflow with its input symbols and initial execution
    /// entries (all `NotStarted`).
    async fn create_workflow(
        &self,
        descriptor: &WorkflowDescriptor,
        inputs: &[Symbol],
        slots: &[ExecutionSlot],
    ) -> StorageResult<()>;

    /// Statuses of every execution entry, possibly from a prior crashed run.
    async fn get_execution_statuses(
        &self,
        workflow_id: WorkflowId,
    ) -> StorageResult<HashMap<ExecutionSlot, CallStatus>>;

    /// Set the status of one or more entries in a single transaction.
    async fn set_status(
        &self,
        workflow_id: WorkflowId,
        slots: &[ExecutionSlot],
        status: CallStatus,
    ) -> StorageResult<()>;

    /// Persist the outputs a call produced.
    async fn set_outputs(
        &self,
        workflow_id: WorkflowId,
        slot: &ExecutionSlot,
        outputs: &HashMap<String, WorkflowValue>,
    ) -> StorageResult<()>;

    /// Insert new execution entries (scatter shards and collectors) as
    /// `NotStarted`. Idempotent so a crashed expansion can be replayed.
    async fn insert_calls(
        &self,
        workflow_id: WorkflowId,
        slots: &[ExecutionSlot],
    ) -> StorageResult<()>;

    async fn update_workflow_state(
        &self,
        workflow_id: WorkflowId,
        state: WorkflowState,
    ) -> StorageResult<()>;

    /// Input symbols of a call scope.
    async fn get_inputs(&self, workflow_id: WorkflowId, call: &Fqn) -> StorageResult<Vec<Symbol>>;

    /// Output symbols of one execution entry.
    async fn get_outputs(
        &self,
        workflow_id: WorkflowId,
        slot: &ExecutionSlot,
    ) -> StorageResult<Vec<Symbol>>;

    /// Symbols whose fully qualified name matches `fqn` exactly.
    async fn get_fully_qualified_name(
        &self,
        workflow_id: WorkflowId,
        fqn: &str,
    ) -> StorageResult<Vec<Symbol>>;

    async fn update_workflow_options(
        &self,
        workflow_id: WorkflowId,
        options: &WorkflowOptions,
    ) -> StorageResult<()>;
}
