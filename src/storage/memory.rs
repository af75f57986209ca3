//! In-memory storage for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DataAccess, StorageError, StorageResult, WorkflowId, WorkflowState};
use crate::execution::{CallStatus, ExecutionSlot, ExecutionStatus};
use crate::lang::Fqn;
use crate::options::WorkflowOptions;
use crate::symbols::Symbol;
use crate::values::WorkflowValue;
use crate::workflow::WorkflowDescriptor;

#[derive(Debug, Clone)]
struct StatusRow {
    status: CallStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct WorkflowRow {
    name: String,
    state: WorkflowState,
    options: WorkflowOptions,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    workflows: HashMap<WorkflowId, WorkflowRow>,
    statuses: HashMap<WorkflowId, HashMap<ExecutionSlot, StatusRow>>,
    symbols: HashMap<WorkflowId, Vec<Symbol>>,
}

/// Storage that keeps every row in process memory. Cloning shares the data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current workflow state, for test assertions.
    pub fn workflow_state(&self, workflow_id: WorkflowId) -> Option<WorkflowState> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.workflows.get(&workflow_id).map(|row| row.state)
    }

    /// Snapshot of every execution status row, for test assertions.
    pub fn status_snapshot(&self, workflow_id: WorkflowId) -> HashMap<ExecutionSlot, CallStatus> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .statuses
            .get(&workflow_id)
            .map(|rows| rows.iter().map(|(k, row)| (k.clone(), row.status)).collect())
            .unwrap_or_default()
    }

    /// Workflow name and submission time, for test assertions.
    pub fn workflow_row(&self, workflow_id: WorkflowId) -> Option<(String, DateTime<Utc>)> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .workflows
            .get(&workflow_id)
            .map(|row| (row.name.clone(), row.submitted_at))
    }

    /// Status rows with their creation and last-update times.
    pub fn status_rows(
        &self,
        workflow_id: WorkflowId,
    ) -> Vec<(ExecutionSlot, CallStatus, DateTime<Utc>, DateTime<Utc>)> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .statuses
            .get(&workflow_id)
            .map(|rows| {
                rows.iter()
                    .map(|(slot, row)| (slot.clone(), row.status, row.created_at, row.updated_at))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored options, for test assertions.
    pub fn options(&self, workflow_id: WorkflowId) -> Option<WorkflowOptions> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .workflows
            .get(&workflow_id)
            .map(|row| row.options.clone())
    }

    /// Pre-seed execution rows, bypassing `create_workflow`. Restart tests
    /// use this to fabricate the durable leftovers of a crashed run.
    pub fn seed_statuses(
        &self,
        workflow_id: WorkflowId,
        rows: impl IntoIterator<Item = (ExecutionSlot, CallStatus)>,
    ) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        let statuses = inner.statuses.entry(workflow_id).or_default();
        for (slot, status) in rows {
            statuses.insert(
                slot,
                StatusRow {
                    status,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
    }

    /// Pre-seed symbols, for restart tests.
    pub fn seed_symbols(&self, workflow_id: WorkflowId, symbols: Vec<Symbol>) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.symbols.entry(workflow_id).or_default().extend(symbols);
    }

    fn with_workflow<T>(
        &self,
        workflow_id: WorkflowId,
        f: impl FnOnce(&mut Inner) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if !inner.workflows.contains_key(&workflow_id)
            && !inner.statuses.contains_key(&workflow_id)
        {
            return Err(StorageError::WorkflowNotFound(workflow_id));
        }
        f(&mut inner)
    }
}

#[async_trait]
impl DataAccess for MemoryStore {
    async fn create_workflow(
        &self,
        descriptor: &WorkflowDescriptor,
        inputs: &[Symbol],
        slots: &[ExecutionSlot],
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        inner.workflows.insert(
            descriptor.id,
            WorkflowRow {
                name: descriptor.namespace.workflow_name().to_string(),
                state: WorkflowState::Submitted,
                options: descriptor.options.clone(),
                submitted_at: now,
            },
        );
        let statuses = inner.statuses.entry(descriptor.id).or_default();
        for slot in slots {
            statuses.entry(slot.clone()).or_insert(StatusRow {
                status: CallStatus::new(ExecutionStatus::NotStarted),
                created_at: now,
                updated_at: now,
            });
        }
        inner
            .symbols
            .entry(descriptor.id)
            .or_default()
            .extend(inputs.iter().cloned());
        Ok(())
    }

    async fn get_execution_statuses(
        &self,
        workflow_id: WorkflowId,
    ) -> StorageResult<HashMap<ExecutionSlot, CallStatus>> {
        self.with_workflow(workflow_id, |inner| {
            Ok(inner
                .statuses
                .get(&workflow_id)
                .map(|rows| rows.iter().map(|(k, row)| (k.clone(), row.status)).collect())
                .unwrap_or_default())
        })
    }

    async fn set_status(
        &self,
        workflow_id: WorkflowId,
        slots: &[ExecutionSlot],
        status: CallStatus,
    ) -> StorageResult<()> {
        self.with_workflow(workflow_id, |inner| {
            let rows = inner
                .statuses
                .get_mut(&workflow_id)
                .ok_or(StorageError::WorkflowNotFound(workflow_id))?;
            for slot in slots {
                let row = rows.get_mut(slot).ok_or_else(|| StorageError::SlotNotFound {
                    workflow_id,
                    slot: slot.clone(),
                })?;
                row.status = status;
                row.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn set_outputs(
        &self,
        workflow_id: WorkflowId,
        slot: &ExecutionSlot,
        outputs: &HashMap<String, WorkflowValue>,
    ) -> StorageResult<()> {
        self.with_workflow(workflow_id, |inner| {
            let symbols = inner.symbols.entry(workflow_id).or_default();
            // A replayed completion overwrites its previous rows.
            symbols.retain(|symbol| {
                symbol.is_input || symbol.scope != slot.fqn || symbol.index != slot.index
            });
            for (name, value) in outputs {
                symbols.push(Symbol {
                    scope: slot.fqn.clone(),
                    name: name.clone(),
                    index: slot.index,
                    is_input: false,
                    value_type: value.inferred_type(),
                    value: Some(value.clone()),
                });
            }
            Ok(())
        })
    }

    async fn insert_calls(
        &self,
        workflow_id: WorkflowId,
        slots: &[ExecutionSlot],
    ) -> StorageResult<()> {
        self.with_workflow(workflow_id, |inner| {
            let now = Utc::now();
            let rows = inner.statuses.entry(workflow_id).or_default();
            for slot in slots {
                rows.entry(slot.clone()).or_insert(StatusRow {
                    status: CallStatus::new(ExecutionStatus::NotStarted),
                    created_at: now,
                    updated_at: now,
                });
            }
            Ok(())
        })
    }

    async fn update_workflow_state(
        &self,
        workflow_id: WorkflowId,
        state: WorkflowState,
    ) -> StorageResult<()> {
        self.with_workflow(workflow_id, |inner| {
            let row = inner
                .workflows
                .get_mut(&workflow_id)
                .ok_or(StorageError::WorkflowNotFound(workflow_id))?;
            row.state = state;
            Ok(())
        })
    }

    async fn get_inputs(&self, workflow_id: WorkflowId, call: &Fqn) -> StorageResult<Vec<Symbol>> {
        self.with_workflow(workflow_id, |inner| {
            Ok(inner
                .symbols
                .get(&workflow_id)
                .map(|symbols| {
                    symbols
                        .iter()
                        .filter(|s| s.is_input && s.scope == *call)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn get_outputs(
        &self,
        workflow_id: WorkflowId,
        slot: &ExecutionSlot,
    ) -> StorageResult<Vec<Symbol>> {
        self.with_workflow(workflow_id, |inner| {
            Ok(inner
                .symbols
                .get(&workflow_id)
                .map(|symbols| {
                    symbols
                        .iter()
                        .filter(|s| !s.is_input && s.scope == slot.fqn && s.index == slot.index)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn get_fully_qualified_name(
        &self,
        workflow_id: WorkflowId,
        fqn: &str,
    ) -> StorageResult<Vec<Symbol>> {
        self.with_workflow(workflow_id, |inner| {
            Ok(inner
                .symbols
                .get(&workflow_id)
                .map(|symbols| {
                    symbols
                        .iter()
                        .filter(|s| s.fully_qualified_name() == fqn)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn update_workflow_options(
        &self,
        workflow_id: WorkflowId,
        options: &WorkflowOptions,
    ) -> StorageResult<()> {
        self.with_workflow(workflow_id, |inner| {
            let row = inner
                .workflows
                .get_mut(&workflow_id)
                .ok_or(StorageError::WorkflowNotFound(workflow_id))?;
            row.options = options.clone();
            Ok(())
        })
    }
}
