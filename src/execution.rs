//! Execution keys, statuses, and the in-memory execution store.
//!
//! The store is the workflow actor's source of truth for what is runnable.
//! It is bulk-loaded from durable storage on start (which may contain rows
//! from a prior crashed run) and mutated only on the workflow actor's task.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::lang::{Fqn, Namespace};

/// Lifecycle status of one execution entry. Statuses only move forward,
/// except for restart-driven rollbacks applied before the store is scanned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ExecutionStatus {
    NotStarted,
    Starting,
    Running,
    Done,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Done | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::NotStarted => "NotStarted",
            ExecutionStatus::Starting => "Starting",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Done => "Done",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "NotStarted" => Ok(ExecutionStatus::NotStarted),
            "Starting" => Ok(ExecutionStatus::Starting),
            "Running" => Ok(ExecutionStatus::Running),
            "Done" => Ok(ExecutionStatus::Done),
            "Failed" => Ok(ExecutionStatus::Failed),
            "Aborted" => Ok(ExecutionStatus::Aborted),
            other => Err(format!("unknown execution status {other:?}")),
        }
    }
}

/// Durable form of an execution entry's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStatus {
    pub status: ExecutionStatus,
    pub return_code: Option<i32>,
}

impl CallStatus {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            return_code: None,
        }
    }

    pub fn with_return_code(status: ExecutionStatus, return_code: i32) -> Self {
        Self {
            status,
            return_code: Some(return_code),
        }
    }
}

/// Identity of an execution row in durable storage: `(fqn, index)` is unique
/// within a workflow regardless of key kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionSlot {
    pub fqn: Fqn,
    pub index: Option<i32>,
}

impl ExecutionSlot {
    pub fn new(fqn: Fqn, index: Option<i32>) -> Self {
        Self { fqn, index }
    }
}

impl fmt::Display for ExecutionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{index}", self.fqn),
            None => write!(f, "{}", self.fqn),
        }
    }
}

/// A schedulable unit: a concrete call invocation, a scatter node, or the
/// collector that merges a scattered call's shards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionKey {
    Call { fqn: Fqn, index: Option<i32> },
    Scatter { fqn: Fqn, index: Option<i32> },
    Collector { fqn: Fqn },
}

impl ExecutionKey {
    pub fn call(fqn: Fqn, index: Option<i32>) -> Self {
        ExecutionKey::Call { fqn, index }
    }

    pub fn scatter(fqn: Fqn) -> Self {
        ExecutionKey::Scatter { fqn, index: None }
    }

    pub fn collector(fqn: Fqn) -> Self {
        ExecutionKey::Collector { fqn }
    }

    pub fn fqn(&self) -> &Fqn {
        match self {
            ExecutionKey::Call { fqn, .. }
            | ExecutionKey::Scatter { fqn, .. }
            | ExecutionKey::Collector { fqn } => fqn,
        }
    }

    pub fn index(&self) -> Option<i32> {
        match self {
            ExecutionKey::Call { index, .. } | ExecutionKey::Scatter { index, .. } => *index,
            ExecutionKey::Collector { .. } => None,
        }
    }

    pub fn slot(&self) -> ExecutionSlot {
        ExecutionSlot::new(self.fqn().clone(), self.index())
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKey::Call { .. } => write!(f, "call {}", self.slot()),
            ExecutionKey::Scatter { .. } => write!(f, "scatter {}", self.slot()),
            ExecutionKey::Collector { fqn } => write!(f, "collector {fqn}"),
        }
    }
}

/// In-memory map from execution key to status.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStore {
    entries: HashMap<ExecutionKey, ExecutionStatus>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (ExecutionKey, ExecutionStatus)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, key: ExecutionKey, status: ExecutionStatus) {
        self.entries.insert(key, status);
    }

    pub fn set(&mut self, key: &ExecutionKey, status: ExecutionStatus) {
        if let Some(entry) = self.entries.get_mut(key) {
            *entry = status;
        }
    }

    pub fn status(&self, key: &ExecutionKey) -> Option<ExecutionStatus> {
        self.entries.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExecutionKey, ExecutionStatus)> {
        self.entries.iter().map(|(k, s)| (k, *s))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries for a scope matched by `(fqn, index)`, the durable identity.
    pub fn entries_for(
        &self,
        fqn: &Fqn,
        index: Option<i32>,
    ) -> Vec<(&ExecutionKey, ExecutionStatus)> {
        self.iter()
            .filter(|(key, _)| key.fqn() == fqn && key.index() == index)
            .collect()
    }

    /// All shard entries of a scattered call, ordered by index ascending.
    pub fn shards_of(&self, fqn: &Fqn) -> Vec<(&ExecutionKey, ExecutionStatus)> {
        let mut shards: Vec<_> = self
            .iter()
            .filter(|(key, _)| {
                matches!(key, ExecutionKey::Call { index: Some(_), .. }) && key.fqn() == fqn
            })
            .collect();
        shards.sort_by_key(|(key, _)| key.index());
        shards
    }

    /// True once every entry is `Done`.
    pub fn all_done(&self) -> bool {
        self.entries.values().all(|s| *s == ExecutionStatus::Done)
    }

    /// True once every entry is terminal or never started; the abort path
    /// waits for this before declaring the workflow aborted.
    pub fn quiesced(&self) -> bool {
        self.entries
            .values()
            .all(|s| s.is_terminal() || *s == ExecutionStatus::NotStarted)
    }

    /// Keys whose prerequisites are all satisfied, per the dependency rules.
    /// Callers re-invoke after every completion until a fixed point.
    pub fn runnable_keys(&self, namespace: &Namespace) -> Vec<ExecutionKey> {
        let mut runnable: Vec<ExecutionKey> = self
            .iter()
            .filter(|(key, status)| {
                *status == ExecutionStatus::NotStarted && self.is_runnable(namespace, key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        runnable.sort_by_key(|key| key.slot());
        runnable
    }

    fn is_runnable(&self, namespace: &Namespace, key: &ExecutionKey) -> bool {
        if let ExecutionKey::Collector { fqn } = key {
            let shards = self.shards_of(fqn);
            return !shards.is_empty()
                && shards
                    .iter()
                    .all(|(_, status)| *status == ExecutionStatus::Done);
        }
        for prerequisite in namespace.prerequisites(key.fqn()) {
            // Inside a shared scatter the dependency is shard-aligned;
            // otherwise it is on the aggregated (collected) entry.
            let shared_scatter = namespace
                .closest_common_ancestor(&prerequisite, key.fqn())
                .is_some_and(|ancestor| ancestor.is_scatter());
            let wanted_index = if shared_scatter { key.index() } else { None };
            let upstream = self.entries_for(&prerequisite, wanted_index);
            // An empty set means a scatter has not yet expanded; wait.
            if upstream.is_empty()
                || upstream
                    .iter()
                    .any(|(_, status)| *status != ExecutionStatus::Done)
            {
                return false;
            }
        }
        true
    }
}
