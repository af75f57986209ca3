//! Backend capability set.
//!
//! A backend owns the actual execution of task commands (local processes, a
//! batch service, a cluster scheduler). The engine drives it through this
//! interface and never observes how jobs run, only their outcomes.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::execution::ExecutionSlot;
use crate::storage::WorkflowId;
use crate::values::WorkflowValue;
use crate::workflow::WorkflowDescriptor;

/// Backend-specific identity of a started job, opaque to the engine. Held in
/// durable storage so a restarted engine can reconnect to live jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey(pub String);

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Workflow inputs localized onto the backend's filesystem.
pub type HostInputs = HashMap<String, WorkflowValue>;

/// One concrete call hand-off to the backend.
#[derive(Debug, Clone)]
pub struct CallInvocation {
    pub workflow_id: WorkflowId,
    pub slot: ExecutionSlot,
    pub task: String,
    pub inputs: HashMap<String, WorkflowValue>,
}

/// Outcome of a completed call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub outputs: HashMap<String, WorkflowValue>,
    pub return_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("task execution failed{}: {message}", fmt_rc(.return_code))]
    Execution {
        return_code: Option<i32>,
        message: String,
    },
    #[error("call aborted")]
    Aborted,
    #[error("{0}")]
    Message(String),
}

fn fmt_rc(return_code: &Option<i32>) -> String {
    match return_code {
        Some(rc) => format!(" (rc {rc})"),
        None => String::new(),
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Execution backend capability set.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepare the backend for a fresh workflow and localize its inputs.
    async fn initialize_for_workflow(
        &self,
        descriptor: &WorkflowDescriptor,
    ) -> BackendResult<HostInputs>;

    /// Prepare the backend before a restarted workflow re-scans its store.
    async fn prepare_for_restart(&self, descriptor: &WorkflowDescriptor) -> BackendResult<()>;

    /// Jobs from a prior run that are still live and can be reconnected.
    async fn find_resumable_executions(
        &self,
        workflow_id: WorkflowId,
    ) -> BackendResult<HashMap<ExecutionSlot, JobKey>>;

    /// Run a call to completion.
    async fn execute(&self, invocation: &CallInvocation) -> BackendResult<CallOutcome>;

    /// Reconnect to a live job from a prior run and await its completion.
    async fn resume(
        &self,
        invocation: &CallInvocation,
        job: &JobKey,
    ) -> BackendResult<CallOutcome>;

    /// Release per-workflow backend resources after a terminal transition.
    async fn clean_up_for_workflow(&self, descriptor: &WorkflowDescriptor) -> BackendResult<()>;
}
