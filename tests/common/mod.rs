//! Shared test fixtures: a programmable backend, a scripted I/O broker, and
//! namespace builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use strand::backend::{
    Backend, BackendResult, CallInvocation, CallOutcome, HostInputs, JobKey,
};
use strand::execution::ExecutionSlot;
use strand::io::{IoAck, IoClient, IoCommand, IoRequest};
use strand::lang::{Call, Expression, Namespace, Scatter, Task, TaskInput, TaskOutput, Workflow, WorkflowNode};
use strand::options::WorkflowOptions;
use strand::storage::WorkflowId;
use strand::values::ValueType;
use strand::workflow::WorkflowDescriptor;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

pub type TaskHandler = Arc<dyn Fn(&CallInvocation) -> BackendResult<CallOutcome> + Send + Sync>;

/// Backend whose behavior is scripted per task name. Records every dispatch
/// so tests can assert nothing ran twice.
#[derive(Default)]
pub struct StubBackend {
    host_inputs: Mutex<HostInputs>,
    handlers: Mutex<HashMap<String, TaskHandler>>,
    delays: Mutex<HashMap<String, Duration>>,
    resumable: Mutex<HashMap<ExecutionSlot, JobKey>>,
    executed: Mutex<Vec<ExecutionSlot>>,
    resumed: Mutex<Vec<(ExecutionSlot, JobKey)>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host_inputs(self, inputs: HostInputs) -> Self {
        *self.host_inputs.lock().unwrap() = inputs;
        self
    }

    pub fn on_task(
        &self,
        task: &str,
        handler: impl Fn(&CallInvocation) -> BackendResult<CallOutcome> + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .insert(task.to_string(), Arc::new(handler));
    }

    /// Delay execution of a task, giving abort tests a window to interrupt.
    pub fn delay_task(&self, task: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(task.to_string(), delay);
    }

    pub fn set_resumable(&self, slot: ExecutionSlot, job: JobKey) {
        self.resumable.lock().unwrap().insert(slot, job);
    }

    pub fn executed_slots(&self) -> Vec<ExecutionSlot> {
        self.executed.lock().unwrap().clone()
    }

    pub fn resumed_jobs(&self) -> Vec<(ExecutionSlot, JobKey)> {
        self.resumed.lock().unwrap().clone()
    }

    fn outcome_for(&self, invocation: &CallInvocation) -> BackendResult<CallOutcome> {
        let handler = self.handlers.lock().unwrap().get(&invocation.task).cloned();
        match handler {
            Some(handler) => handler(invocation),
            None => Ok(CallOutcome {
                outputs: HashMap::new(),
                return_code: 0,
            }),
        }
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn initialize_for_workflow(
        &self,
        _descriptor: &WorkflowDescriptor,
    ) -> BackendResult<HostInputs> {
        Ok(self.host_inputs.lock().unwrap().clone())
    }

    async fn prepare_for_restart(&self, _descriptor: &WorkflowDescriptor) -> BackendResult<()> {
        Ok(())
    }

    async fn find_resumable_executions(
        &self,
        _workflow_id: WorkflowId,
    ) -> BackendResult<HashMap<ExecutionSlot, JobKey>> {
        Ok(self.resumable.lock().unwrap().clone())
    }

    async fn execute(&self, invocation: &CallInvocation) -> BackendResult<CallOutcome> {
        let delay = self.delays.lock().unwrap().get(&invocation.task).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.executed.lock().unwrap().push(invocation.slot.clone());
        self.outcome_for(invocation)
    }

    async fn resume(
        &self,
        invocation: &CallInvocation,
        job: &JobKey,
    ) -> BackendResult<CallOutcome> {
        self.resumed
            .lock()
            .unwrap()
            .push((invocation.slot.clone(), job.clone()));
        self.outcome_for(invocation)
    }

    async fn clean_up_for_workflow(&self, _descriptor: &WorkflowDescriptor) -> BackendResult<()> {
        Ok(())
    }
}

/// An I/O broker whose acknowledgements are scripted. `respond` returning
/// `None` swallows the command (for timeout tests).
pub struct ScriptedBroker {
    client: IoClient,
    received: Arc<Mutex<Vec<IoCommand>>>,
    handle: JoinHandle<()>,
}

impl ScriptedBroker {
    pub fn start(respond: impl Fn(&IoCommand) -> Option<IoAck> + Send + 'static) -> Self {
        let (tx, mut rx) = mpsc::channel::<IoRequest>(16);
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                seen.lock().unwrap().push(request.command.clone());
                if let Some(ack) = respond(&request.command) {
                    let _ = request.reply.send(ack).await;
                }
            }
        });
        Self {
            client: IoClient::new(tx),
            received,
            handle,
        }
    }

    pub fn client(&self) -> IoClient {
        self.client.clone()
    }

    pub fn received(&self) -> Vec<IoCommand> {
        self.received.lock().unwrap().clone()
    }

    pub async fn shutdown(self) {
        drop(self.client);
        let _ = self.handle.await;
    }
}

pub fn task(name: &str, inputs: &[(&str, ValueType)], outputs: &[(&str, ValueType)]) -> Task {
    Task {
        name: name.to_string(),
        inputs: inputs
            .iter()
            .map(|(n, t)| TaskInput {
                name: n.to_string(),
                value_type: t.clone(),
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(n, t)| TaskOutput {
                name: n.to_string(),
                value_type: t.clone(),
            })
            .collect(),
    }
}

pub fn call(name: &str, inputs: Vec<(&str, Expression)>) -> WorkflowNode {
    WorkflowNode::Call(Call {
        name: name.to_string(),
        task: name.to_string(),
        inputs: inputs
            .into_iter()
            .map(|(n, e)| (n.to_string(), e))
            .collect(),
    })
}

pub fn scatter(item: &str, collection: Expression, body: Vec<WorkflowNode>) -> WorkflowNode {
    WorkflowNode::Scatter(Scatter {
        item: item.to_string(),
        collection,
        body,
    })
}

pub fn namespace(name: &str, body: Vec<WorkflowNode>, tasks: Vec<Task>) -> Arc<Namespace> {
    let workflow = Workflow {
        name: name.to_string(),
        body,
    };
    Arc::new(Namespace::new(workflow, tasks, HashMap::new()).expect("valid namespace"))
}

pub fn descriptor(namespace: Arc<Namespace>) -> WorkflowDescriptor {
    WorkflowDescriptor {
        id: WorkflowId::new(),
        namespace,
        options: WorkflowOptions::new(),
    }
}
