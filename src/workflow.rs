//! Per-workflow state machine.
//!
//! One actor per workflow run. The actor owns the execution store, reacts to
//! call lifecycle messages, expands scatters, collects shard outputs, and
//! persists every transition before logging it so observers never see a log
//! line ahead of durable state.
//!
//! Handlers run to completion on the actor's task; messages arriving while a
//! handler awaits storage or backend calls are buffered in the mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError, JobKey};
use crate::call_runner::{self, CacheContext, CallRunnerHandle, CallRunnerParams};
use crate::cache_copy::ResultGenerationMode;
use crate::config::EngineConfig;
use crate::execution::{
    CallStatus, ExecutionKey, ExecutionSlot, ExecutionStatus, ExecutionStore,
};
use crate::lang::{Fqn, Namespace, ScopeEntry, ScopeKind};
use crate::options::WorkflowOptions;
use crate::storage::{DataAccess, StorageError, WorkflowId, WorkflowState};
use crate::symbols::{ResolveError, Symbol, SymbolResolver};
use crate::values::WorkflowValue;

/// Immutable description of one workflow run.
#[derive(Clone)]
pub struct WorkflowDescriptor {
    pub id: WorkflowId,
    pub namespace: Arc<Namespace>,
    pub options: WorkflowOptions,
}

impl std::fmt::Debug for WorkflowDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDescriptor")
            .field("id", &self.id)
            .field("workflow", &self.namespace.workflow_name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Start,
    Restart,
}

/// Events accepted by the workflow actor.
#[derive(Debug)]
pub enum WorkflowMessage {
    Start(StartMode),
    CallStarted(ExecutionKey),
    CallCompleted {
        key: ExecutionKey,
        outputs: HashMap<String, WorkflowValue>,
        return_code: i32,
        mode: ResultGenerationMode,
    },
    CallFailed {
        key: ExecutionKey,
        return_code: Option<i32>,
        message: String,
    },
    AbortComplete(ExecutionKey),
    Abort,
    GetState(oneshot::Sender<WorkflowState>),
    GetFailureMessage(oneshot::Sender<Option<String>>),
    GetExecutionSnapshot(oneshot::Sender<Vec<(ExecutionKey, ExecutionStatus)>>),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(
        "scatter {0} was mid-expansion at restart; roll its entries back or mark it Done before resubmitting"
    )]
    ScatterMidExpansion(Fqn),
    #[error("collector {collector} is missing output {output:?} from shard {index}")]
    MissingShardOutput {
        collector: Fqn,
        output: String,
        index: i32,
    },
    #[error("unknown scope {0} in execution store")]
    UnknownScope(Fqn),
}

pub struct WorkflowActorParams {
    pub descriptor: WorkflowDescriptor,
    pub data_access: Arc<dyn DataAccess>,
    pub backend: Arc<dyn Backend>,
    pub config: EngineConfig,
    /// Cache-copy machinery; absent disables call caching entirely.
    pub cache: Option<Arc<CacheContext>>,
}

/// Handle to a spawned workflow actor.
pub struct WorkflowHandle {
    id: WorkflowId,
    tx: mpsc::Sender<WorkflowMessage>,
    handle: JoinHandle<()>,
}

impl WorkflowHandle {
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub async fn start(&self, mode: StartMode) {
        let _ = self.tx.send(WorkflowMessage::Start(mode)).await;
    }

    pub async fn abort(&self) {
        let _ = self.tx.send(WorkflowMessage::Abort).await;
    }

    pub async fn state(&self) -> Option<WorkflowState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(WorkflowMessage::GetState(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn failure_message(&self) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkflowMessage::GetFailureMessage(reply_tx))
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    pub async fn execution_snapshot(&self) -> Option<Vec<(ExecutionKey, ExecutionStatus)>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkflowMessage::GetExecutionSnapshot(reply_tx))
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    /// Wait for the actor to stop (it stops shortly after reaching a
    /// terminal state).
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawn a workflow actor. Nothing happens until `start` is sent.
pub fn spawn(params: WorkflowActorParams) -> WorkflowHandle {
    let (tx, rx) = mpsc::channel(64);
    let id = params.descriptor.id;
    let self_tx = tx.clone();
    let handle = tokio::spawn(async move {
        WorkflowActor::new(params, rx, self_tx).run().await;
    });
    WorkflowHandle { id, tx, handle }
}

struct WorkflowActor {
    descriptor: WorkflowDescriptor,
    data_access: Arc<dyn DataAccess>,
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    cache: Option<Arc<CacheContext>>,
    rx: mpsc::Receiver<WorkflowMessage>,
    self_tx: mpsc::Sender<WorkflowMessage>,
    state: WorkflowState,
    store: ExecutionStore,
    runners: HashMap<ExecutionSlot, CallRunnerHandle>,
    failure: Option<String>,
    terminate_at: Option<Instant>,
}

impl WorkflowActor {
    fn new(
        params: WorkflowActorParams,
        rx: mpsc::Receiver<WorkflowMessage>,
        self_tx: mpsc::Sender<WorkflowMessage>,
    ) -> Self {
        Self {
            descriptor: params.descriptor,
            data_access: params.data_access,
            backend: params.backend,
            config: params.config,
            cache: params.cache,
            rx,
            self_tx,
            state: WorkflowState::Submitted,
            store: ExecutionStore::new(),
            runners: HashMap::new(),
            failure: None,
            terminate_at: None,
        }
    }

    fn namespace(&self) -> &Namespace {
        &self.descriptor.namespace
    }

    async fn run(mut self) {
        let id = self.descriptor.id;
        debug!(workflow_id = %id, "workflow actor started");
        loop {
            let deadline = self.terminate_at;
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => break,
            }
        }
        debug!(workflow_id = %id, state = %self.state, "workflow actor stopped");
    }

    async fn handle(&mut self, message: WorkflowMessage) {
        match message {
            WorkflowMessage::GetState(reply) => {
                let _ = reply.send(self.state);
            }
            WorkflowMessage::GetFailureMessage(reply) => {
                let _ = reply.send(self.failure.clone());
            }
            WorkflowMessage::GetExecutionSnapshot(reply) => {
                let snapshot = self
                    .store
                    .iter()
                    .map(|(key, status)| (key.clone(), status))
                    .collect();
                let _ = reply.send(snapshot);
            }
            WorkflowMessage::Start(mode) => self.handle_start(mode).await,
            WorkflowMessage::Abort => self.handle_abort().await,
            WorkflowMessage::CallStarted(key) => self.handle_call_started(key).await,
            WorkflowMessage::CallCompleted {
                key,
                outputs,
                return_code,
                mode,
            } => self.handle_call_completed(key, outputs, return_code, mode).await,
            WorkflowMessage::CallFailed {
                key,
                return_code,
                message,
            } => self.handle_call_failed(key, return_code, message).await,
            WorkflowMessage::AbortComplete(key) => self.handle_abort_complete(key).await,
        }
    }

    async fn handle_start(&mut self, mode: StartMode) {
        if self.state != WorkflowState::Submitted {
            warn!(workflow_id = %self.descriptor.id, state = %self.state, "ignoring start in non-submitted state");
            return;
        }
        let initialized = match mode {
            StartMode::Start => self.initialize().await,
            StartMode::Restart => self.restart().await,
        };
        if let Err(err) = initialized {
            self.fail_workflow(err.to_string()).await;
            return;
        }
        if !self.transition(WorkflowState::Running).await {
            return;
        }
        self.scan_and_dispatch().await;
    }

    /// Fresh start: localize inputs, register durable rows, build the store.
    async fn initialize(&mut self) -> Result<(), WorkflowError> {
        let host_inputs = self.backend.initialize_for_workflow(&self.descriptor).await?;
        let mut symbols = Vec::with_capacity(host_inputs.len());
        for (fqn, value) in host_inputs {
            // Input FQNs are `<scope>.<name>`.
            let (scope, name) = fqn.rsplit_once('.').unwrap_or((fqn.as_str(), fqn.as_str()));
            symbols.push(Symbol::input(Fqn::new(scope), name, value));
        }

        let keys = self.initial_keys();
        let slots: Vec<ExecutionSlot> = keys.iter().map(ExecutionKey::slot).collect();
        self.data_access
            .create_workflow(&self.descriptor, &symbols, &slots)
            .await?;
        self.store = ExecutionStore::from_entries(
            keys.into_iter().map(|key| (key, ExecutionStatus::NotStarted)),
        );
        info!(workflow_id = %self.descriptor.id, entries = self.store.len(), "execution store created");
        Ok(())
    }

    /// Restart: reload the durable store and reconcile non-terminal entries.
    async fn restart(&mut self) -> Result<(), WorkflowError> {
        self.backend.prepare_for_restart(&self.descriptor).await?;
        let statuses = self
            .data_access
            .get_execution_statuses(self.descriptor.id)
            .await?;

        let mut entries = Vec::with_capacity(statuses.len());
        for (slot, call_status) in &statuses {
            let key = self
                .key_for_slot(slot)
                .ok_or_else(|| WorkflowError::UnknownScope(slot.fqn.clone()))?;
            entries.push((key, call_status.status));
        }
        self.store = ExecutionStore::from_entries(entries);

        let resumable = self
            .backend
            .find_resumable_executions(self.descriptor.id)
            .await?;

        let mut rollbacks: Vec<ExecutionKey> = Vec::new();
        let mut resumes: Vec<(ExecutionKey, JobKey)> = Vec::new();
        for (key, status) in self.store.iter() {
            match (key, status) {
                // A scatter caught mid-expansion needs operator intervention:
                // shards may or may not exist durably. Fail loudly.
                (ExecutionKey::Scatter { fqn, .. }, ExecutionStatus::Starting) => {
                    return Err(WorkflowError::ScatterMidExpansion(fqn.clone()));
                }
                (_, ExecutionStatus::Starting) => rollbacks.push(key.clone()),
                (ExecutionKey::Call { .. }, ExecutionStatus::Running) => {
                    match resumable.get(&key.slot()) {
                        Some(job) => resumes.push((key.clone(), job.clone())),
                        None => rollbacks.push(key.clone()),
                    }
                }
                (_, ExecutionStatus::Running) => rollbacks.push(key.clone()),
                _ => {}
            }
        }

        if !rollbacks.is_empty() {
            let slots: Vec<ExecutionSlot> = rollbacks.iter().map(ExecutionKey::slot).collect();
            self.data_access
                .set_status(
                    self.descriptor.id,
                    &slots,
                    CallStatus::new(ExecutionStatus::NotStarted),
                )
                .await?;
            for key in &rollbacks {
                self.store.set(key, ExecutionStatus::NotStarted);
                info!(workflow_id = %self.descriptor.id, %key, "rolled back to NotStarted for restart");
            }
        }

        for (key, job) in resumes {
            info!(workflow_id = %self.descriptor.id, %key, job = %job, "resuming live job");
            self.spawn_runner(key, Some(job));
        }

        info!(workflow_id = %self.descriptor.id, entries = self.store.len(), "execution store reloaded");
        Ok(())
    }

    /// Initial execution entries: top-level calls and scatter nodes. Entries
    /// for scattered calls appear when their scatter expands.
    fn initial_keys(&self) -> Vec<ExecutionKey> {
        self.namespace()
            .top_level_scopes()
            .iter()
            .map(|entry| match &entry.kind {
                ScopeKind::Scatter { .. } => ExecutionKey::scatter(entry.fqn.clone()),
                _ => ExecutionKey::call(entry.fqn.clone(), None),
            })
            .collect()
    }

    /// Reconstruct the key kind for a durable slot.
    fn key_for_slot(&self, slot: &ExecutionSlot) -> Option<ExecutionKey> {
        let entry = self.namespace().scope(&slot.fqn)?;
        match &entry.kind {
            ScopeKind::Scatter { .. } => Some(ExecutionKey::Scatter {
                fqn: slot.fqn.clone(),
                index: slot.index,
            }),
            ScopeKind::Call(_) => {
                if slot.index.is_none() && self.namespace().scatter_ancestor(&slot.fqn).is_some() {
                    Some(ExecutionKey::collector(slot.fqn.clone()))
                } else {
                    Some(ExecutionKey::call(slot.fqn.clone(), slot.index))
                }
            }
            ScopeKind::Declaration(_) => None,
        }
    }

    /// Start every runnable key, repeating until no new work appears.
    async fn scan_and_dispatch(&mut self) {
        while self.state == WorkflowState::Running {
            let runnable = self.store.runnable_keys(self.namespace());
            if runnable.is_empty() {
                break;
            }
            for key in runnable {
                if self.state != WorkflowState::Running {
                    return;
                }
                let result = match &key {
                    ExecutionKey::Scatter { .. } => self.expand_scatter(&key).await,
                    ExecutionKey::Collector { .. } => self.collect(&key).await,
                    ExecutionKey::Call { .. } => self.start_call(key.clone()).await,
                };
                if let Err(err) = result {
                    self.fail_workflow(err.to_string()).await;
                    return;
                }
            }
        }
        if self.state == WorkflowState::Running && self.store.all_done() {
            self.succeed().await;
        }
    }

    /// Evaluate the scatter collection and materialize shard and collector
    /// entries. The store mutation completes before the scan resumes, so the
    /// new shards take part in the same fixed-point pass.
    async fn expand_scatter(&mut self, key: &ExecutionKey) -> Result<(), WorkflowError> {
        let scatter_entry = self
            .namespace()
            .scope(key.fqn())
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownScope(key.fqn().clone()))?;
        let items = {
            let resolver = SymbolResolver::new(
                self.namespace(),
                self.descriptor.id,
                self.data_access.as_ref(),
            );
            resolver.evaluate_scatter_collection(&scatter_entry).await?
        };
        let width = items.len();

        let calls = self.namespace().calls_under(key.fqn());
        let mut new_keys = Vec::with_capacity(calls.len() * (width + 1));
        for call in &calls {
            for index in 0..width {
                new_keys.push(ExecutionKey::call(call.fqn.clone(), Some(index as i32)));
            }
            new_keys.push(ExecutionKey::collector(call.fqn.clone()));
        }
        let new_slots: Vec<ExecutionSlot> = new_keys.iter().map(ExecutionKey::slot).collect();

        let slot = [key.slot()];
        self.data_access
            .set_status(
                self.descriptor.id,
                &slot,
                CallStatus::new(ExecutionStatus::Starting),
            )
            .await?;
        self.store.set(key, ExecutionStatus::Starting);

        self.data_access
            .insert_calls(self.descriptor.id, &new_slots)
            .await?;
        for new_key in new_keys {
            self.store.insert(new_key, ExecutionStatus::NotStarted);
        }

        self.data_access
            .set_status(
                self.descriptor.id,
                &slot,
                CallStatus::with_return_code(ExecutionStatus::Done, 0),
            )
            .await?;
        self.store.set(key, ExecutionStatus::Done);
        info!(workflow_id = %self.descriptor.id, scatter = %key.fqn(), width, "scatter expanded");
        Ok(())
    }

    /// Merge shard outputs into array-typed outputs for the collector entry.
    async fn collect(&mut self, key: &ExecutionKey) -> Result<(), WorkflowError> {
        let fqn = key.fqn().clone();
        let slot = [key.slot()];
        self.data_access
            .set_status(
                self.descriptor.id,
                &slot,
                CallStatus::new(ExecutionStatus::Starting),
            )
            .await?;
        self.store.set(key, ExecutionStatus::Starting);

        let task_outputs = self
            .namespace()
            .scope(&fqn)
            .and_then(ScopeEntry::as_call)
            .and_then(|call| self.namespace().task(&call.task))
            .map(|task| task.outputs.clone())
            .unwrap_or_default();

        let shard_slots: Vec<ExecutionSlot> = self
            .store
            .shards_of(&fqn)
            .iter()
            .map(|(shard, _)| shard.slot())
            .collect();

        let mut collected: HashMap<String, WorkflowValue> = HashMap::new();
        for output in &task_outputs {
            let mut values = Vec::with_capacity(shard_slots.len());
            for shard_slot in &shard_slots {
                let symbols = self
                    .data_access
                    .get_outputs(self.descriptor.id, shard_slot)
                    .await?;
                let value = symbols
                    .into_iter()
                    .find(|symbol| symbol.name == output.name)
                    .and_then(|symbol| symbol.value)
                    .ok_or_else(|| WorkflowError::MissingShardOutput {
                        collector: fqn.clone(),
                        output: output.name.clone(),
                        index: shard_slot.index.unwrap_or(-1),
                    })?;
                values.push(value);
            }
            collected.insert(output.name.clone(), WorkflowValue::Array(values));
        }

        self.data_access
            .set_outputs(self.descriptor.id, &key.slot(), &collected)
            .await?;
        self.data_access
            .set_status(
                self.descriptor.id,
                &slot,
                CallStatus::with_return_code(ExecutionStatus::Done, 0),
            )
            .await?;
        self.store.set(key, ExecutionStatus::Done);
        info!(workflow_id = %self.descriptor.id, collector = %fqn, shards = shard_slots.len(), "shards collected");
        Ok(())
    }

    /// Persist `Starting` and hand the call to a runner. The in-memory store
    /// moves in the same handler, so a key is dispatched at most once.
    async fn start_call(&mut self, key: ExecutionKey) -> Result<(), WorkflowError> {
        let slot = [key.slot()];
        self.data_access
            .set_status(
                self.descriptor.id,
                &slot,
                CallStatus::new(ExecutionStatus::Starting),
            )
            .await?;
        self.store.set(&key, ExecutionStatus::Starting);
        self.spawn_runner(key, None);
        Ok(())
    }

    fn spawn_runner(&mut self, key: ExecutionKey, resume_job: Option<JobKey>) {
        let call = match self
            .namespace()
            .scope(key.fqn())
            .and_then(ScopeEntry::as_call)
        {
            Some(call) => call.clone(),
            None => {
                error!(workflow_id = %self.descriptor.id, %key, "no call scope for runner");
                return;
            }
        };
        let params = CallRunnerParams {
            key: key.clone(),
            call,
            descriptor: self.descriptor.clone(),
            data_access: Arc::clone(&self.data_access),
            backend: Arc::clone(&self.backend),
            resume_job,
            cache: self.cache.clone(),
        };
        let handle = call_runner::spawn(params, self.self_tx.clone());
        self.runners.insert(key.slot(), handle);
    }

    async fn handle_call_started(&mut self, key: ExecutionKey) {
        if self.state.is_terminal() {
            return;
        }
        if self
            .persist_status(&key, CallStatus::new(ExecutionStatus::Running))
            .await
        {
            self.store.set(&key, ExecutionStatus::Running);
        }
    }

    async fn handle_call_completed(
        &mut self,
        key: ExecutionKey,
        outputs: HashMap<String, WorkflowValue>,
        return_code: i32,
        mode: ResultGenerationMode,
    ) {
        if self.state.is_terminal() {
            debug!(workflow_id = %self.descriptor.id, %key, "completion after terminal state");
            return;
        }
        self.runners.remove(&key.slot());
        if let Err(err) = self
            .data_access
            .set_outputs(self.descriptor.id, &key.slot(), &outputs)
            .await
        {
            self.persistence_failed(err).await;
            return;
        }
        if !self
            .persist_status(
                &key,
                CallStatus::with_return_code(ExecutionStatus::Done, return_code),
            )
            .await
        {
            return;
        }
        self.store.set(&key, ExecutionStatus::Done);
        info!(workflow_id = %self.descriptor.id, %key, return_code, cached = mode == ResultGenerationMode::CallCached, "call done");

        match self.state {
            WorkflowState::Aborting => self.maybe_aborted().await,
            WorkflowState::Running => self.scan_and_dispatch().await,
            _ => {}
        }
    }

    async fn handle_call_failed(
        &mut self,
        key: ExecutionKey,
        return_code: Option<i32>,
        message: String,
    ) {
        if self.state.is_terminal() {
            debug!(workflow_id = %self.descriptor.id, %key, "failure after terminal state");
            return;
        }
        self.runners.remove(&key.slot());
        let status = CallStatus {
            status: ExecutionStatus::Failed,
            return_code,
        };
        if self.persist_status(&key, status).await {
            self.store.set(&key, ExecutionStatus::Failed);
        }
        match self.state {
            WorkflowState::Aborting => {
                self.failure.get_or_insert(message);
                self.maybe_aborted().await;
            }
            _ => {
                self.fail_workflow(format!("{key} failed: {message}")).await;
            }
        }
    }

    async fn handle_abort_complete(&mut self, key: ExecutionKey) {
        if self.state.is_terminal() {
            return;
        }
        self.runners.remove(&key.slot());
        if self
            .persist_status(&key, CallStatus::new(ExecutionStatus::Aborted))
            .await
        {
            self.store.set(&key, ExecutionStatus::Aborted);
        }
        match self.state {
            WorkflowState::Aborting => self.maybe_aborted().await,
            _ => {
                self.fail_workflow(format!("{key} was aborted by its backend")).await;
            }
        }
    }

    async fn handle_abort(&mut self) {
        if self.state.is_terminal() || self.state == WorkflowState::Aborting {
            return;
        }
        info!(workflow_id = %self.descriptor.id, children = self.runners.len(), "aborting workflow");
        for handle in self.runners.values() {
            handle.abort();
        }
        if !self.transition(WorkflowState::Aborting).await {
            return;
        }
        self.maybe_aborted().await;
    }

    async fn maybe_aborted(&mut self) {
        if self.runners.is_empty()
            && self.store.quiesced()
            && self.transition(WorkflowState::Aborted).await
        {
            self.terminal_cleanup().await;
        }
    }

    async fn succeed(&mut self) {
        if self.transition(WorkflowState::Succeeded).await {
            self.terminal_cleanup().await;
        }
    }

    async fn fail_workflow(&mut self, message: String) {
        error!(workflow_id = %self.descriptor.id, failure = %message, "workflow failed");
        self.failure.get_or_insert(message);
        if self
            .data_access
            .update_workflow_state(self.descriptor.id, WorkflowState::Failed)
            .await
            .is_err()
        {
            error!(workflow_id = %self.descriptor.id, "could not persist Failed state");
        }
        self.state = WorkflowState::Failed;
        self.terminal_cleanup().await;
    }

    /// Persist the workflow state, then log. Returns false when persistence
    /// failed (the workflow is then failed instead).
    async fn transition(&mut self, next: WorkflowState) -> bool {
        match self
            .data_access
            .update_workflow_state(self.descriptor.id, next)
            .await
        {
            Ok(()) => {
                info!(workflow_id = %self.descriptor.id, from = %self.state, to = %next, "workflow transition");
                self.state = next;
                true
            }
            Err(err) => {
                self.persistence_failed(err).await;
                false
            }
        }
    }

    /// Persist one entry's status. Returns false (after failing the
    /// workflow) when the write was lost.
    async fn persist_status(&mut self, key: &ExecutionKey, status: CallStatus) -> bool {
        let slots = [key.slot()];
        match self
            .data_access
            .set_status(self.descriptor.id, &slots, status)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.persistence_failed(err).await;
                false
            }
        }
    }

    async fn persistence_failed(&mut self, err: StorageError) {
        metrics::counter!("strand_persistence_errors_total").increment(1);
        self.fail_workflow(format!("persistence failure: {err}")).await;
    }

    /// Terminal housekeeping: backend cleanup, encrypted-option purge, and a
    /// short self-terminate timer so late queries still get answers.
    async fn terminal_cleanup(&mut self) {
        if let Err(err) = self.backend.clean_up_for_workflow(&self.descriptor).await {
            warn!(workflow_id = %self.descriptor.id, %err, "backend cleanup failed");
        }
        if self.descriptor.options.has_encrypted() {
            let mut options = self.descriptor.options.clone();
            options.clear_encrypted();
            if let Err(err) = self
                .data_access
                .update_workflow_options(self.descriptor.id, &options)
                .await
            {
                warn!(workflow_id = %self.descriptor.id, %err, "could not clear encrypted options");
            }
        }
        self.terminate_at = Some(Instant::now() + self.config.terminate_delay);
    }
}

/// Convenience for tests and embedders: poll the handle until the workflow
/// reaches a terminal state or `deadline` elapses.
pub async fn await_terminal_state(
    handle: &WorkflowHandle,
    deadline: Duration,
) -> Option<WorkflowState> {
    let end = Instant::now() + deadline;
    loop {
        match handle.state().await {
            Some(state) if state.is_terminal() => return Some(state),
            Some(_) if Instant::now() < end => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, CallInvocation, CallOutcome, HostInputs};
    use crate::lang::{Call, Scatter, Task, TaskOutput, Workflow, WorkflowNode};
    use crate::values::ValueType;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct NoopBackend;

    #[async_trait]
    impl Backend for NoopBackend {
        async fn initialize_for_workflow(
            &self,
            _descriptor: &WorkflowDescriptor,
        ) -> BackendResult<HostInputs> {
            Ok(HostInputs::new())
        }

        async fn prepare_for_restart(
            &self,
            _descriptor: &WorkflowDescriptor,
        ) -> BackendResult<()> {
            Ok(())
        }

        async fn find_resumable_executions(
            &self,
            _workflow_id: WorkflowId,
        ) -> BackendResult<StdHashMap<ExecutionSlot, JobKey>> {
            Ok(StdHashMap::new())
        }

        async fn execute(&self, _invocation: &CallInvocation) -> BackendResult<CallOutcome> {
            Ok(CallOutcome {
                outputs: StdHashMap::new(),
                return_code: 0,
            })
        }

        async fn resume(
            &self,
            invocation: &CallInvocation,
            _job: &JobKey,
        ) -> BackendResult<CallOutcome> {
            self.execute(invocation).await
        }

        async fn clean_up_for_workflow(
            &self,
            _descriptor: &WorkflowDescriptor,
        ) -> BackendResult<()> {
            Ok(())
        }
    }

    fn namespace_with_scatter() -> Arc<Namespace> {
        let workflow = Workflow {
            name: "wf".to_string(),
            body: vec![WorkflowNode::Scatter(Scatter {
                item: "i".to_string(),
                collection: crate::lang::Expression::Literal(WorkflowValue::Array(vec![])),
                body: vec![WorkflowNode::Call(Call {
                    name: "a".to_string(),
                    task: "a".to_string(),
                    inputs: vec![],
                })],
            })],
        };
        let task = Task {
            name: "a".to_string(),
            inputs: vec![],
            outputs: vec![TaskOutput {
                name: "out".to_string(),
                value_type: ValueType::Integer,
            }],
        };
        Arc::new(Namespace::new(workflow, vec![task], StdHashMap::new()).unwrap())
    }

    #[test]
    fn slot_reconstruction_distinguishes_kinds() {
        let namespace = namespace_with_scatter();
        let actor = WorkflowActor {
            descriptor: WorkflowDescriptor {
                id: WorkflowId::new(),
                namespace,
                options: WorkflowOptions::new(),
            },
            data_access: Arc::new(crate::storage::MemoryStore::new()),
            backend: Arc::new(NoopBackend),
            config: EngineConfig::default(),
            cache: None,
            rx: mpsc::channel(1).1,
            self_tx: mpsc::channel(1).0,
            state: WorkflowState::Submitted,
            store: ExecutionStore::new(),
            runners: HashMap::new(),
            failure: None,
            terminate_at: None,
        };

        let scatter = ExecutionSlot::new(Fqn::new("wf.$scatter_0"), None);
        assert!(matches!(
            actor.key_for_slot(&scatter),
            Some(ExecutionKey::Scatter { .. })
        ));

        let shard = ExecutionSlot::new(Fqn::new("wf.$scatter_0.a"), Some(1));
        assert!(matches!(
            actor.key_for_slot(&shard),
            Some(ExecutionKey::Call { index: Some(1), .. })
        ));

        let collector = ExecutionSlot::new(Fqn::new("wf.$scatter_0.a"), None);
        assert!(matches!(
            actor.key_for_slot(&collector),
            Some(ExecutionKey::Collector { .. })
        ));
    }
}
