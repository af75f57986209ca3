//! Per-call worker.
//!
//! Spawned by the workflow actor for each runnable call key. The runner
//! resolves and coerces the call's inputs, optionally routes through a
//! cache-hit copy attempt, then hands the invocation to the backend and
//! reports the outcome back to its parent. Failures never cross the task
//! boundary as panics; every exit is a typed message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, CallInvocation, JobKey};
use crate::blacklist::BlacklistCache;
use crate::cache_copy::{
    self, CacheCopyHooks, CacheCopyParams, CacheHit, CopyResponse, ResultGenerationMode,
};
use crate::execution::{ExecutionKey, ExecutionSlot};
use crate::io::IoClient;
use crate::lang::Call;
use crate::paths::JobPaths;
use crate::storage::DataAccess;
use crate::symbols::SymbolResolver;
use crate::values::{WorkflowValue, assemble_outputs};
use crate::workflow::{WorkflowDescriptor, WorkflowMessage};

/// A cache hit matched to a call, plus the destination layout its outputs
/// would be copied into.
#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub hit: CacheHit,
    pub destination: JobPaths,
}

/// Shared cache-copy machinery, present when call caching is configured.
pub struct CacheContext {
    pub io: IoClient,
    pub blacklist: Arc<BlacklistCache>,
    pub hooks: Arc<dyn CacheCopyHooks>,
    pub io_timeout: Duration,
    /// Cache hits matched upstream, keyed by execution slot.
    pub candidates: HashMap<ExecutionSlot, CacheCandidate>,
}

pub struct CallRunnerParams {
    pub key: ExecutionKey,
    pub call: Call,
    pub descriptor: WorkflowDescriptor,
    pub data_access: Arc<dyn DataAccess>,
    pub backend: Arc<dyn Backend>,
    /// Present when the workflow restarted on top of a live job.
    pub resume_job: Option<JobKey>,
    pub cache: Option<Arc<CacheContext>>,
}

/// Handle held by the workflow actor for abort broadcasting.
pub struct CallRunnerHandle {
    abort_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CallRunnerHandle {
    pub fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawn a call runner reporting to `parent`.
pub fn spawn(params: CallRunnerParams, parent: mpsc::Sender<WorkflowMessage>) -> CallRunnerHandle {
    let (abort_tx, abort_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        CallRunner {
            params,
            parent,
            abort_rx,
        }
        .run()
        .await;
    });
    CallRunnerHandle { abort_tx, handle }
}

struct CallRunner {
    params: CallRunnerParams,
    parent: mpsc::Sender<WorkflowMessage>,
    abort_rx: watch::Receiver<bool>,
}

impl CallRunner {
    async fn run(mut self) {
        let key = self.params.key.clone();
        self.report(WorkflowMessage::CallStarted(key.clone())).await;

        if self.aborted() {
            self.report(WorkflowMessage::AbortComplete(key)).await;
            return;
        }

        // Cache-hit copying is an alternative to execution: a successful copy
        // completes the call, any failure falls back to the backend.
        if let Some(message) = self.try_cache_copy().await {
            self.report(message).await;
            return;
        }

        let message = match self.resolve_inputs().await {
            Ok(inputs) => self.execute(inputs).await,
            Err(err) => WorkflowMessage::CallFailed {
                key: key.clone(),
                return_code: None,
                message: err.to_string(),
            },
        };
        self.report(message).await;
    }

    fn aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    async fn report(&self, message: WorkflowMessage) {
        if self.parent.send(message).await.is_err() {
            warn!(key = %self.params.key, "workflow actor is gone, dropping call report");
        }
    }

    /// Returns a terminal message when the copy attempt settled the call.
    async fn try_cache_copy(&mut self) -> Option<WorkflowMessage> {
        let cache = self.params.cache.clone()?;
        let candidate = cache.candidates.get(&self.params.key.slot())?.clone();
        let key = self.params.key.clone();

        let (copy_tx, mut copy_rx) = mpsc::channel(1);
        let worker = cache_copy::spawn(
            CacheCopyParams {
                slot: key.slot(),
                attempt: 1,
                hit: candidate.hit,
                destination: candidate.destination,
                blacklist: Arc::clone(&cache.blacklist),
                io: cache.io.clone(),
                hooks: Arc::clone(&cache.hooks),
                io_timeout: cache.io_timeout,
            },
            copy_tx,
        );

        let response = tokio::select! {
            response = copy_rx.recv() => response,
            _ = self.abort_rx.changed() => {
                worker.abort().await;
                // The worker answers (JobAborted or a settled outcome) and
                // stops; either way this call is done.
                let _ = copy_rx.recv().await;
                worker.join().await;
                return Some(WorkflowMessage::AbortComplete(key));
            }
        };
        worker.join().await;

        match response {
            Some(CopyResponse::JobSucceeded {
                outputs,
                return_code,
                generation_mode,
                ..
            }) => match assemble_outputs(&outputs) {
                Ok(outputs) => {
                    info!(key = %key, "call completed from cache");
                    Some(WorkflowMessage::CallCompleted {
                        key,
                        outputs,
                        return_code,
                        mode: generation_mode,
                    })
                }
                Err(err) => Some(WorkflowMessage::CallFailed {
                    key,
                    return_code: None,
                    message: format!("reassembling cached outputs: {err}"),
                }),
            },
            Some(CopyResponse::CopyingOutputsFailed { failure, .. }) => {
                if failure.is_loggable() {
                    info!(key = %key, %failure, "cache copy failed, running the task");
                } else {
                    debug!(key = %key, %failure, "cache copy skipped, running the task");
                }
                None
            }
            Some(CopyResponse::JobAborted { .. }) => {
                Some(WorkflowMessage::AbortComplete(key))
            }
            None => {
                warn!(key = %key, "cache copy worker vanished, running the task");
                None
            }
        }
    }

    async fn resolve_inputs(
        &self,
    ) -> Result<HashMap<String, WorkflowValue>, crate::symbols::ResolveError> {
        let namespace = &self.params.descriptor.namespace;
        let resolver = SymbolResolver::new(
            namespace,
            self.params.descriptor.id,
            self.params.data_access.as_ref(),
        );
        let task = namespace.task(&self.params.call.task);

        // Workflow-supplied inputs first, call-level expressions on top.
        let mut inputs = HashMap::new();
        let supplied = self
            .params
            .data_access
            .get_inputs(self.params.descriptor.id, self.params.key.fqn())
            .await?;
        for symbol in supplied {
            if let Some(value) = symbol.value {
                inputs.insert(symbol.name, value);
            }
        }

        for (name, expression) in &self.params.call.inputs {
            let value = resolver.evaluate(expression, &self.params.key).await?;
            let coerced = match task.and_then(|t| t.input(name)) {
                Some(input) => input.value_type.coerce(value)?,
                None => value,
            };
            inputs.insert(name.clone(), coerced);
        }
        Ok(inputs)
    }

    async fn execute(&mut self, inputs: HashMap<String, WorkflowValue>) -> WorkflowMessage {
        let key = self.params.key.clone();
        let invocation = CallInvocation {
            workflow_id: self.params.descriptor.id,
            slot: key.slot(),
            task: self.params.call.task.clone(),
            inputs,
        };

        let outcome = {
            let backend = Arc::clone(&self.params.backend);
            let resume_job = self.params.resume_job.clone();
            let execution = async move {
                match &resume_job {
                    Some(job) => backend.resume(&invocation, job).await,
                    None => backend.execute(&invocation).await,
                }
            };
            tokio::select! {
                outcome = execution => outcome,
                _ = self.abort_rx.changed() => {
                    return WorkflowMessage::AbortComplete(key);
                }
            }
        };

        match outcome {
            Ok(outcome) => WorkflowMessage::CallCompleted {
                key,
                outputs: outcome.outputs,
                return_code: outcome.return_code,
                mode: ResultGenerationMode::Run,
            },
            Err(BackendError::Aborted) => WorkflowMessage::AbortComplete(key),
            Err(BackendError::Execution {
                return_code,
                message,
            }) => WorkflowMessage::CallFailed {
                key,
                return_code,
                message,
            },
            Err(err) => WorkflowMessage::CallFailed {
                key,
                return_code: None,
                message: err.to_string(),
            },
        }
    }
}
