//! Cache-hit copy worker.
//!
//! When a call's fingerprint matches a prior invocation, its outputs can be
//! copied from the cache source instead of re-running the task. The worker
//! batches copy commands against the I/O broker, tracks acknowledgements
//! set-by-set, and short-circuits against sources the blacklist already knows
//! to be forbidden. Backends customize behavior through [`CacheCopyHooks`]
//! rather than subclassing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::blacklist::{BlacklistCache, BlacklistStatus, CacheHitId};
use crate::execution::ExecutionSlot;
use crate::io::{IoAck, IoClient, IoCommand, IoCommandKind};
use crate::paths::{CALL_ROOT_PATH_KEY, JobPaths, PathError, reroot};
use crate::values::{Simpleton, WorkflowValue};

/// How a call's result came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultGenerationMode {
    /// The backend ran the task.
    Run,
    /// Outputs were copied from a cache hit.
    CallCached,
}

/// A matched prior invocation whose outputs are candidates for reuse.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub id: CacheHitId,
    /// Flattened outputs with paths rooted at the source call root.
    pub simpletons: Vec<Simpleton>,
    /// Source bookkeeping files, keyed by detritus key.
    pub detritus: HashMap<String, String>,
    pub return_code: i32,
}

/// Why a copy attempt was skipped by blacklist policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistSkip {
    HitBlacklisted,
    BucketBlacklisted,
}

#[derive(Debug, Error)]
pub enum CopyFailure {
    /// Skipped by policy; expected, not an error to log.
    #[error("cache source skipped by blacklist: {0:?}")]
    Blacklisted(BlacklistSkip),
    #[error("cache hit is missing the {CALL_ROOT_PATH_KEY:?} detritus entry")]
    MissingCallRoot,
    #[error("copy attempt failed: {message}")]
    Attempt { message: String },
    #[error("timed out after {timeout:?} waiting for {pending}")]
    Timeout { timeout: Duration, pending: String },
    #[error(transparent)]
    Path(#[from] PathError),
}

impl CopyFailure {
    /// Blacklist skips are routine; everything else deserves a log line.
    pub fn is_loggable(&self) -> bool {
        !matches!(self, CopyFailure::Blacklisted(_))
    }
}

/// Responses delivered to the spawning parent.
#[derive(Debug)]
pub enum CopyResponse {
    JobSucceeded {
        slot: ExecutionSlot,
        outputs: Vec<Simpleton>,
        detritus: HashMap<String, String>,
        return_code: i32,
        generation_mode: ResultGenerationMode,
    },
    CopyingOutputsFailed {
        slot: ExecutionSlot,
        attempt: u32,
        failure: CopyFailure,
    },
    JobAborted {
        slot: ExecutionSlot,
    },
}

/// Backend-provided customization points.
pub trait CacheCopyHooks: Send + Sync {
    /// Attempt a fast-path duplication of every `(source, destination)` pair
    /// (server-side copy, same-bucket rename). `None` falls through to the
    /// I/O broker; `Some(Ok(()))` completes the copy; `Some(Err(_))` fails it.
    fn duplicate(&self, _pairs: &[(String, String)]) -> Option<Result<(), String>> {
        None
    }

    /// Extra command sets dispatched after the copy set completes, e.g.
    /// touches that refresh cache-entry timestamps.
    fn additional_io_commands(&self, _source_simpletons: &[Simpleton]) -> Vec<Vec<IoCommand>> {
        Vec::new()
    }

    /// The bucket/prefix under which a forbidden path should be blacklisted.
    fn extract_blacklist_prefix(&self, path: &str) -> Option<String> {
        default_blacklist_prefix(path)
    }
}

/// Hooks with no fast path and scheme-based bucket extraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCacheCopyHooks;

impl CacheCopyHooks for DefaultCacheCopyHooks {}

/// `scheme://bucket` for URI-shaped paths, the first path component for
/// rooted local paths.
pub fn default_blacklist_prefix(path: &str) -> Option<String> {
    if let Some(scheme_end) = path.find("://") {
        let after = &path[scheme_end + 3..];
        let bucket_end = after.find('/').unwrap_or(after.len());
        if bucket_end == 0 {
            return None;
        }
        return Some(path[..scheme_end + 3 + bucket_end].to_string());
    }
    let trimmed = path.strip_prefix('/')?;
    let first = trimmed.split('/').next()?;
    if first.is_empty() {
        None
    } else {
        Some(format!("/{first}"))
    }
}

/// The copy plan computed before any I/O is dispatched.
#[derive(Debug)]
struct CopyPlan {
    commands: Vec<IoCommand>,
    pairs: Vec<(String, String)>,
    outputs: Vec<Simpleton>,
    detritus: HashMap<String, String>,
}

/// Re-root every file simpleton and shared detritus entry onto the
/// destination call root.
fn plan_copy(
    hit: &CacheHit,
    source_root: &str,
    destination: &JobPaths,
) -> Result<CopyPlan, CopyFailure> {
    let mut commands = Vec::new();
    let mut pairs = Vec::new();
    let mut outputs = Vec::with_capacity(hit.simpletons.len());

    for simpleton in &hit.simpletons {
        match &simpleton.value {
            WorkflowValue::File(source) => {
                let dest = reroot(source, source_root, &destination.call_root)?;
                commands.push(IoCommand::copy(source.clone(), dest.clone()));
                pairs.push((source.clone(), dest.clone()));
                outputs.push(Simpleton::new(
                    simpleton.key.clone(),
                    WorkflowValue::File(dest),
                ));
            }
            other => outputs.push(Simpleton::new(simpleton.key.clone(), other.clone())),
        }
    }

    let mut detritus = HashMap::new();
    detritus.insert(
        CALL_ROOT_PATH_KEY.to_string(),
        destination.call_root.clone(),
    );
    for (key, source) in &hit.detritus {
        if key == CALL_ROOT_PATH_KEY {
            continue;
        }
        // Only keys known on both sides are copied.
        if let Some(dest) = destination.detritus_path(key) {
            commands.push(IoCommand::copy(source.clone(), dest.to_string()));
            pairs.push((source.clone(), dest.to_string()));
            detritus.insert(key.clone(), dest.to_string());
        }
    }

    Ok(CopyPlan {
        commands,
        pairs,
        outputs,
        detritus,
    })
}

/// Control messages accepted by a running copy worker.
#[derive(Debug)]
pub enum CacheCopyMessage {
    Abort,
}

/// Spawn parameters for one copy attempt.
pub struct CacheCopyParams {
    pub slot: ExecutionSlot,
    pub attempt: u32,
    pub hit: CacheHit,
    pub destination: JobPaths,
    pub blacklist: Arc<BlacklistCache>,
    pub io: IoClient,
    pub hooks: Arc<dyn CacheCopyHooks>,
    pub io_timeout: Duration,
}

/// Handle to a spawned copy worker.
pub struct CacheCopyHandle {
    tx: mpsc::Sender<CacheCopyMessage>,
    handle: JoinHandle<()>,
}

impl CacheCopyHandle {
    /// Request abort. The worker does not interrupt in-flight commands; it
    /// answers `JobAborted` and stops.
    pub async fn abort(&self) {
        let _ = self.tx.send(CacheCopyMessage::Abort).await;
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawn a copy worker delivering responses to `parent`.
pub fn spawn(params: CacheCopyParams, parent: mpsc::Sender<CopyResponse>) -> CacheCopyHandle {
    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(async move {
        CopyWorker {
            params,
            parent,
            control: rx,
        }
        .run()
        .await;
    });
    CacheCopyHandle { tx, handle }
}

struct CopyWorker {
    params: CacheCopyParams,
    parent: mpsc::Sender<CopyResponse>,
    control: mpsc::Receiver<CacheCopyMessage>,
}

impl CopyWorker {
    async fn run(mut self) {
        let outcome = self.attempt_copy().await;
        match outcome {
            Ok(Some(response)) => self.send(response).await,
            // Response already delivered (failure paths report eagerly).
            Ok(None) => {}
            Err(failure) => self.fail(failure).await,
        }
    }

    async fn send(&self, response: CopyResponse) {
        if self.parent.send(response).await.is_err() {
            warn!(slot = %self.params.slot, "cache copy parent is gone");
        }
    }

    async fn fail(&self, failure: CopyFailure) {
        if failure.is_loggable() {
            info!(slot = %self.params.slot, hit = %self.params.hit.id, %failure, "cache hit copy failed");
        } else {
            debug!(slot = %self.params.slot, hit = %self.params.hit.id, %failure, "cache hit copy skipped");
        }
        self.send(CopyResponse::CopyingOutputsFailed {
            slot: self.params.slot.clone(),
            attempt: self.params.attempt,
            failure,
        })
        .await;
    }

    /// Returns `Ok(Some(success))` when a response still needs delivering,
    /// `Ok(None)` when the worker already reported (failure-and-drain path).
    async fn attempt_copy(&mut self) -> Result<Option<CopyResponse>, CopyFailure> {
        let hit_id = self.params.hit.id;
        if self.params.blacklist.hit_status(hit_id) == BlacklistStatus::Bad {
            return Err(CopyFailure::Blacklisted(BlacklistSkip::HitBlacklisted));
        }

        let source_root = self
            .params
            .hit
            .detritus
            .get(CALL_ROOT_PATH_KEY)
            .cloned()
            .ok_or(CopyFailure::MissingCallRoot)?;

        let bucket = self.params.hooks.extract_blacklist_prefix(&source_root);
        if let Some(bucket) = &bucket
            && self.params.blacklist.bucket_status(bucket) == BlacklistStatus::Bad
        {
            return Err(CopyFailure::Blacklisted(BlacklistSkip::BucketBlacklisted));
        }

        let plan = plan_copy(&self.params.hit, &source_root, &self.params.destination)?;

        if let Some(result) = self.params.hooks.duplicate(&plan.pairs) {
            return match result {
                Ok(()) => {
                    self.mark_good(bucket.as_deref());
                    Ok(Some(self.success_response(plan)))
                }
                Err(message) => Err(CopyFailure::Attempt { message }),
            };
        }

        let mut command_sets: VecDeque<HashSet<IoCommand>> = VecDeque::new();
        if !plan.commands.is_empty() {
            command_sets.push_back(plan.commands.iter().cloned().collect());
        }
        for set in self
            .params
            .hooks
            .additional_io_commands(&self.params.hit.simpletons)
        {
            if !set.is_empty() {
                command_sets.push_back(set.into_iter().collect());
            }
        }

        if command_sets.is_empty() {
            self.mark_good(bucket.as_deref());
            return Ok(Some(self.success_response(plan)));
        }

        let (ack_tx, mut ack_rx) = mpsc::channel(16);
        self.dispatch_set(command_sets.front().expect("non-empty"), &ack_tx)
            .await?;

        // WaitingForIoResponses: drain the head set, then release the next.
        let mut control_open = true;
        loop {
            let ack = tokio::select! {
                message = self.control.recv(), if control_open => {
                    match message {
                        Some(CacheCopyMessage::Abort) => {
                            // Mid-flight abort is unsupported; answer and stop.
                            self.send(CopyResponse::JobAborted { slot: self.params.slot.clone() }).await;
                            return Ok(None);
                        }
                        None => {
                            control_open = false;
                            continue;
                        }
                    }
                }
                ack = timeout(self.params.io_timeout, ack_rx.recv()) => match ack {
                    Ok(Some(ack)) => ack,
                    Ok(None) => {
                        return Err(CopyFailure::Attempt {
                            message: "I/O broker dropped the acknowledgement channel".to_string(),
                        });
                    }
                    Err(_) => {
                        let pending = command_sets
                            .front()
                            .map(describe_pending)
                            .unwrap_or_default();
                        return Err(CopyFailure::Timeout {
                            timeout: self.params.io_timeout,
                            pending,
                        });
                    }
                },
            };

            let removed = command_sets
                .front_mut()
                .map(|head| head.remove(ack.command()))
                .unwrap_or(false);
            if !removed {
                warn!(slot = %self.params.slot, command = %ack.command().describe(),
                    "acknowledgement for a command not in the in-flight set");
                continue;
            }

            match ack {
                IoAck::Success(_) => {
                    if command_sets.front().is_some_and(HashSet::is_empty) {
                        command_sets.pop_front();
                        match command_sets.front() {
                            Some(next) => self.dispatch_set(next, &ack_tx).await?,
                            None => {
                                self.mark_good(bucket.as_deref());
                                return Ok(Some(self.success_response(plan)));
                            }
                        }
                    }
                }
                IoAck::ReadForbidden { path, .. } => {
                    self.params.blacklist.blacklist_hit(hit_id);
                    if let Some(prefix) = self.params.hooks.extract_blacklist_prefix(&path) {
                        self.params.blacklist.blacklist_bucket(&prefix);
                    }
                    let failure = CopyFailure::Attempt {
                        message: format!("read forbidden: {path}"),
                    };
                    let mut head = command_sets.pop_front().expect("head set present");
                    self.fail_and_await_pending(failure, &mut head, &mut ack_rx).await;
                    return Ok(None);
                }
                IoAck::Failure { command, message } => {
                    if let Some(prefix) = command_source(&command)
                        .and_then(|source| self.params.hooks.extract_blacklist_prefix(source))
                    {
                        self.params.blacklist.blacklist_bucket(&prefix);
                    }
                    let failure = CopyFailure::Attempt {
                        message: format!("{}: {message}", command.describe()),
                    };
                    let mut head = command_sets.pop_front().expect("head set present");
                    self.fail_and_await_pending(failure, &mut head, &mut ack_rx).await;
                    return Ok(None);
                }
            }
        }
    }

    async fn dispatch_set(
        &self,
        set: &HashSet<IoCommand>,
        ack_tx: &mpsc::Sender<IoAck>,
    ) -> Result<(), CopyFailure> {
        for command in set {
            self.params
                .io
                .send(command.clone(), ack_tx.clone())
                .await
                .map_err(|err| CopyFailure::Attempt {
                    message: err.to_string(),
                })?;
        }
        Ok(())
    }

    /// Report the failure, then drain acknowledgements still in flight for
    /// the head set so late forbidden responses also reach the blacklist.
    async fn fail_and_await_pending(
        &self,
        failure: CopyFailure,
        head: &mut HashSet<IoCommand>,
        ack_rx: &mut mpsc::Receiver<IoAck>,
    ) {
        self.fail(failure).await;
        while !head.is_empty() {
            let ack = match timeout(self.params.io_timeout, ack_rx.recv()).await {
                Ok(Some(ack)) => ack,
                Ok(None) | Err(_) => {
                    warn!(slot = %self.params.slot, pending = %describe_pending(head),
                        "gave up draining in-flight copy acknowledgements");
                    return;
                }
            };
            head.remove(ack.command());
            match ack {
                IoAck::Success(_) => {}
                IoAck::ReadForbidden { path, .. } => {
                    self.params.blacklist.blacklist_hit(self.params.hit.id);
                    if let Some(prefix) = self.params.hooks.extract_blacklist_prefix(&path) {
                        self.params.blacklist.blacklist_bucket(&prefix);
                    }
                }
                IoAck::Failure { command, .. } => {
                    if let Some(prefix) = command_source(&command)
                        .and_then(|source| self.params.hooks.extract_blacklist_prefix(source))
                    {
                        self.params.blacklist.blacklist_bucket(&prefix);
                    }
                }
            }
        }
    }

    fn mark_good(&self, bucket: Option<&str>) {
        self.params.blacklist.whitelist_hit(self.params.hit.id);
        if let Some(bucket) = bucket {
            self.params.blacklist.whitelist_bucket(bucket);
        }
    }

    fn success_response(&self, plan: CopyPlan) -> CopyResponse {
        CopyResponse::JobSucceeded {
            slot: self.params.slot.clone(),
            outputs: plan.outputs,
            detritus: plan.detritus,
            return_code: self.params.hit.return_code,
            generation_mode: ResultGenerationMode::CallCached,
        }
    }
}

fn command_source(command: &IoCommand) -> Option<&str> {
    match &command.kind {
        IoCommandKind::Copy { source, .. } => Some(source),
        IoCommandKind::Touch { .. } => None,
    }
}

fn describe_pending(set: &HashSet<IoCommand>) -> String {
    let mut parts: Vec<String> = set.iter().map(IoCommand::describe).collect();
    parts.sort();
    parts.join(", ")
}
