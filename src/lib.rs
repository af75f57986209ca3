//! Strand - the execution core of a scientific workflow engine.
//!
//! This crate takes a parsed workflow graph (tasks with inputs, outputs,
//! dependencies, and scatter parallelism) and drives every call to completion
//! through pluggable backends. The key components are:
//!
//! ## Scheduling
//!
//! - [`workflow`]: the per-workflow actor that owns the execution store,
//!   expands scatters, collects shard outputs, and persists every transition
//! - [`execution`]: execution keys, statuses, and the dependency resolver
//! - [`call_runner`]: per-call workers that resolve inputs and invoke the
//!   backend
//!
//! ## Call caching
//!
//! - [`cache_copy`]: the cache-hit copy worker that batch-copies prior
//!   outputs through the I/O broker
//! - [`blacklist`]: the process-wide cache of known-forbidden cache sources
//!
//! ## Collaborator interfaces
//!
//! - [`backend`]: the execution backend capability set
//! - [`storage`]: durable state access, with an in-memory implementation
//! - [`io`]: the I/O broker command vocabulary and a local-filesystem broker

pub mod backend;
pub mod blacklist;
pub mod cache_copy;
pub mod call_runner;
pub mod config;
pub mod execution;
pub mod io;
pub mod lang;
pub mod options;
pub mod paths;
pub mod storage;
pub mod symbols;
pub mod values;
pub mod workflow;

// Configuration
pub use config::{DEFAULT_IO_TIMEOUT, DEFAULT_TERMINATE_DELAY, EngineConfig};

// Scheduling
pub use execution::{
    CallStatus, ExecutionKey, ExecutionSlot, ExecutionStatus, ExecutionStore,
};
pub use workflow::{
    StartMode, WorkflowActorParams, WorkflowDescriptor, WorkflowError, WorkflowHandle,
    WorkflowMessage, await_terminal_state, spawn,
};

// Call execution
pub use backend::{Backend, BackendError, BackendResult, CallInvocation, CallOutcome, JobKey};
pub use call_runner::{CacheCandidate, CacheContext};

// Call caching
pub use blacklist::{BlacklistCache, BlacklistConfig, BlacklistStatus, CacheHitId};
pub use cache_copy::{
    BlacklistSkip, CacheCopyHooks, CacheHit, CopyFailure, CopyResponse, DefaultCacheCopyHooks,
    ResultGenerationMode,
};

// Collaborators
pub use io::{IoAck, IoClient, IoCommand, IoCommandKind, IoRequest, LocalIoBroker};
pub use storage::{DataAccess, MemoryStore, StorageError, StorageResult, WorkflowId, WorkflowState};

// Language surface
pub use lang::{
    Call, Declaration, Expression, ExpressionError, Fqn, LangError, Namespace, Scatter, Task,
    TaskInput, TaskOutput, Workflow, WorkflowNode,
};
pub use options::{OptionValue, WorkflowOptions};
pub use paths::{CALL_ROOT_PATH_KEY, JobPaths};
pub use symbols::{ResolveError, Symbol, SymbolResolver};
pub use values::{Simpleton, ValueType, WorkflowValue, assemble_outputs, flatten_outputs};
