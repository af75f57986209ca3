//! Cache-hit copy scenarios: blacklist short-circuits, mid-flight forbidden
//! responses, ordered command sets, timeouts, and end-to-end call caching
//! through a workflow.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use common::{ScriptedBroker, StubBackend, call, descriptor, init_tracing, namespace, task};
use strand::blacklist::{BlacklistCache, BlacklistConfig, BlacklistStatus, CacheHitId};
use strand::cache_copy::{
    self, BlacklistSkip, CacheCopyHooks, CacheCopyParams, CacheHit, CopyFailure, CopyResponse,
    ResultGenerationMode,
};
use strand::call_runner::{CacheCandidate, CacheContext};
use strand::config::EngineConfig;
use strand::execution::ExecutionSlot;
use strand::io::{IoAck, IoCommand, IoCommandKind, LocalIoBroker};
use strand::lang::Fqn;
use strand::paths::{CALL_ROOT_PATH_KEY, JobPaths};
use strand::storage::{DataAccess, MemoryStore, WorkflowState};
use strand::values::{Simpleton, ValueType, WorkflowValue};
use strand::workflow::{StartMode, WorkflowActorParams, await_terminal_state, spawn};

const SOURCE_ROOT: &str = "gs://src/wf/a";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn source_hit() -> CacheHit {
    let mut detritus = HashMap::new();
    detritus.insert(CALL_ROOT_PATH_KEY.to_string(), SOURCE_ROOT.to_string());
    detritus.insert("stdout".to_string(), format!("{SOURCE_ROOT}/stdout"));
    CacheHit {
        id: CacheHitId::new(),
        simpletons: vec![
            Simpleton::new("bam", WorkflowValue::File(format!("{SOURCE_ROOT}/out.bam"))),
            Simpleton::new("count", WorkflowValue::Integer(4)),
        ],
        detritus,
        return_code: 0,
    }
}

fn copy_params(
    hit: CacheHit,
    blacklist: Arc<BlacklistCache>,
    broker: &ScriptedBroker,
) -> CacheCopyParams {
    CacheCopyParams {
        slot: ExecutionSlot::new(Fqn::new("wf.a"), None),
        attempt: 1,
        hit,
        destination: JobPaths::new("gs://dst/wf2/a"),
        blacklist,
        io: broker.client(),
        hooks: Arc::new(cache_copy::DefaultCacheCopyHooks),
        io_timeout: IO_TIMEOUT,
    }
}

async fn run_copy(
    params: CacheCopyParams,
) -> (Vec<CopyResponse>, mpsc::Receiver<CopyResponse>) {
    let (tx, mut rx) = mpsc::channel(4);
    let handle = cache_copy::spawn(params, tx);
    handle.join().await;
    let mut responses = Vec::new();
    while let Ok(response) = rx.try_recv() {
        responses.push(response);
    }
    (responses, rx)
}

#[tokio::test]
async fn blacklisted_bucket_short_circuits_without_io() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    blacklist.blacklist_bucket("gs://src");
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));

    let (responses, _rx) = run_copy(copy_params(source_hit(), Arc::clone(&blacklist), &broker)).await;
    match responses.as_slice() {
        [CopyResponse::CopyingOutputsFailed { failure, .. }] => {
            assert!(matches!(
                failure,
                CopyFailure::Blacklisted(BlacklistSkip::BucketBlacklisted)
            ));
            assert!(!failure.is_loggable());
        }
        other => panic!("unexpected responses: {other:?}"),
    }
    assert!(broker.received().is_empty());
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn blacklisted_hit_short_circuits_before_bucket_check() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let hit = source_hit();
    blacklist.blacklist_hit(hit.id);
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));

    let (responses, _rx) = run_copy(copy_params(hit, Arc::clone(&blacklist), &broker)).await;
    match responses.as_slice() {
        [CopyResponse::CopyingOutputsFailed { failure, .. }] => {
            assert!(matches!(
                failure,
                CopyFailure::Blacklisted(BlacklistSkip::HitBlacklisted)
            ));
        }
        other => panic!("unexpected responses: {other:?}"),
    }
    assert!(broker.received().is_empty());
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn successful_copy_reroots_outputs_and_whitelists() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let hit = source_hit();
    let hit_id = hit.id;
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));

    let (responses, _rx) = run_copy(copy_params(hit, Arc::clone(&blacklist), &broker)).await;
    match responses.as_slice() {
        [CopyResponse::JobSucceeded {
            outputs,
            detritus,
            return_code,
            generation_mode,
            ..
        }] => {
            assert_eq!(*return_code, 0);
            assert_eq!(*generation_mode, ResultGenerationMode::CallCached);
            let bam = outputs.iter().find(|s| s.key == "bam").unwrap();
            assert_eq!(
                bam.value,
                WorkflowValue::File("gs://dst/wf2/a/out.bam".to_string())
            );
            let count = outputs.iter().find(|s| s.key == "count").unwrap();
            assert_eq!(count.value, WorkflowValue::Integer(4));
            assert_eq!(
                detritus.get(CALL_ROOT_PATH_KEY),
                Some(&"gs://dst/wf2/a".to_string())
            );
            assert_eq!(
                detritus.get("stdout"),
                Some(&"gs://dst/wf2/a/stdout".to_string())
            );
        }
        other => panic!("unexpected responses: {other:?}"),
    }
    // One copy per file output plus one per shared detritus key.
    assert_eq!(broker.received().len(), 2);
    assert_eq!(blacklist.hit_status(hit_id), BlacklistStatus::Good);
    assert_eq!(blacklist.bucket_status("gs://src"), BlacklistStatus::Good);
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn mid_flight_forbidden_blacklists_and_drains() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let hit = source_hit();
    let hit_id = hit.id;
    // The data copy succeeds, the detritus copy is forbidden.
    let broker = ScriptedBroker::start(|command| {
        let forbidden = matches!(
            &command.kind,
            IoCommandKind::Copy { source, .. } if source.ends_with("stdout")
        );
        if forbidden {
            let path = match &command.kind {
                IoCommandKind::Copy { source, .. } => source.clone(),
                IoCommandKind::Touch { path } => path.clone(),
            };
            Some(IoAck::ReadForbidden {
                command: command.clone(),
                path,
            })
        } else {
            Some(IoAck::Success(command.clone()))
        }
    });

    let (responses, mut rx) = run_copy(copy_params(hit, Arc::clone(&blacklist), &broker)).await;
    // Exactly one failure response, after which the worker drained the
    // remaining acknowledgement and stopped.
    match responses.as_slice() {
        [CopyResponse::CopyingOutputsFailed { failure, attempt, .. }] => {
            assert_eq!(*attempt, 1);
            assert!(failure.is_loggable());
            assert!(failure.to_string().contains("read forbidden"));
        }
        other => panic!("unexpected responses: {other:?}"),
    }
    assert!(rx.recv().await.is_none());

    assert_eq!(blacklist.hit_status(hit_id), BlacklistStatus::Bad);
    assert_eq!(blacklist.bucket_status("gs://src"), BlacklistStatus::Bad);
    assert_eq!(broker.received().len(), 2);
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn generic_failure_blacklists_bucket_but_not_hit() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let hit = source_hit();
    let hit_id = hit.id;
    let broker = ScriptedBroker::start(|command| {
        Some(IoAck::Failure {
            command: command.clone(),
            message: "backend unavailable".to_string(),
        })
    });

    let (responses, _rx) = run_copy(copy_params(hit, Arc::clone(&blacklist), &broker)).await;
    assert!(matches!(
        responses.as_slice(),
        [CopyResponse::CopyingOutputsFailed { .. }]
    ));
    assert_eq!(blacklist.bucket_status("gs://src"), BlacklistStatus::Bad);
    assert_ne!(blacklist.hit_status(hit_id), BlacklistStatus::Bad);
    broker.shutdown().await;
    Ok(())
}

struct TouchHooks;

impl CacheCopyHooks for TouchHooks {
    fn additional_io_commands(&self, _source_simpletons: &[Simpleton]) -> Vec<Vec<IoCommand>> {
        vec![vec![IoCommand::touch("gs://cache-db/stamp")]]
    }
}

#[tokio::test]
async fn additional_command_sets_dispatch_after_copies_complete() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));
    let mut params = copy_params(source_hit(), Arc::clone(&blacklist), &broker);
    params.hooks = Arc::new(TouchHooks);

    let (responses, _rx) = run_copy(params).await;
    assert!(matches!(
        responses.as_slice(),
        [CopyResponse::JobSucceeded { .. }]
    ));

    // The touch set is released only after every copy has been acknowledged.
    let received = broker.received();
    assert_eq!(received.len(), 3);
    assert!(received[..2]
        .iter()
        .all(|c| matches!(c.kind, IoCommandKind::Copy { .. })));
    assert!(matches!(received[2].kind, IoCommandKind::Touch { .. }));
    broker.shutdown().await;
    Ok(())
}

struct ServerSideCopyHooks;

impl CacheCopyHooks for ServerSideCopyHooks {
    fn duplicate(&self, pairs: &[(String, String)]) -> Option<Result<(), String>> {
        assert!(!pairs.is_empty());
        Some(Ok(()))
    }
}

#[tokio::test]
async fn duplicate_fast_path_skips_the_broker() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));
    let mut params = copy_params(source_hit(), Arc::clone(&blacklist), &broker);
    params.hooks = Arc::new(ServerSideCopyHooks);

    let (responses, _rx) = run_copy(params).await;
    assert!(matches!(
        responses.as_slice(),
        [CopyResponse::JobSucceeded { .. }]
    ));
    assert!(broker.received().is_empty());
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unanswered_commands_time_out() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let broker = ScriptedBroker::start(|_| None);
    let mut params = copy_params(source_hit(), Arc::clone(&blacklist), &broker);
    params.io_timeout = Duration::from_millis(50);

    let (responses, _rx) = run_copy(params).await;
    match responses.as_slice() {
        [CopyResponse::CopyingOutputsFailed { failure, .. }] => {
            assert!(matches!(failure, CopyFailure::Timeout { .. }));
            assert!(failure.to_string().contains("out.bam"), "timeout error should name the pending copy: {failure}");
        }
        other => panic!("unexpected responses: {other:?}"),
    }
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn abort_mid_flight_answers_job_aborted() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let broker = ScriptedBroker::start(|_| None);
    let params = copy_params(source_hit(), Arc::clone(&blacklist), &broker);

    let (tx, mut rx) = mpsc::channel(4);
    let handle = cache_copy::spawn(params, tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort().await;
    handle.join().await;

    assert!(matches!(
        rx.recv().await,
        Some(CopyResponse::JobAborted { .. })
    ));
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_call_root_is_a_configuration_failure() -> Result<()> {
    init_tracing();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));
    let mut hit = source_hit();
    hit.detritus.remove(CALL_ROOT_PATH_KEY);

    let (responses, _rx) = run_copy(copy_params(hit, blacklist, &broker)).await;
    match responses.as_slice() {
        [CopyResponse::CopyingOutputsFailed { failure, .. }] => {
            assert!(matches!(failure, CopyFailure::MissingCallRoot));
        }
        other => panic!("unexpected responses: {other:?}"),
    }
    assert!(broker.received().is_empty());
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn workflow_call_completes_from_cache_through_local_broker() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let source_root = dir.path().join("cache/a");
    let dest_root = dir.path().join("run/a");
    tokio::fs::create_dir_all(&source_root).await?;
    tokio::fs::write(source_root.join("out.txt"), b"cached result").await?;

    let ns = namespace(
        "wf",
        vec![call("a", vec![])],
        vec![task("a", &[], &[("out", ValueType::File)])],
    );
    let backend = Arc::new(StubBackend::new());
    backend.on_task("a", |_| panic!("cached call must not execute"));

    let hit = CacheHit {
        id: CacheHitId::new(),
        simpletons: vec![Simpleton::new(
            "out",
            WorkflowValue::File(source_root.join("out.txt").to_string_lossy().into_owned()),
        )],
        detritus: HashMap::from([(
            CALL_ROOT_PATH_KEY.to_string(),
            source_root.to_string_lossy().into_owned(),
        )]),
        return_code: 0,
    };
    let slot = ExecutionSlot::new(Fqn::new("wf.a"), None);
    let broker = LocalIoBroker::start();
    let cache = Arc::new(CacheContext {
        io: broker.client(),
        blacklist: Arc::new(BlacklistCache::new(BlacklistConfig::default())),
        hooks: Arc::new(cache_copy::DefaultCacheCopyHooks),
        io_timeout: IO_TIMEOUT,
        candidates: HashMap::from([(
            slot.clone(),
            CacheCandidate {
                hit,
                destination: JobPaths::new(dest_root.to_string_lossy().into_owned()),
            },
        )]),
    });

    let store = MemoryStore::new();
    let d = descriptor(ns);
    let workflow_id = d.id;
    let handle = spawn(WorkflowActorParams {
        descriptor: d,
        data_access: Arc::new(store.clone()),
        backend: Arc::clone(&backend) as Arc<dyn strand::backend::Backend>,
        config: EngineConfig {
            terminate_delay: Duration::from_secs(1),
            ..EngineConfig::default()
        },
        cache: Some(cache),
    });
    handle.start(StartMode::Start).await;

    assert_eq!(
        await_terminal_state(&handle, Duration::from_secs(10)).await,
        Some(WorkflowState::Succeeded)
    );
    assert!(backend.executed_slots().is_empty());

    // The file landed under the destination call root and the persisted
    // output points at it.
    let copied = tokio::fs::read(dest_root.join("out.txt")).await?;
    assert_eq!(copied, b"cached result");
    let outputs = store.get_outputs(workflow_id, &slot).await?;
    let out = outputs.iter().find(|s| s.name == "out").unwrap();
    assert_eq!(
        out.value,
        Some(WorkflowValue::File(
            dest_root.join("out.txt").to_string_lossy().into_owned()
        ))
    );
    handle.join().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn blacklist_skip_falls_back_to_execution() -> Result<()> {
    init_tracing();
    let ns = namespace(
        "wf",
        vec![call("a", vec![])],
        vec![task("a", &[], &[("out", ValueType::Integer)])],
    );
    let backend = Arc::new(StubBackend::new());
    backend.on_task("a", |_| {
        Ok(strand::backend::CallOutcome {
            outputs: HashMap::from([("out".to_string(), WorkflowValue::Integer(9))]),
            return_code: 0,
        })
    });

    let hit = source_hit();
    let blacklist = Arc::new(BlacklistCache::new(BlacklistConfig::default()));
    blacklist.blacklist_hit(hit.id);

    let slot = ExecutionSlot::new(Fqn::new("wf.a"), None);
    let broker = ScriptedBroker::start(|command| Some(IoAck::Success(command.clone())));
    let cache = Arc::new(CacheContext {
        io: broker.client(),
        blacklist,
        hooks: Arc::new(cache_copy::DefaultCacheCopyHooks),
        io_timeout: IO_TIMEOUT,
        candidates: HashMap::from([(
            slot.clone(),
            CacheCandidate {
                hit,
                destination: JobPaths::new("gs://dst/wf2/a"),
            },
        )]),
    });

    let store = MemoryStore::new();
    let d = descriptor(ns);
    let handle = spawn(WorkflowActorParams {
        descriptor: d,
        data_access: Arc::new(store.clone()),
        backend: Arc::clone(&backend) as Arc<dyn strand::backend::Backend>,
        config: EngineConfig {
            terminate_delay: Duration::from_secs(1),
            ..EngineConfig::default()
        },
        cache: Some(cache),
    });
    handle.start(StartMode::Start).await;

    assert_eq!(
        await_terminal_state(&handle, Duration::from_secs(10)).await,
        Some(WorkflowState::Succeeded)
    );
    // The blacklisted hit was skipped and the task ran for real.
    assert_eq!(backend.executed_slots(), vec![slot]);
    assert!(broker.received().is_empty());
    broker.shutdown().await;
    Ok(())
}
