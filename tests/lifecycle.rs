//! Shard lifecycle tests: registration, acquisition, failure, destroy

use shardstore::common::blake3_hex;
use shardstore::coordinator::metadata::{MemMetaStore, MetaStore};
use shardstore::coordinator::{Op, RegisterOpts, ShardCoordinator, Sinks};
use shardstore::storage::index::encode_records;
use shardstore::storage::{MemoryMount, Mount, MountRegistry};
use shardstore::{CoordinatorConfig, ShardKey, ShardState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mount whose fetch always fails
struct FailingMount;

impl Mount for FailingMount {
    fn fetch(&self) -> shardstore::Result<Vec<u8>> {
        Err(shardstore::Error::Mount("mount offline".into()))
    }

    fn url(&self) -> String {
        "fail://always".into()
    }
}

/// Mount whose fetch blocks until released
struct GateMount {
    release: Arc<AtomicBool>,
    bytes: Vec<u8>,
}

impl Mount for GateMount {
    fn fetch(&self) -> shardstore::Result<Vec<u8>> {
        while !self.release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(self.bytes.clone())
    }

    fn url(&self) -> String {
        "gate://g".into()
    }
}

async fn start_coordinator(dir: &TempDir, sinks: Sinks) -> ShardCoordinator {
    ShardCoordinator::start(
        CoordinatorConfig::new(dir.path().join("idx")),
        Arc::new(MemMetaStore::new()),
        Arc::new(MountRegistry::new()),
        sinks,
    )
    .await
    .unwrap()
}

fn payload() -> Vec<u8> {
    encode_records([b"one".as_slice(), b"two".as_slice()])
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn recv_trace(
    rx: &mut mpsc::Receiver<shardstore::Trace>,
) -> shardstore::Trace {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for trace")
        .expect("trace channel closed")
}

#[tokio::test]
async fn test_eager_register_and_acquire() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (trace_tx, mut trace_rx) = mpsc::channel(64);
    let coordinator = start_coordinator(
        &dir,
        Sinks {
            trace: Some(trace_tx),
            failure: None,
        },
    )
    .await;

    let mount = Arc::new(MemoryMount::new("a", payload()));
    coordinator
        .register_shard("A", mount, RegisterOpts::default())
        .await
        .unwrap();

    let trace = recv_trace(&mut trace_rx).await;
    assert_eq!(trace.op, Op::Register);
    assert_eq!(trace.after.state, ShardState::New);

    let trace = recv_trace(&mut trace_rx).await;
    assert_eq!(trace.op, Op::Initialize);
    assert_eq!(trace.after.state, ShardState::Initializing);

    let trace = recv_trace(&mut trace_rx).await;
    assert_eq!(trace.op, Op::MakeAvailable);
    assert_eq!(trace.after.state, ShardState::Available);
    assert!(trace.after.error.is_none());

    let key = ShardKey::from("A");
    let accessor = coordinator.acquire_shard(&key).await.unwrap();
    assert_eq!(accessor.entry_count(), 2);
    assert_eq!(accessor.get(&blake3_hex(b"one")).unwrap(), b"one");
    assert_eq!(accessor.get(&blake3_hex(b"two")).unwrap(), b"two");

    let trace = recv_trace(&mut trace_rx).await;
    assert_eq!(trace.op, Op::Acquire);
    assert_eq!(trace.after.state, ShardState::Available);

    coordinator.close().await;
}

#[tokio::test]
async fn test_lazy_register_first_acquire_initializes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (trace_tx, mut trace_rx) = mpsc::channel(64);
    let coordinator = start_coordinator(
        &dir,
        Sinks {
            trace: Some(trace_tx),
            failure: None,
        },
    )
    .await;

    let mount = Arc::new(MemoryMount::new("b", payload()));
    coordinator
        .register_shard("B", mount, RegisterOpts { lazy: true })
        .await
        .unwrap();

    // registration completed without initialization
    let key = ShardKey::from("B");
    let info = coordinator.shard_info(&key).await.unwrap();
    assert_eq!(info.state, ShardState::New);
    assert!(info.lazy);

    let accessor = coordinator.acquire_shard(&key).await.unwrap();
    assert_eq!(accessor.entry_count(), 2);

    let ops: Vec<Op> = vec![
        recv_trace(&mut trace_rx).await.op,
        recv_trace(&mut trace_rx).await.op,
        recv_trace(&mut trace_rx).await.op,
        recv_trace(&mut trace_rx).await.op,
    ];
    assert_eq!(
        ops,
        vec![Op::Register, Op::Acquire, Op::Initialize, Op::MakeAvailable]
    );

    coordinator.close().await;
}

#[tokio::test]
async fn test_initialization_failure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (trace_tx, mut trace_rx) = mpsc::channel(64);
    let (failure_tx, mut failure_rx) = mpsc::channel(8);
    let coordinator = start_coordinator(
        &dir,
        Sinks {
            trace: Some(trace_tx),
            failure: Some(failure_tx),
        },
    )
    .await;

    let err = coordinator
        .register_shard("C", Arc::new(FailingMount), RegisterOpts::default())
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("failed to register shard"), "got: {}", msg);
    assert!(msg.contains("mount offline"), "got: {}", msg);

    // the application failure sink hears about it too
    let notification = tokio::time::timeout(Duration::from_secs(5), failure_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.key, ShardKey::from("C"));
    assert!(notification.error.unwrap().to_string().contains("mount offline"));

    let key = ShardKey::from("C");
    let info = coordinator.shard_info(&key).await.unwrap();
    assert_eq!(info.state, ShardState::Errored);
    assert!(info.error.is_some());

    // final trace records the failure transition
    let mut last = None;
    for _ in 0..3 {
        last = Some(recv_trace(&mut trace_rx).await);
    }
    let last = last.unwrap();
    assert_eq!(last.op, Op::Fail);
    assert_eq!(last.after.state, ShardState::Errored);
    assert!(last.after.error.is_some());

    coordinator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_share_one_initialization() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (trace_tx, mut trace_rx) = mpsc::channel(64);
    let coordinator = start_coordinator(
        &dir,
        Sinks {
            trace: Some(trace_tx),
            failure: None,
        },
    )
    .await;

    let release = Arc::new(AtomicBool::new(false));
    let mount = Arc::new(GateMount {
        release: Arc::clone(&release),
        bytes: payload(),
    });
    coordinator
        .register_shard("E", mount, RegisterOpts { lazy: true })
        .await
        .unwrap();

    let key = ShardKey::from("E");
    let (out_tx, mut out_rx) = mpsc::channel(8);
    for _ in 0..4 {
        coordinator
            .acquire_shard_with(&key, CancellationToken::new(), out_tx.clone())
            .await
            .unwrap();
    }

    // all four acquirers are parked behind the gated initialization
    for _ in 0..200 {
        let info = coordinator.shard_info(&key).await.unwrap();
        if info.state == ShardState::Initializing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        coordinator.shard_info(&key).await.unwrap().state,
        ShardState::Initializing
    );

    release.store(true, Ordering::SeqCst);

    for _ in 0..4 {
        let res = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .expect("acquirer timed out")
            .unwrap();
        assert!(res.error.is_none(), "acquire failed: {:?}", res.error);
        assert_eq!(res.accessor.unwrap().entry_count(), 2);
    }

    // exactly one initialization ran for the four acquirers
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut initializations = 0;
    while let Ok(trace) = trace_rx.try_recv() {
        if trace.op == Op::Initialize {
            initializations += 1;
        }
    }
    assert_eq!(initializations, 1);

    coordinator.close().await;
}

#[tokio::test]
async fn test_register_twice_rejected() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let coordinator = start_coordinator(&dir, Sinks::default()).await;

    let mount = Arc::new(MemoryMount::new("dup", payload()));
    coordinator
        .register_shard("dup", Arc::clone(&mount) as Arc<dyn Mount>, RegisterOpts::default())
        .await
        .unwrap();

    let err = coordinator
        .register_shard("dup", mount, RegisterOpts::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already registered"));

    coordinator.close().await;
}

#[tokio::test]
async fn test_destroy_and_reregister() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemMetaStore::new());
    let coordinator = ShardCoordinator::start(
        CoordinatorConfig::new(dir.path().join("idx")),
        Arc::clone(&store) as Arc<dyn MetaStore>,
        Arc::new(MountRegistry::new()),
        Sinks::default(),
    )
    .await
    .unwrap();

    let key = ShardKey::from("F");
    let mount = Arc::new(MemoryMount::new("f", payload()));
    coordinator
        .register_shard("F", Arc::clone(&mount) as Arc<dyn Mount>, RegisterOpts::default())
        .await
        .unwrap();
    assert!(store.get("shards/F").unwrap().is_some());

    coordinator.destroy_shard(&key).await.unwrap();
    assert!(store.get("shards/F").unwrap().is_none());
    assert!(coordinator.shard_info(&key).await.is_err());

    // acquiring a destroyed shard reports it unknown
    let err = coordinator.acquire_shard(&key).await.unwrap_err();
    assert!(err.to_string().contains("shard not found"));

    // destroy is idempotent, registered or not
    coordinator.destroy_shard(&key).await.unwrap();
    coordinator
        .destroy_shard(&ShardKey::from("never-registered"))
        .await
        .unwrap();

    // the key is free again
    coordinator
        .register_shard("F", mount, RegisterOpts::default())
        .await
        .unwrap();
    assert_eq!(
        coordinator.shard_info(&key).await.unwrap().state,
        ShardState::Available
    );

    coordinator.close().await;
}

#[tokio::test]
async fn test_all_shards_info() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let coordinator = start_coordinator(&dir, Sinks::default()).await;

    coordinator
        .register_shard(
            "g1",
            Arc::new(MemoryMount::new("g1", payload())),
            RegisterOpts::default(),
        )
        .await
        .unwrap();
    coordinator
        .register_shard(
            "g2",
            Arc::new(MemoryMount::new("g2", payload())),
            RegisterOpts { lazy: true },
        )
        .await
        .unwrap();

    let infos = coordinator.all_shards_info().await;
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[&ShardKey::from("g1")].state, ShardState::Available);
    assert_eq!(infos[&ShardKey::from("g2")].state, ShardState::New);

    coordinator.close().await;
}
