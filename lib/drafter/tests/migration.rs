// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end migration sessions over an in-process transport, with fake
//! hypervisor, agent, and exposer collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use drafter::agent::GuestAgent;
use drafter::expose::{ExposedVolume, VolumeExposer};
use drafter::storage::Storage;
use drafter::vmm::VmControl;
use drafter::{
    migrate_from, migrate_to, DeviceLayout, DeviceName, MigrateError,
    MigrateFromHooks, MigrateFromOptions, MigrateToOptions, SnapshotKind,
    SourceDevice,
};

fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("drafter-it-{}-{tag}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64)
            .wrapping_mul(31)
            .wrapping_add(seed as u64) as u8)
        .collect()
}

fn source_device(
    dir: &Path,
    name: DeviceName,
    content: &[u8],
    block_size: u32,
) -> SourceDevice {
    let path = dir.join(name.artifact_name());
    std::fs::write(&path, content).unwrap();
    SourceDevice::open(name, path, block_size, Duration::from_secs(10))
        .unwrap()
}

#[derive(Default)]
struct FakeVm {
    suspends: AtomicUsize,
    msyncs: AtomicUsize,
    state_snapshots: AtomicUsize,
    resumes: AtomicUsize,
    suspended_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl FakeVm {
    fn with_suspend_signal() -> (Arc<Self>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let vm = Arc::new(Self {
            suspended_tx: Mutex::new(Some(tx)),
            ..Default::default()
        });
        (vm, rx)
    }
}

#[async_trait::async_trait]
impl VmControl for FakeVm {
    async fn resume_snapshot(
        &self,
        _state_name: &str,
        _memory_name: &str,
    ) -> anyhow::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _state_name: &str,
        _memory_name: &str,
        kind: SnapshotKind,
    ) -> anyhow::Result<()> {
        match kind {
            SnapshotKind::Msync => {
                self.msyncs.fetch_add(1, Ordering::SeqCst);
            }
            SnapshotKind::Full | SnapshotKind::MsyncAndState => {
                self.state_snapshots.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.suspended_tx.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeAgent {
    before_suspends: AtomicUsize,
    after_resumes: AtomicUsize,
}

#[async_trait::async_trait]
impl GuestAgent for FakeAgent {
    async fn before_suspend(&self) -> anyhow::Result<()> {
        self.before_suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn after_resume(&self) -> anyhow::Result<()> {
        self.after_resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Captures every exposed storage stack so tests can read through the
/// destination's waiting caches like a resumed guest would.
#[derive(Default)]
struct CapturingExposer {
    exposed: Mutex<Vec<(DeviceName, Arc<dyn Storage>)>>,
    shutdowns: Arc<AtomicUsize>,
}

impl CapturingExposer {
    fn storage_for(&self, name: DeviceName) -> Option<Arc<dyn Storage>> {
        self.exposed
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| s.clone())
    }

    fn exposed_count(&self) -> usize {
        self.exposed.lock().unwrap().len()
    }
}

struct FakeVolume {
    path: PathBuf,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ExposedVolume for FakeVolume {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl VolumeExposer for CapturingExposer {
    async fn expose(
        &self,
        name: DeviceName,
        storage: Arc<dyn Storage>,
        _block_size: u32,
    ) -> anyhow::Result<Box<dyn ExposedVolume>> {
        self.exposed.lock().unwrap().push((name, storage));
        Ok(Box::new(FakeVolume {
            path: PathBuf::from(format!("/dev/fake-nbd-{name}")),
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

#[derive(Default)]
struct HookCounters {
    received: AtomicUsize,
    exposed: AtomicUsize,
    authority: AtomicUsize,
    completed: AtomicUsize,
    all_received: AtomicUsize,
    all_completed: AtomicUsize,
}

fn counting_hooks(counters: &Arc<HookCounters>) -> MigrateFromHooks {
    let c = counters.clone();
    let c2 = counters.clone();
    let c3 = counters.clone();
    let c4 = counters.clone();
    let c5 = counters.clone();
    let c6 = counters.clone();
    MigrateFromHooks {
        on_device_received: Some(Box::new(move |_, _| {
            c.received.fetch_add(1, Ordering::SeqCst);
        })),
        on_device_exposed: Some(Box::new(move |_, _| {
            c2.exposed.fetch_add(1, Ordering::SeqCst);
        })),
        on_device_authority_received: Some(Box::new(move |_| {
            c3.authority.fetch_add(1, Ordering::SeqCst);
        })),
        on_device_migration_completed: Some(Box::new(move |_| {
            c4.completed.fetch_add(1, Ordering::SeqCst);
        })),
        on_all_devices_received: Some(Box::new(move || {
            c5.all_received.fetch_add(1, Ordering::SeqCst);
        })),
        on_all_migrations_completed: Some(Box::new(move || {
            c6.all_completed.fetch_add(1, Ordering::SeqCst);
        })),
    }
}

fn fast_source_opts() -> MigrateToOptions {
    MigrateToOptions {
        drain_interval: Duration::from_millis(5),
        settle_drains: 2,
        ..Default::default()
    }
}

const BLOCK: u32 = 64 * 1024;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_device_quiescent_migration() {
    let dir = scratch_dir("single");
    let content = patterned(16 * BLOCK as usize, 3);
    let device = source_device(&dir, DeviceName::Disk, &content, BLOCK);

    let (src_conn, dst_conn) = tokio::io::duplex(256 * 1024);
    let vm = Arc::new(FakeVm::default());
    let agent = Arc::new(FakeAgent::default());
    let exposer = Arc::new(CapturingExposer::default());
    let counters = Arc::new(HookCounters::default());

    let dst_dir = dir.join("dst");
    let mut peer = migrate_from(
        dst_conn,
        DeviceLayout::under(&dst_dir),
        exposer.clone(),
        counting_hooks(&counters),
        MigrateFromOptions::default(),
        &test_log(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let src = tokio::spawn({
        let vm = vm.clone();
        let agent = agent.clone();
        async move {
            migrate_to(
                src_conn,
                vec![device],
                vm,
                agent,
                fast_source_opts(),
                &test_log(),
                CancellationToken::new(),
            )
            .await
        }
    });

    peer.ready().await.unwrap();
    assert!(peer.device_path(DeviceName::Disk).is_some());
    peer.join().await.unwrap();
    src.await.unwrap().unwrap();

    // The source suspended exactly once, after the agent was told.
    assert_eq!(vm.suspends.load(Ordering::SeqCst), 1);
    assert_eq!(vm.state_snapshots.load(Ordering::SeqCst), 1);
    assert_eq!(agent.before_suspends.load(Ordering::SeqCst), 1);

    // Every hook fired once for the single device.
    assert_eq!(counters.received.load(Ordering::SeqCst), 1);
    assert_eq!(counters.exposed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.authority.load(Ordering::SeqCst), 1);
    assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.all_received.load(Ordering::SeqCst), 1);
    assert_eq!(counters.all_completed.load(Ordering::SeqCst), 1);

    // Destination content matches the source bytes exactly.
    let migrated = std::fs::read(
        dst_dir.join(DeviceName::Disk.artifact_name()),
    )
    .unwrap();
    assert_eq!(migrated, content);

    peer.close().await.unwrap();
    assert!(exposer.shutdowns.load(Ordering::SeqCst) >= 1);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dirty_blocks_converge_and_suspend() {
    let dir = scratch_dir("converge");
    let content = patterned(8 * BLOCK as usize, 9);
    let device = source_device(&dir, DeviceName::Memory, &content, BLOCK);
    let guest_view = device.storage.clone();

    let (src_conn, dst_conn) = tokio::io::duplex(256 * 1024);
    let (vm, _suspended) = FakeVm::with_suspend_signal();
    let agent = Arc::new(FakeAgent::default());
    let exposer = Arc::new(CapturingExposer::default());

    // A "guest" rewriting block 0 while pre-copy runs. It stops on its
    // own; convergence is then a run of empty drains.
    let writer = tokio::spawn(async move {
        for round in 0u8..50 {
            let payload = vec![round.wrapping_add(1); 512];
            guest_view.write_at(0, &payload).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let dst_dir = dir.join("dst");
    let mut peer = migrate_from(
        dst_conn,
        DeviceLayout::under(&dst_dir),
        exposer.clone(),
        MigrateFromHooks::default(),
        MigrateFromOptions::default(),
        &test_log(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let opts = MigrateToOptions {
        // Only an empty drain counts as settled, and six of them must
        // accumulate back to back, so suspension cannot race the writer.
        dirty_threshold: 0,
        settle_drains: 5,
        drain_interval: Duration::from_millis(2),
        ..Default::default()
    };
    let src = tokio::spawn({
        let vm = vm.clone();
        let agent = agent.clone();
        async move {
            migrate_to(
                src_conn,
                vec![device],
                vm,
                agent,
                opts,
                &test_log(),
                CancellationToken::new(),
            )
            .await
        }
    });

    peer.ready().await.unwrap();
    peer.join().await.unwrap();
    src.await.unwrap().unwrap();
    writer.await.unwrap();

    assert_eq!(vm.suspends.load(Ordering::SeqCst), 1);
    // The engine flushed guest memory between drains.
    assert!(vm.msyncs.load(Ordering::SeqCst) >= 1);

    // The destination holds the final pre-suspend bytes, including the
    // writer's last rewrite of block 0.
    let migrated = std::fs::read(
        dst_dir.join(DeviceName::Memory.artifact_name()),
    )
    .unwrap();
    let source_now = std::fs::read(
        dir.join(DeviceName::Memory.artifact_name()),
    )
    .unwrap();
    assert_eq!(migrated, source_now);
    assert_eq!(migrated[0], 50);

    peer.close().await.unwrap();
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn early_destination_read_is_served() {
    let dir = scratch_dir("needat");
    let content = patterned(64 * BLOCK as usize, 17);
    let device = source_device(&dir, DeviceName::Disk, &content, BLOCK);

    let (src_conn, dst_conn) = tokio::io::duplex(64 * 1024);
    let vm = Arc::new(FakeVm::default());
    let agent = Arc::new(FakeAgent::default());
    let exposer = Arc::new(CapturingExposer::default());

    let (exposed_tx, exposed_rx) = tokio::sync::oneshot::channel();
    let hooks = MigrateFromHooks {
        on_device_exposed: Some(Box::new({
            let tx = Mutex::new(Some(exposed_tx));
            move |_, _| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        })),
        ..Default::default()
    };

    let dst_dir = dir.join("dst");
    let mut peer = migrate_from(
        dst_conn,
        DeviceLayout::under(&dst_dir),
        exposer.clone(),
        hooks,
        MigrateFromOptions::default(),
        &test_log(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let src = tokio::spawn({
        let vm = vm.clone();
        let agent = agent.clone();
        async move {
            migrate_to(
                src_conn,
                vec![device],
                vm,
                agent,
                fast_source_opts(),
                &test_log(),
                CancellationToken::new(),
            )
            .await
        }
    });

    // As soon as the device is exposed, read a block that volatility
    // ranking would send late. The stalled read emits NeedAt upstream and
    // must come back with the right bytes well before the tail arrives.
    exposed_rx.await.unwrap();
    let cache = exposer.storage_for(DeviceName::Disk).unwrap();
    let offset = 50 * BLOCK as u64;
    let mut early = vec![0u8; BLOCK as usize];
    cache.read_at(offset, &mut early).await.unwrap();
    assert_eq!(
        early,
        content[offset as usize..offset as usize + BLOCK as usize]
    );

    peer.ready().await.unwrap();
    peer.join().await.unwrap();
    src.await.unwrap().unwrap();
    peer.close().await.unwrap();
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_drop_fails_both_sides_and_releases_devices() {
    let dir = scratch_dir("drop");
    let content = patterned(64 * BLOCK as usize, 23);
    let device = source_device(&dir, DeviceName::Disk, &content, BLOCK);

    // Proxy the source->destination direction through a byte budget of
    // roughly half the device, then cut the link.
    let (src_conn, src_proxy) = tokio::io::duplex(64 * 1024);
    let (dst_proxy, dst_conn) = tokio::io::duplex(64 * 1024);
    let (mut sp_read, mut sp_write) = tokio::io::split(src_proxy);
    let (mut dp_read, mut dp_write) = tokio::io::split(dst_proxy);

    tokio::spawn(async move {
        let mut budget = 32usize * BLOCK as usize;
        let mut buf = [0u8; 4096];
        while budget > 0 {
            let n = match sp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let take = n.min(budget);
            if dp_write.write_all(&buf[..take]).await.is_err() {
                break;
            }
            budget -= take;
        }
        // Halves drop here; the link is dead in this direction.
    });
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = match dp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if sp_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });

    let vm = Arc::new(FakeVm::default());
    let agent = Arc::new(FakeAgent::default());
    let exposer = Arc::new(CapturingExposer::default());

    let dst_dir = dir.join("dst");
    let mut peer = migrate_from(
        dst_conn,
        DeviceLayout::under(&dst_dir),
        exposer.clone(),
        MigrateFromHooks::default(),
        MigrateFromOptions::default(),
        &test_log(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let src = tokio::spawn({
        let vm = vm.clone();
        let agent = agent.clone();
        async move {
            migrate_to(
                src_conn,
                vec![device],
                vm,
                agent,
                fast_source_opts(),
                &test_log(),
                CancellationToken::new(),
            )
            .await
        }
    });

    // Both sides finalize as failed.
    assert!(src.await.unwrap().is_err());
    assert!(peer.join().await.is_err());

    // Every exposed device was released, and the waiting cache no longer
    // parks readers.
    assert_eq!(exposer.exposed_count(), 1);
    assert!(exposer.shutdowns.load(Ordering::SeqCst) >= 1);
    let cache = exposer.storage_for(DeviceName::Disk).unwrap();
    let mut buf = [0u8; 16];
    assert!(cache.read_at(63 * BLOCK as u64, &mut buf).await.is_err());

    // The guest was never suspended for a migration that failed.
    assert_eq!(vm.suspends.load(Ordering::SeqCst), 0);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_device_migration_with_resume() {
    let dir = scratch_dir("multi");
    let config_json = br#"{"agentVSockPort": 26}"#.to_vec();
    let contents: Vec<(DeviceName, Vec<u8>)> = vec![
        (DeviceName::State, patterned(2 * BLOCK as usize, 1)),
        (DeviceName::Memory, patterned(8 * BLOCK as usize, 2)),
        (DeviceName::Disk, patterned(4 * BLOCK as usize, 3)),
        // A partial final block: size is deliberately unaligned.
        (DeviceName::Kernel, patterned(3 * BLOCK as usize + 100, 4)),
        (DeviceName::Config, config_json),
    ];
    let devices: Vec<SourceDevice> = contents
        .iter()
        .map(|(name, content)| source_device(&dir, *name, content, BLOCK))
        .collect();

    let (src_conn, dst_conn) = tokio::io::duplex(512 * 1024);
    let vm = Arc::new(FakeVm::default());
    let agent = Arc::new(FakeAgent::default());
    let exposer = Arc::new(CapturingExposer::default());
    let counters = Arc::new(HookCounters::default());

    let dst_dir = dir.join("dst");
    let mut peer = migrate_from(
        dst_conn,
        DeviceLayout::under(&dst_dir),
        exposer.clone(),
        counting_hooks(&counters),
        MigrateFromOptions::default(),
        &test_log(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let src = tokio::spawn({
        let vm = vm.clone();
        let agent = agent.clone();
        async move {
            migrate_to(
                src_conn,
                devices,
                vm,
                agent,
                fast_source_opts(),
                &test_log(),
                CancellationToken::new(),
            )
            .await
        }
    });

    // Resume is gated on every device having authority.
    peer.ready().await.unwrap();
    let config = peer.resume(vm.as_ref(), agent.as_ref()).await.unwrap();
    assert_eq!(config.agent_vsock_port, 26);
    assert_eq!(vm.resumes.load(Ordering::SeqCst), 1);
    assert_eq!(agent.after_resumes.load(Ordering::SeqCst), 1);

    peer.join().await.unwrap();
    src.await.unwrap().unwrap();

    assert_eq!(counters.all_received.load(Ordering::SeqCst), 1);
    assert_eq!(counters.received.load(Ordering::SeqCst), 5);
    assert_eq!(counters.authority.load(Ordering::SeqCst), 5);
    assert_eq!(counters.completed.load(Ordering::SeqCst), 5);
    assert_eq!(counters.all_completed.load(Ordering::SeqCst), 1);

    for (name, content) in &contents {
        let migrated =
            std::fs::read(dst_dir.join(name.artifact_name())).unwrap();
        assert_eq!(&migrated, content, "content mismatch for {name}");
    }

    peer.close().await.unwrap();
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destination_cancellation_releases_resources() {
    let dir = scratch_dir("cancel");
    let content = patterned(64 * BLOCK as usize, 29);
    let device = source_device(&dir, DeviceName::Disk, &content, BLOCK);

    let (src_conn, dst_conn) = tokio::io::duplex(64 * 1024);
    let vm = Arc::new(FakeVm::default());
    let agent = Arc::new(FakeAgent::default());
    let exposer = Arc::new(CapturingExposer::default());

    let (exposed_tx, exposed_rx) = tokio::sync::oneshot::channel();
    let hooks = MigrateFromHooks {
        on_device_exposed: Some(Box::new({
            let tx = Mutex::new(Some(exposed_tx));
            move |_, _| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        })),
        ..Default::default()
    };

    let dst_dir = dir.join("dst");
    let mut peer = migrate_from(
        dst_conn,
        DeviceLayout::under(&dst_dir),
        exposer.clone(),
        hooks,
        MigrateFromOptions::default(),
        &test_log(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let src = tokio::spawn({
        let vm = vm.clone();
        let agent = agent.clone();
        async move {
            migrate_to(
                src_conn,
                vec![device],
                vm,
                agent,
                fast_source_opts(),
                &test_log(),
                CancellationToken::new(),
            )
            .await
        }
    });

    // Cancel mid pre-copy, as soon as the device exists.
    exposed_rx.await.unwrap();
    peer.cancel();

    match peer.join().await {
        Err(MigrateError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(src.await.unwrap().is_err());

    // Waiting caches are unblocked and devices released.
    let cache = exposer.storage_for(DeviceName::Disk).unwrap();
    let mut buf = [0u8; 16];
    assert!(cache.read_at(63 * BLOCK as u64, &mut buf).await.is_err());
    assert!(exposer.shutdowns.load(Ordering::SeqCst) >= 1);

    std::fs::remove_dir_all(dir).unwrap();
}
