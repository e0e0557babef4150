// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination side of a migration session.
//!
//! Each inbound stream announces a device; the engine allocates backing
//! storage, wraps it in a waiting cache, exposes it to the guest, and
//! admits blocks as they arrive. Once every announced device has passed
//! authority, the VM may be resumed; the residual tail keeps streaming
//! into the caches underneath it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drafter_types::{DeviceName, PackageConfiguration};
use slog::{debug, info, o, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::GuestAgent;
use crate::expose::{ExposedVolume, VolumeExposer};
use crate::storage::{
    block_count, CacheHint, FileStorage, ShardedStorage, Storage, WaitingCache,
};
use crate::vmm::VmControl;

use super::codec::{EventKind, Message};
use super::mux::{Acceptor, IncomingStream, Mux};
use super::{MigrateError, MigrateFromHooks, MigrateRole};

/// Where each received device's backing file lands.
#[derive(Clone, Debug)]
pub struct DeviceLayout {
    pub state: PathBuf,
    pub memory: PathBuf,
    pub disk: PathBuf,
    pub initramfs: PathBuf,
    pub kernel: PathBuf,
    pub config: PathBuf,
}

impl DeviceLayout {
    /// The canonical layout: every artifact under one directory.
    pub fn under(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let path = |name: DeviceName| dir.join(name.artifact_name());
        Self {
            state: path(DeviceName::State),
            memory: path(DeviceName::Memory),
            disk: path(DeviceName::Disk),
            initramfs: path(DeviceName::Initramfs),
            kernel: path(DeviceName::Kernel),
            config: path(DeviceName::Config),
        }
    }

    pub fn path_for(&self, name: DeviceName) -> &Path {
        match name {
            DeviceName::State => &self.state,
            DeviceName::Memory => &self.memory,
            DeviceName::Disk => &self.disk,
            DeviceName::Initramfs => &self.initramfs,
            DeviceName::Kernel => &self.kernel,
            DeviceName::Config => &self.config,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MigrateFromOptions {
    /// Block size advertised to the guest on the exposed device.
    pub expose_block_size: u32,
    /// Devices larger than this are striped across shards instead of one
    /// flat file. `None` keeps everything flat.
    pub shard_above: Option<u64>,
    /// Time allowed for the guest agent's post-resume handshake.
    pub resume_timeout: Duration,
    /// Snapshot file names passed through to the hypervisor on resume.
    pub snapshot_state_name: String,
    pub snapshot_memory_name: String,
}

impl Default for MigrateFromOptions {
    fn default() -> Self {
        Self {
            expose_block_size: 4096,
            shard_above: None,
            resume_timeout: Duration::from_secs(60),
            snapshot_state_name: DeviceName::State.artifact_name().to_string(),
            snapshot_memory_name: DeviceName::Memory
                .artifact_name()
                .to_string(),
        }
    }
}

struct DeviceEntry {
    name: DeviceName,
    cache: Arc<WaitingCache>,
    volume: Arc<dyn ExposedVolume>,
    authority: bool,
    completed: bool,
}

struct SessionState {
    devices: HashMap<u32, DeviceEntry>,
    all_sent: bool,
    all_completed_fired: bool,
}

struct Session {
    layout: DeviceLayout,
    opts: MigrateFromOptions,
    exposer: Arc<dyn VolumeExposer>,
    hooks: MigrateFromHooks,
    state: Mutex<SessionState>,
    /// Streams the transport has announced, maintained by the mux read
    /// task ahead of any frame dispatch. Guards readiness against a
    /// device whose stream exists but whose setup has not registered it
    /// yet.
    announced_streams: Arc<AtomicUsize>,
    ready_tx: watch::Sender<bool>,
    log: Logger,
}

impl Session {
    fn mark_all_sent(&self) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.all_sent {
                false
            } else {
                state.all_sent = true;
                true
            }
        };
        if fire {
            if let Some(hook) = &self.hooks.on_all_devices_received {
                hook();
            }
        }
        self.check_ready();
    }

    fn mark_authority(&self, id: u32) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.devices.get_mut(&id) {
                entry.authority = true;
            }
        }
        if let Some(hook) = &self.hooks.on_device_authority_received {
            hook(id);
        }
        self.check_ready();
    }

    fn mark_completed(&self, id: u32) {
        let fire_all = {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.devices.get_mut(&id) {
                entry.completed = true;
            }
            let done = state.all_sent
                && !state.devices.is_empty()
                && state.devices.len()
                    == self.announced_streams.load(Ordering::SeqCst)
                && state.devices.values().all(|d| d.completed);
            if done && !state.all_completed_fired {
                state.all_completed_fired = true;
                true
            } else {
                false
            }
        };
        if let Some(hook) = &self.hooks.on_device_migration_completed {
            hook(id);
        }
        if fire_all {
            info!(self.log, "all device migrations completed");
            if let Some(hook) = &self.hooks.on_all_migrations_completed {
                hook();
            }
        }
    }

    /// The VM is safe to resume once every announced device has passed
    /// authority and the source has promised no further devices.
    fn check_ready(&self) {
        let state = self.state.lock().unwrap();
        if state.all_sent
            && !state.devices.is_empty()
            && state.devices.len()
                == self.announced_streams.load(Ordering::SeqCst)
            && state.devices.values().all(|d| d.authority)
        {
            let _ = self.ready_tx.send(true);
        }
    }
}

/// Handle to an in-progress inbound migration.
///
/// `ready()` resolves when the VM may be resumed (every device holds
/// authority); `join()` resolves when the whole transfer has completed and
/// the session is torn down.
pub struct MigratedPeer {
    session: Arc<Session>,
    task: Option<tokio::task::JoinHandle<Result<(), MigrateError>>>,
    ready_rx: watch::Receiver<bool>,
    ended_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl MigratedPeer {
    /// Wait until every device has received authority (safe to resume), or
    /// until the session dies first.
    pub async fn ready(&mut self) -> Result<(), MigrateError> {
        let mut ended = self.ended_rx.clone();
        tokio::select! {
            res = self.ready_rx.wait_for(|&v| v) => {
                res.map(|_| ()).map_err(|_| MigrateError::TransportClosed)
            }
            _ = ended.wait_for(|&v| v) => Err(MigrateError::InvalidState(
                "session ended before all devices were ready",
            )),
        }
    }

    /// Abort the session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The exposed device path for `name`, once announced.
    pub fn device_path(&self, name: DeviceName) -> Option<PathBuf> {
        let state = self.session.state.lock().unwrap();
        state
            .devices
            .values()
            .find(|d| d.name == name)
            .map(|d| d.volume.path().to_path_buf())
    }

    /// Parse the package configuration and resume the VM. Only valid once
    /// `ready()` has resolved; missing config blocks are pulled on demand.
    pub async fn resume(
        &self,
        vm: &dyn VmControl,
        agent: &dyn GuestAgent,
    ) -> Result<PackageConfiguration, MigrateError> {
        if !*self.ready_rx.borrow() {
            return Err(MigrateError::InvalidState(
                "resume before all devices received authority",
            ));
        }
        let config = self.package_configuration().await?;
        info!(self.session.log, "resuming VM";
            "agent_vsock_port" => config.agent_vsock_port);

        vm.resume_snapshot(
            &self.session.opts.snapshot_state_name,
            &self.session.opts.snapshot_memory_name,
        )
        .await
        .map_err(|e| MigrateError::Hypervisor(e.to_string()))?;

        match tokio::time::timeout(
            self.session.opts.resume_timeout,
            agent.after_resume(),
        )
        .await
        {
            Err(_) => Err(MigrateError::AgentTimeout(
                self.session.opts.resume_timeout,
            )),
            Ok(Err(e)) => Err(MigrateError::Agent(e.to_string())),
            Ok(Ok(())) => Ok(config),
        }
    }

    async fn package_configuration(
        &self,
    ) -> Result<PackageConfiguration, MigrateError> {
        let cache = {
            let state = self.session.state.lock().unwrap();
            state
                .devices
                .values()
                .find(|d| d.name == DeviceName::Config)
                .map(|d| d.cache.clone())
        }
        .ok_or(MigrateError::InvalidState("no config device received"))?;

        let mut raw = vec![0u8; cache.size() as usize];
        cache.read_at(0, &mut raw).await?;
        // The document is padded out to the device size with NULs.
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        serde_json::from_slice(&raw[..end])
            .map_err(|e| MigrateError::Configuration(e.to_string()))
    }

    /// Wait for the whole migration to finish. The devices stay exposed
    /// for the resumed VM; release them with [`MigratedPeer::close`].
    pub async fn join(&mut self) -> Result<(), MigrateError> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(res) => res,
                Err(join_err) => Err(MigrateError::Invariant(format!(
                    "session task panicked: {join_err}"
                ))),
            },
            // Already joined; that call surfaced the outcome.
            None => Ok(()),
        }
    }

    /// Abort anything still in flight and release every exposed device
    /// and backing file. Call once the VM is done with the devices.
    pub async fn close(&mut self) -> Result<(), MigrateError> {
        self.cancel.cancel();
        let mut errors = Vec::new();
        if let Err(e) = self.join().await {
            errors.push(e);
        }

        let entries: Vec<(Arc<WaitingCache>, Arc<dyn ExposedVolume>)> = {
            let state = self.session.state.lock().unwrap();
            state
                .devices
                .values()
                .map(|d| (d.cache.clone(), d.volume.clone()))
                .collect()
        };
        for (cache, volume) in entries {
            cache.close_waiters();
            if let Err(e) = volume.shutdown().await {
                errors.push(MigrateError::Exposer(e.to_string()));
            }
            if let Err(e) = cache.close().await {
                errors.push(MigrateError::Storage(e));
            }
        }

        let meaningful: Vec<MigrateError> = errors
            .into_iter()
            .filter(|e| !matches!(e, MigrateError::Cancelled))
            .collect();
        match MigrateError::aggregate(meaningful) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Accept a migration from the peer on the other end of `conn`. Returns a
/// handle immediately; device arrival, exposure, and authority transfer
/// happen in the background.
pub async fn migrate_from<T>(
    conn: T,
    layout: DeviceLayout,
    exposer: Arc<dyn VolumeExposer>,
    hooks: MigrateFromHooks,
    opts: MigrateFromOptions,
    log: &Logger,
    cancel: CancellationToken,
) -> Result<MigratedPeer, MigrateError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if !opts.expose_block_size.is_power_of_two() {
        return Err(MigrateError::InvalidState(
            "expose block size must be a power of two",
        ));
    }

    let log = log.new(o!(
        "migration_id" => Uuid::new_v4().to_string(),
        "migrate_role" => MigrateRole::Destination.as_str(),
    ));
    info!(log, "starting destination migration");

    let session_cancel = cancel.child_token();
    let (reader, writer) = tokio::io::split(conn);
    let (accept_tx, accept_rx) = mpsc::channel(DeviceName::ALL.len());
    let announced_streams = Arc::new(AtomicUsize::new(0));
    let mux = Mux::start(
        reader,
        writer,
        Some(Acceptor { tx: accept_tx, seen: announced_streams.clone() }),
        session_cancel.clone(),
        &log,
    );

    let (ready_tx, ready_rx) = watch::channel(false);
    let (ended_tx, ended_rx) = watch::channel(false);
    let session = Arc::new(Session {
        layout,
        opts,
        exposer,
        hooks,
        state: Mutex::new(SessionState {
            devices: HashMap::new(),
            all_sent: false,
            all_completed_fired: false,
        }),
        announced_streams,
        ready_tx,
        log: log.clone(),
    });

    let task = tokio::spawn(run_session(
        session.clone(),
        mux,
        accept_rx,
        session_cancel.clone(),
        ended_tx,
        cancel.clone(),
    ));

    Ok(MigratedPeer {
        session,
        task: Some(task),
        ready_rx,
        ended_rx,
        cancel: session_cancel,
    })
}

async fn run_session(
    session: Arc<Session>,
    mux: Mux,
    mut accept_rx: mpsc::Receiver<IncomingStream>,
    cancel: CancellationToken,
    ended_tx: watch::Sender<bool>,
    external: CancellationToken,
) -> Result<(), MigrateError> {
    let mut device_tasks: JoinSet<Result<(), MigrateError>> = JoinSet::new();
    let mut errors: Vec<MigrateError> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = accept_rx.recv() => {
                let Some(incoming) = incoming else {
                    // Transport drained; the remaining work is in the
                    // device tasks.
                    break;
                };
                let device_session = session.clone();
                let device_cancel = cancel.clone();
                device_tasks.spawn(async move {
                    run_device(incoming, device_session, device_cancel).await
                });
            }
            Some(joined) = device_tasks.join_next(), if !device_tasks.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        cancel.cancel();
                        errors.push(e);
                        break;
                    }
                    Err(join_err) => {
                        cancel.cancel();
                        errors.push(MigrateError::Invariant(format!(
                            "device task panicked: {join_err}"
                        )));
                        break;
                    }
                }
            }
        }
    }

    // Any device that has not completed will never see another frame;
    // unblock readers it may have parked in its cache before joining.
    {
        let state = session.state.lock().unwrap();
        for entry in state.devices.values().filter(|d| !d.completed) {
            entry.cache.close_waiters();
        }
    }

    while let Some(joined) = device_tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                errors.push(e);
            }
            Err(join_err) => {
                cancel.cancel();
                errors.push(MigrateError::Invariant(format!(
                    "device task panicked: {join_err}"
                )));
            }
        }
    }

    // On failure, no consistent tail is coming: unblock any readers
    // parked on absent blocks. If authority had already transferred for
    // every device the VM may be running on them, so the devices stay
    // exposed and only [`MigratedPeer::close`] releases them; before
    // that point they are torn down here. On success everything stays up
    // for the resumed VM. Mux shutdown cancels the session token as a
    // matter of course, so remember how we got here first.
    let was_cancelled = cancel.is_cancelled();
    let failed = !errors.is_empty() || was_cancelled;
    if failed {
        let ready = *session.ready_tx.borrow();
        let entries: Vec<(Arc<WaitingCache>, Arc<dyn ExposedVolume>)> = {
            let state = session.state.lock().unwrap();
            state
                .devices
                .values()
                .map(|d| (d.cache.clone(), d.volume.clone()))
                .collect()
        };
        for (cache, volume) in entries {
            cache.close_waiters();
            if !ready {
                if let Err(e) = volume.shutdown().await {
                    errors.push(MigrateError::Exposer(e.to_string()));
                }
                if let Err(e) = cache.flush().await {
                    errors.push(MigrateError::Storage(e));
                }
            }
        }
    }
    if let Some(e) = mux.shutdown().await {
        errors.push(e);
    }

    let incomplete = {
        let state = session.state.lock().unwrap();
        state.devices.is_empty()
            || !state.devices.values().all(|d| d.completed)
            || !state.all_sent
    };
    let _ = ended_tx.send(true);

    let meaningful: Vec<MigrateError> = errors
        .into_iter()
        .filter(|e| !matches!(e, MigrateError::Cancelled))
        .collect();
    if !meaningful.is_empty() {
        return Err(MigrateError::aggregate(meaningful).unwrap());
    }
    if external.is_cancelled() || was_cancelled {
        return Err(MigrateError::Cancelled);
    }
    if incomplete {
        return Err(MigrateError::TransportClosed);
    }
    info!(session.log, "destination migration complete");
    Ok(())
}

/// Build the backing provider for a device: one flat file, or shards for
/// large devices.
fn create_backing(
    session: &Session,
    name: DeviceName,
    size: u64,
) -> Result<Arc<dyn Storage>, MigrateError> {
    let path = session.layout.path_for(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(MigrateError::Storage)?;
    }
    match session.opts.shard_above {
        Some(threshold) if size > threshold => {
            let shard_size = (size / 1024).max(threshold);
            let sharded =
                ShardedStorage::new(size, shard_size, |index, len| {
                    let shard = PathBuf::from(format!(
                        "{}-{index}.shard",
                        path.display()
                    ));
                    FileStorage::create(shard, len)
                        .map(|s| s as Arc<dyn Storage>)
                })
                .map_err(MigrateError::Storage)?;
            Ok(sharded)
        }
        _ => Ok(FileStorage::create(path, size).map_err(MigrateError::Storage)?),
    }
}

async fn run_device(
    incoming: IncomingStream,
    session: Arc<Session>,
    cancel: CancellationToken,
) -> Result<(), MigrateError> {
    let IncomingStream { id, tx, mut rx } = incoming;

    // The first frame on a stream must announce the device.
    let (name, size, block_size) = match rx.recv().await {
        Some(Message::DevInfo { name, size, block_size }) => {
            let name: DeviceName = name
                .parse()
                .map_err(|_| MigrateError::UnknownDevice(name.clone()))?;
            (name, size, block_size)
        }
        Some(_) => return Err(MigrateError::UnexpectedMessage),
        None if cancel.is_cancelled() => return Err(MigrateError::Cancelled),
        None => return Err(MigrateError::TransportClosed),
    };
    if block_size == 0
        || !block_size.is_power_of_two()
        || block_count(size, block_size) > u32::MAX as u64
    {
        return Err(MigrateError::InvalidState("invalid device geometry"));
    }
    {
        let state = session.state.lock().unwrap();
        if state.devices.values().any(|d| d.name == name) {
            return Err(MigrateError::UnexpectedMessage);
        }
    }
    let log = session.log.new(o!("device" => name.as_str()));
    info!(log, "device announced"; "size" => size, "block_size" => block_size);

    if let Some(hook) = &session.hooks.on_device_received {
        hook(id, name);
    }

    let backing = create_backing(&session, name, size)?;
    let (cache, mut hints) = WaitingCache::new(backing, block_size);

    let volume: Arc<dyn ExposedVolume> = Arc::from(
        session
            .exposer
            .expose(
                name,
                cache.clone() as Arc<dyn Storage>,
                session.opts.expose_block_size,
            )
            .await
            .map_err(|e| MigrateError::Exposer(e.to_string()))?,
    );
    info!(log, "device exposed"; "path" => %volume.path().display());
    if let Some(hook) = &session.hooks.on_device_exposed {
        hook(id, volume.path());
    }

    {
        let mut state = session.state.lock().unwrap();
        state.devices.insert(
            id,
            DeviceEntry {
                name,
                cache: cache.clone(),
                volume,
                authority: false,
                completed: false,
            },
        );
    }

    // Forward the cache's advisory hints upstream so the source can
    // reprioritise. Hints are meaningless once this device's stream is
    // done, so the forwarder's lifetime is tied to this task.
    let hint_task = {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(hint) = hints.recv().await {
                let message = match hint {
                    CacheHint::NeedAt { offset, length } => {
                        Message::NeedAt { offset, length }
                    }
                    CacheHint::DontNeedAt { offset, length } => {
                        Message::DontNeedAt { offset, length }
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        })
    };
    let _abort_hints = AbortOnDrop(&hint_task);

    let mut completed = false;
    while let Some(message) = rx.recv().await {
        match message {
            Message::WriteAt { offset, data } => {
                admit_write(&cache, offset, &data).await?;
                tx.send(Message::WriteAtResponse).await?;
            }
            Message::ReadAt { offset, length } => {
                let mut data = vec![0u8; length as usize];
                cache.read_at(offset, &mut data).await?;
                tx.send(Message::ReadAtResponse(data)).await?;
            }
            Message::DirtyList(blocks) => {
                debug!(log, "source re-dirtied blocks";
                    "count" => blocks.len());
                cache.mark_dirty(blocks.iter().map(|&b| b as u64));
            }
            Message::Event(kind) => {
                match kind {
                    EventKind::AllDevicesSent => session.mark_all_sent(),
                    EventKind::AssumeAuthority => {
                        info!(log, "authority received");
                        session.mark_authority(id);
                    }
                    EventKind::Completed => {
                        // Recorded before the ack goes out: the source
                        // will not close the transport until it has seen
                        // the ack, so EOF always finds this device
                        // complete.
                        completed = true;
                        session.mark_completed(id);
                    }
                    EventKind::PreLock
                    | EventKind::PostLock
                    | EventKind::PreUnlock
                    | EventKind::PostUnlock => {
                        debug!(log, "source lock transition"; "event" => ?kind);
                    }
                }
                tx.send(Message::EventResponse).await?;
                if completed {
                    break;
                }
            }
            _ => return Err(MigrateError::UnexpectedMessage),
        }
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
    }
    if !completed {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        warn!(log, "stream ended before Completed");
        return Err(MigrateError::TransportClosed);
    }
    info!(log, "device migration completed");
    Ok(())
}

/// Aborts the wrapped task when dropped, so early returns do not leak it.
struct AbortOnDrop<'a>(&'a tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Admit a remote write block by block; the arrival-bit discipline in the
/// cache makes re-deliveries harmless.
async fn admit_write(
    cache: &Arc<WaitingCache>,
    offset: u64,
    data: &[u8],
) -> Result<(), MigrateError> {
    let bs = cache.block_size() as u64;
    if offset % bs != 0 {
        return Err(MigrateError::UnexpectedMessage);
    }
    let mut at = offset;
    let mut cursor = 0usize;
    while cursor < data.len() {
        let take = ((data.len() - cursor) as u64).min(bs) as usize;
        cache
            .present(at / bs, &data[cursor..cursor + take])
            .await
            .map_err(MigrateError::Storage)?;
        at += take as u64;
        cursor += take;
    }
    Ok(())
}
