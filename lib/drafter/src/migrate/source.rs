// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source side of a migration session.
//!
//! Each device runs the same pipeline on its own stream: announce
//! (`DevInfo`), pre-copy every block in priority/coldest-first order,
//! then loop draining the dirty set and re-sending until the set settles.
//! When every convergence-honoured device has voted, the devices lock
//! their storage in concert, the guest is suspended, a final drain ships
//! the residual, and authority passes to the destination.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drafter_types::{DeviceName, SnapshotKind};
use slog::{debug, info, o, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::GuestAgent;
use crate::storage::{
    block_count, block_len, blocks_in_range, DirtyTracker, FileStorage,
    Lockable, Metrics, Storage, VolatilityMonitor,
};
use crate::vmm::VmControl;

use super::codec::{EventKind, Message};
use super::mux::{Mux, StreamReceiver, StreamSender};
use super::orderer::{BlockClass, PriorityBlockOrder};
use super::{DeviceState, MigrateError, MigrateRole};

/// Tunables for a source session. The convergence defaults match observed
/// behavior on interactive workloads but are not load-tuned.
#[derive(Clone, Debug)]
pub struct MigrateToOptions {
    /// In-flight (unacknowledged) block transfers allowed per device, per
    /// block class, so priority sends are never starved by standard ones.
    pub concurrency: usize,
    /// A drain at or below this many blocks counts as small.
    pub dirty_threshold: usize,
    /// Consecutive small drains of the `memory` device before suspension
    /// is requested.
    pub settle_drains: u32,
    /// Pause between drains while the dirty set is small.
    pub drain_interval: Duration,
    /// Time allowed for each guest-agent call.
    pub agent_timeout: Duration,
    /// Snapshot file names passed through to the hypervisor.
    pub snapshot_state_name: String,
    pub snapshot_memory_name: String,
}

impl Default for MigrateToOptions {
    fn default() -> Self {
        Self {
            concurrency: 5000,
            dirty_threshold: 200,
            settle_drains: 10,
            drain_interval: Duration::from_millis(500),
            agent_timeout: Duration::from_secs(60),
            snapshot_state_name: DeviceName::State.artifact_name().to_string(),
            snapshot_memory_name: DeviceName::Memory
                .artifact_name()
                .to_string(),
        }
    }
}

/// A source-side device: the storage stack between the backing file and
/// the guest, with the tracking layers the engine drains.
///
/// Writes from the guest flow through `storage` (the lockable top of the
/// stack) and are recorded by the tracker and monitor on the way down.
pub struct SourceDevice {
    pub name: DeviceName,
    pub storage: Arc<Lockable>,
    pub tracker: Arc<DirtyTracker>,
    pub monitor: Arc<VolatilityMonitor>,
    pub metrics: Arc<Metrics>,
}

impl SourceDevice {
    /// Build the standard stack over an existing backing file.
    pub fn open(
        name: DeviceName,
        path: impl AsRef<Path>,
        block_size: u32,
        volatility_window: Duration,
    ) -> io::Result<Self> {
        Self::from_storage(
            name,
            FileStorage::open(path)?,
            block_size,
            volatility_window,
        )
    }

    /// Build the standard stack over any base provider.
    pub fn from_storage(
        name: DeviceName,
        base: Arc<dyn Storage>,
        block_size: u32,
        volatility_window: Duration,
    ) -> io::Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block size {block_size} is not a power of two"),
            ));
        }
        let metrics = Metrics::new(base);
        let tracker = DirtyTracker::new(metrics.clone(), block_size);
        let monitor = VolatilityMonitor::new(
            tracker.clone(),
            block_size,
            volatility_window,
        );
        let storage = Lockable::new(monitor.clone());
        Ok(Self { name, storage, tracker, monitor, metrics })
    }

    pub fn size(&self) -> u64 {
        self.storage.size()
    }

    pub fn block_size(&self) -> u32 {
        self.tracker.block_size()
    }
}

/// Migrate `devices` to the peer on the other end of `conn`. Blocks until
/// the destination has confirmed `Completed` for every device; the guest
/// is suspended partway through.
pub async fn migrate_to<T>(
    conn: T,
    devices: Vec<SourceDevice>,
    vm: Arc<dyn VmControl>,
    agent: Arc<dyn GuestAgent>,
    opts: MigrateToOptions,
    log: &Logger,
    cancel: CancellationToken,
) -> Result<(), MigrateError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if devices.is_empty() {
        return Err(MigrateError::InvalidState("no devices to migrate"));
    }
    {
        let mut names = BTreeSet::new();
        for dev in &devices {
            if !names.insert(dev.name) {
                return Err(MigrateError::InvalidState("duplicate device name"));
            }
            if block_count(dev.size(), dev.block_size()) > u32::MAX as u64 {
                return Err(MigrateError::InvalidState(
                    "device has too many blocks for wire indices",
                ));
            }
        }
    }

    let log = log.new(o!(
        "migration_id" => Uuid::new_v4().to_string(),
        "migrate_role" => MigrateRole::Source.as_str(),
    ));
    info!(log, "starting source migration"; "devices" => devices.len());

    let session_cancel = cancel.child_token();
    let (reader, writer) = tokio::io::split(conn);
    let mux = Mux::start(reader, writer, None, session_cancel.clone(), &log);

    let honoured: BTreeSet<DeviceName> =
        if devices.iter().any(|d| d.name == DeviceName::Memory) {
            [DeviceName::Memory].into()
        } else {
            devices.iter().map(|d| d.name).collect()
        };
    let gate = Arc::new(SuspendGate::new(honoured));
    let announced = Arc::new(Rendezvous::new(devices.len()));
    let locked = Arc::new(Rendezvous::new(devices.len()));

    let mut device_tasks: JoinSet<Result<(), MigrateError>> = JoinSet::new();
    let mut recv_tasks: JoinSet<Result<(), MigrateError>> = JoinSet::new();

    for (index, dev) in devices.into_iter().enumerate() {
        let id = index as u32;
        let (tx, rx) = mux.open(id);
        let orderer = PriorityBlockOrder::new(dev.monitor.clone());
        orderer.add_all();
        let ledger = Arc::new(AckLedger::default());
        let done = Arc::new(AtomicBool::new(false));
        let dev_log = log.new(o!("device" => dev.name.as_str()));

        recv_tasks.spawn(recv_loop(
            rx,
            tx.clone(),
            ledger.clone(),
            orderer.clone(),
            dev.storage.clone() as Arc<dyn Storage>,
            dev.block_size(),
            done.clone(),
            session_cancel.clone(),
            dev_log.new(o!("task" => "recv")),
        ));

        let task = DeviceSource {
            name: dev.name,
            storage: dev.storage,
            tracker: dev.tracker,
            stream: tx,
            orderer,
            ledger,
            sems: ClassSems::new(opts.concurrency),
            gate: gate.clone(),
            announced: announced.clone(),
            locked: locked.clone(),
            vm: vm.clone(),
            agent: agent.clone(),
            opts: opts.clone(),
            cancel: session_cancel.clone(),
            done,
            state: DeviceState::Init,
            log: dev_log,
            leader: index == 0,
        };
        device_tasks.spawn(task.run());
    }

    let mut errors: Vec<MigrateError> = Vec::new();
    while let Some(joined) = device_tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session_cancel.cancel();
                errors.push(e);
            }
            Err(join_err) => {
                session_cancel.cancel();
                errors.push(MigrateError::Invariant(format!(
                    "device task panicked: {join_err}"
                )));
            }
        }
    }

    if let Some(e) = mux.shutdown().await {
        errors.push(e);
    }
    while let Some(joined) = recv_tasks.join_next().await {
        if let Ok(Err(e)) = joined {
            errors.push(e);
        }
    }

    finish(errors, &cancel, &log)
}

/// Collapse collected failures into the session's single terminal error.
fn finish(
    errors: Vec<MigrateError>,
    external: &CancellationToken,
    log: &Logger,
) -> Result<(), MigrateError> {
    let meaningful: Vec<MigrateError> = errors
        .into_iter()
        .filter(|e| !matches!(e, MigrateError::Cancelled))
        .collect();
    if !meaningful.is_empty() {
        return Err(MigrateError::aggregate(meaningful).unwrap());
    }
    if external.is_cancelled() {
        return Err(MigrateError::Cancelled);
    }
    info!(log, "source migration complete");
    Ok(())
}

/// All-devices rendezvous point; the final arriver learns it is last.
struct Rendezvous {
    total: usize,
    arrived: AtomicUsize,
    complete_tx: watch::Sender<bool>,
}

impl Rendezvous {
    fn new(total: usize) -> Self {
        let (complete_tx, _) = watch::channel(false);
        Self { total, arrived: AtomicUsize::new(0), complete_tx }
    }

    /// Returns true for the last device to arrive.
    fn arrive(&self) -> bool {
        let n = self.arrived.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.total {
            let _ = self.complete_tx.send(true);
            true
        } else {
            false
        }
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), MigrateError> {
        let mut rx = self.complete_tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
            res = rx.wait_for(|&v| v) => {
                res.map(|_| ()).map_err(|_| MigrateError::Cancelled)
            }
        }
    }
}

/// Tracks when suspension has been requested (every honoured device voted)
/// and when the guest is actually suspended.
struct SuspendGate {
    honoured: BTreeSet<DeviceName>,
    votes: Mutex<BTreeSet<DeviceName>>,
    requested_tx: watch::Sender<bool>,
    suspended_tx: watch::Sender<bool>,
}

impl SuspendGate {
    fn new(honoured: BTreeSet<DeviceName>) -> Self {
        let (requested_tx, _) = watch::channel(false);
        let (suspended_tx, _) = watch::channel(false);
        Self { honoured, votes: Mutex::new(BTreeSet::new()), requested_tx, suspended_tx }
    }

    fn honoured(&self, name: DeviceName) -> bool {
        self.honoured.contains(&name)
    }

    fn vote(&self, name: DeviceName) {
        if !self.honoured(name) {
            return;
        }
        let mut votes = self.votes.lock().unwrap();
        votes.insert(name);
        if votes.is_superset(&self.honoured) {
            let _ = self.requested_tx.send(true);
        }
    }

    fn requested(&self) -> bool {
        *self.requested_tx.borrow()
    }

    fn is_suspended(&self) -> bool {
        *self.suspended_tx.borrow()
    }

    fn set_suspended(&self) {
        let _ = self.suspended_tx.send(true);
    }

    async fn wait_suspended(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MigrateError> {
        let mut rx = self.suspended_tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
            res = rx.wait_for(|&v| v) => {
                res.map(|_| ()).map_err(|_| MigrateError::Cancelled)
            }
        }
    }
}

/// Per-device outstanding-response bookkeeping. Responses arrive on the
/// stream in request order, so each queue is matched FIFO.
#[derive(Default)]
struct AckLedger {
    /// Each in-flight `WriteAt` holds its concurrency permit here until
    /// the ack releases it.
    writes: Mutex<VecDeque<tokio::sync::OwnedSemaphorePermit>>,
    events: Mutex<VecDeque<oneshot::Sender<()>>>,
    drained: Notify,
}

impl AckLedger {
    fn register_write(&self, permit: tokio::sync::OwnedSemaphorePermit) {
        self.writes.lock().unwrap().push_back(permit);
    }

    fn ack_write(&self) -> Result<(), MigrateError> {
        let permit = self.writes.lock().unwrap().pop_front();
        match permit {
            Some(permit) => {
                drop(permit);
                self.drained.notify_waiters();
                Ok(())
            }
            None => Err(MigrateError::Invariant(
                "write acknowledged with none outstanding".to_string(),
            )),
        }
    }

    fn register_event(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.events.lock().unwrap().push_back(tx);
        rx
    }

    fn ack_event(&self) -> Result<(), MigrateError> {
        match self.events.lock().unwrap().pop_front() {
            Some(tx) => {
                let _ = tx.send(());
                Ok(())
            }
            None => Err(MigrateError::Invariant(
                "event acknowledged with none outstanding".to_string(),
            )),
        }
    }

    async fn wait_writes_drained(&self, cancel: &CancellationToken) -> Result<(), MigrateError> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.writes.lock().unwrap().is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
                _ = notified => {}
            }
        }
    }
}

struct ClassSems {
    priority: Arc<Semaphore>,
    standard: Arc<Semaphore>,
    dirty: Arc<Semaphore>,
}

impl ClassSems {
    fn new(limit: usize) -> Self {
        Self {
            priority: Arc::new(Semaphore::new(limit)),
            standard: Arc::new(Semaphore::new(limit)),
            dirty: Arc::new(Semaphore::new(limit)),
        }
    }

    fn for_class(&self, class: BlockClass) -> &Arc<Semaphore> {
        match class {
            BlockClass::Priority => &self.priority,
            BlockClass::Standard => &self.standard,
            BlockClass::Dirty => &self.dirty,
        }
    }
}

struct DeviceSource {
    name: DeviceName,
    storage: Arc<Lockable>,
    tracker: Arc<DirtyTracker>,
    stream: StreamSender,
    orderer: Arc<PriorityBlockOrder>,
    ledger: Arc<AckLedger>,
    sems: ClassSems,
    gate: Arc<SuspendGate>,
    announced: Arc<Rendezvous>,
    locked: Arc<Rendezvous>,
    vm: Arc<dyn VmControl>,
    agent: Arc<dyn GuestAgent>,
    opts: MigrateToOptions,
    cancel: CancellationToken,
    done: Arc<AtomicBool>,
    state: DeviceState,
    log: Logger,
    leader: bool,
}

impl DeviceSource {
    async fn run(mut self) -> Result<(), MigrateError> {
        let size = self.storage.size();
        let block_size = self.tracker.block_size();

        self.stream
            .send(Message::DevInfo {
                name: self.name.to_string(),
                size,
                block_size,
            })
            .await?;
        self.state.advance(DeviceState::PreCopy)?;

        // Every stream has announced before AllDevicesSent goes out.
        self.announced.arrive();
        self.announced.wait(&self.cancel).await?;
        if self.leader {
            self.send_event(EventKind::AllDevicesSent).await?;
        }

        info!(self.log, "pre-copy";
            "blocks" => self.orderer.remaining(), "block_size" => block_size);
        while let Some((block, class)) = self.orderer.next() {
            self.send_block(block, class).await?;
        }
        self.state.advance(DeviceState::Draining)?;

        let mut settles: u32 = 0;
        let mut authority_passed = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            let suspended = self.gate.is_suspended();

            // Ask the hypervisor to flush guest memory writes so the next
            // drain reflects settled state.
            if !suspended && self.name == DeviceName::Memory {
                self.snapshot(SnapshotKind::Msync).await?;
            }

            let dirty = self.tracker.drain();
            debug!(self.log, "drained"; "dirty" => dirty.len(),
                "suspended" => suspended);

            if suspended {
                if authority_passed && dirty.is_empty() {
                    break;
                }
                if !dirty.is_empty() {
                    self.send_dirty(&dirty).await?;
                }
                if !authority_passed {
                    // Residual is on the wire; make sure it has all been
                    // admitted before the handoff is announced.
                    self.ledger.wait_writes_drained(&self.cancel).await?;
                    self.state.advance(DeviceState::AuthorityTransfer)?;
                    info!(self.log, "passing authority to destination");
                    self.send_event(EventKind::AssumeAuthority).await?;
                    authority_passed = true;
                }
                continue;
            }

            let small = dirty.len() <= self.opts.dirty_threshold;
            if small && self.gate.honoured(self.name) {
                settles += 1;
                let needed = if self.name == DeviceName::Memory {
                    self.opts.settle_drains
                } else {
                    // Without a memory device to watch, a single settled
                    // drain per device is the convergence signal.
                    0
                };
                if settles > needed {
                    self.gate.vote(self.name);
                }
            } else if !small {
                settles = 0;
            }

            if !dirty.is_empty() {
                self.send_dirty(&dirty).await?;
            }

            if self.gate.requested() {
                self.enter_suspension().await?;
                continue;
            }

            if small {
                let mut requested_rx = self.gate.requested_tx.subscribe();
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(MigrateError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.opts.drain_interval) => {}
                    _ = requested_rx.wait_for(|&v| v) => {}
                }
            }
        }

        self.state.advance(DeviceState::Final)?;
        self.send_event(EventKind::PreUnlock).await?;
        self.storage.unlock().await;
        self.send_event(EventKind::PostUnlock).await?;
        self.send_event(EventKind::Completed).await?;
        self.state.advance(DeviceState::Done)?;
        self.done.store(true, Ordering::SeqCst);
        info!(self.log, "device migration complete");
        Ok(())
    }

    /// Lock this device, rendezvous with the others, and (for the last
    /// arriver) suspend the guest.
    async fn enter_suspension(&mut self) -> Result<(), MigrateError> {
        self.send_event(EventKind::PreLock).await?;
        self.storage.lock().await;
        self.send_event(EventKind::PostLock).await?;

        if self.locked.arrive() {
            info!(self.log, "all devices locked, suspending guest");
            if let Err(e) = self.suspend_guest().await {
                self.cancel.cancel();
                return Err(e);
            }
            self.gate.set_suspended();
        }
        self.gate.wait_suspended(&self.cancel).await
    }

    async fn suspend_guest(&self) -> Result<(), MigrateError> {
        match tokio::time::timeout(
            self.opts.agent_timeout,
            self.agent.before_suspend(),
        )
        .await
        {
            Err(_) => {
                return Err(MigrateError::AgentTimeout(self.opts.agent_timeout))
            }
            Ok(Err(e)) => return Err(MigrateError::Agent(e.to_string())),
            Ok(Ok(())) => {}
        }
        self.vm
            .suspend()
            .await
            .map_err(|e| MigrateError::Hypervisor(e.to_string()))?;
        self.snapshot(SnapshotKind::MsyncAndState).await
    }

    async fn snapshot(&self, kind: SnapshotKind) -> Result<(), MigrateError> {
        self.vm
            .create_snapshot(
                &self.opts.snapshot_state_name,
                &self.opts.snapshot_memory_name,
                kind,
            )
            .await
            .map_err(|e| MigrateError::Hypervisor(e.to_string()))
    }

    async fn send_dirty(
        &self,
        dirty: &BTreeSet<u64>,
    ) -> Result<(), MigrateError> {
        let blocks: Vec<u32> = dirty.iter().map(|&b| b as u32).collect();
        self.stream.send(Message::DirtyList(blocks)).await?;
        for &block in dirty {
            self.send_block(block, BlockClass::Dirty).await?;
        }
        Ok(())
    }

    async fn send_block(
        &self,
        block: u64,
        class: BlockClass,
    ) -> Result<(), MigrateError> {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
            permit = self.sems.for_class(class).clone().acquire_owned() => {
                permit.map_err(|_| MigrateError::Cancelled)?
            }
        };

        let size = self.storage.size();
        let block_size = self.tracker.block_size();
        let len = block_len(size, block_size, block) as usize;
        let offset = block * block_size as u64;
        let mut data = vec![0u8; len];
        self.storage.read_at(offset, &mut data).await?;

        // Registration precedes the send so a fast ack always finds its
        // entry.
        self.ledger.register_write(permit);
        self.stream.send(Message::WriteAt { offset, data }).await
    }

    async fn send_event(&self, kind: EventKind) -> Result<(), MigrateError> {
        let ack = self.ledger.register_event();
        self.stream.send(Message::Event(kind)).await?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            res = ack => res.map_err(|_| MigrateError::TransportClosed),
        }
    }
}

/// Drains one device's inbound stream: acknowledgements release their
/// ledger entries, peer hints steer the orderer, and pull-back reads are
/// served from storage.
#[allow(clippy::too_many_arguments)]
async fn recv_loop(
    mut rx: StreamReceiver,
    tx: StreamSender,
    ledger: Arc<AckLedger>,
    orderer: Arc<PriorityBlockOrder>,
    storage: Arc<dyn Storage>,
    block_size: u32,
    done: Arc<AtomicBool>,
    cancel: CancellationToken,
    log: Logger,
) -> Result<(), MigrateError> {
    let fail = |e: MigrateError| {
        cancel.cancel();
        Err(e)
    };
    while let Some(message) = rx.recv().await {
        match message {
            Message::WriteAtResponse => {
                if let Err(e) = ledger.ack_write() {
                    return fail(e);
                }
            }
            Message::EventResponse => {
                if let Err(e) = ledger.ack_event() {
                    return fail(e);
                }
            }
            Message::NeedAt { offset, length } => {
                debug!(log, "peer needs range";
                    "offset" => offset, "length" => length);
                for block in
                    clamp_blocks(offset, length, storage.size(), block_size)
                {
                    orderer.prioritise(block);
                }
            }
            Message::DontNeedAt { offset, length } => {
                for block in
                    clamp_blocks(offset, length, storage.size(), block_size)
                {
                    orderer.remove(block);
                }
            }
            Message::ReadAt { offset, length } => {
                let mut data = vec![0u8; length as usize];
                match storage.read_at(offset, &mut data).await {
                    Ok(()) => {
                        if tx.send(Message::ReadAtResponse(data)).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => return fail(MigrateError::Storage(e)),
                }
            }
            other => {
                return fail(MigrateError::Invariant(format!(
                    "unexpected message on source stream: {other:?}"
                )));
            }
        }
    }
    if !done.load(Ordering::SeqCst) && !cancel.is_cancelled() {
        return fail(MigrateError::TransportClosed);
    }
    Ok(())
}

/// Block indices covered by `[offset, offset + length)`, clamped to the
/// device.
fn clamp_blocks(
    offset: u64,
    length: u32,
    size: u64,
    block_size: u32,
) -> std::ops::Range<u64> {
    if offset >= size {
        return 0..0;
    }
    let len = (length as u64).min(size - offset);
    blocks_in_range(offset, len, block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_blocks_respects_device_end() {
        // 10 blocks of 4 KiB.
        assert_eq!(clamp_blocks(0, 4096, 40960, 4096), 0..1);
        assert_eq!(clamp_blocks(4096, 8192, 40960, 4096), 1..3);
        // Range spilling past the end is clamped, not an error.
        assert_eq!(clamp_blocks(36864, 100_000, 40960, 4096), 9..10);
        assert_eq!(clamp_blocks(50_000, 10, 40960, 4096), 0..0);
    }

    #[test]
    fn options_default_to_spec_constants() {
        let opts = MigrateToOptions::default();
        assert_eq!(opts.concurrency, 5000);
        assert_eq!(opts.dirty_threshold, 200);
        assert_eq!(opts.settle_drains, 10);
        assert_eq!(opts.drain_interval, Duration::from_millis(500));
    }
}
