mod kernel;

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use cascade_timing::{Duration, Instant};
use cascade_utils::short_typename;
pub use kernel::{
    DestFrames, FilterEvents, HeadKernel, Inputs, Kernel, ManyToManyKernel, ManyToOneKernel,
    OneToManyKernel, OneToOneKernel, Outputs, SourceFrames, TailKernel,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tinyvec::TinyVec;
use tracing::{debug, warn};

use crate::{
    FilterId, PortId,
    config::RuntimeConfig,
    error::{ConnectError, QueueFault},
    event::{Event, EventQueue},
    io::{Reader, Writer},
    queue::FrameQueue,
    runnable::{EnabledPeers, GroupCell, RunState, Runnable},
};

/// Default port capacity on the many-sided shapes.
pub const MAX_READERS: usize = 16;
/// Default port capacity on the many-sided shapes.
pub const MAX_WRITERS: usize = 16;

/// Reserved writer id for head filters driven passively by their source
/// adapter; never handed out by id generation.
pub const NULL_WRITER_ID: PortId = 0;

const FIRST_PORT_ID: PortId = 1;

/// Shape tag of a filter; fixes its port capacities and which demand/supply
/// protocol drives its kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterKind {
    Head,
    Tail,
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

struct Ports {
    kernel: Kernel,
    readers: BTreeMap<PortId, Reader>,
    writers: BTreeMap<PortId, Writer>,
}

/// A processing node of the graph: a shape-tagged kernel behind the generic
/// demand/supply machinery, its port maps, a pending-event queue and the
/// scheduling state workers drive it by.
///
/// Connection operations lock the upstream filter first, then the
/// downstream one; callers wiring in both directions concurrently must
/// serialize (the pipeline manager does).
pub struct Filter {
    label: String,
    kind: FilterKind,
    force: AtomicBool,
    max_readers: usize,
    max_writers: usize,
    backoff: AtomicU64,
    ports: Mutex<Ports>,
    events: EventQueue,
    sched: RunState,
}

impl Filter {
    fn with_kernel(label: String, kind: FilterKind, kernel: Kernel) -> Self {
        let (max_readers, max_writers) = match kind {
            FilterKind::Head => (0, MAX_WRITERS),
            FilterKind::Tail => (MAX_READERS, 0),
            FilterKind::OneToOne => (1, 1),
            FilterKind::OneToMany => (1, MAX_WRITERS),
            FilterKind::ManyToOne => (MAX_READERS, 1),
            FilterKind::ManyToMany => (MAX_READERS, MAX_WRITERS),
        };
        Self {
            label,
            kind,
            force: AtomicBool::new(false),
            max_readers,
            max_writers,
            backoff: AtomicU64::new(RuntimeConfig::default().backoff.as_micros()),
            ports: Mutex::new(Ports {
                kernel,
                readers: BTreeMap::new(),
                writers: BTreeMap::new(),
            }),
            events: EventQueue::new(),
            sched: RunState::new(),
        }
    }

    pub fn head<K: HeadKernel + 'static>(kernel: K) -> Self {
        Self::with_kernel(short_typename::<K>(), FilterKind::Head, Kernel::Head(Box::new(kernel)))
    }

    pub fn tail<K: TailKernel + 'static>(kernel: K) -> Self {
        Self::with_kernel(short_typename::<K>(), FilterKind::Tail, Kernel::Tail(Box::new(kernel)))
    }

    pub fn one_to_one<K: OneToOneKernel + 'static>(kernel: K) -> Self {
        Self::with_kernel(
            short_typename::<K>(),
            FilterKind::OneToOne,
            Kernel::OneToOne(Box::new(kernel)),
        )
    }

    pub fn one_to_many<K: OneToManyKernel + 'static>(kernel: K) -> Self {
        Self::with_kernel(
            short_typename::<K>(),
            FilterKind::OneToMany,
            Kernel::OneToMany(Box::new(kernel)),
        )
    }

    pub fn many_to_one<K: ManyToOneKernel + 'static>(kernel: K) -> Self {
        Self::with_kernel(
            short_typename::<K>(),
            FilterKind::ManyToOne,
            Kernel::ManyToOne(Box::new(kernel)),
        )
    }

    pub fn many_to_many<K: ManyToManyKernel + 'static>(kernel: K) -> Self {
        Self::with_kernel(
            short_typename::<K>(),
            FilterKind::ManyToMany,
            Kernel::ManyToMany(Box::new(kernel)),
        )
    }

    /// ManyToOne/ManyToMany only: proceed when any input has a frame
    /// instead of requiring all of them.
    pub fn with_force(self, force: bool) -> Self {
        self.force.store(force, Ordering::Relaxed);
        self
    }

    pub fn with_max_readers(mut self, max: usize) -> Self {
        self.max_readers = max;
        self
    }

    pub fn with_max_writers(mut self, max: usize) -> Self {
        self.max_writers = max;
        self
    }

    #[inline]
    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    #[inline]
    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    #[inline]
    pub fn max_writers(&self) -> usize {
        self.max_writers
    }

    #[inline]
    pub fn force(&self) -> bool {
        self.force.load(Ordering::Relaxed)
    }

    pub fn set_force(&self, force: bool) {
        self.force.store(force, Ordering::Relaxed);
    }

    pub(crate) fn set_backoff(&self, backoff: Duration) {
        self.backoff.store(backoff.as_micros(), Ordering::Relaxed);
    }

    fn backoff(&self) -> Duration {
        Duration(self.backoff.load(Ordering::Relaxed))
    }

    /// Inserts into the pending-event queue; the filter drains due events
    /// before its next processing cycle.
    pub fn push_event(&self, event: Event) {
        self.events.push(event);
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn connected_readers(&self) -> usize {
        self.ports.lock().readers.len()
    }

    pub fn connected_writers(&self) -> usize {
        self.ports.lock().writers.len()
    }

    pub fn reader_ids(&self) -> Vec<PortId> {
        self.ports.lock().readers.keys().copied().collect()
    }

    pub fn writer_ids(&self) -> Vec<PortId> {
        self.ports.lock().writers.keys().copied().collect()
    }

    /// Smallest unoccupied reader id, or `None` at capacity.
    pub fn generate_reader_id(&self) -> Option<PortId> {
        let ports = self.ports.lock();
        if ports.readers.len() >= self.max_readers {
            return None;
        }
        Some(next_free_id(&ports.readers))
    }

    /// Smallest unoccupied writer id, or `None` at capacity. Never yields
    /// [`NULL_WRITER_ID`].
    pub fn generate_writer_id(&self) -> Option<PortId> {
        let ports = self.ports.lock();
        if ports.writers.len() >= self.max_writers {
            return None;
        }
        Some(next_free_id(&ports.writers))
    }

    // Connection operations. `self` is always the upstream side; ids are
    // auto-generated unless the variant pins one.

    pub fn connect_one_to_one(
        &self,
        dst: &Filter,
        cfg: &RuntimeConfig,
    ) -> Result<(PortId, PortId), ConnectError> {
        self.connect(dst, None, None, cfg)
    }

    /// Pins the writer id on `self` (the many side feeds one downstream).
    pub fn connect_many_to_one(
        &self,
        dst: &Filter,
        writer_id: PortId,
        cfg: &RuntimeConfig,
    ) -> Result<(PortId, PortId), ConnectError> {
        self.connect(dst, Some(writer_id), None, cfg)
    }

    /// Pins the reader id on `dst` (one upstream feeds the many side).
    pub fn connect_one_to_many(
        &self,
        dst: &Filter,
        reader_id: PortId,
        cfg: &RuntimeConfig,
    ) -> Result<(PortId, PortId), ConnectError> {
        self.connect(dst, None, Some(reader_id), cfg)
    }

    pub fn connect_many_to_many(
        &self,
        dst: &Filter,
        reader_id: PortId,
        writer_id: PortId,
        cfg: &RuntimeConfig,
    ) -> Result<(PortId, PortId), ConnectError> {
        self.connect(dst, Some(writer_id), Some(reader_id), cfg)
    }

    /// Atomically allocates a queue via this filter's `alloc_queue`, binds a
    /// `Writer` here and a `Reader` on `dst`, and registers both ports. On
    /// any failure neither filter is changed.
    fn connect(
        &self,
        dst: &Filter,
        want_writer: Option<PortId>,
        want_reader: Option<PortId>,
        cfg: &RuntimeConfig,
    ) -> Result<(PortId, PortId), ConnectError> {
        if std::ptr::eq(self, dst) {
            return Err(ConnectError::SelfLoop(self.id()));
        }

        let mut up = self.ports.lock();
        if up.writers.len() >= self.max_writers {
            return Err(ConnectError::WritersExhausted(self.id(), self.max_writers));
        }
        let writer_id = match want_writer {
            Some(id) => {
                if up.writers.contains_key(&id) {
                    return Err(ConnectError::WriterOccupied(self.id(), id));
                }
                id
            }
            None => next_free_id(&up.writers),
        };

        let queue = alloc_queue(&up.kernel, self.id(), writer_id, cfg)?;

        let mut down = dst.ports.lock();
        if down.readers.len() >= dst.max_readers {
            return Err(ConnectError::ReadersExhausted(dst.id(), dst.max_readers));
        }
        let reader_id = match want_reader {
            Some(id) => {
                if down.readers.contains_key(&id) {
                    return Err(ConnectError::ReaderOccupied(dst.id(), id));
                }
                id
            }
            None => next_free_id(&down.readers),
        };

        up.writers.insert(writer_id, Writer::bind(Arc::clone(&queue), dst.id()));
        down.readers.insert(reader_id, Reader::bind(queue, self.id()));
        debug!(
            up = self.id(),
            writer = writer_id,
            down = dst.id(),
            reader = reader_id,
            "filters connected"
        );
        Ok((writer_id, reader_id))
    }

    /// Releases both endpoints of one link. The queue is torn down once
    /// both sides have dropped it.
    pub fn disconnect(
        &self,
        writer_id: PortId,
        dst: &Filter,
        reader_id: PortId,
    ) -> Result<(), ConnectError> {
        let mut up = self.ports.lock();
        let mut down = dst.ports.lock();

        let writer = up
            .writers
            .get(&writer_id)
            .ok_or(ConnectError::WriterNotConnected(self.id(), writer_id))?;
        let reader = down
            .readers
            .get(&reader_id)
            .ok_or(ConnectError::ReaderNotConnected(dst.id(), reader_id))?;
        match (writer.queue(), reader.queue()) {
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => {}
            _ => {
                return Err(ConnectError::LinkMismatch(self.id(), writer_id, dst.id(), reader_id));
            }
        }

        let mut writer = up.writers.remove(&writer_id).expect("present above");
        let mut reader = down.readers.remove(&reader_id).expect("present above");
        writer.disconnect();
        reader.disconnect();
        debug!(
            up = self.id(),
            writer = writer_id,
            down = dst.id(),
            reader = reader_id,
            "filters disconnected"
        );
        Ok(())
    }

    /// Tells a head kernel its path went live; a no-op for other shapes.
    pub(crate) fn activate_source(&self) {
        let mut ports = self.ports.lock();
        if let Kernel::Head(k) = &mut ports.kernel {
            k.initiate();
        }
    }

    /// Tells a head kernel its path was torn down; a no-op for other shapes.
    pub(crate) fn deactivate_source(&self) {
        let mut ports = self.ports.lock();
        if let Kernel::Head(k) = &mut ports.kernel {
            k.halt();
        }
    }

    /// Drains due events, then runs one shape-specific processing cycle.
    fn process(&self) -> Result<(Duration, EnabledPeers), QueueFault> {
        let mut ports = self.ports.lock();

        let now = Instant::now();
        while let Some(event) = self.events.pop_due(now) {
            if !ports.kernel.on_event(&event) {
                warn!(filter = self.id(), event = %event.name(), "unknown event name, dropping");
            }
        }

        let mut enabled = EnabledPeers::default();
        let backoff = self.backoff();
        let force = self.force();
        let Ports { kernel, readers, writers } = &mut *ports;
        let hint = match kernel {
            Kernel::Head(k) => {
                let mut outs = Outputs::new(writers, &mut enabled);
                k.produce(&mut outs)?
            }
            Kernel::Tail(k) => {
                let mut ins = Inputs::new(readers);
                k.consume(&mut ins)?
            }
            Kernel::OneToOne(k) => {
                cycle_one_to_one(k.as_mut(), readers, writers, &mut enabled, backoff)?
            }
            Kernel::OneToMany(k) => {
                cycle_one_to_many(k.as_mut(), readers, writers, &mut enabled, backoff)?
            }
            Kernel::ManyToOne(k) => {
                cycle_many_to_one(k.as_mut(), readers, writers, &mut enabled, backoff, force)?
            }
            Kernel::ManyToMany(k) => {
                cycle_many_to_many(k.as_mut(), readers, writers, &mut enabled, backoff, force)?
            }
        };
        Ok((hint, enabled))
    }
}

impl Runnable for Filter {
    fn id(&self) -> FilterId {
        self.sched.id()
    }

    fn set_id(&self, id: FilterId) -> bool {
        self.sched.set_id(id)
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn next_wake(&self) -> Instant {
        self.sched.next_wake()
    }

    fn wake_now(&self) {
        self.sched.set_next_wake(Instant::ZERO);
    }

    fn run_process_frame(&self) -> Result<EnabledPeers, QueueFault> {
        let (hint, enabled) = self.process()?;
        self.sched.set_next_wake(Instant::now() + hint);
        Ok(enabled)
    }

    fn is_running(&self) -> bool {
        self.sched.is_running()
    }

    fn set_running(&self) {
        self.sched.set_running();
    }

    fn unset_running(&self) {
        self.sched.unset_running();
    }

    fn quiesce(&self) {
        self.sched.quiesce();
    }

    fn group_cell(&self) -> &GroupCell {
        self.sched.group_cell()
    }

    fn group_ids(&self) -> Vec<FilterId> {
        self.sched.group_ids()
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("id", &self.id())
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

fn next_free_id<V>(ports: &BTreeMap<PortId, V>) -> PortId {
    let mut candidate = FIRST_PORT_ID;
    for &taken in ports.keys() {
        if taken < candidate {
            continue;
        }
        if taken == candidate {
            candidate += 1;
        } else {
            break;
        }
    }
    candidate
}

/// `allocQueue(writer_id)`: the upstream filter sizes a fresh ring from the
/// descriptor its kernel reports for that port.
fn alloc_queue(
    kernel: &Kernel,
    owner: FilterId,
    writer_id: PortId,
    cfg: &RuntimeConfig,
) -> Result<Arc<FrameQueue>, ConnectError> {
    let spec = kernel.descriptor(writer_id).ok_or(ConnectError::NoOutput(owner))?;
    let policy = cfg.policy(spec.kind);
    Ok(FrameQueue::new(spec, policy.depth, policy.max_payload))
}

fn first_connected_reader(readers: &mut BTreeMap<PortId, Reader>) -> Option<&mut Reader> {
    readers.values_mut().find(|r| r.is_connected())
}

fn first_connected_writer(writers: &mut BTreeMap<PortId, Writer>) -> Option<&mut Writer> {
    writers.values_mut().find(|w| w.is_connected())
}

fn cycle_one_to_one(
    kernel: &mut dyn OneToOneKernel,
    readers: &mut BTreeMap<PortId, Reader>,
    writers: &mut BTreeMap<PortId, Writer>,
    enabled: &mut EnabledPeers,
    backoff: Duration,
) -> Result<Duration, QueueFault> {
    let Some(reader) = first_connected_reader(readers) else {
        return Ok(backoff);
    };
    if !reader.has_frame() {
        return Ok(backoff);
    }
    let Some(writer) = first_connected_writer(writers) else {
        return Ok(backoff);
    };
    if !writer.has_room() {
        // full downstream: skip the cycle entirely, let the hint pace us
        return Ok(backoff);
    }

    let committed = {
        let Some(src) = reader.frame() else {
            return Ok(backoff);
        };
        let Some(dst) = writer.frame() else {
            return Ok(backoff);
        };
        kernel.transform(src, dst)
    };

    if committed {
        writer.commit()?;
        if let Some(peer) = writer.peer() {
            enabled.push(peer);
        }
    } else {
        writer.abort();
    }
    reader.remove()?;
    Ok(Duration::ZERO)
}

fn cycle_one_to_many(
    kernel: &mut dyn OneToManyKernel,
    readers: &mut BTreeMap<PortId, Reader>,
    writers: &mut BTreeMap<PortId, Writer>,
    enabled: &mut EnabledPeers,
    backoff: Duration,
) -> Result<Duration, QueueFault> {
    let Some(reader) = first_connected_reader(readers) else {
        return Ok(backoff);
    };
    if !reader.has_frame() {
        return Ok(backoff);
    }

    let mut supplied: TinyVec<[PortId; 8]> = TinyVec::default();
    let committed = {
        let Some(src) = reader.frame() else {
            return Ok(backoff);
        };
        let mut dsts = DestFrames::new();
        for (&port, writer) in writers.iter_mut() {
            if !writer.is_connected() || !writer.has_room() {
                continue;
            }
            if let Some(frame) = writer.frame() {
                supplied.push(port);
                dsts.insert(port, frame);
            }
        }
        if dsts.is_empty() {
            return Ok(backoff);
        }
        kernel.transform(src, &mut dsts)
    };

    for port in supplied {
        let writer = writers.get_mut(&port).expect("supplied above");
        if committed {
            writer.commit()?;
            if let Some(peer) = writer.peer() {
                enabled.push(peer);
            }
        } else {
            writer.abort();
        }
    }
    reader.remove()?;
    Ok(Duration::ZERO)
}

fn cycle_many_to_one(
    kernel: &mut dyn ManyToOneKernel,
    readers: &mut BTreeMap<PortId, Reader>,
    writers: &mut BTreeMap<PortId, Writer>,
    enabled: &mut EnabledPeers,
    backoff: Duration,
    force: bool,
) -> Result<Duration, QueueFault> {
    let connected = readers.values().filter(|r| r.is_connected()).count();
    if connected == 0 {
        return Ok(backoff);
    }
    let Some(writer) = first_connected_writer(writers) else {
        return Ok(backoff);
    };
    if !writer.has_room() {
        return Ok(backoff);
    }

    let mut demanded: TinyVec<[PortId; 8]> = TinyVec::default();
    let committed = {
        let mut srcs = SourceFrames::new();
        for (&port, reader) in readers.iter() {
            if !reader.is_connected() {
                continue;
            }
            if let Some(frame) = reader.frame() {
                srcs.insert(port, frame);
            }
        }
        let satisfied = if force { !srcs.is_empty() } else { srcs.len() == connected };
        if !satisfied {
            return Ok(backoff);
        }
        for &port in srcs.keys() {
            demanded.push(port);
        }
        let Some(dst) = writer.frame() else {
            return Ok(backoff);
        };
        kernel.combine(&srcs, dst)
    };

    if committed {
        writer.commit()?;
        if let Some(peer) = writer.peer() {
            enabled.push(peer);
        }
    } else {
        writer.abort();
    }
    for port in demanded {
        readers.get_mut(&port).expect("demanded above").remove()?;
    }
    Ok(Duration::ZERO)
}

fn cycle_many_to_many(
    kernel: &mut dyn ManyToManyKernel,
    readers: &mut BTreeMap<PortId, Reader>,
    writers: &mut BTreeMap<PortId, Writer>,
    enabled: &mut EnabledPeers,
    backoff: Duration,
    force: bool,
) -> Result<Duration, QueueFault> {
    let connected = readers.values().filter(|r| r.is_connected()).count();
    if connected == 0 {
        return Ok(backoff);
    }

    let mut demanded: TinyVec<[PortId; 8]> = TinyVec::default();
    let mut supplied: TinyVec<[PortId; 8]> = TinyVec::default();
    let committed = {
        let mut srcs = SourceFrames::new();
        for (&port, reader) in readers.iter() {
            if !reader.is_connected() {
                continue;
            }
            if let Some(frame) = reader.frame() {
                srcs.insert(port, frame);
            }
        }
        let satisfied = if force { !srcs.is_empty() } else { srcs.len() == connected };
        if !satisfied {
            return Ok(backoff);
        }
        for &port in srcs.keys() {
            demanded.push(port);
        }

        let mut dsts = DestFrames::new();
        for (&port, writer) in writers.iter_mut() {
            if !writer.is_connected() || !writer.has_room() {
                continue;
            }
            if let Some(frame) = writer.frame() {
                supplied.push(port);
                dsts.insert(port, frame);
            }
        }
        if dsts.is_empty() {
            return Ok(backoff);
        }
        kernel.process(&srcs, &mut dsts)
    };

    for port in supplied {
        let writer = writers.get_mut(&port).expect("supplied above");
        if committed {
            writer.commit()?;
            if let Some(peer) = writer.peer() {
                enabled.push(peer);
            }
        } else {
            writer.abort();
        }
    }
    for port in demanded {
        readers.get_mut(&port).expect("demanded above").remove()?;
    }
    Ok(Duration::ZERO)
}
