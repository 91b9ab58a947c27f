use std::collections::BTreeMap;

use cascade_timing::Duration;

use crate::{
    FilterId, PortId,
    error::QueueFault,
    event::Event,
    frame::{Frame, StreamSpec},
    io::{Reader, Writer},
    runnable::EnabledPeers,
};

/// Origin frames gathered in one demand pass, keyed by reader port.
pub type SourceFrames<'a> = BTreeMap<PortId, &'a Frame>;

/// Destination slots gathered in one supply pass, keyed by writer port.
pub type DestFrames<'a> = BTreeMap<PortId, &'a mut Frame>;

/// Event hook shared by every kernel shape. Handlers may mutate kernel
/// state but must not touch the frame machinery; the shape logic runs them
/// strictly between processing cycles.
pub trait FilterEvents: Send {
    /// Returns false for unrecognized names; the filter logs and drops
    /// those.
    fn on_event(&mut self, event: &Event) -> bool {
        let _ = event;
        false
    }
}

/// Source shape: zero inputs, writes outputs at its own pace. The returned
/// hint is the wake delay until the next cycle.
pub trait HeadKernel: FilterEvents {
    /// Descriptor of the stream leaving `writer`; sizes the queue allocated
    /// at connect time.
    fn descriptor(&self, writer: PortId) -> StreamSpec;

    /// Called when the owning path goes live.
    fn initiate(&mut self) {}

    /// Called when the owning path is torn down.
    fn halt(&mut self) {}

    fn produce(&mut self, outs: &mut Outputs<'_>) -> Result<Duration, QueueFault>;
}

/// Sink shape: zero outputs, drains its readers.
pub trait TailKernel: FilterEvents {
    fn consume(&mut self, ins: &mut Inputs<'_>) -> Result<Duration, QueueFault>;
}

/// Exactly one input and one output.
pub trait OneToOneKernel: FilterEvents {
    fn descriptor(&self, writer: PortId) -> StreamSpec;

    /// Returns true to commit `dst`; the source frame is consumed either
    /// way.
    fn transform(&mut self, src: &Frame, dst: &mut Frame) -> bool;
}

/// One input fanned out to every output with free capacity.
pub trait OneToManyKernel: FilterEvents {
    fn descriptor(&self, writer: PortId) -> StreamSpec;

    fn transform(&mut self, src: &Frame, dsts: &mut DestFrames<'_>) -> bool;
}

/// All (or, under `force`, any) inputs folded into one output.
pub trait ManyToOneKernel: FilterEvents {
    fn descriptor(&self, writer: PortId) -> StreamSpec;

    fn combine(&mut self, srcs: &SourceFrames<'_>, dst: &mut Frame) -> bool;
}

/// The general shape: gathered inputs, gathered outputs.
pub trait ManyToManyKernel: FilterEvents {
    fn descriptor(&self, writer: PortId) -> StreamSpec;

    fn process(&mut self, srcs: &SourceFrames<'_>, dsts: &mut DestFrames<'_>) -> bool;
}

/// Tagged kernel variant; the shape-generic demand/supply logic dispatches
/// on this.
pub enum Kernel {
    Head(Box<dyn HeadKernel>),
    Tail(Box<dyn TailKernel>),
    OneToOne(Box<dyn OneToOneKernel>),
    OneToMany(Box<dyn OneToManyKernel>),
    ManyToOne(Box<dyn ManyToOneKernel>),
    ManyToMany(Box<dyn ManyToManyKernel>),
}

impl Kernel {
    pub(crate) fn on_event(&mut self, event: &Event) -> bool {
        match self {
            Kernel::Head(k) => k.on_event(event),
            Kernel::Tail(k) => k.on_event(event),
            Kernel::OneToOne(k) => k.on_event(event),
            Kernel::OneToMany(k) => k.on_event(event),
            Kernel::ManyToOne(k) => k.on_event(event),
            Kernel::ManyToMany(k) => k.on_event(event),
        }
    }

    /// `None` for shapes that cannot allocate output queues.
    pub(crate) fn descriptor(&self, writer: PortId) -> Option<StreamSpec> {
        match self {
            Kernel::Head(k) => Some(k.descriptor(writer)),
            Kernel::Tail(_) => None,
            Kernel::OneToOne(k) => Some(k.descriptor(writer)),
            Kernel::OneToMany(k) => Some(k.descriptor(writer)),
            Kernel::ManyToOne(k) => Some(k.descriptor(writer)),
            Kernel::ManyToMany(k) => Some(k.descriptor(writer)),
        }
    }
}

/// Writer-side view handed to head kernels: obtain a slot, fill it, commit.
/// Commits are tallied as enabled peers for the scheduler.
pub struct Outputs<'a> {
    writers: &'a mut BTreeMap<PortId, Writer>,
    enabled: &'a mut EnabledPeers,
}

impl<'a> Outputs<'a> {
    pub(crate) fn new(writers: &'a mut BTreeMap<PortId, Writer>, enabled: &'a mut EnabledPeers) -> Self {
        Self { writers, enabled }
    }

    /// Connected writer ports, in id order.
    pub fn ports(&self) -> Vec<PortId> {
        self.writers.iter().filter(|(_, w)| w.is_connected()).map(|(&p, _)| p).collect()
    }

    pub fn has_room(&self, port: PortId) -> bool {
        self.writers.get(&port).is_some_and(Writer::has_room)
    }

    /// The next writable slot on `port`; `None` when full, disconnected or
    /// unknown.
    pub fn frame(&mut self, port: PortId) -> Option<&mut Frame> {
        self.writers.get_mut(&port)?.frame()
    }

    pub fn commit(&mut self, port: PortId) -> Result<(), QueueFault> {
        let Some(writer) = self.writers.get_mut(&port) else {
            return Err(QueueFault::CommitWithoutCheckout);
        };
        writer.commit()?;
        if let Some(peer) = writer.peer() {
            if !self.enabled.contains(&peer) {
                self.enabled.push(peer);
            }
        }
        Ok(())
    }

    pub fn abort(&mut self, port: PortId) {
        if let Some(writer) = self.writers.get_mut(&port) {
            writer.abort();
        }
    }
}

/// Reader-side view handed to tail kernels: peek, consume, release.
pub struct Inputs<'a> {
    readers: &'a mut BTreeMap<PortId, Reader>,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(readers: &'a mut BTreeMap<PortId, Reader>) -> Self {
        Self { readers }
    }

    /// Connected reader ports, in id order.
    pub fn ports(&self) -> Vec<PortId> {
        self.readers.iter().filter(|(_, r)| r.is_connected()).map(|(&p, _)| p).collect()
    }

    pub fn has_frame(&self, port: PortId) -> bool {
        self.readers.get(&port).is_some_and(Reader::has_frame)
    }

    /// Oldest readable frame on `port`; stays owned by the reader until
    /// `remove`.
    pub fn frame(&self, port: PortId) -> Option<&Frame> {
        self.readers.get(&port)?.frame()
    }

    pub fn remove(&mut self, port: PortId) -> Result<(), QueueFault> {
        match self.readers.get_mut(&port) {
            Some(reader) => reader.remove(),
            None => Err(QueueFault::ReleaseWithoutFrame),
        }
    }

    /// Upstream filter on `port`, if still connected.
    pub fn peer(&self, port: PortId) -> Option<FilterId> {
        self.readers.get(&port).and_then(Reader::peer)
    }
}
