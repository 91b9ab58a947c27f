use thiserror::Error;

use crate::{FilterId, PathId, PortId, WorkerId};

/// Fatal queue-protocol violations. A worker that observes one aborts its
/// loop and quiesces the filter's group; everything else in this module is
/// recoverable.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueFault {
    #[error("commit without a checked-out rear slot")]
    CommitWithoutCheckout,
    #[error("frame release without a readable frame")]
    ReleaseWithoutFrame,
}

/// Failures while wiring two filters together. The graph is unchanged when
/// one of these comes back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("filter {0} is at its reader capacity of {1}")]
    ReadersExhausted(FilterId, usize),
    #[error("filter {0} is at its writer capacity of {1}")]
    WritersExhausted(FilterId, usize),
    #[error("reader {1} on filter {0} is already connected")]
    ReaderOccupied(FilterId, PortId),
    #[error("writer {1} on filter {0} is already connected")]
    WriterOccupied(FilterId, PortId),
    #[error("writer {1} on filter {0} is not connected")]
    WriterNotConnected(FilterId, PortId),
    #[error("reader {1} on filter {0} is not connected")]
    ReaderNotConnected(FilterId, PortId),
    #[error("filter {0} cannot allocate output queues")]
    NoOutput(FilterId),
    #[error("filter {0} cannot be connected to itself")]
    SelfLoop(FilterId),
    #[error("writer {1} and reader {3} do not share a queue (filters {0} and {2})")]
    LinkMismatch(FilterId, PortId, FilterId, PortId),
}

/// Graph-level id and lifecycle errors surfaced by the pipeline manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("filter id {0} is already registered")]
    DuplicateFilter(FilterId),
    #[error("unknown filter id {0}")]
    UnknownFilter(FilterId),
    #[error("filter {0} already carries an id")]
    FilterIdTaken(FilterId),
    #[error("path id {0} is already registered")]
    DuplicatePath(PathId),
    #[error("unknown path id {0}")]
    UnknownPath(PathId),
    #[error("path {0} is already connected")]
    PathConnected(PathId),
    #[error("path {0} is not connected")]
    PathNotConnected(PathId),
    #[error("unknown worker id {0}")]
    UnknownWorker(WorkerId),
    #[error("filter {0} still has connected ports")]
    FilterInUse(FilterId),
    #[error("filter {0} is assigned to running worker {1}")]
    FilterAssigned(FilterId, WorkerId),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Control-plane dispatch failures.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("unknown filter type {0:?}")]
    UnknownFilterType(String),
    #[error("bad parameters for {command}: {reason}")]
    BadParams { command: &'static str, reason: String },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
