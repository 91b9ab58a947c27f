//! Live media streaming engine built around a dynamic filter graph:
//! filters exchange pooled frames over bounded SPSC queues, workers drive
//! them cooperatively under soft-real-time pacing, and a pipeline manager
//! mediates graph mutation while everything runs.

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod filter;
pub mod filters;
pub mod frame;
pub mod io;
pub mod path;
pub mod pipeline;
pub mod queue;
pub mod runnable;
pub mod worker;

pub use cascade_timing as timing;
pub use cascade_utils as utils;
pub use tracing;

/// Graph-wide filter identifier; `u32::MAX` is reserved as "unassigned".
pub type FilterId = u32;
/// Reader/writer port identifier within one filter; `0` is the null writer.
pub type PortId = u32;
pub type PathId = u32;
pub type WorkerId = u32;
