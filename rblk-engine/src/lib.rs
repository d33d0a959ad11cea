#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Remote I/O engine.
//!
//! An [`Engine`] splits each multi-segment [`IoRequest`] into sub-operations,
//! issues them through a [`Transport`](rblk_io::Transport) under an in-flight
//! cap, and hands every request back to a [`CompletionSink`] exactly once.

mod admission;
mod completion;
mod config;
mod dispatch;
mod engine;
mod request;
mod setup;
mod sink;
mod tracker;

pub use admission::InFlightGate;
pub use config::{
    EngineConfig, FabricSettings, RetrySettings, RingSettings, ShutdownSettings, StatsSettings,
    TrackerSettings, TransportSettings,
};
pub use engine::{Engine, ShutdownReport};
pub use request::{CompletedRequest, IoRequest, Opcode, Rejected, RequestStatus, Segment};
pub use setup::{PeerHandle, TransportHandle, build_transport};
pub use sink::{ChannelSink, CompletionSink};
pub use tracker::{CompletionOutcome, DispatchItem, SubOpStatus, Tracker, TrackerLimits};
