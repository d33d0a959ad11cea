#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod counters;
mod pages;
mod reporter;

pub use counters::{EngineCounters, StatsSnapshot, describe_metrics, export_snapshot};
pub use pages::{PageStats, PageStatsSummary};
pub use reporter::StatsReporter;
