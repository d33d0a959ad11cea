//! Shared fault areas.
//!
//! A [`FaultArea`] carries one direction of traffic between the engine and
//! its peer: a circular queue of [`rblk_core::TaskDescriptor`] slots and a
//! companion byte ring for page payloads. Exactly one [`AreaProducer`] and
//! one [`AreaConsumer`] operate on an area; indices are published with
//! release stores and observed with acquire loads, no locks are taken.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod area;
mod endpoint;
mod layout;

pub use area::FaultArea;
pub use endpoint::{AreaConsumer, AreaProducer};
pub use layout::RingLayout;
