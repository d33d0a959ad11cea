#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod fabric;
mod local;
mod peer;
mod ring;
mod store;
mod transport;

pub use fabric::FabricTransport;
pub use local::LocalTransport;
pub use peer::RingPeer;
pub use ring::RingTransport;
pub use store::{FabricStore, MemoryStore, PageStore};
pub use transport::{Completion, OpStatus, OpTag, Transport, TransportKind};
