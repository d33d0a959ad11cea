//! Connection establishment and memory registration.
//!
//! A [`Connector`] drives the connection-manager handshake over any
//! [`Fabric`], exchanging [`RemoteMemoryDescriptor`]s in the handshake
//! private data and negotiating the queue depth from both endpoints'
//! advertised capabilities. The resulting [`Connection`] owns a
//! [`QueuePair`] for one-sided reads and writes against the peer's region.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cm;
mod connection;
mod descriptor;
mod loopback;
mod region;
mod verbs;

pub use cm::{CmChannel, CmEvent, ConnectParams, DeviceCaps, Fabric, negotiate_queue_depth};
pub use connection::{ConnectOptions, Connection, ConnectionState, Connector};
pub use descriptor::RemoteMemoryDescriptor;
pub use loopback::{LoopbackFabric, ServerOptions};
pub use region::MemoryRegion;
pub use verbs::{QueuePair, WcOpcode, WcStatus, WorkCompletion};
