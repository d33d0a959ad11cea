#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod buffer;
mod error;
mod retry;
mod task;

pub use buffer::PageBuffer;
pub use error::{RblkError, Result};
pub use retry::{Backoff, CountingPause, Pause, RetryPolicy, ThreadSleep};
pub use task::{TASK_DESCRIPTOR_SIZE, TaskDescriptor, TaskKind};

pub const PAGE_SIZE: usize = 4096;

/// Leading version tag of every shared fault area.
pub const FAULT_AREA_VERSION: u32 = 1;

pub const DEFAULT_QUEUE_SLOTS: usize = 896;
pub const DEFAULT_BYTE_CAPACITY: usize = 3584 * 1024; // 3.5 MiB
pub const DEFAULT_MAX_SEGMENTS: usize = 256;
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 256 * 1024;
pub const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// Upper bound on concurrent one-sided operations per connection.
pub const MAX_FABRIC_QUEUE_DEPTH: u32 = 128;
pub const DEFAULT_FABRIC_QUEUE_DEPTH: u32 = 16;

/// Remote regions are registered in 2 MiB units.
pub const REGION_ALIGNMENT: u64 = 2 * 1024 * 1024;
