use bytes::Bytes;
use rblk_core::RblkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Fetch a page range from remote memory.
    Read,
    /// Evict a page range to remote memory.
    Write,
}

/// One contiguous range of a block request.
///
/// A read segment starts with empty `data` and receives the fetched bytes
/// when its sub-operation completes. A write segment carries its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub opcode: Opcode,
    pub position: u64,
    pub length: usize,
    pub data: Bytes,
}

impl Segment {
    #[must_use]
    pub fn read(position: u64, length: usize) -> Self {
        Self {
            opcode: Opcode::Read,
            position,
            length,
            data: Bytes::new(),
        }
    }

    #[must_use]
    pub fn write(position: u64, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            opcode: Opcode::Write,
            position,
            length: data.len(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub request_id: u64,
    pub segments: Vec<Segment>,
}

impl IoRequest {
    #[must_use]
    pub fn new(request_id: u64, segments: Vec<Segment>) -> Self {
        Self {
            request_id,
            segments,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    /// At least one sub-operation failed, or the request was abandoned.
    IoError,
}

/// A finalized request, handed to the [`CompletionSink`](crate::CompletionSink)
/// exactly once. Segments come back in submission order.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub request_id: u64,
    pub status: RequestStatus,
    pub segments: Vec<Segment>,
}

impl CompletedRequest {
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == RequestStatus::Ok
    }
}

/// A request the engine refused at submit. The caller gets the request
/// back and must complete it with a resource error or retry it when
/// [`RblkError::is_retryable`] says so.
#[derive(Debug)]
pub struct Rejected {
    pub request: IoRequest,
    pub error: RblkError,
}

impl Rejected {
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.error.is_retryable()
    }
}

impl From<Rejected> for RblkError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request {} rejected: {}", self.request.request_id, self.error)
    }
}
