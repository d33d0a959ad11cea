use thiserror::Error;

#[derive(Error, Debug)]
pub enum RblkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    #[error("In-flight limit of {limit} operations reached")]
    InFlightSaturated { limit: usize },

    #[error("Retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Request has {segments} segments, maximum is {max}")]
    SegmentLimit { segments: usize, max: usize },

    #[error("Access at {position} with length {length} exceeds region size {size}")]
    OutOfBounds { position: u64, length: u64, size: u64 },

    #[error("Request {0} is already pending")]
    DuplicateRequest(u64),

    #[error("Protocol corruption: {0}")]
    ProtocolCorruption(String),

    #[error("Duplicate completion for request {request_id} sub-operation {sub_index}")]
    DuplicateCompletion { request_id: u64, sub_index: u32 },

    #[error("Stale completion for request {request_id} generation {generation}")]
    StaleCompletion { request_id: u64, generation: u64 },

    #[error("Ring role already claimed: {0}")]
    RoleClaimed(&'static str),

    #[error("Shared area layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Route resolution failed: {0}")]
    RouteResolution(String),

    #[error("Connection rejected by peer: {0}")]
    Rejected(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Connection closed")]
    Disconnected,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Memory allocation of {0} bytes failed")]
    AllocFailed(usize),

    #[error("Memory lock (mlock) failed: {0}")]
    MlockFailed(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RblkError {
    /// Resource-busy conditions that clear on their own once the peer drains.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RblkError::QueueFull(_) | RblkError::InFlightSaturated { .. }
        )
    }

    /// Conditions that stop the whole engine rather than a single request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RblkError::ProtocolCorruption(_)
                | RblkError::LayoutMismatch(_)
                | RblkError::Disconnected
        )
    }

    /// Failures of connection establishment; terminal for that attempt.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RblkError::AddressResolution(_)
                | RblkError::RouteResolution(_)
                | RblkError::Rejected(_)
                | RblkError::Unreachable(_)
                | RblkError::Disconnected
        )
    }
}

pub type Result<T> = std::result::Result<T, RblkError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_errors_are_retryable() {
        assert!(RblkError::QueueFull("ring").is_retryable());
        assert!(RblkError::InFlightSaturated { limit: 4 }.is_retryable());
        assert!(!RblkError::Disconnected.is_retryable());
        assert!(!RblkError::SegmentLimit { segments: 9, max: 8 }.is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RblkError::ProtocolCorruption("slot reused".into()).is_fatal());
        assert!(RblkError::Disconnected.is_fatal());
        assert!(!RblkError::DuplicateCompletion { request_id: 1, sub_index: 0 }.is_fatal());
        assert!(!RblkError::RetryExhausted { attempts: 3 }.is_fatal());
    }

    #[test]
    fn test_connection_errors() {
        assert!(RblkError::Rejected("no memory".into()).is_connection_error());
        assert!(RblkError::AddressResolution("mem9".into()).is_connection_error());
        assert!(!RblkError::Timeout("event").is_connection_error());
    }
}
