use crate::CompletedRequest;
use tracing::warn;

/// Receives every request exactly once when it finalizes.
///
/// Called from engine worker threads; implementations must not block for
/// long.
pub trait CompletionSink: Send + Sync {
    fn finalize(&self, completed: CompletedRequest);
}

impl<F> CompletionSink for F
where
    F: Fn(CompletedRequest) + Send + Sync,
{
    fn finalize(&self, completed: CompletedRequest) {
        self(completed);
    }
}

/// Forwards finalized requests over an unbounded channel so the worker
/// threads never wait on the consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: flume::Sender<CompletedRequest>,
}

impl ChannelSink {
    #[must_use]
    pub fn unbounded() -> (Self, flume::Receiver<CompletedRequest>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl CompletionSink for ChannelSink {
    fn finalize(&self, completed: CompletedRequest) {
        let request_id = completed.request_id;
        if self.tx.send(completed).is_err() {
            warn!(target: "rblk::engine", request_id, "Completion receiver dropped; result discarded");
        }
    }
}
