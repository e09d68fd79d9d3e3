use ema_protocol::WireError;

use crate::log::LogError;

/// Failures surfaced by [`EventBusClient`](crate::EventBusClient).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("shard discovery failed for stream {stream}: {source}")]
    Discovery { stream: String, source: LogError },

    #[error("could not open iterator on shard {shard_id}: {source}")]
    OpenIterator { shard_id: String, source: LogError },

    #[error("read failed on shard {shard_id}: {source}")]
    Read { shard_id: String, source: LogError },

    #[error("publish failed: {0}")]
    Publish(#[source] LogError),

    #[error("event could not be encoded: {0}")]
    Encode(#[from] WireError),
}

impl BusError {
    /// The shard this error belongs to, if any.
    pub fn shard_id(&self) -> Option<&str> {
        match self {
            BusError::OpenIterator { shard_id, .. } | BusError::Read { shard_id, .. } => {
                Some(shard_id)
            }
            _ => None,
        }
    }
}
