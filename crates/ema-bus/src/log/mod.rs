//! Sharded log backends.
//!
//! The bus client never talks to a concrete log. It goes through
//! [`ShardedLog`], which models an append-only stream split into
//! independently ordered shards, read through opaque iterator tokens.

pub mod api;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use http::HttpLog;
pub use memory::MemoryLog;

// ============================================================================
// Topology and records
// ============================================================================

/// One shard as listed by [`ShardedLog::describe_stream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: String,
    /// Set when this shard was created by splitting another one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_shard_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub stream: String,
    pub shards: Vec<ShardInfo>,
    /// The listing was truncated; more shards exist than were returned.
    #[serde(default)]
    pub has_more_shards: bool,
}

/// Where a new iterator starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IteratorPosition {
    /// Only records appended after the iterator was opened.
    #[default]
    Latest,
    /// The oldest record still held by the shard.
    TrimHorizon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub sequence_number: String,
    pub partition_key: String,
    /// UTF-8 payload as written by the producer.
    pub data: String,
    pub approximate_arrival: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// `None` once the shard is closed and fully read.
    pub next_iterator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAck {
    pub shard_id: String,
    pub sequence_number: String,
}

// ============================================================================
// Backend trait
// ============================================================================

#[async_trait]
pub trait ShardedLog: Send + Sync {
    /// List the stream's shards.
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError>;

    /// Open an iterator on one shard.
    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<String, LogError>;

    /// Read up to `limit` records. The iterator is spent on success; continue
    /// with the returned `next_iterator`.
    async fn get_records(&self, iterator: &str, limit: usize) -> Result<RecordBatch, LogError>;

    /// Append one record to the shard owning `partition_key`.
    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: String,
    ) -> Result<PutAck, LogError>;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("read throughput exceeded")]
    ThroughputExceeded,

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("shard iterator expired or unknown")]
    ExpiredIterator,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {0}: {1}")]
    Server(u16, String),
}

impl LogError {
    /// Throttling is the only condition worth retrying on the same iterator.
    pub fn is_throttle(&self) -> bool {
        matches!(self, LogError::ThroughputExceeded)
    }

    /// Stable code used on the HTTP wire.
    pub fn code(&self) -> &'static str {
        match self {
            LogError::ThroughputExceeded => "throughput_exceeded",
            LogError::StreamNotFound(_) => "stream_not_found",
            LogError::ShardNotFound(_) => "shard_not_found",
            LogError::ExpiredIterator => "expired_iterator",
            LogError::InvalidArgument(_) => "invalid_argument",
            LogError::Transport(_) => "transport",
            LogError::Server(..) => "server",
        }
    }

    /// Rebuild an error from its wire code.
    pub fn from_code(code: &str, status: u16, message: String) -> Self {
        match code {
            "throughput_exceeded" => LogError::ThroughputExceeded,
            "stream_not_found" => LogError::StreamNotFound(message),
            "shard_not_found" => LogError::ShardNotFound(message),
            "expired_iterator" => LogError::ExpiredIterator,
            "invalid_argument" => LogError::InvalidArgument(message),
            _ => LogError::Server(status, message),
        }
    }

    /// The bare subject of the error (stream, shard or message), as sent on
    /// the wire.
    pub fn detail(&self) -> String {
        match self {
            LogError::StreamNotFound(s)
            | LogError::ShardNotFound(s)
            | LogError::InvalidArgument(s)
            | LogError::Transport(s)
            | LogError::Server(_, s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_throttle_is_retryable() {
        assert!(LogError::ThroughputExceeded.is_throttle());
        assert!(!LogError::ExpiredIterator.is_throttle());
        assert!(!LogError::Transport("reset".into()).is_throttle());
    }

    #[test]
    fn test_error_code_round_trip() {
        let errors = [
            LogError::ThroughputExceeded,
            LogError::StreamNotFound("ema".into()),
            LogError::ShardNotFound("shardId-000000000001".into()),
            LogError::ExpiredIterator,
            LogError::InvalidArgument("limit".into()),
        ];
        for err in errors {
            let rebuilt = LogError::from_code(err.code(), 400, err.detail());
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_unknown_code_becomes_server_error() {
        let err = LogError::from_code("boom", 503, "unavailable".into());
        assert_eq!(err, LogError::Server(503, "unavailable".into()));
    }
}
