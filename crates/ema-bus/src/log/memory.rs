use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    IteratorPosition, LogError, PutAck, Record, RecordBatch, ShardInfo, ShardedLog,
    StreamDescription,
};

/// Read rate a shard accepts when limiting is enabled.
pub const DEFAULT_READS_PER_SECOND: usize = 5;

const READ_WINDOW: Duration = Duration::from_secs(1);

/// In-process sharded log.
///
/// Records are routed to shards by hashing the partition key into each
/// shard's hash-key range, the way a hosted stream does. Iterator tokens are
/// single-use; every successful read retires its token and hands out the next.
///
/// Used by the `ema-logd` service and directly by tests.
pub struct MemoryLog {
    state: Mutex<LogState>,
    reads_per_second: Option<usize>,
}

#[derive(Default)]
struct LogState {
    streams: HashMap<String, StreamState>,
    iterators: HashMap<Uuid, IteratorState>,
}

struct StreamState {
    shards: Vec<ShardState>,
    next_shard_number: u64,
    next_sequence: u64,
}

struct ShardState {
    shard_id: String,
    parent_shard_id: Option<String>,
    /// Inclusive hash-key range owned by this shard.
    start_hash: u128,
    end_hash: u128,
    records: Vec<Record>,
    closed: bool,
    recent_reads: VecDeque<Instant>,
}

struct IteratorState {
    stream: String,
    shard_index: usize,
    position: usize,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            reads_per_second: None,
        }
    }

    /// A log holding one stream with `shard_count` open shards.
    pub fn with_stream(stream: &str, shard_count: usize) -> Self {
        let mut state = LogState::default();
        state.create_stream(stream, shard_count);
        Self {
            state: Mutex::new(state),
            reads_per_second: None,
        }
    }

    /// Reject reads beyond `reads_per_second` per shard with
    /// [`LogError::ThroughputExceeded`].
    pub fn with_read_limit(mut self, reads_per_second: usize) -> Self {
        self.reads_per_second = Some(reads_per_second);
        self
    }

    /// Create a stream. Returns `false` if it already exists.
    pub async fn create_stream(&self, stream: &str, shard_count: usize) -> bool {
        self.state.lock().await.create_stream(stream, shard_count)
    }

    /// Close an open shard and replace it by two children splitting its
    /// hash-key range. Returns the children's ids.
    pub async fn split_shard(
        &self,
        stream: &str,
        shard_id: &str,
    ) -> Result<(String, String), LogError> {
        let mut state = self.state.lock().await;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;

        let index = stream_state
            .shards
            .iter()
            .position(|s| s.shard_id == shard_id && !s.closed)
            .ok_or_else(|| LogError::ShardNotFound(shard_id.to_string()))?;

        let (start, end) = {
            let parent = &mut stream_state.shards[index];
            if parent.start_hash == parent.end_hash {
                return Err(LogError::InvalidArgument(format!(
                    "shard {shard_id} cannot be split further"
                )));
            }
            parent.closed = true;
            (parent.start_hash, parent.end_hash)
        };
        let middle = start + (end - start) / 2;

        let left = stream_state.add_shard(start, middle, Some(shard_id.to_string()));
        let right = stream_state.add_shard(middle + 1, end, Some(shard_id.to_string()));

        tracing::info!(
            stream = %stream,
            parent = %shard_id,
            left = %left,
            right = %right,
            "split shard"
        );
        Ok((left, right))
    }

    /// Total records held by a stream, across all shards.
    pub async fn record_count(&self, stream: &str) -> usize {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| s.shards.iter().map(|shard| shard.records.len()).sum())
            .unwrap_or(0)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogState {
    fn create_stream(&mut self, stream: &str, shard_count: usize) -> bool {
        if self.streams.contains_key(stream) {
            return false;
        }

        let count = shard_count.max(1) as u128;
        let step = u128::MAX / count;
        let mut state = StreamState {
            shards: Vec::new(),
            next_shard_number: 0,
            next_sequence: 0,
        };
        for i in 0..count {
            let start = i * step;
            let end = if i + 1 == count {
                u128::MAX
            } else {
                (i + 1) * step - 1
            };
            state.add_shard(start, end, None);
        }

        self.streams.insert(stream.to_string(), state);
        true
    }

    fn issue_iterator(&mut self, stream: &str, shard_index: usize, position: usize) -> String {
        let token = Uuid::new_v4();
        self.iterators.insert(
            token,
            IteratorState {
                stream: stream.to_string(),
                shard_index,
                position,
            },
        );
        token.to_string()
    }
}

impl StreamState {
    fn add_shard(&mut self, start_hash: u128, end_hash: u128, parent: Option<String>) -> String {
        let shard_id = format!("shardId-{:012}", self.next_shard_number);
        self.next_shard_number += 1;
        self.shards.push(ShardState {
            shard_id: shard_id.clone(),
            parent_shard_id: parent,
            start_hash,
            end_hash,
            records: Vec::new(),
            closed: false,
            recent_reads: VecDeque::new(),
        });
        shard_id
    }
}

impl ShardState {
    /// Record a read, or refuse it if the shard is over its read budget.
    fn admit_read(&mut self, now: Instant, limit: Option<usize>) -> bool {
        let Some(limit) = limit else {
            return true;
        };
        while let Some(oldest) = self.recent_reads.front() {
            if now.duration_since(*oldest) >= READ_WINDOW {
                self.recent_reads.pop_front();
            } else {
                break;
            }
        }
        if self.recent_reads.len() >= limit {
            return false;
        }
        self.recent_reads.push_back(now);
        true
    }
}

/// Map a partition key onto the 128-bit hash-key space.
fn hash_key(partition_key: &str) -> u128 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

#[async_trait]
impl ShardedLog for MemoryLog {
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError> {
        let state = self.state.lock().await;
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;

        Ok(StreamDescription {
            stream: stream.to_string(),
            shards: stream_state
                .shards
                .iter()
                .map(|s| ShardInfo {
                    shard_id: s.shard_id.clone(),
                    parent_shard_id: s.parent_shard_id.clone(),
                })
                .collect(),
            has_more_shards: false,
        })
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<String, LogError> {
        let mut state = self.state.lock().await;
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;

        let (index, shard) = stream_state
            .shards
            .iter()
            .enumerate()
            .find(|(_, s)| s.shard_id == shard_id)
            .ok_or_else(|| LogError::ShardNotFound(shard_id.to_string()))?;

        let start = match position {
            IteratorPosition::Latest => shard.records.len(),
            IteratorPosition::TrimHorizon => 0,
        };
        Ok(state.issue_iterator(stream, index, start))
    }

    async fn get_records(&self, iterator: &str, limit: usize) -> Result<RecordBatch, LogError> {
        if limit == 0 {
            return Err(LogError::InvalidArgument("limit must be positive".into()));
        }
        let token = Uuid::parse_str(iterator).map_err(|_| LogError::ExpiredIterator)?;

        let mut state = self.state.lock().await;
        let (stream, shard_index, position) = match state.iterators.get(&token) {
            Some(it) => (it.stream.clone(), it.shard_index, it.position),
            None => return Err(LogError::ExpiredIterator),
        };

        let shard = state
            .streams
            .get_mut(&stream)
            .and_then(|s| s.shards.get_mut(shard_index))
            .ok_or(LogError::ExpiredIterator)?;

        // A throttled read keeps its token so the caller can retry it.
        if !shard.admit_read(Instant::now(), self.reads_per_second) {
            return Err(LogError::ThroughputExceeded);
        }

        let end = position.saturating_add(limit).min(shard.records.len());
        let records = shard.records[position..end].to_vec();
        let exhausted = shard.closed && end == shard.records.len();

        state.iterators.remove(&token);
        let next_iterator = if exhausted {
            None
        } else {
            Some(state.issue_iterator(&stream, shard_index, end))
        };

        Ok(RecordBatch {
            records,
            next_iterator,
        })
    }

    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: String,
    ) -> Result<PutAck, LogError> {
        if partition_key.is_empty() {
            return Err(LogError::InvalidArgument("partition key is empty".into()));
        }
        let hash = hash_key(partition_key);

        let mut state = self.state.lock().await;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;

        let sequence_number = format!("{:020}", stream_state.next_sequence);
        stream_state.next_sequence += 1;

        let shard = stream_state
            .shards
            .iter_mut()
            .find(|s| !s.closed && s.start_hash <= hash && hash <= s.end_hash)
            .ok_or_else(|| LogError::Server(500, "no open shard owns the hash key".into()))?;

        shard.records.push(Record {
            sequence_number: sequence_number.clone(),
            partition_key: partition_key.to_string(),
            data,
            approximate_arrival: Utc::now(),
        });

        Ok(PutAck {
            shard_id: shard.shard_id.clone(),
            sequence_number,
        })
    }
}
