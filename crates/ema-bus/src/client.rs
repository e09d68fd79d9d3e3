use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ema_protocol::Event;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::BusError;
use crate::log::{IteratorPosition, PutAck, Record, ShardInfo, ShardedLog};
use crate::policy::{Backoff, ReadPolicy, ShardFailurePolicy};

/// Position of one reader within one shard.
///
/// The iterator token is replaced by every successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCursor {
    pub shard_id: String,
    iterator: String,
}

/// An event read from the log.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub event: Event,
    /// Approximate time the record arrived in the log.
    pub arrived: DateTime<Utc>,
    pub shard_id: String,
}

/// Result of one successful [`EventBusClient::poll`].
#[derive(Debug)]
pub struct Polled {
    pub events: Vec<Delivered>,
    /// Records that could not be decoded as events.
    pub dropped: usize,
    /// `None` once the shard is closed and fully read.
    pub next: Option<ShardCursor>,
}

/// What shard readers hand to the consumer.
#[derive(Debug)]
pub enum Delivery {
    Event(Delivered),
    Failure(BusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAck {
    Appended(PutAck),
    /// The client is offline; the event was only logged.
    Offline,
}

#[derive(Clone)]
enum Backend {
    Online(Arc<dyn ShardedLog>),
    Offline,
}

/// Reads and writes events on one stream of a sharded log.
///
/// Delivery is at-least-once per reader, ordered within a shard only.
#[derive(Clone)]
pub struct EventBusClient {
    backend: Backend,
    stream: String,
    policy: ReadPolicy,
}

impl EventBusClient {
    pub fn online(log: Arc<dyn ShardedLog>, stream: impl Into<String>, policy: ReadPolicy) -> Self {
        Self {
            backend: Backend::Online(log),
            stream: stream.into(),
            policy,
        }
    }

    /// A client that never touches a log: publishing only logs the event and
    /// consuming yields nothing.
    pub fn offline(stream: impl Into<String>, policy: ReadPolicy) -> Self {
        Self {
            backend: Backend::Offline,
            stream: stream.into(),
            policy,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn policy(&self) -> &ReadPolicy {
        &self.policy
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.backend, Backend::Offline)
    }

    // ------------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------------

    /// List the shards worth reading: every shard that is not the parent of
    /// another listed shard.
    pub async fn discover_shards(&self) -> Result<BTreeSet<String>, BusError> {
        let Backend::Online(log) = &self.backend else {
            return Ok(BTreeSet::new());
        };

        let description = log
            .describe_stream(&self.stream)
            .await
            .map_err(|source| BusError::Discovery {
                stream: self.stream.clone(),
                source,
            })?;

        if description.has_more_shards {
            warn!(
                stream = %self.stream,
                listed = description.shards.len(),
                "stream has more shards than were listed; reading only the listed ones"
            );
        }

        Ok(leaf_shards(&description.shards))
    }

    /// Open a reader on a shard. Only records appended from now on are seen.
    pub async fn open_iterator(&self, shard_id: &str) -> Result<ShardCursor, BusError> {
        let Backend::Online(log) = &self.backend else {
            return Err(BusError::OpenIterator {
                shard_id: shard_id.to_string(),
                source: crate::log::LogError::InvalidArgument("client is offline".into()),
            });
        };

        let iterator = log
            .shard_iterator(&self.stream, shard_id, IteratorPosition::Latest)
            .await
            .map_err(|source| BusError::OpenIterator {
                shard_id: shard_id.to_string(),
                source,
            })?;

        debug!(shard_id = %shard_id, "opened shard iterator");
        Ok(ShardCursor {
            shard_id: shard_id.to_string(),
            iterator,
        })
    }

    /// Read one batch from the cursor's position.
    ///
    /// A throttled read is retried with the same cursor after the cooldown,
    /// as often as needed. Any other failure is returned.
    pub async fn poll(&self, cursor: ShardCursor) -> Result<Polled, BusError> {
        let Backend::Online(log) = &self.backend else {
            return Ok(Polled {
                events: Vec::new(),
                dropped: 0,
                next: None,
            });
        };

        let batch = loop {
            match log
                .get_records(&cursor.iterator, self.policy.batch_limit)
                .await
            {
                Ok(batch) => break batch,
                Err(err) if err.is_throttle() => {
                    info!(shard_id = %cursor.shard_id, "read rate exceeded; slowing down");
                    tokio::time::sleep(self.policy.throttle_cooldown).await;
                }
                Err(source) => {
                    return Err(BusError::Read {
                        shard_id: cursor.shard_id,
                        source,
                    });
                }
            }
        };

        let mut events = Vec::with_capacity(batch.records.len());
        let mut dropped = 0;
        for record in &batch.records {
            match decode_record(record) {
                Some(event) => events.push(Delivered {
                    event,
                    arrived: record.approximate_arrival,
                    shard_id: cursor.shard_id.clone(),
                }),
                None => dropped += 1,
            }
        }

        let next = batch.next_iterator.map(|iterator| ShardCursor {
            shard_id: cursor.shard_id,
            iterator,
        });

        Ok(Polled {
            events,
            dropped,
            next,
        })
    }

    /// Start one reader task per discovered shard, forwarding into `sink`.
    ///
    /// Returns the number of readers started. Readers hold a clone of `sink`,
    /// so the receiving side closes once every reader has ended.
    pub async fn consume(&self, sink: mpsc::Sender<Delivery>) -> Result<usize, BusError> {
        if self.is_offline() {
            info!("event bus offline; nothing to consume");
            return Ok(0);
        }

        let shards = self.discover_shards().await?;
        info!(stream = %self.stream, shards = ?shards, "starting shard readers");

        for shard_id in &shards {
            let reader = ShardReader {
                client: self.clone(),
                shard_id: shard_id.clone(),
                sink: sink.clone(),
            };
            tokio::spawn(reader.run().in_current_span());
        }

        Ok(shards.len())
    }

    // ------------------------------------------------------------------------
    // Production
    // ------------------------------------------------------------------------

    /// Append an event to the log, keyed by its session id when it has one,
    /// else by its name. Failures are returned, never retried.
    pub async fn publish(&self, event: &Event) -> Result<PublishAck, BusError> {
        let data = event.to_wire()?;

        let Backend::Online(log) = &self.backend else {
            info!(event = %data, "event bus offline; not posting");
            return Ok(PublishAck::Offline);
        };

        let ack = log
            .put_record(&self.stream, event.partition_key(), data)
            .await
            .map_err(BusError::Publish)?;

        debug!(
            event = %event.describe(),
            shard_id = %ack.shard_id,
            sequence_number = %ack.sequence_number,
            "posted event"
        );
        Ok(PublishAck::Appended(ack))
    }
}

/// Shards that are nobody's parent, whatever order they are listed in.
fn leaf_shards(shards: &[ShardInfo]) -> BTreeSet<String> {
    let parents: HashSet<&str> = shards
        .iter()
        .filter_map(|s| s.parent_shard_id.as_deref())
        .collect();

    shards
        .iter()
        .filter(|s| !parents.contains(s.shard_id.as_str()))
        .map(|s| s.shard_id.clone())
        .collect()
}

fn decode_record(record: &Record) -> Option<Event> {
    match Event::from_wire(record.data.as_bytes()) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(
                sequence_number = %record.sequence_number,
                error = %err,
                "skipping undecodable record"
            );
            None
        }
    }
}

// ============================================================================
// Shard reader
// ============================================================================

struct ShardReader {
    client: EventBusClient,
    shard_id: String,
    sink: mpsc::Sender<Delivery>,
}

impl ShardReader {
    async fn run(self) {
        let mut backoff = match self.client.policy.on_failure {
            ShardFailurePolicy::Reconnect {
                initial_backoff,
                max_backoff,
            } => Some(Backoff::new(initial_backoff, max_backoff)),
            ShardFailurePolicy::Stop => None,
        };
        let mut cursor: Option<ShardCursor> = None;

        loop {
            let current = match cursor.take() {
                Some(current) => current,
                None => match self.client.open_iterator(&self.shard_id).await {
                    Ok(opened) => opened,
                    Err(err) => {
                        if self.fail(err, backoff.as_mut()).await {
                            continue;
                        }
                        return;
                    }
                },
            };

            match self.client.poll(current).await {
                Ok(polled) => {
                    if let Some(backoff) = backoff.as_mut() {
                        backoff.reset();
                    }
                    for delivered in polled.events {
                        // Waits while the consumer is behind.
                        if self.sink.send(Delivery::Event(delivered)).await.is_err() {
                            debug!(shard_id = %self.shard_id, "consumer gone; stopping reader");
                            return;
                        }
                    }
                    match polled.next {
                        Some(next) => cursor = Some(next),
                        None => {
                            info!(shard_id = %self.shard_id, "shard closed; reader finished");
                            return;
                        }
                    }
                    tokio::time::sleep(self.client.policy.next_read_delay()).await;
                }
                Err(err) => {
                    if !self.fail(err, backoff.as_mut()).await {
                        return;
                    }
                }
            }
        }
    }

    /// Report a failure. Returns whether the reader should carry on.
    async fn fail(&self, err: BusError, backoff: Option<&mut Backoff>) -> bool {
        error!(shard_id = %self.shard_id, error = %err, "shard read failed");
        if self.sink.send(Delivery::Failure(err)).await.is_err() {
            return false;
        }

        match backoff {
            Some(backoff) => {
                let delay = backoff.next_delay();
                info!(
                    shard_id = %self.shard_id,
                    delay_ms = delay.as_millis() as u64,
                    "reopening shard after backoff"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                warn!(shard_id = %self.shard_id, "shard reader stopped; no further reads");
                false
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogError, MemoryLog, RecordBatch, StreamDescription};
    use async_trait::async_trait;
    use ema_protocol::{EventKey, EventName};
    use std::sync::Mutex;
    use std::time::Duration;

    const STREAM: &str = "ema-event-stream";

    fn shard(id: &str, parent: Option<&str>) -> ShardInfo {
        ShardInfo {
            shard_id: id.to_string(),
            parent_shard_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn test_leaf_shards_ignore_listing_order() {
        let forward = vec![shard("a", None), shard("b", Some("a")), shard("c", Some("a"))];
        let reversed: Vec<_> = forward.iter().cloned().rev().collect();

        let expected: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(leaf_shards(&forward), expected);
        assert_eq!(leaf_shards(&reversed), expected);
    }

    #[test]
    fn test_leaf_shards_with_unlisted_parent() {
        let shards = vec![shard("b", Some("gone")), shard("d", None)];
        assert_eq!(leaf_shards(&shards).len(), 2);
    }

    /// Log whose reads follow a script of results.
    struct ScriptedLog {
        reads: Mutex<Vec<Result<RecordBatch, LogError>>>,
        read_calls: Mutex<Vec<String>>,
        description: StreamDescription,
    }

    impl ScriptedLog {
        fn new(mut reads: Vec<Result<RecordBatch, LogError>>) -> Self {
            reads.reverse();
            Self {
                reads: Mutex::new(reads),
                read_calls: Mutex::new(Vec::new()),
                description: StreamDescription {
                    stream: STREAM.into(),
                    shards: vec![shard("shardId-000000000000", None)],
                    has_more_shards: true,
                },
            }
        }
    }

    #[async_trait]
    impl ShardedLog for ScriptedLog {
        async fn describe_stream(&self, _: &str) -> Result<StreamDescription, LogError> {
            Ok(self.description.clone())
        }

        async fn shard_iterator(
            &self,
            _: &str,
            _: &str,
            _: IteratorPosition,
        ) -> Result<String, LogError> {
            Ok("it-0".into())
        }

        async fn get_records(&self, iterator: &str, _: usize) -> Result<RecordBatch, LogError> {
            self.read_calls.lock().unwrap().push(iterator.to_string());
            self.reads
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(LogError::Transport("script exhausted".into())))
        }

        async fn put_record(&self, _: &str, _: &str, _: String) -> Result<PutAck, LogError> {
            Err(LogError::Server(503, "unavailable".into()))
        }
    }

    fn record(data: &str) -> Record {
        Record {
            sequence_number: "1".into(),
            partition_key: "k".into(),
            data: data.into(),
            approximate_arrival: Utc::now(),
        }
    }

    fn batch(records: Vec<Record>, next: &str) -> Result<RecordBatch, LogError> {
        Ok(RecordBatch {
            records,
            next_iterator: Some(next.into()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_retries_throttle_with_same_cursor() {
        let log = Arc::new(ScriptedLog::new(vec![
            Err(LogError::ThroughputExceeded),
            Err(LogError::ThroughputExceeded),
            batch(vec![], "it-1"),
        ]));
        let client = EventBusClient::online(log.clone(), STREAM, ReadPolicy::default());

        let cursor = client.open_iterator("shardId-000000000000").await.unwrap();
        let started = tokio::time::Instant::now();
        let polled = client.poll(cursor).await.unwrap();

        assert_eq!(
            *log.read_calls.lock().unwrap(),
            vec!["it-0", "it-0", "it-0"]
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(4000), "{waited:?}");
        assert!(waited < Duration::from_millis(4100), "{waited:?}");
        assert_eq!(polled.next.unwrap().iterator, "it-1");
    }

    #[tokio::test]
    async fn test_poll_drops_undecodable_records() {
        let good = r#"{"eventName":"offer","eventSource":"StoreOffersAgent","userSessionId":"s1"}"#;
        let log = Arc::new(ScriptedLog::new(vec![batch(
            vec![
                record("not json"),
                record(r#"{"eventName":"offer"}"#),
                record(good),
            ],
            "it-1",
        )]));
        let client = EventBusClient::online(log, STREAM, ReadPolicy::default());

        let cursor = client.open_iterator("shardId-000000000000").await.unwrap();
        let polled = client.poll(cursor).await.unwrap();

        assert_eq!(polled.dropped, 2);
        assert_eq!(polled.events.len(), 1);
        assert_eq!(polled.events[0].event.session_id(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_stops_after_hard_failure() {
        let log = Arc::new(ScriptedLog::new(vec![
            batch(vec![], "it-1"),
            Err(LogError::ExpiredIterator),
            batch(vec![], "it-2"),
        ]));
        let client = EventBusClient::online(log.clone(), STREAM, ReadPolicy::default());

        let (tx, mut rx) = mpsc::channel(16);
        assert_eq!(client.consume(tx).await.unwrap(), 1);

        let failure = rx.recv().await.unwrap();
        assert!(matches!(
            failure,
            Delivery::Failure(BusError::Read {
                source: LogError::ExpiredIterator,
                ..
            })
        ));
        // The reader is gone, so the channel closes.
        assert!(rx.recv().await.is_none());
        assert_eq!(log.read_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_reconnects_when_configured() {
        let log = Arc::new(ScriptedLog::new(vec![
            Err(LogError::Transport("reset".into())),
            batch(
                vec![record(
                    r#"{"eventName":"userTag","eventSource":"TaggerAgent","tag":"vip"}"#,
                )],
                "it-1",
            ),
        ]));
        let policy = ReadPolicy {
            on_failure: ShardFailurePolicy::Reconnect {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(8),
            },
            ..ReadPolicy::default()
        };
        let client = EventBusClient::online(log, STREAM, policy);

        let (tx, mut rx) = mpsc::channel(16);
        client.consume(tx).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Delivery::Failure(_))));
        match rx.recv().await {
            Some(Delivery::Event(delivered)) => {
                assert_eq!(delivered.event.str_field(EventKey::USER_TAG), Some("vip"));
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let log = Arc::new(ScriptedLog::new(vec![]));
        let client = EventBusClient::online(log, STREAM, ReadPolicy::default());
        let event = Event::new(EventName::USER_NEAR_STORE);
        assert!(matches!(
            client.publish(&event).await,
            Err(BusError::Publish(LogError::Server(503, _)))
        ));
    }

    #[tokio::test]
    async fn test_offline_publish_succeeds_without_log() {
        let client = EventBusClient::offline(STREAM, ReadPolicy::default());
        let event = Event::builder(EventName::OFFER).source("test").build();
        assert_eq!(client.publish(&event).await.unwrap(), PublishAck::Offline);

        let (tx, mut rx) = mpsc::channel(1);
        assert_eq!(client.consume(tx).await.unwrap(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_partitions_by_session() {
        let log = Arc::new(MemoryLog::with_stream(STREAM, 4));
        let client = EventBusClient::online(log.clone(), STREAM, ReadPolicy::default());

        let first = Event::builder(EventName::OFFER)
            .source("a")
            .field(EventKey::USER_SESSION_ID, "s1")
            .build();
        let second = Event::builder(EventName::USER_VISITS_STORE)
            .source("b")
            .field(EventKey::USER_SESSION_ID, "s1")
            .build();

        let PublishAck::Appended(a) = client.publish(&first).await.unwrap() else {
            panic!("expected an append");
        };
        let PublishAck::Appended(b) = client.publish(&second).await.unwrap() else {
            panic!("expected an append");
        };
        assert_eq!(a.shard_id, b.shard_id);
        assert_eq!(log.record_count(STREAM).await, 2);
    }

    #[tokio::test]
    async fn test_discovery_skips_split_parents() {
        let log = Arc::new(MemoryLog::with_stream(STREAM, 2));
        log.split_shard(STREAM, "shardId-000000000000").await.unwrap();
        let client = EventBusClient::online(log, STREAM, ReadPolicy::default());

        let shards = client.discover_shards().await.unwrap();
        assert!(!shards.contains("shardId-000000000000"));
        assert_eq!(shards.len(), 3);
    }
}
