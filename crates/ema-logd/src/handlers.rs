use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use ema_bus::log::api::{
    IteratorRequest, IteratorResponse, PutRecordRequest, RecordsQuery, SplitResponse,
};
use ema_bus::log::{MemoryLog, PutAck, RecordBatch, ShardedLog, StreamDescription};
use serde_json::{Value, json};

use crate::error::ApiError;

/// Most records one read may ask for.
pub const MAX_READ_LIMIT: usize = 10_000;

pub type SharedLog = Arc<MemoryLog>;

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /streams/{stream}
pub async fn describe_stream(
    State(log): State<SharedLog>,
    Path(stream): Path<String>,
) -> Result<Json<StreamDescription>, ApiError> {
    Ok(Json(log.describe_stream(&stream).await?))
}

/// POST /streams/{stream}/shards/{shard}/iterator
pub async fn shard_iterator(
    State(log): State<SharedLog>,
    Path((stream, shard_id)): Path<(String, String)>,
    Json(req): Json<IteratorRequest>,
) -> Result<Json<IteratorResponse>, ApiError> {
    let iterator = log.shard_iterator(&stream, &shard_id, req.position).await?;
    Ok(Json(IteratorResponse { iterator }))
}

/// GET /records?iterator=..&limit=..
pub async fn get_records(
    State(log): State<SharedLog>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<RecordBatch>, ApiError> {
    let limit = query.limit.min(MAX_READ_LIMIT);
    Ok(Json(log.get_records(&query.iterator, limit).await?))
}

/// POST /streams/{stream}/records
pub async fn put_record(
    State(log): State<SharedLog>,
    Path(stream): Path<String>,
    Json(req): Json<PutRecordRequest>,
) -> Result<Json<PutAck>, ApiError> {
    let ack = log.put_record(&stream, &req.partition_key, req.data).await?;
    tracing::debug!(
        stream = %stream,
        shard_id = %ack.shard_id,
        sequence_number = %ack.sequence_number,
        "record appended"
    );
    Ok(Json(ack))
}

/// POST /streams/{stream}/shards/{shard}/split
pub async fn split_shard(
    State(log): State<SharedLog>,
    Path((stream, shard_id)): Path<(String, String)>,
) -> Result<Json<SplitResponse>, ApiError> {
    let (left, right) = log.split_shard(&stream, &shard_id).await?;
    Ok(Json(SplitResponse {
        children: vec![left, right],
    }))
}
