//! Request/response bodies of the log service HTTP API.
//!
//! Shared by [`HttpLog`](super::HttpLog) and the `ema-logd` server so both
//! sides agree on the wire shape.
//!
//! | method | path                                      | body / query         | response              |
//! |--------|-------------------------------------------|----------------------|-----------------------|
//! | GET    | `/streams/{stream}`                       |                      | `StreamDescription`   |
//! | POST   | `/streams/{stream}/shards/{shard}/iterator` | `IteratorRequest`  | `IteratorResponse`    |
//! | GET    | `/records`                                | `RecordsQuery`       | `RecordBatch`         |
//! | POST   | `/streams/{stream}/records`               | `PutRecordRequest`   | `PutAck`              |
//! | POST   | `/streams/{stream}/shards/{shard}/split`  |                      | `SplitResponse`       |

use serde::{Deserialize, Serialize};

use super::IteratorPosition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorRequest {
    #[serde(default)]
    pub position: IteratorPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorResponse {
    pub iterator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsQuery {
    pub iterator: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRecordRequest {
    pub partition_key: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitResponse {
    pub children: Vec<String>,
}

/// Error body returned with every non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}
