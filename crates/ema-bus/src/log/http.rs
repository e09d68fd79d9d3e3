use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::api::{
    ErrorBody, IteratorRequest, IteratorResponse, PutRecordRequest, RecordsQuery,
};
use super::{IteratorPosition, LogError, PutAck, RecordBatch, ShardedLog, StreamDescription};

/// Client for a log served by `ema-logd` over HTTP.
#[derive(Clone)]
pub struct HttpLog {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpLog {
    pub fn new(base_url: &str) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, LogError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| LogError::Transport(format!("invalid response body: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => Err(LogError::from_code(&err.code, status.as_u16(), err.error)),
            Err(_) => Err(LogError::Server(status.as_u16(), body)),
        }
    }
}

fn transport(e: reqwest::Error) -> LogError {
    LogError::Transport(e.to_string())
}

#[async_trait]
impl ShardedLog for HttpLog {
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError> {
        let url = format!("{}/streams/{}", self.base_url, stream);
        let resp = self.http_client.get(&url).send().await.map_err(transport)?;
        Self::decode(resp).await
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<String, LogError> {
        let url = format!(
            "{}/streams/{}/shards/{}/iterator",
            self.base_url, stream, shard_id
        );
        let resp = self
            .http_client
            .post(&url)
            .json(&IteratorRequest { position })
            .send()
            .await
            .map_err(transport)?;
        let body: IteratorResponse = Self::decode(resp).await?;
        Ok(body.iterator)
    }

    async fn get_records(&self, iterator: &str, limit: usize) -> Result<RecordBatch, LogError> {
        let url = format!("{}/records", self.base_url);
        let resp = self
            .http_client
            .get(&url)
            .query(&RecordsQuery {
                iterator: iterator.to_string(),
                limit,
            })
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp).await
    }

    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: String,
    ) -> Result<PutAck, LogError> {
        let url = format!("{}/streams/{}/records", self.base_url, stream);
        let resp = self
            .http_client
            .post(&url)
            .json(&PutRecordRequest {
                partition_key: partition_key.to_string(),
                data,
            })
            .send()
            .await
            .map_err(transport)?;

        let ack: PutAck = Self::decode(resp).await?;
        tracing::debug!(
            shard_id = %ack.shard_id,
            sequence_number = %ack.sequence_number,
            "record appended"
        );
        Ok(ack)
    }
}
