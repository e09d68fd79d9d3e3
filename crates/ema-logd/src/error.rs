use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ema_bus::log::LogError;
use ema_bus::log::api::ErrorBody;

/// A [`LogError`] on its way back to an HTTP client.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub LogError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            LogError::ThroughputExceeded => StatusCode::TOO_MANY_REQUESTS,
            LogError::StreamNotFound(_) | LogError::ShardNotFound(_) => StatusCode::NOT_FOUND,
            LogError::ExpiredIterator => StatusCode::GONE,
            LogError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LogError::Transport(_) => StatusCode::BAD_GATEWAY,
            LogError::Server(status, _) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "log request failed");
        }
        let body = ErrorBody {
            code: self.0.code().to_string(),
            error: self.0.detail(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (LogError::ThroughputExceeded, 429),
            (LogError::StreamNotFound("s".into()), 404),
            (LogError::ShardNotFound("x".into()), 404),
            (LogError::ExpiredIterator, 410),
            (LogError::InvalidArgument("limit".into()), 400),
            (LogError::Server(500, "boom".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status().as_u16(), status);
        }
    }
}
