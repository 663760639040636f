use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Inference(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("artifact error: {0}")]
    Artifact(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Inference(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Image(_)
            | ServiceError::Artifact(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_bad_request() {
        let err = ServiceError::BadRequest("No file uploaded".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "No file uploaded");
    }

    #[test]
    fn oversized_uploads_map_to_payload_too_large() {
        let err = ServiceError::PayloadTooLarge("upload exceeds the size limit".into());
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn processing_errors_map_to_internal_error() {
        let err = ServiceError::Inference("Prediction error: shape".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let io = ServiceError::from(std::io::Error::other("disk full"));
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(io.to_string().contains("disk full"));
    }
}
