use std::error::Error as StdError;
use std::fmt;

use poem::error::ResponseError;
use poem::http::StatusCode;
use poem::web::Json;
use poem::{IntoResponse, Response};

/// Everything a request handler can fail with.
///
/// Clients only ever see the stable messages below; the underlying
/// error detail stays server-side in the logs.
#[derive(Debug)]
pub enum ApiError {
    /// The multipart form carried no `file` field.
    MissingFile,
    /// The `file` field carried no filename.
    EmptyFilename,
    /// The upload could not be decoded as an image.
    Decode(anyhow::Error),
    /// The model failed to run, or the annotated copy could not be rendered.
    Inference(anyhow::Error),
    /// Writing the annotated image or the log row failed.
    Persistence(anyhow::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::MissingFile => "No file found in the request",
            Self::EmptyFilename => "No selected file",
            Self::Decode(_) => "The uploaded file could not be decoded as an image",
            Self::Inference(_) => "Object detection failed",
            Self::Persistence(_) => "Failed to record the prediction",
        };

        f.write_str(message)
    }
}

impl StdError for ApiError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::MissingFile | Self::EmptyFilename => None,
            Self::Decode(e) | Self::Inference(e) | Self::Persistence(e) => Some(e.as_ref()),
        }
    }
}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingFile | Self::EmptyFilename => StatusCode::BAD_REQUEST,
            Self::Decode(_) | Self::Inference(_) | Self::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn as_response(&self) -> Response {
        if self.status().is_server_error() {
            tracing::error!("request failed: {self}: {source:?}", source = self.source());
        }

        let mut response =
            Json(serde_json::json!({ "error": self.to_string() })).into_response();
        response.set_status(self.status());

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_bad_requests_with_the_pinned_messages() {
        assert_eq!(ApiError::MissingFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::MissingFile.to_string(),
            "No file found in the request"
        );

        assert_eq!(ApiError::EmptyFilename.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::EmptyFilename.to_string(), "No selected file");
    }

    #[test]
    fn runtime_errors_are_server_errors_and_hide_the_detail() {
        let error = ApiError::Persistence(anyhow::anyhow!("password authentication failed"));

        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!error.to_string().contains("password"));
    }
}
