use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ConversionError {
    /// Missing or malformed URL, unsupported format or quality, unreadable body.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("No se pudo preparar el archivo de cookies: {0}")]
    CredentialStaging(#[source] std::io::Error),

    /// Diagnostic text from the extractor, passed through untouched.
    #[error("{0}")]
    Extraction(String),

    #[error("La conversion termino sin generar el archivo de audio.")]
    ArtifactMissing,

    #[error("{0}")]
    Internal(String),
}

impl ConversionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Extraction(_) => StatusCode::BAD_GATEWAY,
            Self::CredentialStaging(_) | Self::ArtifactMissing | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::CredentialStaging(_) => "CREDENTIAL_STAGING",
            Self::Extraction(_) => "EXTRACTION_FAILED",
            Self::ArtifactMissing => "ARTIFACT_MISSING",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    code: &'static str,
}

impl IntoResponse for ConversionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            Self::CredentialStaging(source) => {
                error!("Fallo al escribir cookies temporales: {source}");
                "No se pudo preparar el archivo de cookies. Reintenta sin cookies.".to_string()
            }
            Self::ArtifactMissing | Self::Internal(_) => {
                error!("Error interno de conversion: {self}");
                self.to_string()
            }
            Self::InvalidRequest(_) | Self::Extraction(_) => self.to_string(),
        };

        let body = Json(ErrorBody {
            detail,
            code: self.code(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body_json(error: ConversionError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn extraction_detail_is_verbatim() {
        let (status, body) =
            body_json(ConversionError::Extraction("ERROR: Unsupported URL: x".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["detail"], "ERROR: Unsupported URL: x");
        assert_eq!(body["code"], "EXTRACTION_FAILED");
    }

    #[tokio::test]
    async fn invalid_request_is_client_error() {
        let (status, body) = body_json(ConversionError::invalid("falta url")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "falta url");
    }

    #[tokio::test]
    async fn staging_error_hides_io_detail() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/secret/path");
        let (status, body) = body_json(ConversionError::CredentialStaging(source)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body["detail"].as_str().unwrap().contains("/secret/path"));
        assert_eq!(body["code"], "CREDENTIAL_STAGING");
    }
}
