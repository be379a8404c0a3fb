//! Client for the external image classification service.
//!
//! The [`Classifier`] trait is the seam between the proxy handler and the backend. In
//! production it is implemented by [`ReqwestClassifier`], which posts the staged image
//! as `multipart/form-data` to `<classifier.url>/<classifier.classify_path>`.
//!
//! A classifier only reports what came back on the wire ([`BackendReply`]).
//! Interpreting that reply is done by [`normalize`], so the branching between "not JSON",
//! "failure status" and "success" lives in one place and can be tested without HTTP.

use crate::config::ClassifierConfig;
use crate::errors::{BACKEND_ERROR_FALLBACK, Error};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use serde_json::Value;
use tracing::{debug, error, instrument};
use url::Url;

/// An image ready to be sent to the classification service
#[derive(Debug, Clone)]
pub struct ClassifierUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Raw reply from the classification service, body not yet interpreted
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub status: StatusCode,
    pub body: String,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Send one image to the classification service and read the full reply.
    ///
    /// Only transport failures are errors here; any HTTP status is a reply.
    async fn classify(&self, upload: ClassifierUpload) -> Result<BackendReply, Error>;
}

/// The concrete implementation of `Classifier`, over HTTP.
pub struct ReqwestClassifier {
    client: Client,
    endpoint: Url,
}

impl ReqwestClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, Error> {
        crate::install_crypto_provider();

        let endpoint = config.classify_endpoint().map_err(|e| Error::Internal {
            operation: format!("construct classifier URL: {e}"),
        })?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Internal {
                operation: format!("create HTTP client: {e}"),
            })?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Transport failures keep reqwest's description but drop the backend URL.
fn transport_error(e: reqwest::Error) -> Error {
    let message = if e.is_timeout() {
        "Classification service timed out".to_string()
    } else {
        e.without_url().to_string()
    };
    Error::BackendTransport { message }
}

#[async_trait]
impl Classifier for ReqwestClassifier {
    #[instrument(skip_all, fields(file_name = %upload.file_name, size_bytes = upload.bytes.len()))]
    async fn classify(&self, upload: ClassifierUpload) -> Result<BackendReply, Error> {
        let part = Part::bytes(upload.bytes.to_vec())
            .file_name(upload.file_name)
            .mime_str(&upload.mime_type)
            .map_err(|e| Error::Internal {
                operation: format!("attach image to classifier request: {e}"),
            })?;
        let form = Form::new().part("file", part);

        debug!("Forwarding image to {}", self.endpoint);
        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        debug!(status = %status, body_len = body.len(), "Classification service replied");

        Ok(BackendReply { status, body })
    }
}

/// Parse a response body as JSON.
pub fn try_parse_json(body: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(body)
}

/// Map a backend reply onto the proxy's response contract.
///
/// - body not JSON: [`Error::InvalidBackendResponse`], raw body only logged
/// - failure status: [`Error::BackendRejected`] carrying the backend's `error` text
/// - success without a `predictions` array: [`Error::InvalidBackendResponse`]
/// - otherwise the parsed body, unchanged
pub fn normalize(reply: BackendReply) -> Result<Value, Error> {
    let parsed = match try_parse_json(&reply.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(status = %reply.status, error = %e, "Failed to parse classification service response as JSON");
            error!("Response body was: {}", reply.body);
            return Err(Error::InvalidBackendResponse);
        }
    };

    if !reply.status.is_success() {
        let message = parsed
            .get("error")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(BACKEND_ERROR_FALLBACK)
            .to_string();
        return Err(Error::BackendRejected {
            status: reply.status.as_u16(),
            message,
        });
    }

    match parsed.get("predictions") {
        Some(Value::Array(_)) => Ok(parsed),
        _ => {
            error!("Classification service response has no predictions array: {}", parsed);
            Err(Error::InvalidBackendResponse)
        }
    }
}
