//! HTTP handler for the classify endpoint.
//!
//! Each request walks the same path: read the multipart body, validate the `file`
//! field, stage it, forward the staged copy to the classification service, release the
//! staged copy, then answer with either the backend's predictions or `{"error": ...}`.

use crate::AppState;
use crate::api::models::classify::{ClassificationResponse, ErrorResponse, is_image_mime};
use crate::classifier::{ClassifierUpload, normalize};
use crate::errors::{Error, Result};
use crate::staging::StagedFile;
use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use bytes::Bytes;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Name of the multipart field carrying the image
pub const FILE_FIELD: &str = "file";

/// Image accepted from the inbound multipart body
#[derive(Debug)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[utoipa::path(
    post,
    path = "/classify",
    tag = "classify",
    summary = "Classify image",
    description = "Upload one image in the `file` field of a multipart form. The image is forwarded to the \
classification service and its ranked predictions are returned unchanged.",
    request_body(
        content_type = "multipart/form-data",
        description = "Single `file` field with an `image/*` content type"
    ),
    responses(
        (status = 200, description = "Predictions from the classification service", body = ClassificationResponse),
        (status = 400, description = "No file uploaded, or the file is not an image", body = ErrorResponse),
        (status = 500, description = "The upload could not be processed or the classification service failed", body = ErrorResponse)
    )
)]
#[instrument(skip_all)]
pub async fn classify(State(state): State<AppState>, multipart: std::result::Result<Multipart, MultipartRejection>) -> Result<Json<Value>> {
    let result = classify_upload(&state, multipart).await;

    if let Some(metrics) = &state.metrics {
        metrics.record_outcome(match &result {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        });
    }

    result.map(Json)
}

async fn classify_upload(state: &AppState, multipart: std::result::Result<Multipart, MultipartRejection>) -> Result<Value> {
    let multipart = multipart.map_err(|e| Error::MalformedUpload { message: e.body_text() })?;
    let upload = extract_upload(multipart).await?;

    info!(
        file_name = %upload.name,
        mime_type = %upload.mime_type,
        size_bytes = upload.bytes.len(),
        "Received image for classification"
    );

    let staged = StagedFile::acquire(state.staging.clone(), &upload.name, upload.bytes)
        .await
        .map_err(|e| Error::Internal {
            operation: format!("stage upload: {e}"),
        })?;

    // forward never panics on a backend failure, so release always runs here;
    // if this future is dropped instead, StagedFile's Drop takes over
    let outcome = forward(state, &staged, upload.name, upload.mime_type).await;
    staged.release().await;

    outcome
}

/// Pull the first `file` field with a filename out of the multipart body.
///
/// Other fields are skipped. The content type is checked before the body of the field
/// is read, so non-images are rejected without buffering them.
pub async fn extract_upload(mut multipart: Multipart) -> Result<UploadedFile> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::MalformedUpload { message: e.body_text() })?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        // A plain text value under `file` is not a file upload
        let Some(name) = field.file_name().map(str::to_string) else {
            debug!("Skipping `file` field without a filename");
            continue;
        };

        let mime_type = field.content_type().unwrap_or_default().to_string();
        if !is_image_mime(&mime_type) {
            debug!(file_name = %name, mime_type = %mime_type, "Rejecting non-image upload");
            return Err(Error::not_an_image());
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::MalformedUpload { message: e.body_text() })?;

        return Ok(UploadedFile { name, mime_type, bytes });
    }

    Err(Error::no_file())
}

async fn forward(state: &AppState, staged: &StagedFile, file_name: String, mime_type: String) -> Result<Value> {
    let bytes = staged.contents().await.map_err(|e| Error::Internal {
        operation: format!("read staged upload {}: {e}", staged.key()),
    })?;

    let started = Instant::now();
    let reply = state
        .classifier
        .classify(ClassifierUpload {
            file_name,
            mime_type,
            bytes,
        })
        .await;

    if let Some(metrics) = &state.metrics {
        let status = match &reply {
            Ok(reply) => reply.status.as_u16().to_string(),
            Err(_) => "error".to_string(),
        };
        metrics.record_backend_call(&status, started.elapsed());
    }

    normalize(reply?)
}
