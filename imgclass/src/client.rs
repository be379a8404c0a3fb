//! Client-side driver for the classify endpoint.
//!
//! [`ClassifyDriver`] is the controller a UI sits on top of. It holds four pieces of
//! observable state (selected file, predictions, in-flight flag, error message), accepts a
//! file selection, and submits at most one classification request at a time. Every
//! failure, whatever its cause, ends up as a single human readable `error_message`.
//!
//! ```no_run
//! use imgclass::client::{ClassifyDriver, SelectedImage};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let driver = ClassifyDriver::new("http://localhost:3000/api/classify".parse()?)?;
//! driver.select_file(SelectedImage::from_path("cat.jpg").await?);
//! driver.submit().await;
//!
//! let state = driver.state();
//! if let Some(predictions) = state.predictions {
//!     for p in predictions {
//!         println!("{} {:.2}%", p.description, p.probability * 100.0);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::api::models::classify::{Prediction, is_image_mime};
use bytes::Bytes;
use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use serde_json::Value;
use std::{
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;

pub const INVALID_SELECTION_MESSAGE: &str = "Please select a valid image file";

/// A file picked by the user
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedImage {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl SelectedImage {
    /// Read a file from disk, guessing its media type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let mime_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        Ok(Self {
            name,
            mime_type,
            bytes: Bytes::from(bytes),
        })
    }
}

/// Observable driver state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverState {
    pub selected_file: Option<SelectedImage>,
    pub predictions: Option<Vec<Prediction>>,
    pub in_flight: bool,
    pub error_message: Option<String>,
}

/// Why a submission failed. `Display` is the message shown to the user.
#[derive(Debug, Error, PartialEq)]
pub enum DriverError {
    #[error("Invalid response from server")]
    InvalidJson,

    #[error("{0}")]
    Server(String),

    #[error("Invalid response format from server")]
    InvalidFormat,

    #[error("{0}")]
    Transport(String),
}

/// What a call to [`ClassifyDriver::submit`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing selected, no request made
    NoFileSelected,
    /// Another submission is still running, no request made
    AlreadyInFlight,
    /// The request completed and predictions were stored
    Classified,
    /// The request completed (or failed to) and an error message was stored
    Failed,
}

pub struct ClassifyDriver {
    client: Client,
    endpoint: Url,
    state: Mutex<DriverState>,
}

/// Clears `in_flight` however the submission ends, including when the future is dropped.
struct InFlightGuard<'a> {
    state: &'a Mutex<DriverState>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).in_flight = false;
    }
}

fn lock(state: &Mutex<DriverState>) -> MutexGuard<'_, DriverState> {
    // State is plain data, a panic elsewhere cannot leave it half-updated in a harmful way
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClassifyDriver {
    /// Default time allowed for one classification round trip
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(endpoint: Url) -> Result<Self, DriverError> {
        Self::with_timeout(endpoint, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: Url, timeout: Duration) -> Result<Self, DriverError> {
        crate::install_crypto_provider();

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            state: Mutex::new(DriverState::default()),
        })
    }

    /// Snapshot of the current state
    pub fn state(&self) -> DriverState {
        lock(&self.state).clone()
    }

    /// Select a file for the next submission. Returns whether it was accepted.
    pub fn select_file(&self, file: SelectedImage) -> bool {
        let mut state = lock(&self.state);

        if !is_image_mime(&file.mime_type) {
            debug!(file_name = %file.name, mime_type = %file.mime_type, "Rejected file selection");
            state.error_message = Some(INVALID_SELECTION_MESSAGE.to_string());
            return false;
        }

        state.selected_file = Some(file);
        state.predictions = None;
        state.error_message = None;
        true
    }

    /// Classify the selected file.
    ///
    /// Returns immediately without touching the network when nothing is selected or a
    /// previous submission is still running.
    #[instrument(skip(self))]
    pub async fn submit(&self) -> SubmitOutcome {
        let file = {
            let mut state = lock(&self.state);
            let Some(file) = state.selected_file.clone() else {
                return SubmitOutcome::NoFileSelected;
            };
            if state.in_flight {
                debug!("Ignoring submit while a request is in flight");
                return SubmitOutcome::AlreadyInFlight;
            }
            state.in_flight = true;
            state.error_message = None;
            file
        };
        let guard = InFlightGuard { state: &self.state };

        let result = self.request(file).await;

        let outcome = {
            let mut state = lock(&self.state);
            match result {
                Ok(predictions) => {
                    state.predictions = Some(predictions);
                    state.error_message = None;
                    SubmitOutcome::Classified
                }
                Err(e) => {
                    error!("Classification failed: {}", e);
                    state.predictions = None;
                    state.error_message = Some(e.to_string());
                    SubmitOutcome::Failed
                }
            }
        };
        drop(guard);

        outcome
    }

    async fn request(&self, file: SelectedImage) -> Result<Vec<Prediction>, DriverError> {
        let part = Part::bytes(file.bytes.to_vec())
            .file_name(file.name)
            .mime_str(&file.mime_type)
            .map_err(transport_error)?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        interpret_response(status, &body)
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    let message = e.without_url().to_string();
    if message.trim().is_empty() {
        DriverError::Transport("Error in classification".to_string())
    } else {
        DriverError::Transport(message)
    }
}

/// Turn a proxy reply into predictions or the error to show.
pub fn interpret_response(status: StatusCode, body: &str) -> Result<Vec<Prediction>, DriverError> {
    let data: Value = serde_json::from_str(body).map_err(|e| {
        error!(error = %e, "Failed to parse response: {}", body);
        DriverError::InvalidJson
    })?;

    if !status.is_success() {
        let message = data
            .get("error")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or("Failed to classify image");
        return Err(DriverError::Server(message.to_string()));
    }

    let predictions = match data.get("predictions") {
        Some(predictions @ Value::Array(_)) => predictions.clone(),
        _ => {
            error!("Unexpected response format: {}", data);
            return Err(DriverError::InvalidFormat);
        }
    };

    serde_json::from_value(predictions).map_err(|e| {
        error!(error = %e, "Predictions have an unexpected shape");
        DriverError::InvalidFormat
    })
}
