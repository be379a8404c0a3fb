use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single ranked prediction returned by the classification service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Prediction {
    /// Human readable class name (e.g. "tabby")
    pub description: String,
    /// Confidence in `[0, 1]`
    pub probability: f64,
    /// Backend class identifier, when the service provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Successful classification payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ClassificationResponse {
    pub predictions: Vec<Prediction>,
}

/// Failure payload, returned with a 4xx or 5xx status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Whether a declared media type names an image: `image/<subtype>`, parameters allowed.
///
/// The subtype must be a non-empty HTTP token so the type can be forwarded as-is.
pub fn is_image_mime(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    let Some((top, subtype)) = essence.split_once('/') else {
        return false;
    };

    top.eq_ignore_ascii_case("image") && !subtype.is_empty() && subtype.chars().all(is_token_char)
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}
