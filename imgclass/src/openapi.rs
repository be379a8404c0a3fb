//! OpenAPI document for the proxy, served at `/api-docs/openapi.json` and rendered at `/docs`.

use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "imgclass",
        description = "Upload an image and get ranked predictions from the classification service."
    ),
    paths(api::handlers::classify::classify),
    components(schemas(
        api::models::classify::Prediction,
        api::models::classify::ClassificationResponse,
        api::models::classify::ErrorResponse,
    )),
    tags(
        (name = "classify", description = "Image classification")
    ),
    modifiers(&ApiPrefix)
)]
pub struct ApiDoc;

/// Handlers are mounted under `/api`; prefix their documented paths to match.
struct ApiPrefix;

impl utoipa::Modify for ApiPrefix {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let paths = std::mem::take(&mut openapi.paths.paths);
        openapi.paths.paths = paths.into_iter().map(|(path, item)| (format!("/api{path}"), item)).collect();
    }
}
