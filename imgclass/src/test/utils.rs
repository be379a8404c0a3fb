use crate::{
    AppState, build_router,
    classifier::ReqwestClassifier,
    config::{Config, StagingConfig},
    staging::{MemoryStaging, StagingStorage},
};
use axum_test::{
    TestServer,
    multipart::{MultipartForm, Part},
};
use std::{sync::Arc, time::Duration};

/// Config pointing at `classifier_url`, with in-memory staging and short timeouts
pub fn create_test_config(classifier_url: &str) -> Config {
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.classifier.url = classifier_url.parse().expect("Invalid classifier URL");
    config.classifier.request_timeout = Duration::from_secs(5);
    config.classifier.connect_timeout = Duration::from_secs(1);
    config.staging = StagingConfig::Memory;
    config
}

pub fn create_test_app(classifier_url: &str) -> (TestServer, Arc<MemoryStaging>) {
    create_test_app_with_config(create_test_config(classifier_url))
}

/// Test server over the full router. The returned staging handle lets tests observe
/// how many uploads were staged and released.
pub fn create_test_app_with_config(config: Config) -> (TestServer, Arc<MemoryStaging>) {
    let staging = Arc::new(MemoryStaging::new());
    let server = create_test_app_with_staging(config, staging.clone());
    (server, staging)
}

/// Test server over the full router with a caller-supplied staging backend
pub fn create_test_app_with_staging(config: Config, staging: Arc<dyn StagingStorage>) -> TestServer {
    let classifier = ReqwestClassifier::new(&config.classifier).expect("Failed to create classifier client");

    let state = AppState::builder()
        .config(config)
        .classifier(Arc::new(classifier))
        .staging(staging)
        .build();

    let router = build_router(state).expect("Failed to build router");
    TestServer::new(router.into_make_service()).expect("Failed to create test server")
}

/// A multipart form with one `file` part
pub fn image_form(file_name: &str, mime_type: &str, bytes: &[u8]) -> MultipartForm {
    MultipartForm::new().add_part(
        "file",
        Part::bytes(bytes.to_vec()).file_name(file_name.to_string()).mime_type(mime_type.to_string()),
    )
}
