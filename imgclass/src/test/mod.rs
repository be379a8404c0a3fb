pub mod utils;

use crate::Application;
use crate::api::models::classify::Prediction;
use crate::client::{ClassifyDriver, SelectedImage, SubmitOutcome};
use bytes::Bytes;
use tokio::net::TcpListener;
use url::Url;
use utils::create_test_config;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serve the full application on an ephemeral port and return the classify URL
async fn spawn_proxy(config: crate::Config) -> Url {
    let router = Application::new(config)
        .await
        .expect("Failed to create application")
        .into_router();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");

    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.expect("Server failed");
    });

    format!("http://{addr}/api/classify").parse().expect("Invalid proxy URL")
}

fn cat_image() -> SelectedImage {
    SelectedImage {
        name: "cat.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        bytes: Bytes::from_static(b"fake-jpeg-bytes"),
    }
}

/// Driver -> proxy -> classification service and back
#[test_log::test(tokio::test)]
async fn test_e2e_classification_through_driver() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/classify"))
        .and(body_string_contains("fake-jpeg-bytes"))
        .and(body_string_contains(r#"filename="cat.jpg""#))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"predictions":[{"label":"n02123045","description":"tabby","probability":0.87},{"label":"n02124075","description":"Egyptian_cat","probability":0.09}]}"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let endpoint = spawn_proxy(create_test_config(&mock_server.uri())).await;
    let driver = ClassifyDriver::new(endpoint).unwrap();

    assert!(driver.select_file(cat_image()));
    assert_eq!(driver.submit().await, SubmitOutcome::Classified);

    let state = driver.state();
    let predictions = state.predictions.unwrap();
    assert_eq!(predictions.len(), 2);
    assert_eq!(
        predictions[0],
        Prediction {
            label: Some("n02123045".to_string()),
            description: "tabby".to_string(),
            probability: 0.87,
        }
    );
    assert!(!state.in_flight);
    assert_eq!(state.error_message, None);
}

#[test_log::test(tokio::test)]
async fn test_e2e_backend_failure_reaches_driver() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/classify"))
        .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"error":"model not loaded"}"#))
        .mount(&mock_server)
        .await;

    let endpoint = spawn_proxy(create_test_config(&mock_server.uri())).await;
    let driver = ClassifyDriver::new(endpoint).unwrap();
    driver.select_file(cat_image());

    assert_eq!(driver.submit().await, SubmitOutcome::Failed);

    let state = driver.state();
    assert_eq!(state.error_message.as_deref(), Some("model not loaded"));
    assert_eq!(state.predictions, None);
    assert!(!state.in_flight);
}

#[test_log::test(tokio::test)]
async fn test_e2e_garbage_backend_reply_reaches_driver() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Traceback (most recent call last):"))
        .mount(&mock_server)
        .await;

    let endpoint = spawn_proxy(create_test_config(&mock_server.uri())).await;
    let driver = ClassifyDriver::new(endpoint).unwrap();
    driver.select_file(cat_image());
    driver.submit().await;

    assert_eq!(
        driver.state().error_message.as_deref(),
        Some("Invalid response from classification service")
    );
}

#[test_log::test(tokio::test)]
async fn test_e2e_disk_staging_is_cleaned_up() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"predictions":[]}"#))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config(&mock_server.uri());
    config.staging = crate::config::StagingConfig::Disk {
        dir: Some(dir.path().to_path_buf()),
    };

    let endpoint = spawn_proxy(config).await;
    let driver = ClassifyDriver::new(endpoint).unwrap();
    driver.select_file(cat_image());

    for _ in 0..3 {
        assert_eq!(driver.submit().await, SubmitOutcome::Classified);
    }

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// The only test that enables metrics: axum-prometheus installs a process-wide recorder
#[test_log::test(tokio::test)]
async fn test_metrics_endpoint() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"predictions":[]}"#))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&mock_server.uri());
    config.enable_metrics = true;
    let server = Application::new(config).await.unwrap().into_test_server();

    server
        .post("/api/classify")
        .multipart(utils::image_form("cat.png", "image/png", b"png"))
        .await
        .assert_status_ok();
    server
        .post("/api/classify")
        .multipart(utils::image_form("notes.txt", "text/plain", b"txt"))
        .await
        .assert_status_bad_request();

    let response = server.get("/internal/metrics").await;
    response.assert_status_ok();
    let text = response.text();
    assert!(text.contains(r#"imgclass_classifications_total{outcome="success"} 1"#));
    assert!(text.contains(r#"imgclass_classifications_total{outcome="rejected"} 1"#));
    assert!(text.contains(r#"imgclass_backend_request_duration_seconds_count{status="200"} 1"#));
}
