//! Command line front end for the classify endpoint.
//!
//! ```bash
//! imgclass-classify --server http://localhost:3000 cat.jpg
//! ```

use clap::Parser;
use imgclass::client::{ClassifyDriver, SelectedImage, SubmitOutcome};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Classify an image through an imgclass proxy", long_about = None)]
struct Cli {
    /// Base URL of the proxy
    #[arg(long, env = "IMGCLASS_SERVER", default_value = "http://localhost:3000")]
    server: Url,

    /// Request timeout, e.g. `30s` or `2m`
    #[arg(long, default_value = "2m", value_parser = humantime_serde::re::humantime::parse_duration)]
    timeout: Duration,

    /// Image to classify
    image: Option<PathBuf>,
}

fn classify_endpoint(server: &Url) -> Result<Url, url::ParseError> {
    let mut base = server.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join("api/classify")
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let driver = ClassifyDriver::with_timeout(classify_endpoint(&cli.server)?, cli.timeout)?;

    if let Some(path) = &cli.image {
        let image = SelectedImage::from_path(path).await?;
        driver.select_file(image);
    }

    let outcome = driver.submit().await;
    let state = driver.state();

    match outcome {
        SubmitOutcome::Classified => {
            for prediction in state.predictions.unwrap_or_default() {
                println!("{:<40} {:>6.2}%", prediction.description, prediction.probability * 100.0);
            }
            Ok(ExitCode::SUCCESS)
        }
        SubmitOutcome::NoFileSelected => {
            let message = state.error_message.unwrap_or_else(|| "Please select an image first".to_string());
            eprintln!("{message}");
            Ok(ExitCode::from(2))
        }
        SubmitOutcome::AlreadyInFlight | SubmitOutcome::Failed => {
            eprintln!("{}", state.error_message.unwrap_or_else(|| "Error in classification".to_string()));
            Ok(ExitCode::FAILURE)
        }
    }
}
