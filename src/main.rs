pub(crate) mod config;
pub(crate) mod detector;
pub(crate) mod error;
pub(crate) mod routes;
pub(crate) mod store;

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::Context as _;
use detector::YoloDetector;
use ort::execution_providers::{CUDAExecutionProvider, CoreMLExecutionProvider};
use poem::{Server, listener::TcpListener};
use routes::AppContext;
use store::PgPredictionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = config::parse_config()?;

    // Initialize ONNX runtime
    ort::init()
        .with_execution_providers([
            CUDAExecutionProvider::default().build(),
            CoreMLExecutionProvider::default().build(),
        ])
        .with_telemetry(true)
        .commit()
        .context("failed to initialize ONNX runtime")?;

    let detector = YoloDetector::from_model_file(&config.model_path)?;

    let pool = sqlx::PgPool::connect(&config.database_url())
        .await
        .context("Failed to connect to PostgreSQL")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to apply database migrations")?;

    std::fs::create_dir_all(&config.prediction_dir).with_context(|| {
        format!(
            "Failed to create the prediction directory {}",
            config.prediction_dir.display()
        )
    })?;

    let context = Arc::new(AppContext {
        detector: Arc::new(detector),
        store: Arc::new(PgPredictionStore::new(pool)),
        prediction_dir: config.prediction_dir.clone(),
    });

    let addr = SocketAddr::from_str(&std::env::var("BIND_ADDR").unwrap_or("0.0.0.0:8080".into()))
        .context("Invalid BIND_ADDR")?;

    let app = routes::build_route(context);

    tracing::info!(
        "Prediction service listening on http://127.0.0.1:{port}",
        port = addr.port()
    );

    Server::new(TcpListener::bind(addr)).run(app).await?;

    Ok(())
}
