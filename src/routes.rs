use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use image::ImageReader;
use poem::endpoint::StaticFilesEndpoint;
use poem::middleware::AddData;
use poem::web::{Data, Html, Json, Multipart};
use poem::{Endpoint, EndpointExt, IntoResponse, Route, get, handler, post};
use serde::Serialize;

use crate::detector::{Detector, encode_annotated};
use crate::error::ApiError;
use crate::store::{NewPredictionLog, PredictionStore};

/// Label stored and returned when the model finds nothing.
pub const NO_OBJECT_LABEL: &str = "No Object Detected";

/// Public URL prefix the saved annotated images are served under.
pub const PUBLIC_PREDICTION_PREFIX: &str = "/static/predictions";

/// Application-lifetime singletons, initialized once at startup and
/// shared by every request handler. Tests substitute fakes here.
pub struct AppContext {
    pub detector: Arc<dyn Detector>,
    pub store: Arc<dyn PredictionStore>,
    pub prediction_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    success: bool,
    predict_image_url: String,
    detections: usize,
    detected_object: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    total_predictions: i64,
    class_count: Vec<crate::store::ClassCount>,
    status: bool,
}

#[handler]
fn home() -> impl IntoResponse {
    Html(include_str!("../assets/index.html"))
}

#[handler]
fn dashboard() -> impl IntoResponse {
    Html(include_str!("../assets/dashboard.html"))
}

#[handler]
async fn predict(
    Data(context): Data<&Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Decode(anyhow::Error::new(e)))?
    {
        if field.name() == Some("file") {
            file = Some(field);
            break;
        }
    }

    let file = file.ok_or(ApiError::MissingFile)?;

    if file.file_name().is_none_or(str::is_empty) {
        return Err(ApiError::EmptyFilename);
    }

    let data = file
        .bytes()
        .await
        .map_err(|e| ApiError::Decode(anyhow::Error::new(e)))?;

    // Decode, inference and annotation are CPU-bound; keep them off the
    // request thread.
    let detector = context.detector.clone();
    let (detections, annotated) = tokio::task::spawn_blocking(move || {
        let image = ImageReader::new(Cursor::new(&data))
            .with_guessed_format()
            .map_err(|e| ApiError::Decode(anyhow::Error::new(e)))?
            .decode()
            .map_err(|e| ApiError::Decode(anyhow::Error::new(e)))?;

        let detections = detector.detect(&image).map_err(ApiError::Inference)?;
        let annotated = encode_annotated(&image, &detections).map_err(ApiError::Inference)?;

        Ok::<_, ApiError>((detections, annotated))
    })
    .await
    .map_err(|e| ApiError::Inference(anyhow::Error::new(e)))??;

    let mut unique_labels: Vec<String> = Vec::new();
    for detection in &detections {
        if !unique_labels.contains(&detection.label) {
            unique_labels.push(detection.label.clone());
        }
    }

    if unique_labels.is_empty() {
        unique_labels.push(NO_OBJECT_LABEL.to_string());
    }

    // The uuid suffix keeps two requests within the same second from
    // overwriting each other's file.
    let file_name = format!(
        "prediction_{timestamp}_{id}.jpg",
        timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S"),
        id = uuid::Uuid::new_v4()
    );
    let target_path = context.prediction_dir.join(&file_name);

    tokio::fs::write(&target_path, &annotated)
        .await
        .map_err(|e| ApiError::Persistence(anyhow::Error::new(e)))?;

    let file_path = format!("{PUBLIC_PREDICTION_PREFIX}/{file_name}");

    let log = NewPredictionLog {
        file_name,
        detected_objects: unique_labels.join(", "),
        total_objects: detections.len() as i32,
        file_path: file_path.clone(),
    };

    if let Err(e) = context.store.insert(log).await {
        // don't leave an orphaned image behind
        if let Err(remove_error) = tokio::fs::remove_file(&target_path).await {
            tracing::warn!(
                "failed to remove {path}: {remove_error}",
                path = target_path.display()
            );
        }

        return Err(ApiError::Persistence(e));
    }

    Ok(Json(PredictResponse {
        success: true,
        predict_image_url: file_path,
        detections: detections.len(),
        detected_object: unique_labels,
    }))
}

#[handler]
async fn api_dashboard(
    Data(context): Data<&Arc<AppContext>>,
) -> Result<Json<DashboardResponse>, ApiError> {
    let total_predictions = context
        .store
        .total_predictions()
        .await
        .map_err(ApiError::Persistence)?;

    let class_count = context
        .store
        .class_counts()
        .await
        .map_err(ApiError::Persistence)?;

    Ok(Json(DashboardResponse {
        total_predictions,
        class_count,
        status: true,
    }))
}

pub fn build_route(context: Arc<AppContext>) -> impl Endpoint {
    Route::new()
        .at("/", get(home))
        .at("/dashboard", get(dashboard))
        .at("/predict", post(predict))
        .at("/api/dashboard", get(api_dashboard))
        .nest(
            PUBLIC_PREDICTION_PREFIX,
            StaticFilesEndpoint::new(context.prediction_dir.clone()),
        )
        .nest("/assets", StaticFilesEndpoint::new("assets"))
        .with(AddData::new(context))
}
