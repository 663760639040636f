use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::Html,
    routing::{get, post},
};
use serde_json::Value;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ClassificationResponse, GenerationResponse, ModelRegistry, RegressionResponse,
        regression::parse_feature_row,
    },
    upload::{ScratchFile, allowed_file},
};

const HOME_PAGE: &str = include_str!("home.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let body_limit = config.max_upload_bytes;
    let state = AppState { config, registry };

    Router::new()
        .route("/regpredict", post(regression_predict))
        .route("/predict", post(classify_image))
        .route("/textgen", post(generate_text))
        .route("/home", get(home))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

async fn home() -> Html<&'static str> {
    Html(HOME_PAGE)
}

/// Pulls `key` out of a JSON object body, rejecting anything else with the
/// same client-facing message.
fn required_field(
    payload: Result<Json<Value>, JsonRejection>,
    key: &str,
) -> Result<Value, ServiceError> {
    let missing =
        || ServiceError::BadRequest(format!("Invalid input. JSON with \"{key}\" key is required."));

    let Json(mut body) = payload.map_err(|_| missing())?;
    body.as_object_mut()
        .and_then(|object| object.remove(key))
        .ok_or_else(missing)
}

async fn regression_predict(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<RegressionResponse>, ServiceError> {
    let features = required_field(payload, "features")?;
    let row = parse_feature_row(&features)
        .map_err(|e| ServiceError::BadRequest(format!("Invalid features format: {e}")))?;

    let prediction = state.registry.predict_regression(&row)?;
    Ok(Json(RegressionResponse { prediction }))
}

async fn classify_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ClassificationResponse>, ServiceError> {
    let no_file = || ServiceError::BadRequest("No file uploaded".into());
    let mut multipart = multipart.map_err(|_| no_file())?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        // A part without a filename is a plain form value, not a file.
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let data = field.bytes().await.map_err(multipart_error)?;
        upload = Some((filename, data));
        break;
    }

    let (filename, data) = upload.ok_or_else(no_file)?;
    if filename.is_empty() {
        return Err(ServiceError::BadRequest("No selected file".into()));
    }
    if !allowed_file(&filename) {
        return Err(ServiceError::BadRequest(
            "Invalid file type. Only PNG, JPG, and JPEG are allowed.".into(),
        ));
    }

    info!(%filename, bytes = data.len(), "classifying upload");

    let registry = state.registry.clone();
    let config = state.config.clone();
    let predictions = task::spawn_blocking(move || {
        let scratch = ScratchFile::persist(&config.upload_dir, &filename, &data)?;
        registry.classify_image(scratch.path(), &config)
    })
    .await
    .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))??;

    Ok(Json(ClassificationResponse { predictions }))
}

fn multipart_error(err: MultipartError) -> ServiceError {
    let detail = err.body_text();
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge(format!("upload exceeds the size limit: {detail}"))
    } else {
        ServiceError::BadRequest(format!("malformed multipart body: {detail}"))
    }
}

async fn generate_text(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let prompt = match required_field(payload, "prompt")? {
        Value::String(prompt) => prompt,
        _ => {
            return Err(ServiceError::BadRequest(
                "Invalid input. \"prompt\" must be a string.".into(),
            ));
        }
    };

    let generated_text = state
        .registry
        .generate_text(prompt, &state.config)
        .await
        .map_err(|e| ServiceError::Inference(format!("Text generation error: {e}")))?;

    Ok(Json(GenerationResponse { generated_text }))
}
