use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Path, State},
};
use serde_json::{Map, Value};
use tracing::info;

use super::run_blocking;
use crate::{
    AppState,
    admission::Metered,
    api::models::ml::{ModelInfo, ModelMetricsResponse, ModelsListResponse, PredictionResponse, TrainResponse},
    auth::current_user::CurrentUser,
    errors::{Error, Result},
    training::{ModelType, TrainRequest, TrainingError},
    types::Operation,
};

/// Raw multipart fields of a training request.
#[derive(Debug, Default)]
struct TrainForm {
    file: Option<Bytes>,
    model_name: Option<String>,
    model_type: Option<String>,
    features: Option<String>,
    label: Option<String>,
    model_params: Option<String>,
    test_size: Option<f64>,
}

async fn field_text(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String> {
    field.text().await.map_err(|e| Error::BadRequest {
        message: format!("Failed to read {name}: {e}"),
    })
}

impl TrainForm {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut form = TrainForm::default();

        while let Some(field) = multipart.next_field().await.map_err(|e| Error::BadRequest {
            message: format!("Failed to parse multipart data: {e}"),
        })? {
            let field_name = field.name().unwrap_or("").to_string();

            match field_name.as_str() {
                "file" => {
                    form.file = Some(field.bytes().await.map_err(|e| Error::BadRequest {
                        message: format!("Failed to read file: {e}"),
                    })?);
                }
                "model_name" => form.model_name = Some(field_text(field, "model_name").await?),
                "model_type" => form.model_type = Some(field_text(field, "model_type").await?),
                "features" => form.features = Some(field_text(field, "features").await?),
                "label" => form.label = Some(field_text(field, "label").await?),
                "model_params" => form.model_params = Some(field_text(field, "model_params").await?),
                "test_size" => {
                    let value = field_text(field, "test_size").await?;
                    form.test_size = Some(value.trim().parse::<f64>().map_err(|_| Error::BadRequest {
                        message: format!("Invalid test_size value '{value}': must be a number"),
                    })?);
                }
                _ => {
                    // Ignore unknown fields
                }
            }
        }

        Ok(form)
    }

    fn required<T>(value: Option<T>, name: &str) -> Result<T> {
        value.ok_or_else(|| Error::BadRequest {
            message: format!("Missing required field: '{name}'"),
        })
    }

    /// Check that every required field arrived.
    fn complete(self) -> Result<TrainUpload> {
        Ok(TrainUpload {
            file: Self::required(self.file, "file")?,
            model_name: Self::required(self.model_name, "model_name")?,
            features: Self::required(self.features, "features")?,
            label: Self::required(self.label, "label")?,
            model_type: self.model_type,
            model_params: self.model_params,
            test_size: self.test_size,
        })
    }
}

/// A training form with all required fields present, still holding the JSON-encoded ones raw.
#[derive(Debug)]
struct TrainUpload {
    file: Bytes,
    model_name: String,
    features: String,
    label: String,
    model_type: Option<String>,
    model_params: Option<String>,
    test_size: Option<f64>,
}

impl TrainUpload {
    /// Decode the model type and the JSON-valued fields into a training request.
    fn into_request(self, default_test_size: f64) -> Result<(Bytes, TrainRequest)> {
        let model_type = match self.model_type.as_deref().map(str::trim) {
            None | Some("") => ModelType::LinearRegression,
            Some(name) => name.parse::<ModelType>()?,
        };

        let features: Vec<String> = serde_json::from_str(&self.features).map_err(|e| {
            TrainingError::validation(format!("Invalid JSON format for features: {e}. Expected an array of column names"))
        })?;

        let model_params = match self.model_params.as_deref().map(str::trim) {
            None | Some("") => Map::new(),
            Some(raw) => serde_json::from_str::<Map<String, Value>>(raw)
                .map_err(|e| TrainingError::validation(format!("Invalid JSON format for model_params: {e}. Expected an object")))?,
        };

        let request = TrainRequest {
            model_name: self.model_name,
            model_type,
            features,
            label: self.label,
            model_params,
            test_size: self.test_size.unwrap_or(default_test_size),
        };
        Ok((self.file, request))
    }
}

/// Train a model on an uploaded CSV file
///
/// The form carries `file`, `model_name`, `features` (a JSON array of column names), `label`,
/// and optionally `model_type`, `model_params` (a JSON object) and `test_size`. A form missing
/// a required field is rejected for free; once it is complete the call is charged, even if
/// the data turns out to be unusable.
#[utoipa::path(
    post,
    path = "/train",
    tag = "models",
    request_body(content_type = "multipart/form-data", description = "CSV training data and model settings"),
    responses(
        (status = 200, description = "Model trained and stored", body = TrainResponse),
        (status = 400, description = "Invalid form, columns, values or parameters"),
        (status = 401, description = "Missing or invalid session token"),
        (status = 402, description = "Insufficient tokens"),
        (status = 429, description = "Rate limit exceeded"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn train(
    State(state): State<AppState>,
    current_user: CurrentUser,
    multipart: Multipart,
) -> Result<Metered<Json<TrainResponse>>> {
    let upload = TrainForm::read(multipart).await?.complete()?;
    let policy = state.config.pricing.policy(Operation::Train);
    let default_test_size = state.config.training.default_test_size;
    let training = state.training.clone();

    let metered = state
        .gate
        .perform(&current_user.username, &policy, || async move {
            let (file, request) = upload.into_request(default_test_size)?;
            run_blocking(move || Ok(training.train(&file, request)?)).await
        })
        .await?;

    info!(
        username = %current_user.username,
        model_type = %metered.value.model_type,
        metrics = ?metered.value.metrics,
        "Model trained"
    );
    Ok(metered.map(|outcome| Json(TrainResponse::from(outcome))))
}

/// Predict with a stored model
///
/// The body maps every feature the model was trained on to a number.
#[utoipa::path(
    post,
    path = "/predict/{model_name}",
    tag = "models",
    params(("model_name" = String, Path, description = "Name of a trained model")),
    request_body(content = std::collections::HashMap<String, f64>, description = "Feature name to value"),
    responses(
        (status = 200, description = "Prediction", body = PredictionResponse),
        (status = 400, description = "Missing or non-numeric features"),
        (status = 401, description = "Missing or invalid session token"),
        (status = 402, description = "Insufficient tokens"),
        (status = 404, description = "Model not found"),
        (status = 429, description = "Rate limit exceeded"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn predict(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(model_name): Path<String>,
    Json(input): Json<Map<String, Value>>,
) -> Result<Metered<Json<PredictionResponse>>> {
    let policy = state.config.pricing.policy(Operation::Predict);
    let training = state.training.clone();
    let name = model_name.clone();

    let metered = state
        .gate
        .perform(&current_user.username, &policy, || async move {
            run_blocking(move || Ok(training.predict(&name, &input)?)).await
        })
        .await?;

    info!(username = %current_user.username, model_name = %model_name, prediction = metered.value, "Prediction made");
    Ok(metered.map(|prediction| Json(PredictionResponse { prediction })))
}

/// List every stored model
#[utoipa::path(
    get,
    path = "/models",
    tag = "models",
    responses(
        (status = 200, description = "Stored models sorted by name", body = ModelsListResponse),
        (status = 401, description = "Missing or invalid session token"),
        (status = 402, description = "Insufficient tokens"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_models(State(state): State<AppState>, current_user: CurrentUser) -> Result<Metered<Json<ModelsListResponse>>> {
    let policy = state.config.pricing.policy(Operation::ListModels);
    let training = state.training.clone();

    let metered = state
        .gate
        .perform(&current_user.username, &policy, || async move { Ok(training.list_models()) })
        .await?;

    Ok(metered.map(|records| {
        Json(ModelsListResponse {
            models: records.into_iter().map(ModelInfo::from).collect(),
        })
    }))
}

/// Get a stored model's evaluation metrics
#[utoipa::path(
    get,
    path = "/models/{model_name}/metrics",
    tag = "models",
    params(("model_name" = String, Path, description = "Name of a trained model")),
    responses(
        (status = 200, description = "Model metrics", body = ModelMetricsResponse),
        (status = 401, description = "Missing or invalid session token"),
        (status = 402, description = "Insufficient tokens"),
        (status = 404, description = "Model not found"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn model_metrics(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(model_name): Path<String>,
) -> Result<Metered<Json<ModelMetricsResponse>>> {
    let policy = state.config.pricing.policy(Operation::ModelMetrics);
    let training = state.training.clone();

    let metered = state
        .gate
        .perform(&current_user.username, &policy, || async move { training.model_metrics(&model_name).map_err(Error::from) })
        .await?;

    Ok(metered.map(|record| Json(ModelMetricsResponse::from(record))))
}
