//! HTTP surface of the prediction service.
//!
//! - `GET /pred`, `POST /pred` - score one observation
//! - `GET /info` - static service metadata
//! - `GET /confusion` - the confusion matrix computed at startup

use crate::config::ServiceInfo;
use crate::encode::{EncodeError, RawInput};
use crate::evaluate::ConfusionMatrix;
use crate::handler::{PredictError, PredictionResult};
use crate::model::artifact::ModelError;
use crate::startup::ServiceContext;
use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures a request can end in, each mapped to one status code.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    InvalidInput(#[from] EncodeError),
    #[error("Malformed request body: {}", .0.body_text())]
    MalformedBody(#[from] JsonRejection),
    #[error("Prediction failed: {0}")]
    Model(ModelError),
    #[error("Prediction did not finish within {} seconds", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("Prediction task did not complete: {0}")]
    Task(String),
}

impl From<PredictError> for ApiError {
    fn from(err: PredictError) -> Self {
        match err {
            PredictError::Encode(err) => ApiError::InvalidInput(err),
            PredictError::Model(err) => ApiError::Model(err),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::MalformedBody(rejection) => rejection.status(),
            ApiError::Model(_) | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.to_string()));
        if let ApiError::InvalidInput(err) = self {
            body.insert("feature".to_string(), Value::String(err.feature().to_string()));
            if let Some(allowed) = err.allowed() {
                body.insert("allowed".to_string(), json!(allowed));
            }
        }
        Value::Object(body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::InvalidInput(_) | ApiError::MalformedBody(_) => log::debug!("Rejected request: {self}"),
            other => log::error!("{other}"),
        }
        (self.status(), Json(self.body())).into_response()
    }
}

/// Builds the router over an already-initialised context.
pub fn router(context: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/pred", get(predict_get).post(predict_post))
        .route("/info", get(info))
        .route("/confusion", get(confusion))
        .with_state(context)
}

/// Binds `bind` and serves until Ctrl-C.
pub async fn serve(bind: &str, context: Arc<ServiceContext>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);
    log::info!("Available endpoints: GET|POST /pred, GET /info, GET /confusion");
    axum::serve(listener, router(context))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for the shutdown signal: {e}");
    }
    log::info!("Shutdown signal received, draining connections");
}

pub async fn predict_get(
    State(context): State<Arc<ServiceContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PredictionResult>, ApiError> {
    run_prediction(context, RawInput::from_query(params)).await
}

pub async fn predict_post(
    State(context): State<Arc<ServiceContext>>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let Json(body) = body?;
    run_prediction(context, RawInput::from_json(body)).await
}

pub async fn info(State(context): State<Arc<ServiceContext>>) -> Json<ServiceInfo> {
    Json(context.info().clone())
}

pub async fn confusion(State(context): State<Arc<ServiceContext>>) -> Json<ConfusionMatrix> {
    Json(*context.confusion_matrix())
}

// The model call runs on the blocking pool and is the only step a timeout applies to.
async fn run_prediction(
    context: Arc<ServiceContext>,
    raw: RawInput,
) -> Result<Json<PredictionResult>, ApiError> {
    let handler = context.handler().clone();
    let row = handler.encode(&raw)?;
    let task = tokio::task::spawn_blocking(move || handler.predict_row(row));

    let joined = match context.prediction_timeout() {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| ApiError::Timeout(limit))?,
        None => task.await,
    };
    let result = joined.map_err(|e| ApiError::Task(e.to_string()))??;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::compute_defaults;
    use crate::evaluate::Evaluation;
    use crate::handler::PredictionHandler;
    use crate::model::artifact::{Classifier, FitSummary, assemble_model};
    use crate::model::test_fixtures::synthetic_cohort;
    use crate::schema::{FeatureRow, FeatureSchema, Outcome};
    use axum::body::{Body, to_bytes};
    use axum::extract::FromRequest;
    use axum::http::Request;
    use ndarray::Array1;
    use std::collections::BTreeMap;
    use std::time::Instant;

    /// Sleeps on every call, standing in for a model that hangs.
    struct StalledClassifier {
        delay: Duration,
    }

    impl Classifier for StalledClassifier {
        fn predict_probability(&self, rows: &[FeatureRow]) -> Result<Array1<f64>, ModelError> {
            std::thread::sleep(self.delay);
            Ok(Array1::from_elem(rows.len(), 0.5))
        }

        fn predict_class(&self, rows: &[FeatureRow]) -> Result<Vec<Outcome>, ModelError> {
            std::thread::sleep(self.delay);
            Ok(vec![Outcome::Diabetes; rows.len()])
        }
    }

    fn stalled_context(timeout: Option<Duration>) -> Arc<ServiceContext> {
        let schema = FeatureSchema::standard();
        let data = synthetic_cohort(&schema, 50, 11);
        let defaults = compute_defaults(&schema, &data).unwrap();
        let classifier = StalledClassifier {
            delay: Duration::from_millis(800),
        };
        let handler = PredictionHandler::new(&schema, defaults, Arc::new(classifier)).unwrap();
        let evaluation = Evaluation {
            matrix: ConfusionMatrix::default(),
            rows_total: 0,
            excluded_missing_label: 0,
            excluded_missing_features: 0,
        };
        let info = ServiceInfo {
            name: "Diabetes risk".to_string(),
            github_pages_url: "https://example.github.io/glyco".to_string(),
        };
        Arc::new(ServiceContext::from_parts(handler, evaluation, info).with_prediction_timeout(timeout))
    }

    async fn rejected_body(content_type: &str, body: &'static str) -> JsonRejection {
        let request = Request::builder()
            .method("POST")
            .uri("/pred")
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap();
        Json::<Map<String, Value>>::from_request(request, &())
            .await
            .unwrap_err()
    }

    fn context() -> Arc<ServiceContext> {
        let schema = FeatureSchema::standard();
        let data = synthetic_cohort(&schema, 250, 5);
        let mut terms = BTreeMap::new();
        for (name, value) in [
            ("HighBPYes", 1.4),
            ("BMI", 0.11),
            ("SmokerYes", 0.3),
            ("HeartDiseaseorAttackYes", 0.9),
            ("PhysActivityYes", -0.5),
            ("SexMale", 0.2),
        ] {
            terms.insert(name.to_string(), value);
        }
        let model = assemble_model(&schema, -4.7, terms, FitSummary::default());
        let info = ServiceInfo {
            name: "Diabetes risk".to_string(),
            github_pages_url: "https://example.github.io/glyco".to_string(),
        };
        Arc::new(ServiceContext::from_dataset(schema, &data, Arc::new(model), info).unwrap())
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn get_pred_echoes_the_encoded_row() {
        let mut params = HashMap::new();
        params.insert("BMI".to_string(), "32".to_string());
        params.insert("HighBP".to_string(), "Yes".to_string());

        let Json(result) = predict_get(State(context()), Query(params)).await.unwrap();
        assert_eq!(result.input.get("BMI").and_then(|v| v.as_number()), Some(32.0));
        assert!((0.0..=1.0).contains(&result.prob_diabetes));
    }

    #[tokio::test]
    async fn invalid_category_is_a_bad_request() {
        let body = serde_json::json!({ "HighBP": "maybe" });
        let err = predict_post(State(context()), Ok(Json(body.as_object().unwrap().clone())))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = json_body(response).await;
        assert_eq!(json["feature"], "HighBP");
        assert_eq!(json["allowed"], serde_json::json!(["No", "Yes"]));
    }

    #[tokio::test]
    async fn invalid_number_has_no_allowed_list() {
        let mut params = HashMap::new();
        params.insert("BMI".to_string(), "heavy".to_string());
        let response = predict_get(State(context()), Query(params))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["feature"], "BMI");
        assert!(json.get("allowed").is_none());
    }

    #[tokio::test]
    async fn confusion_total_matches_cohort() {
        let Json(matrix) = confusion(State(context())).await;
        assert_eq!(matrix.total(), 250);
    }

    #[test]
    fn model_errors_map_to_server_errors() {
        let err = ApiError::from(PredictError::Model(ModelError::InternalStackingError));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ApiError::Timeout(Duration::from_secs(2)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_model_call_times_out_with_service_unavailable() {
        let limit = Duration::from_millis(100);
        let started = Instant::now();
        let response = predict_get(State(stalled_context(Some(limit))), Query(HashMap::new()))
            .await
            .unwrap_err()
            .into_response();
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert!(json["error"].as_str().unwrap().contains("0.1 seconds"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn without_a_limit_slow_model_calls_complete() {
        let Json(result) = predict_get(State(stalled_context(None)), Query(HashMap::new()))
            .await
            .unwrap();
        assert_eq!(result.predicted_class, Outcome::Diabetes);
        assert_eq!(result.prob_diabetes, 0.5);
    }

    #[tokio::test]
    async fn malformed_bodies_are_json_client_errors() {
        let cases = [
            ("application/json", "[1, 2]", StatusCode::UNPROCESSABLE_ENTITY),
            ("application/json", "{not json", StatusCode::BAD_REQUEST),
            ("text/plain", "{}", StatusCode::UNSUPPORTED_MEDIA_TYPE),
        ];
        for (content_type, body, expected) in cases {
            let rejection = rejected_body(content_type, body).await;
            let response = predict_post(State(context()), Err(rejection))
                .await
                .unwrap_err()
                .into_response();
            assert_eq!(response.status(), expected, "body {body:?}");
            let json = json_body(response).await;
            assert!(json["error"].as_str().unwrap().starts_with("Malformed request body"));
            assert!(json.get("feature").is_none());
        }
    }
}
