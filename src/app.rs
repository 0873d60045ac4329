//! Stackmerge HTTP application: routes run requests to the runner.

use crate::app_state::SharedAppState;
use crate::dataset::{Dataset, RawFileDataset};
use crate::error::EngineError;
use crate::metrics;
use crate::models::{RunRequest, RunResponse};
use crate::partition::PartitionHint;
use crate::roi::Roi;
use crate::udfs;
use crate::validated_json::ValidatedJson;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::{Layer, ServiceBuilder};
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Application service type
pub type Service = NormalizePath<Router>;

/// Returns a [axum::Router] for the Stackmerge application
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    fn v1() -> Router<SharedAppState> {
        Router::new()
            .route("/run/:udf", post(run))
            .route("/runs/:run_id", delete(cancel))
            .route("/udfs", get(list_udfs))
    }

    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/v1", v1())
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .on_request(metrics::request_counter)
                    .on_response(metrics::record_response_metrics),
            ),
        )
        .with_state(state)
}

/// Returns a [crate::app::Service] for the Stackmerge application
///
/// The router is wrapped so that paths with a trailing slash are routed like those without.
pub fn service(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

/// Names of the available UDFs
async fn list_udfs() -> Json<[&'static str; 4]> {
    Json(udfs::NAMES)
}

/// Handler for run requests
///
/// Runs the UDF to completion or cancellation and responds with the aggregate. The run executes
/// in its own task and is cancelled if the client goes away.
///
/// # Arguments
///
/// * `state`: Shared application state
/// * `udf`: Name of the UDF to run
/// * `request`: Run request data
#[tracing::instrument(skip(state, request))]
async fn run(
    State(state): State<SharedAppState>,
    Path(udf): Path<String>,
    ValidatedJson(request): ValidatedJson<RunRequest>,
) -> Result<Json<RunResponse>, EngineError> {
    let udf = udfs::by_name(&udf)?;
    let dataset: Arc<dyn Dataset> = Arc::new(RawFileDataset::open(&request.dataset)?);
    let roi = request
        .roi
        .map(|mask| Roi::new(&request.dataset.nav_shape, mask))
        .transpose()?;
    let runner = match request.partitions {
        Some(count) => state.runner.with_hint(PartitionHint::Count(count)),
        None => state.runner.clone(),
    };
    let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
    let token = state.register_run(run_id).await?;
    let _guard = token.drop_guard();

    let handle = tokio::spawn({
        let state = state.clone();
        async move {
            let outcome = runner
                .run_with_id(run_id, dataset, udf, roi.as_ref(), &token)
                .await;
            state.finish_run(run_id).await;
            outcome
        }
    });
    let outcome = handle.await.map_err(|err| EngineError::WorkerFailure {
        worker: "server".to_string(),
        reason: err.to_string(),
    })??;
    Ok(Json(RunResponse::new(run_id, outcome)))
}

/// Handler for cancellation requests
///
/// Raises the cancel token of a run in progress. The run's own request then completes with the
/// partial aggregate.
async fn cancel(
    State(state): State<SharedAppState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    state.cancel_run(run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
