//! Dataset catalog routes

use crate::catalog::Dataset;
use crate::error::{not_found_error, ApiResult};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct DatasetListResponse {
    pub success: bool,
    pub datasets: Vec<Dataset>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct DatasetResponse {
    pub success: bool,
    pub dataset: Dataset,
}

/// GET /v1/datasets
pub async fn list_datasets(State(state): State<SharedState>) -> ApiResult<Json<DatasetListResponse>> {
    let datasets = state.catalog.list().await;
    Ok(Json(DatasetListResponse {
        success: true,
        total: datasets.len(),
        datasets,
    }))
}

/// GET /v1/datasets/{id}
pub async fn get_dataset(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DatasetResponse>> {
    let dataset = state
        .catalog
        .get(&id)
        .await
        .ok_or_else(|| not_found_error(format!("Dataset '{}' not found", id)))?;

    Ok(Json(DatasetResponse {
        success: true,
        dataset,
    }))
}
