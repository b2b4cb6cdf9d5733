use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tracing::info;

use super::{
    models::{
        AllotmentRequest, ArchiveResponse, BatchCreatedResponse, BatchView, DeadLetterQuery,
        DeadLetterView, HealthResponse, JobView, QuotaResetResponse, SubmissionRequest,
    },
    state::{AppState, LAST_MAINTENANCE_KEY},
    utils::{
        attachment_disposition, owner_id, parse_content_type, require_admin, validate_body_size,
    },
};
use crate::api::error::ApiError;
use crate::submission::Submission;

/// Reads a JSON request body.
///
/// Decompression is handled by `RequestDecompressionLayer`, so this sees the
/// decoded bytes.
async fn read_json<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<T, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;
    parse_content_type(content_type)?;

    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::InvalidPayload(err.to_string()))?
        .to_bytes();
    validate_body_size(&data, state.config.server.max_payload_bytes.as_usize())?;

    Ok(serde_json::from_slice(&data)?)
}

/// Validation preview (POST /batches/preview)
///
/// Reports per-line results, the number of jobs a confirmation would create
/// and whether the owner's quota covers them. Creates nothing.
pub async fn preview_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let request = read_json::<SubmissionRequest>(&state, &headers, body).await?;
    let preview = state
        .submissions
        .preview(&owner, &request.into_entries())
        .await?;

    Ok((StatusCode::OK, Json(preview)))
}

/// Batch creation (POST /batches)
///
/// Validates again, charges quota and enqueues one job per valid unique
/// entry. Returns 202 since verification runs in the background.
pub async fn create_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let request = read_json::<SubmissionRequest>(&state, &headers, body).await?;
    let source = request.source.clone();

    let confirmation = state
        .submissions
        .confirm(Submission {
            owner_id: owner,
            source,
            entries: request.into_entries(),
        })
        .await?;

    let response = BatchCreatedResponse {
        batch_id: confirmation.batch_id,
        total_jobs: confirmation.total_jobs,
        invalid: confirmation.invalid,
        duplicates: confirmation.duplicates,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Owner's batches, newest first (GET /batches)
pub async fn list_batches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let batches: Vec<BatchView> = state
        .submissions
        .batches(&owner)?
        .into_iter()
        .map(BatchView::from)
        .collect();
    Ok(Json(batches))
}

/// Batch status and progress (GET /batches/{id})
pub async fn get_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let batch = state.submissions.batch(&owner, &batch_id)?;
    Ok(Json(BatchView::from(batch)))
}

/// Jobs of a batch in submission order (GET /batches/{id}/jobs)
pub async fn batch_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let expose = state.expose_traces();
    let mut jobs = state.submissions.batch_jobs(&owner, &batch_id)?;
    jobs.sort_by_key(|job| job.line_number);

    let views: Vec<JobView> = jobs
        .into_iter()
        .map(|job| JobView::from_job(job, expose))
        .collect();
    Ok(Json(views))
}

/// Stop scheduling a batch's pending jobs (POST /batches/{id}/cancel)
pub async fn cancel_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let batch = state.submissions.cancel(&owner, &batch_id)?;
    info!(batch_id = %batch.id, owner_id = %owner, "Cancel requested via API");
    Ok(Json(BatchView::from(batch)))
}

/// Remove a finished or canceled batch (DELETE /batches/{id})
pub async fn delete_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    state.submissions.delete(&owner, &batch_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Build (or reuse) the batch archive (POST /batches/{id}/archive)
pub async fn pack_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let archive = state.submissions.pack(&owner, &batch_id).await?;
    let status = if archive.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ArchiveResponse::from(archive))))
}

/// Download the batch archive (GET /batches/{id}/archive)
pub async fn download_archive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let download = state
        .submissions
        .download_archive(&owner, &batch_id)
        .await?;

    let response_headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            attachment_disposition(&download.name),
        ),
    ];
    Ok((StatusCode::OK, response_headers, download.bytes))
}

/// Single job (GET /jobs/{id})
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let job = state.submissions.job(&owner, &job_id)?;
    Ok(Json(JobView::from_job(job, state.expose_traces())))
}

/// Owner's quota account (GET /quota)
pub async fn get_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_id(&headers)?;
    let quota = state.submissions.quota(&owner).await?;
    Ok(Json(quota))
}

/// Zero one owner's usage (POST /admin/quota/{owner}/reset)
pub async fn admin_reset_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(owner): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&headers, state.config.server.admin_token.as_deref())?;
    state.quota.reset(&owner).await?;
    info!(owner_id = %owner, "Quota reset by admin");
    Ok(Json(state.quota.account(&owner).await?))
}

/// Change one owner's monthly allotment (PUT /admin/quota/{owner})
pub async fn admin_set_allotment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(owner): Path<String>,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&headers, state.config.server.admin_token.as_deref())?;
    let request = read_json::<AllotmentRequest>(&state, &headers, body).await?;
    state
        .quota
        .set_allotment(&owner, request.monthly_allotment)
        .await?;
    info!(
        owner_id = %owner,
        monthly_allotment = request.monthly_allotment,
        "Quota allotment changed by admin"
    );
    Ok(Json(state.quota.account(&owner).await?))
}

/// Roll over every account whose period has ended (POST /admin/quota/reset-due)
pub async fn admin_reset_due_quotas(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&headers, state.config.server.admin_token.as_deref())?;
    let reset = state.quota.reset_due(Utc::now().date_naive()).await?;
    Ok(Json(QuotaResetResponse { reset }))
}

/// Jobs that exhausted their attempts (GET /admin/dead-letters?limit=N)
pub async fn admin_dead_letters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeadLetterQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&headers, state.config.server.admin_token.as_deref())?;
    let dead = state.queue.read().await.list_dlq(query.limit)?;
    let views: Vec<DeadLetterView> = dead
        .into_iter()
        .map(|(seq, task)| DeadLetterView::new(seq, task))
        .collect();
    Ok(Json(views))
}

fn status_of(healthy: bool) -> String {
    let status = if healthy { "healthy" } else { "unhealthy" };
    status.to_string()
}

/// Health check endpoint (GET /health)
///
/// Reports each component plus the metric counters. Returns 503 if any
/// component is unhealthy.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = BTreeMap::new();
    components.insert("api".to_string(), status_of(true));
    let last_maintenance = state.store.get_meta(LAST_MAINTENANCE_KEY);
    components.insert(
        "ledger".to_string(),
        status_of(last_maintenance.is_ok()),
    );
    components.insert(
        "dispatcher".to_string(),
        status_of(state.dispatcher.is_healthy()),
    );
    components.insert(
        "queue".to_string(),
        status_of(state.queue.read().await.health_check().is_ok()),
    );
    components.insert(
        "storage".to_string(),
        status_of(state.packager.storage().list("archives/").await.is_ok()),
    );

    let all_healthy = components.values().all(|status| status == "healthy");
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: status_of(all_healthy),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
        last_maintenance: last_maintenance.ok().flatten(),
        metrics: state.metrics.snapshot(),
    };

    (status_code, Json(response))
}
