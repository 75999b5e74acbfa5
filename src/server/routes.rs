//! API route handlers.
//!
//! All endpoints return the JSON envelope `{success, …}` on success and
//! `{success: false, error, message}` on failure. The progress endpoint
//! streams server-sent events: a current-state snapshot first, then live
//! bus events until the job reaches a terminal state.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use chrono::Utc;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::middleware::ApiError;
use super::AppState;
use crate::auth::AuthContext;
use crate::jobs::{enqueue_job, EnrichPayload, JobSpec};
use crate::progress::ProgressEvent;
use crate::queue::{job_id, EnqueueOptions};
use crate::types::{EnrichmentStatus, JenguError, Location, Property};

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartEnrichmentRequest {
    pub property_id: String,
    #[serde(default)]
    pub location: Option<LocationBody>,
    #[serde(default)]
    pub country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LocationBody {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub city: Option<String>,
}

/// POST /enrichment/start
pub async fn start_enrichment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<StartEnrichmentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.property_id.trim().is_empty() {
        return Err(JenguError::Validation("property_id is required".into()).into());
    }

    // First sight of a property with a location in the request creates
    // it; otherwise it must already exist.
    let property = state.store.get_property(&body.property_id).await?;
    let property = match (property, &body.location) {
        (Some(p), _) => p,
        (None, Some(loc)) => {
            let mut location = Location::at(loc.latitude, loc.longitude);
            location.city = loc.city.clone();
            location.country_code = body.country_code.clone();
            let p = Property::new(&body.property_id, &auth.user_id, &body.property_id, location);
            state.store.put_property(&p).await?;
            p
        }
        (None, None) => {
            return Err(ApiError::not_found(&format!(
                "property {} (provide a location to register it)",
                body.property_id
            )))
        }
    };

    // Re-runs are allowed from any settled state.
    if property
        .enrichment_status
        .can_transition_to(EnrichmentStatus::Pending)
    {
        state
            .store
            .set_enrichment_status(&property.property_id, EnrichmentStatus::Pending, None, None)
            .await?;
    }

    let spec = JobSpec::Enrich(EnrichPayload {
        property_id: property.property_id.clone(),
    });
    let job_id = enqueue_job(state.queue.as_ref(), &spec, EnqueueOptions::default()).await?;
    state
        .store
        .set_latest_enrichment_job(&property.property_id, &job_id)
        .await?;

    info!(property_id = %property.property_id, job_id, "Enrichment started");
    Ok(Json(json!({"success": true, "job_id": job_id})))
}

/// GET /enrichment/status/:id — accepts a job id or a property id.
pub async fn enrichment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Family-prefixed ids go straight to the queue.
    if job_id::has_valid_family(&id) {
        let job = state
            .queue
            .get(&id)
            .await?
            .ok_or_else(|| ApiError::not_found(&format!("job {id}")))?;
        return Ok(Json(json!({
            "success": true,
            "status": job.state,
            "progress": job.progress,
            "error": job.last_error,
        })));
    }

    // Otherwise treat it as a property id and resolve the latest
    // enrichment job for that property.
    let property = state
        .store
        .get_property(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(&format!("property {id}")))?;

    if let Some(latest) = state.store.latest_enrichment_job(&id).await? {
        if let Some(job) = state.queue.get(&latest).await? {
            return Ok(Json(json!({
                "success": true,
                "job_id": latest,
                "status": job.state,
                "progress": job.progress,
                "error": job.last_error,
            })));
        }
    }

    // No live job. An already-enriched property reads as complete.
    if property.enrichment_status == EnrichmentStatus::Completed {
        return Ok(Json(json!({
            "success": true,
            "status": "complete",
            "enriched_at": property.enriched_at,
            "warning": property.enrichment_warning,
        })));
    }
    Ok(Json(json!({
        "success": true,
        "status": property.enrichment_status,
        "error": property.enrichment_error,
    })))
}

// ---------------------------------------------------------------------------
// Neighborhood index
// ---------------------------------------------------------------------------

/// GET /neighborhood-index/:property_id/latest
pub async fn index_latest(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = state
        .store
        .latest_index(&property_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&format!("no index for property {property_id}")))?;
    Ok(Json(json!({"success": true, "index": row})))
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    #[serde(default = "default_trend_days")]
    pub days: u32,
}

fn default_trend_days() -> u32 {
    30
}

/// GET /neighborhood-index/:property_id/trend?days=N
pub async fn index_trend(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
    Query(query): Query<TrendQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let days = query.days.clamp(1, 365);
    let rows = state.store.index_trend(&property_id, days).await?;
    Ok(Json(json!({
        "success": true,
        "days": days,
        "rows": rows,
    })))
}

// ---------------------------------------------------------------------------
// Progress (SSE)
// ---------------------------------------------------------------------------

struct SseState {
    snapshot: Option<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
    done: bool,
}

/// GET /progress/:job_id — snapshot first, then live events; the stream
/// closes after a terminal event. Subscribers that lag are dropped.
pub async fn progress_stream(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !job_id::has_valid_family(&job_id) {
        return Err(JenguError::Validation(format!("unrecognised job id {job_id:?}")).into());
    }

    // Subscribe before the probe so no event falls in the gap.
    let rx = state.bus.subscribe(&job_id);
    let job = state
        .queue
        .get(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&format!("job {job_id}")))?;
    let snapshot = ProgressEvent::status_of(&job);
    let done = job.state.is_terminal();
    debug!(job_id, "Progress subscriber attached");

    let stream = futures::stream::unfold(
        SseState {
            snapshot: Some(snapshot),
            rx,
            done,
        },
        |mut st| async move {
            if let Some(snapshot) = st.snapshot.take() {
                let event = to_sse(&snapshot);
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.rx.recv().await {
                Ok(event) => {
                    st.done = matches!(
                        event,
                        ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. }
                    );
                    Some((Ok(to_sse(&event)), st))
                }
                // Lagged or closed: drop the subscriber, no replay.
                Err(_) => None,
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &ProgressEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// GET /live
pub async fn live() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// GET /ready — readiness requires the queue to answer.
pub async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.queue.repeatables().await?;
    Ok(Json(json!({"status": "ready"})))
}

/// GET /version
pub async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now(),
    }))
}
