//! Event endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use calcard_core::store::{ETag, StoredItem};
use calcard_core::{Instance, MutationScope, NewEvent, OccurrenceKey, TimeRange, EventPatch};

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/calendars/{id}/events", get(list_events).post(create_event))
        .route(
            "/events/{uuid}",
            get(get_event).patch(update_event).delete(delete_event),
        )
        .route("/events/{uuid}/move", post(move_event))
}

/// Event JSON with its entity tag in the `ETag` header.
fn with_etag(status: StatusCode, item: StoredItem) -> Result<Response, AppError> {
    let etag = HeaderValue::from_str(&item.etag.quoted())?;
    Ok((status, [(header::ETAG, etag)], Json(item)).into_response())
}

/// `If-Match` as an expected entity tag; `*` matches anything.
fn if_match(headers: &HeaderMap) -> Option<ETag> {
    headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "*")
        .map(ETag::parse)
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Expand recurring events into instances (default true)
    pub expand: Option<bool>,
}

/// GET /calendars/{id}/events?start&end&expand
async fn list_events(
    State(state): State<AppState>,
    Path(calendar_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Instance>>, AppError> {
    let range = TimeRange::from_args(query.start.as_deref(), query.end.as_deref())?;
    let instances = state
        .service
        .list_events(&calendar_id, &range, query.expand.unwrap_or(true))
        .await?;
    Ok(Json(instances))
}

/// POST /calendars/{id}/events - Create a new event
async fn create_event(
    State(state): State<AppState>,
    Path(calendar_id): Path<String>,
    Json(req): Json<NewEvent>,
) -> Result<Response, AppError> {
    let item = state.service.create_event(&calendar_id, req).await?;
    with_etag(StatusCode::CREATED, item)
}

/// GET /events/{uuid}
async fn get_event(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, AppError> {
    with_etag(StatusCode::OK, state.service.get_event(&uuid).await?)
}

/// Which part of a series a mutation applies to.
#[derive(Deserialize)]
pub struct MutationQuery {
    #[serde(default)]
    pub scope: Option<String>,
    /// Occurrence key (`YYYYMMDDThhmmssZ`) for `this` and `this_and_future`
    #[serde(default)]
    pub recurrence_id: Option<String>,
}

impl MutationQuery {
    fn parse(&self) -> Result<(MutationScope, Option<OccurrenceKey>), AppError> {
        let scope: MutationScope = self.scope.as_deref().unwrap_or_default().parse()?;
        let key = self
            .recurrence_id
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(str::parse::<OccurrenceKey>)
            .transpose()?;
        Ok((scope, key))
    }
}

/// PATCH /events/{uuid}?scope&recurrence_id
async fn update_event(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<MutationQuery>,
    headers: HeaderMap,
    Json(patch): Json<EventPatch>,
) -> Result<Response, AppError> {
    let (scope, key) = query.parse()?;
    let expected = if_match(&headers);
    let item = state
        .service
        .update_event(&uuid, &patch, scope, key, expected.as_ref())
        .await?;
    with_etag(StatusCode::OK, item)
}

/// DELETE /events/{uuid}?scope&recurrence_id
async fn delete_event(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<MutationQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let (scope, key) = query.parse()?;
    let expected = if_match(&headers);
    state
        .service
        .delete_event(&uuid, scope, key, expected.as_ref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct MoveRequest {
    pub calendar_id: String,
}

/// POST /events/{uuid}/move - Move an event to another calendar
async fn move_event(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(req): Json<MoveRequest>,
) -> Result<Response, AppError> {
    with_etag(StatusCode::OK, state.service.move_event(&uuid, &req.calendar_id).await?)
}
