//! Calendar endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;

use calcard_core::store::{Collection, NewCollection};
use calcard_core::SyncReport;

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/calendars", get(list_calendars).post(create_calendar))
        .route("/calendars/{id}", get(get_calendar))
        .route("/calendars/{id}/changes", get(changes))
}

/// GET /calendars - List all calendars
async fn list_calendars(State(state): State<AppState>) -> Result<Json<Vec<Collection>>, AppError> {
    Ok(Json(state.service.calendars().await?))
}

/// POST /calendars - Create a calendar
async fn create_calendar(
    State(state): State<AppState>,
    Json(req): Json<NewCollection>,
) -> Result<(StatusCode, Json<Collection>), AppError> {
    let calendar = state.service.create_calendar(req).await?;
    Ok((StatusCode::CREATED, Json(calendar)))
}

/// GET /calendars/{id}
async fn get_calendar(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Collection>, AppError> {
    Ok(Json(state.service.calendar(&id).await?))
}

#[derive(Deserialize)]
pub struct ChangesQuery {
    pub token: Option<String>,
}

/// GET /calendars/{id}/changes?token= - Changes since a sync token
async fn changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(state.service.sync_changes(&id, query.token.as_deref()).await?))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_list_calendars() {
        let app = app();
        let response = send(
            &app,
            json_request("POST", "/calendars", json!({ "name": "Team Meetings", "color": "#28a745" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["path"], "team-meetings");
        assert_eq!(created["color"], "#28a745");

        let listed = body_json(send(&app, empty_request("GET", "/calendars")).await).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let id = created["id"].as_str().unwrap();
        let fetched = send(&app, empty_request("GET", &format!("/calendars/{}", id))).await;
        assert_eq!(fetched.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_calendar_is_bad_request() {
        let app = app();
        let response = send(&app, json_request("POST", "/calendars", json!({ "name": "  " }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_input");

        let missing = send(&app, empty_request("GET", "/calendars/nope")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_changes_with_unknown_token() {
        let app = app();
        let id = create_calendar(&app, "Work").await;

        let initial = body_json(send(&app, empty_request("GET", &format!("/calendars/{}/changes", id))).await).await;
        assert!(initial["entries"].as_array().unwrap().is_empty());
        assert!(initial["token"].is_string());

        let response = send(&app, empty_request("GET", &format!("/calendars/{}/changes?token=bogus", id))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["code"], "invalid_sync_token");
    }
}
