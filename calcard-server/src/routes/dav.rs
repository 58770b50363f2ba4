//! WebDAV-Sync (RFC 6578) collection reports and the resources they name

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};

use calcard_core::{CalCardError, SyncReport, SyncStatus};

use crate::routes::AppError;
use crate::state::AppState;

/// Sync tokens are URIs on the wire; the store's token follows this prefix.
const SYNC_TOKEN_PREFIX: &str = "urn:calcard:sync:";

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

const CALENDAR_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dav/calendars/{id}", any(collection))
        .route("/dav/calendars/{id}/", any(collection))
        .route("/dav/calendars/{id}/{resource}", get(resource))
}

/// A parsed `DAV:sync-collection` request body.
#[derive(Debug, PartialEq, Eq)]
struct SyncCollectionRequest {
    /// Empty or absent means initial sync
    token: Option<String>,
}

fn parse_sync_collection(body: &str) -> Result<SyncCollectionRequest, CalCardError> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| CalCardError::InvalidInput(format!("malformed XML body: {e}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != "sync-collection" || root.tag_name().namespace() != Some("DAV:") {
        return Err(CalCardError::InvalidInput(format!(
            "expected DAV:sync-collection, got {}",
            root.tag_name().name()
        )));
    }

    let level = root
        .children()
        .find(|n| n.tag_name().name() == "sync-level")
        .and_then(|n| n.text())
        .map(str::trim);
    if let Some(level) = level {
        if level != "1" {
            return Err(CalCardError::InvalidInput(format!("unsupported sync-level {level}")));
        }
    }

    let token = root
        .children()
        .find(|n| n.tag_name().name() == "sync-token")
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.strip_prefix(SYNC_TOKEN_PREFIX).unwrap_or(t).to_string());

    Ok(SyncCollectionRequest { token })
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_multistatus(calendar_id: &str, report: &SyncReport) -> String {
    let mut responses = String::new();
    for entry in &report.entries {
        let href = escape_xml(&format!("/dav/calendars/{}/{}", calendar_id, entry.resource_path));
        let body = match &entry.status {
            SyncStatus::Ok { etag } => format!(
                r#"
    <D:propstat>
      <D:prop>
        <D:getetag>{}</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>"#,
                escape_xml(etag)
            ),
            SyncStatus::NotFound => "\n    <D:status>HTTP/1.1 404 Not Found</D:status>".to_string(),
        };
        responses.push_str(&format!(
            "\n  <D:response>\n    <D:href>{}</D:href>{}\n  </D:response>",
            href, body
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">{}
  <D:sync-token>{}{}</D:sync-token>
</D:multistatus>
"#,
        responses,
        SYNC_TOKEN_PREFIX,
        escape_xml(report.token.as_str())
    )
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response()
}

/// The precondition a client must react to by discarding its state and
/// syncing from scratch.
fn invalid_sync_token() -> Response {
    xml_response(
        StatusCode::FORBIDDEN,
        r#"<?xml version="1.0" encoding="utf-8"?>
<D:error xmlns:D="DAV:">
  <D:valid-sync-token/>
</D:error>
"#
        .to_string(),
    )
}

/// REPORT /dav/calendars/{id}/ with a DAV:sync-collection body
async fn collection(
    State(state): State<AppState>,
    Path(calendar_id): Path<String>,
    method: Method,
    body: String,
) -> Result<Response, AppError> {
    if method.as_str() != "REPORT" {
        return Ok((StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "REPORT")]).into_response());
    }

    let request = parse_sync_collection(&body)?;
    match state
        .service
        .sync_changes(&calendar_id, request.token.as_deref())
        .await
    {
        Ok(report) => Ok(xml_response(
            StatusCode::MULTI_STATUS,
            render_multistatus(&calendar_id, &report),
        )),
        Err(CalCardError::InvalidSyncToken(token)) => {
            tracing::debug!(calendar = %calendar_id, token = %token, "Rejected sync token");
            Ok(invalid_sync_token())
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /dav/calendars/{id}/{resource}: the payload behind a sync report href
async fn resource(
    State(state): State<AppState>,
    Path((calendar_id, path)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let item = state.service.get_resource(&calendar_id, &path).await?;
    let etag = HeaderValue::from_str(&item.etag.quoted())?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(CALENDAR_CONTENT_TYPE)), (header::ETAG, etag)],
        item.ics,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;

    fn sync_request(calendar_id: &str, token: &str) -> Request<Body> {
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<D:sync-collection xmlns:D="DAV:">
  <D:sync-token>{}</D:sync-token>
  <D:sync-level>1</D:sync-level>
  <D:prop><D:getetag/></D:prop>
</D:sync-collection>"#,
            token
        );
        Request::builder()
            .method("REPORT")
            .uri(format!("/dav/calendars/{}/", calendar_id))
            .header("content-type", "application/xml")
            .header("depth", "1")
            .body(Body::from(body))
            .unwrap()
    }

    /// Pull the token out of a multistatus body.
    fn token_of(xml: &str) -> String {
        let doc = roxmltree::Document::parse(xml).unwrap();
        doc.descendants()
            .find(|n| n.tag_name().name() == "sync-token")
            .and_then(|n| n.text())
            .unwrap()
            .to_string()
    }

    fn hrefs_and_statuses(xml: &str) -> Vec<(String, bool)> {
        let doc = roxmltree::Document::parse(xml).unwrap();
        doc.descendants()
            .filter(|n| n.tag_name().name() == "response")
            .map(|response| {
                let href = response
                    .descendants()
                    .find(|n| n.tag_name().name() == "href")
                    .and_then(|n| n.text())
                    .unwrap()
                    .to_string();
                let has_etag = response.descendants().any(|n| n.tag_name().name() == "getetag");
                (href, has_etag)
            })
            .collect()
    }

    #[test]
    fn test_parse_sync_collection() {
        let parsed = parse_sync_collection(
            r#"<sync-collection xmlns="DAV:"><sync-token>urn:calcard:sync:abc</sync-token></sync-collection>"#,
        )
        .unwrap();
        assert_eq!(parsed.token.as_deref(), Some("abc"));

        let initial = parse_sync_collection(
            r#"<D:sync-collection xmlns:D="DAV:"><D:sync-token/><D:sync-level>1</D:sync-level></D:sync-collection>"#,
        )
        .unwrap();
        assert_eq!(initial.token, None);

        assert!(parse_sync_collection("<propfind xmlns=\"DAV:\"/>").is_err());
        assert!(parse_sync_collection("not xml").is_err());
        assert!(
            parse_sync_collection(
                r#"<sync-collection xmlns="DAV:"><sync-level>infinite</sync-level></sync-collection>"#
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_sync_collection_round() {
        let app = app();
        let cal = create_calendar(&app, "Work").await;

        let initial = send(&app, sync_request(&cal, "")).await;
        assert_eq!(initial.status(), StatusCode::MULTI_STATUS);
        let initial = body_text(initial).await;
        assert!(hrefs_and_statuses(&initial).is_empty());
        let token = token_of(&initial);
        assert!(token.starts_with(SYNC_TOKEN_PREFIX));

        let created = send(
            &app,
            json_request(
                "POST",
                &format!("/calendars/{}/events", cal),
                json!({ "summary": "Lunch", "start": "2024-01-23T12:00:00Z" }),
            ),
        )
        .await;
        let uuid = body_json(created).await["uuid"].as_str().unwrap().to_string();

        let changed = body_text(send(&app, sync_request(&cal, &token)).await).await;
        assert_eq!(
            hrefs_and_statuses(&changed),
            vec![(format!("/dav/calendars/{}/{}.ics", cal, uuid), true)]
        );

        send(&app, empty_request("DELETE", &format!("/events/{}", uuid))).await;
        let next = token_of(&changed);
        let deleted = body_text(send(&app, sync_request(&cal, &next)).await).await;
        assert_eq!(
            hrefs_and_statuses(&deleted),
            vec![(format!("/dav/calendars/{}/{}.ics", cal, uuid), false)]
        );
        assert!(deleted.contains("404 Not Found"));
    }

    #[tokio::test]
    async fn test_sync_hrefs_can_be_fetched() {
        let app = app();
        let cal = create_calendar(&app, "Work").await;
        let token = token_of(&body_text(send(&app, sync_request(&cal, "")).await).await);

        let created = send(
            &app,
            json_request(
                "POST",
                &format!("/calendars/{}/events", cal),
                json!({ "summary": "Lunch", "start": "2024-01-23T12:00:00Z" }),
            ),
        )
        .await;
        let etag = created.headers()[header::ETAG].to_str().unwrap().to_string();

        let changed = body_text(send(&app, sync_request(&cal, &token)).await).await;
        let (href, _) = hrefs_and_statuses(&changed).remove(0);

        let fetched = send(&app, empty_request("GET", &href)).await;
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(fetched.headers()[header::CONTENT_TYPE], CALENDAR_CONTENT_TYPE);
        assert_eq!(fetched.headers()[header::ETAG].to_str().unwrap(), etag);
        let ics = body_text(fetched).await;
        assert!(ics.starts_with("BEGIN:VCALENDAR"));
        assert!(ics.contains("SUMMARY:Lunch"));

        let missing = send(&app, empty_request("GET", &format!("/dav/calendars/{}/nope.ics", cal))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_token_is_valid_sync_token_precondition() {
        let app = app();
        let cal = create_calendar(&app, "Work").await;

        let response = send(&app, sync_request(&cal, "urn:calcard:sync:unknown")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_text(response).await;
        let doc = roxmltree::Document::parse(&body).unwrap();
        assert_eq!(doc.root_element().tag_name().name(), "error");
        assert!(doc.descendants().any(|n| n.tag_name().name() == "valid-sync-token"));
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        let app = app();
        let cal = create_calendar(&app, "Work").await;
        let response = send(&app, empty_request("PROPFIND", &format!("/dav/calendars/{}/", cal))).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "REPORT");

        let missing = send(&app, sync_request("missing", "")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
