//! Axum + Askama web UI and JSON API for Yardscout.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use yardscout_core::{CompletionKey, DateFilter, InventoryRecord, RowGroup, WatchListDraft};
use yardscout_pipeline::Pipeline;
use yardscout_storage::StoreError;

pub const CRATE_NAME: &str = "yardscout-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DaysQuery {
    days: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    query: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    completed: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    retention_days: u32,
    total_records: usize,
    records: Vec<InventoryRecord>,
}

#[derive(Debug, Clone)]
struct ScavengerYard {
    name: String,
    hot_wheels_count: usize,
    rows: Vec<RowGroup>,
}

#[derive(Template)]
#[template(path = "scavenger.html")]
struct ScavengerTemplate {
    selected_days: String,
    yards: Vec<ScavengerYard>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/scavenger", get(scavenger_page_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/scavenger_filtered", get(scavenger_filtered_handler))
        .route(
            "/api/scavenger_yards/{yard}/rows/{row}/{make}/{model}/{year}",
            put(completion_handler),
        )
        .route(
            "/api/saved_vehicles",
            get(watch_list_handler).post(watch_create_handler),
        )
        .route(
            "/api/saved_vehicles/{id}",
            put(watch_update_handler).delete(watch_delete_handler),
        )
        .route("/api/search_cars", get(search_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("YARDSCOUT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.recent_inventory().await {
        Ok(records) => render_html(IndexTemplate {
            retention_days: state.pipeline.retention_days(),
            total_records: records.len(),
            records,
        }),
        Err(err) => server_error(err),
    }
}

async fn scavenger_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Response {
    let raw_days = query.days.unwrap_or_default();
    let filter = DateFilter::parse(&raw_days);
    match state.pipeline.scavenger_view(filter).await {
        Ok(grouped) => {
            let yards = grouped
                .into_iter()
                .map(|(name, summary)| ScavengerYard {
                    name,
                    hot_wheels_count: summary.hot_wheels_count,
                    rows: summary.rows,
                })
                .collect();
            render_html(ScavengerTemplate {
                selected_days: raw_days,
                yards,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(serde_json::json!({
            "success": true,
            "insertedCount": summary.inserted,
            "message": summary.message,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "success": false,
                "insertedCount": 0,
                "message": err.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn scavenger_filtered_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Response {
    let filter = DateFilter::parse(query.days.as_deref().unwrap_or(""));
    match state.pipeline.scavenger_view(filter).await {
        Ok(grouped) => Json(grouped).into_response(),
        Err(err) => server_error(err),
    }
}

async fn completion_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((yard, row, make, model, year)): AxumPath<(String, String, String, String, u16)>,
    Json(body): Json<CompletionBody>,
) -> Response {
    let key = CompletionKey {
        yard,
        row,
        make,
        model,
        year,
    };
    match state
        .pipeline
        .store()
        .set_completed(&key, body.completed)
        .await
    {
        Ok(updated) => Json(serde_json::json!({ "updated": updated })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn watch_list_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().load_watch_list().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => store_error(err),
    }
}

async fn watch_create_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<WatchListDraft>,
) -> Response {
    match state.pipeline.store().save_watch_entry(draft).await {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn watch_update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(draft): Json<WatchListDraft>,
) -> Response {
    match state.pipeline.store().update_watch_entry(id, draft).await {
        Ok(entry) => Json(entry).into_response(),
        Err(err) => store_error(err),
    }
}

async fn watch_delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.pipeline.store().delete_watch_entry(id).await {
        Ok(()) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state
        .pipeline
        .search(query.query.as_deref().unwrap_or(""))
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    let status = match err {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;
    use yardscout_pipeline::PipelineConfig;
    use yardscout_storage::{InventoryStore, MemoryStore};

    fn seeded_app(
        records: Vec<InventoryRecord>,
    ) -> (Router, Arc<dyn InventoryStore>, tempfile::TempDir) {
        let artifacts = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::with_records(records));
        let config = PipelineConfig {
            database_url: "sqlite::memory:".to_string(),
            artifacts_dir: artifacts.path().join("listings"),
            retention_days: 15,
            user_agent: "yardscout-test".to_string(),
            http_timeout_secs: 5,
            workspace_root: PathBuf::from("."),
        };
        let pipeline = Arc::new(Pipeline::new(config, Arc::clone(&store)).unwrap());
        (app(AppState::new(pipeline)), store, artifacts)
    }

    fn civic() -> InventoryRecord {
        InventoryRecord {
            year: 2012,
            make: "Honda".to_string(),
            model: "Civic".to_string(),
            row: "14".to_string(),
            arrival_date: Utc::now().date_naive(),
            yard: "PNP".to_string(),
            completed: false,
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_page_lists_recent_inventory() {
        let (app, _store, _artifacts) = seeded_app(vec![civic()]);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Yardscout"));
        assert!(text.contains("Civic"));
    }

    #[tokio::test]
    async fn scavenger_filtered_groups_matches_by_yard_and_row() {
        let (app, store, _artifacts) = seeded_app(vec![civic()]);
        store
            .save_watch_entry(WatchListDraft {
                make: "honda".to_string(),
                model: "civic".to_string(),
                min_year: Some(2010),
                max_year: Some(2015),
                part: None,
            })
            .await
            .unwrap();

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/scavenger_filtered?days=all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["PNP"]["hotWheelsCount"], 1);
        assert_eq!(json["PNP"]["rows"][0]["row"], "14");
        assert_eq!(json["PNP"]["rows"][0]["vehicles"][0]["model"], "Civic");
    }

    #[tokio::test]
    async fn scavenger_filtered_with_garbage_days_falls_back_to_all() {
        let (app, store, _artifacts) = seeded_app(vec![civic()]);
        store
            .save_watch_entry(WatchListDraft {
                make: "Honda".to_string(),
                model: "Civic".to_string(),
                min_year: None,
                max_year: None,
                part: None,
            })
            .await
            .unwrap();

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/scavenger_filtered?days=soon")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["PNP"]["hotWheelsCount"], 1);
    }

    #[tokio::test]
    async fn completion_put_updates_matches_and_404s_on_miss() {
        let (app, store, _artifacts) = seeded_app(vec![civic()]);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/api/scavenger_yards/pnp/rows/14/honda/civic/2012")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"completed":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["updated"], 1);
        assert!(store.load_all().await.unwrap()[0].completed);

        let miss = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/api/scavenger_yards/pnp/rows/99/honda/civic/2012")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"completed":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn saved_vehicles_crud_round_trip() {
        let (app, _store, _artifacts) = seeded_app(vec![]);

        let created = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/saved_vehicles")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"make":"Honda","model":"Civic","minYear":2005,"maxYear":2010,"part":"alternator"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let entry = body_json(created).await;
        let id = entry["id"].as_i64().unwrap();

        let listed = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/saved_vehicles")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(listed).await.as_array().unwrap().len(), 1);

        let updated = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(format!("/api/saved_vehicles/{id}"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"make":"Honda","model":"Accord"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);
        assert_eq!(body_json(updated).await["model"], "Accord");

        let deleted = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/saved_vehicles/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        let gone = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/saved_vehicles/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn refresh_failure_reports_success_false_with_cause() {
        // Workspace root "." inside the test has no yards.yaml, so the run
        // fails before any fetch; prior state must be untouched.
        let (app, store, _artifacts) = seeded_app(vec![civic()]);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["insertedCount"], 0);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_cars_matches_across_fields() {
        let (app, _store, _artifacts) = seeded_app(vec![civic()]);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/search_cars?query=hond")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["make"], "Honda");
    }
}
