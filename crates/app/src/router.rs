use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;

use corpdir_core::types::Company;
use corpdir_storage::{Database, Tracking};

use crate::problem::ApiError;
use crate::service::ServiceManager;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database) -> Self {
        Self { metrics, storage }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    /// Assembles the request-scoped service facade.
    ///
    /// Every call produces a fresh unit of work, so staged state never
    /// crosses request boundaries.
    pub fn services(&self) -> ServiceManager {
        ServiceManager::new(self.storage())
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/companies", get(list_companies))
        .route("/api/companies/:id", get(get_company))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

async fn list_companies(State(state): State<AppState>) -> Result<Json<Vec<Company>>, ApiError> {
    let started = Instant::now();
    let result = state
        .services()
        .companies
        .get_all_companies(Tracking::ReadOnly)
        .await;
    histogram!("api_request_duration_seconds", "route" => "list_companies")
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(companies) => {
            counter!("api_requests_total", "route" => "list_companies", "result" => "ok")
                .increment(1);
            Ok(Json(companies))
        }
        Err(err) => {
            counter!("api_requests_total", "route" => "list_companies", "result" => "error")
                .increment(1);
            Err(ApiError::from(err))
        }
    }
}

async fn get_company(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Company>, ApiError> {
    match state
        .services()
        .companies
        .get_company(&id, Tracking::ReadOnly)
        .await
    {
        Ok(company) => {
            counter!("api_requests_total", "route" => "get_company", "result" => "ok").increment(1);
            Ok(Json(company))
        }
        Err(err) => {
            counter!("api_requests_total", "route" => "get_company", "result" => "error")
                .increment(1);
            Err(ApiError::from(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn setup_state() -> (AppState, TempDir) {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("api.db").display());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        (AppState::new(metrics, database), dir)
    }

    async fn seed_company(state: &AppState, name: &str, address: &str, country: &str) -> Company {
        let company = Company::new(name, address, country);
        let mut unit = state.storage().unit_of_work();
        unit.companies().create(&company);
        unit.save().await.expect("seed commit");
        company
    }

    async fn body_text(response: Response) -> String {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn list_companies_returns_empty_array_for_empty_store() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/companies")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "[]");
    }

    #[tokio::test]
    async fn list_companies_returns_rows_in_name_order() {
        let (state, _dir) = setup_state().await;
        seed_company(&state, "C2", "A2", "CA").await;
        seed_company(&state, "C1", "A1", "US").await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/companies")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json body");
        let rows = body.as_array().expect("array body");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "C1");
        assert_eq!(rows[0]["address"], "A1");
        assert_eq!(rows[0]["country"], "US");
        assert_eq!(rows[1]["name"], "C2");
        assert_eq!(rows[1]["country"], "CA");
    }

    #[tokio::test]
    async fn get_company_returns_the_row() {
        let (state, _dir) = setup_state().await;
        let company = seed_company(&state, "Acme", "12 Main St", "US").await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/companies/{}", company.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json body");
        assert_eq!(body["id"], company.id.as_str());
        assert_eq!(body["name"], "Acme");
    }

    #[tokio::test]
    async fn get_company_maps_unknown_id_to_404() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/companies/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("application/problem+json")
        );
    }

    #[tokio::test]
    async fn get_company_rejects_malformed_id_with_400() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/companies/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_text(response).await;
        assert!(body.contains("invalid id"));
    }

    #[tokio::test]
    async fn storage_failures_collapse_to_an_opaque_500() {
        let (state, _dir) = setup_state().await;
        state.storage().pool().close().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/companies")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_text(response).await;
        assert_eq!(body, "Internal server error");
    }
}
