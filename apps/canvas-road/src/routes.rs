use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use canvas_core::{
    CanvasError, HeatmapEntry, PixelUpdate, PlacementRecord, Snapshot, COLOR_COUNT, MAX_HISTORY,
    PALETTE,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::session::ConnectionSnapshot;
use crate::state::SharedState;
use crate::websocket::websocket_handler;

const DEFAULT_HISTORY: usize = 100;
const DEFAULT_HEATMAP_HOURS: u32 = 24;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/debug/connections", get(list_connections))
        .route("/canvas", delete(clear_canvas))
        .route("/canvas/init", post(initialize_canvas))
        .route("/canvas/info", get(canvas_info))
        .route("/canvas/snapshot", get(get_snapshot))
        .route("/canvas/pixel", post(place_pixel))
        .route("/canvas/pixel/:x/:y", get(get_pixel))
        .route("/canvas/heatmap", get(get_heatmap))
        .route("/canvas/history", get(get_history))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Canvas(CanvasError),
    /// A path, query or body the extractors could not parse.
    Rejected(StatusCode, String),
    Unauthorized,
    Forbidden(&'static str),
}

impl From<CanvasError> for ApiError {
    fn from(err: CanvasError) -> Self {
        ApiError::Canvas(err)
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    success: bool,
    reason: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            ApiError::Canvas(err) => {
                let status = match &err {
                    CanvasError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    CanvasError::StoreUnavailable(_) | CanvasError::DegradedEffect { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    CanvasError::Inconsistent { .. } => StatusCode::CONFLICT,
                };
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
            ApiError::Rejected(status, reason) => (status, reason),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.to_string()),
        };
        (
            status,
            Json(ApiErrorBody {
                success: false,
                reason,
            }),
        )
            .into_response()
    }
}

fn require_admin(state: &SharedState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Forbidden("admin endpoints are disabled"));
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "consistent": state.canvas.is_consistent().await,
        "connections": state.registry.len(),
    }))
}

async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

async fn list_connections(State(state): State<SharedState>) -> Json<Vec<ConnectionSnapshot>> {
    Json(state.registry.snapshot())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CanvasInfo {
    pub width: u32,
    pub height: u32,
    pub zone_size: u32,
    pub color_count: u8,
    pub palette: Vec<String>,
}

async fn canvas_info(State(state): State<SharedState>) -> Json<CanvasInfo> {
    let config = state.canvas.config();
    Json(CanvasInfo {
        width: config.grid.width,
        height: config.grid.height,
        zone_size: config.zone_size,
        color_count: COLOR_COUNT,
        palette: PALETTE.iter().map(|hex| hex.to_string()).collect(),
    })
}

async fn get_snapshot(State(state): State<SharedState>) -> ApiResult<Snapshot> {
    Ok(Json(state.canvas.get_snapshot().await?))
}

#[derive(Debug, Deserialize)]
pub struct PlacePixelRequest {
    pub x: i64,
    pub y: i64,
    pub color: i64,
    pub actor: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlacePixelResponse {
    pub success: bool,
    pub update: PixelUpdate,
}

async fn place_pixel(
    State(state): State<SharedState>,
    request: Result<Json<PlacePixelRequest>, JsonRejection>,
) -> ApiResult<PlacePixelResponse> {
    let Json(request) = request?;
    let update = state
        .canvas
        .place_cell(request.x, request.y, request.color, &request.actor)
        .await?;
    Ok(Json(PlacePixelResponse {
        success: true,
        update,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PixelResponse {
    pub x: i64,
    pub y: i64,
    pub color: u8,
}

async fn get_pixel(
    State(state): State<SharedState>,
    path: Result<Path<(i64, i64)>, PathRejection>,
) -> ApiResult<PixelResponse> {
    let Path((x, y)) = path?;
    let color = state.canvas.get_cell(x, y).await?;
    Ok(Json(PixelResponse { x, y, color }))
}

#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    hours: Option<u32>,
    #[serde(default)]
    fresh: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeatmapResponse {
    pub window_hours: u32,
    pub zone_size: u32,
    pub columns: u32,
    pub rows: u32,
    pub zones: Vec<HeatmapEntry>,
}

async fn get_heatmap(
    State(state): State<SharedState>,
    query: Result<Query<HeatmapQuery>, QueryRejection>,
) -> ApiResult<HeatmapResponse> {
    let Query(query) = query?;
    let window_hours = query.hours.unwrap_or(DEFAULT_HEATMAP_HOURS);
    let zones = state.canvas.get_heatmap(window_hours, query.fresh).await?;
    let (columns, rows) = state.canvas.zones().zone_grid();
    Ok(Json(HeatmapResponse {
        window_hours,
        zone_size: state.canvas.config().zone_size,
        columns,
        rows,
        zones,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

async fn get_history(
    State(state): State<SharedState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Vec<PlacementRecord>> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY).min(MAX_HISTORY);
    Ok(Json(state.canvas.recent_placements(limit).await?))
}

async fn clear_canvas(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;
    state.canvas.clear_canvas().await?;
    state.canvas.initialize().await?;
    Ok(Json(json!({ "success": true })))
}

async fn initialize_canvas(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;
    state.canvas.initialize().await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, SessionRegistry};
    use crate::state::AppState;
    use crate::telemetry::detached_metrics_handle;
    use axum::body::{self, Body};
    use axum::http::Request;
    use canvas_bus::LocalBus;
    use canvas_core::{Backends, Canvas, CanvasConfig, Fault, GridSize, MemoryStore};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    const TOKEN: &str = "test-admin";

    fn app() -> (Router, SharedState, Arc<MemoryStore>) {
        let memory = MemoryStore::new();
        let canvas = Canvas::new(
            CanvasConfig {
                grid: GridSize::new(8, 8),
                zone_size: 4,
                ..CanvasConfig::default()
            },
            Backends::in_memory(memory.clone(), Arc::new(LocalBus::new())),
        )
        .unwrap();
        let state = AppState::new(
            canvas,
            SessionRegistry::new(SessionConfig::default()),
            detached_metrics_handle(),
            Some(TOKEN.to_string()),
        );
        (build_router(state.clone()), state, memory)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn place(x: i64, y: i64, color: i64) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/canvas/pixel")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "x": x, "y": y, "color": color, "actor": "tester" }).to_string(),
            ))
            .unwrap()
    }

    fn admin(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn placed_pixels_are_readable() {
        let (app, state, _memory) = app();
        let (status, body) = call(&app, place(3, 2, 11)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["update"]["color"], 11);
        assert_eq!(body["update"]["actor"], "tester");

        let (status, body) = call(&app, get("/canvas/pixel/3/2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["color"], 11);

        state.canvas.settle().await;
        let (status, body) = call(&app, get("/canvas/snapshot")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cells"], json!([[3, 2, 11]]));
        assert_eq!(body["width"], 8);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn out_of_range_reads_are_background() {
        let (app, _state, _memory) = app();
        let (status, body) = call(&app, get("/canvas/pixel/-1/40")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["color"], 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn invalid_placements_are_bad_requests() {
        let (app, _state, _memory) = app();
        for request in [place(8, 0, 1), place(0, 0, 16), place(0, 0, -2)] {
            let (status, body) = call(&app, request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["success"], false);
            assert!(body["reason"].as_str().unwrap().contains("invalid input"));
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn malformed_requests_get_json_errors() {
        let (app, _state, _memory) = app();
        let malformed_body = Request::builder()
            .method("POST")
            .uri("/canvas/pixel")
            .header("content-type", "application/json")
            .body(Body::from("{\"x\": 1"))
            .unwrap();
        for request in [
            get("/canvas/heatmap?hours=-1"),
            get("/canvas/history?limit=lots"),
            get("/canvas/pixel/a/b"),
            malformed_body,
        ] {
            let (status, body) = call(&app, request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["success"], false);
            assert!(!body["reason"].as_str().unwrap().is_empty());
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn grid_outage_is_service_unavailable() {
        let (app, _state, memory) = app();
        memory.fail(Fault::Fields);
        let (status, body) = call(&app, place(1, 1, 1)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn heatmap_covers_every_zone() {
        let (app, _state, _memory) = app();
        call(&app, place(1, 1, 5)).await;
        call(&app, place(6, 6, 9)).await;
        call(&app, place(7, 5, 2)).await;

        let (status, body) = call(&app, get("/canvas/heatmap?hours=1&fresh=true")).await;
        assert_eq!(status, StatusCode::OK);
        let heatmap: HeatmapResponse = serde_json::from_value(body).unwrap();
        assert_eq!((heatmap.columns, heatmap.rows), (2, 2));
        assert_eq!(heatmap.zones.len(), 4);
        let intensity = |x, y| {
            heatmap
                .zones
                .iter()
                .find(|zone| zone.x == x && zone.y == y)
                .map(|zone| zone.intensity)
        };
        assert_eq!(intensity(0, 0), Some(1));
        assert_eq!(intensity(1, 1), Some(2));
        assert_eq!(intensity(1, 0), Some(0));

        let (status, _) = call(&app, get("/canvas/heatmap?hours=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn history_is_newest_first_and_limited() {
        let (app, state, _memory) = app();
        for color in 1..=3 {
            call(&app, place(0, 0, color)).await;
        }
        state.canvas.settle().await;

        let (status, body) = call(&app, get("/canvas/history?limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<PlacementRecord> = serde_json::from_value(body).unwrap();
        let colors: Vec<u8> = records.iter().map(|r| r.update.color).collect();
        assert_eq!(colors, vec![3, 2]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn info_reports_fixed_dimensions() {
        let (app, _state, _memory) = app();
        let (status, body) = call(&app, get("/canvas/info")).await;
        assert_eq!(status, StatusCode::OK);
        let info: CanvasInfo = serde_json::from_value(body).unwrap();
        assert_eq!((info.width, info.height, info.zone_size), (8, 8, 4));
        assert_eq!(info.color_count, 16);
        assert_eq!(info.palette.len(), 16);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn clearing_requires_the_admin_token() {
        let (app, state, _memory) = app();
        call(&app, place(2, 2, 4)).await;
        state.canvas.settle().await;

        let (status, _) = call(&app, admin("DELETE", "/canvas", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, admin("DELETE", "/canvas", Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, admin("DELETE", "/canvas", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = call(&app, get("/canvas/pixel/2/2")).await;
        assert_eq!(body["color"], 0);
        let (_, body) = call(&app, get("/canvas/snapshot")).await;
        assert_eq!(body["cells"], json!([]));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn partial_clear_conflicts_until_reinitialized() {
        let (app, _state, memory) = app();
        call(&app, place(2, 2, 4)).await;

        memory.fail(Fault::SetDelete);
        let (status, body) = call(&app, admin("DELETE", "/canvas", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        let (status, _) = call(&app, place(1, 1, 1)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        memory.heal(Fault::SetDelete);
        let (status, _) = call(&app, admin("POST", "/canvas/init", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, place(1, 1, 1)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn admin_endpoints_are_disabled_without_a_token() {
        let memory = MemoryStore::new();
        let canvas = Canvas::new(
            CanvasConfig::default(),
            Backends::in_memory(memory, Arc::new(LocalBus::new())),
        )
        .unwrap();
        let state = AppState::new(
            canvas,
            SessionRegistry::new(SessionConfig::default()),
            detached_metrics_handle(),
            None,
        );
        let app = build_router(state);
        let (status, _) = call(&app, admin("POST", "/canvas/init", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn health_and_metrics_respond() {
        let (app, _state, _memory) = app();
        let (status, body) = call(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
