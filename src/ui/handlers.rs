use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::formatters::{details_text, display_rows, status_line, DisplayRow, COLUMNS};
use super::state::{AppState, SelectionView};
use crate::error::DashboardError;
use crate::mapping::Choice;
use crate::query_service::{parse_date, selection, FilterInput, ALL};

const DASHBOARD_HTML: &str = include_str!("dashboard.html");

/// Error rendered as `{ "error": ... }` with a matching status.
pub struct ApiError(pub DashboardError);

impl From<DashboardError> for ApiError {
    fn from(e: DashboardError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DashboardError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            DashboardError::Authentication(_) => StatusCode::UNAUTHORIZED,
            DashboardError::Permission(_) => StatusCode::FORBIDDEN,
            DashboardError::MediaNotFound(_) => StatusCode::NOT_FOUND,
            DashboardError::Connection(_) | DashboardError::Query(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.banner() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(DASHBOARD_HTML.replace("{{ROOT_PATH}}", &state.root_path))
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "warehouse": state.conn.state().to_string(),
        "media_root": state.media.root().display().to_string(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChoicesParams {
    pub tenant: Option<String>,
    pub farm: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChoicesResponse {
    pub tenants: Vec<Choice>,
    pub farms: Vec<Choice>,
    pub cameras: Vec<Choice>,
}

fn with_all(mut choices: Vec<Choice>) -> Vec<Choice> {
    choices.insert(0, Choice { label: ALL.to_string(), value: ALL.to_string() });
    choices
}

/// Cascading dropdowns from the mapping cache.
pub async fn choices(State(state): State<Arc<AppState>>, Query(params): Query<ChoicesParams>) -> Json<ChoicesResponse> {
    let tenant = selection(params.tenant);
    let farm = selection(params.farm);
    let m = &state.mappings;

    let cameras = match (&farm, &tenant) {
        (Some(f), _) => m.camera_choices(Some(f.as_str())),
        (None, Some(t)) => {
            let farms = m.farm_ids_for_tenant(t);
            m.camera_choices(None)
                .into_iter()
                .filter(|c| m.farm_of_camera(&c.value).is_some_and(|f| farms.iter().any(|id| id == f)))
                .collect()
        }
        (None, None) => m.camera_choices(None),
    };

    Json(ChoicesResponse {
        tenants: with_all(m.tenant_choices()),
        farms: with_all(m.farm_choices(tenant.as_deref())),
        cameras: with_all(cameras),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct FiltersParams {
    pub date: Option<String>,
    pub tenant: Option<String>,
    pub farm: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FiltersResponse {
    pub farms: Vec<Choice>,
    pub cameras: Vec<Choice>,
    pub status: String,
}

/// Farms and cameras that actually have Stage 1 data on a date.
pub async fn filters(State(state): State<Arc<AppState>>, Query(params): Query<FiltersParams>) -> ApiResult<FiltersResponse> {
    let date = parse_date(params.date.as_deref().unwrap_or(""))?;
    let tenant = selection(params.tenant);
    let farm = selection(params.farm);

    let farms = state.query.available_farms(date, tenant.as_deref()).await?;
    let cameras = state.query.available_cameras(date, farm.as_deref()).await?;
    let status = format!("Loaded {} farms and {} cameras for {}", farms.len(), cameras.len(), date);

    Ok(Json(FiltersResponse { farms: with_all(farms), cameras: with_all(cameras), status }))
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub columns: Vec<&'static str>,
    pub rows: Vec<DisplayRow>,
    pub count: usize,
    pub status: String,
}

pub async fn run_query(State(state): State<Arc<AppState>>, Query(input): Query<FilterInput>) -> ApiResult<QueryResponse> {
    let filters = input.into_filters(state.default_limit)?;
    let summary = filters.summary(&state.mappings);

    let rows = state.query.query(&filters).await?;
    let display = display_rows(&rows, &state.mappings);
    let count = rows.len();
    state.ui.lock().await.replace_results(rows);

    Ok(Json(QueryResponse {
        columns: COLUMNS.to_vec(),
        rows: display,
        count,
        status: status_line(count, &summary),
    }))
}

/// Row selection: media fetch plus details. Media failures degrade to notices.
pub async fn select_row(State(state): State<Arc<AppState>>, Path(index): Path<usize>) -> ApiResult<SelectionView> {
    let row = {
        let ui = state.ui.lock().await;
        if let Some(cached) = ui.cached_selection(index) {
            return Ok(Json(cached));
        }
        ui.rows
            .get(index)
            .cloned()
            .ok_or_else(|| DashboardError::InvalidFilter(format!("no row {} in the current results", index)))?
    };

    let details = details_text(&row, &state.mappings);
    let media_key = row.media_key();
    let (view, settled) = match state.media.fetch_media(&row).await {
        Ok(bundle) => {
            let settled = !bundle.retryable;
            let view = SelectionView {
                index,
                media_key,
                details,
                gif_url: bundle.gif_relative().map(|p| state.media_url(&p)),
                video_url: bundle.video_relative().map(|p| state.media_url(&p)),
                notices: bundle.notices,
            };
            (view, settled)
        }
        Err(e) => {
            warn!("Media for row {} unavailable: {}", index, e);
            let settled = matches!(e, DashboardError::MediaNotFound(_));
            let view =
                SelectionView { index, media_key, details, gif_url: None, video_url: None, notices: vec![e.banner()] };
            (view, settled)
        }
    };
    info!(
        "Selected row {} (gif: {}, video: {})",
        index,
        view.gif_url.is_some(),
        view.video_url.is_some()
    );

    let mut ui = state.ui.lock().await;
    if settled && ui.rows.get(index).is_some_and(|r| r.media_key() == view.media_key) {
        ui.selection = Some(view.clone());
    }
    Ok(Json(view))
}
