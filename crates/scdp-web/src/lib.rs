//! Axum JSON query API over the latest SCDP export.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use scdp_core::{Dataset, Delta, Record, Taxonomy};
use scdp_sync::{
    category_counts, filter_records, load_dataset, load_taxonomy, statistics, CategoryCount, RecordFilter, Statistics,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "scdp-web";

const DEFAULT_PER_PAGE: usize = 100;
const MAX_PER_PAGE: usize = 1000;

#[derive(Debug, Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
    pub exports_dir: PathBuf,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            exports_dir: workspace_root.join("exports"),
            workspace_root,
        }
    }

    pub fn with_exports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exports_dir = dir.into();
        self
    }

    fn taxonomy(&self) -> anyhow::Result<Taxonomy> {
        load_taxonomy(self.workspace_root.join("rules").join("taxonomy.yaml"))
    }

    fn dataset(&self) -> anyhow::Result<Option<Dataset>> {
        load_dataset(&self.exports_dir)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecordsQuery {
    market: Option<String>,
    #[serde(alias = "certifying_board")]
    board: Option<String>,
    sector: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

impl RecordsQuery {
    fn filter(&self) -> RecordFilter {
        RecordFilter {
            market: self.market.clone(),
            board: self.board.clone(),
            sector: self.sector.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DatasetMeta {
    generated_at: Option<String>,
    taxonomy_version: Option<u32>,
    dataset_checksum: Option<String>,
}

impl DatasetMeta {
    fn of(dataset: Option<&Dataset>) -> Self {
        Self {
            generated_at: dataset.map(|d| d.generated_at().to_rfc3339()),
            taxonomy_version: dataset.map(Dataset::taxonomy_version),
            dataset_checksum: dataset.map(|d| d.checksum().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordsPage<'a> {
    #[serde(flatten)]
    meta: DatasetMeta,
    total: usize,
    page: usize,
    per_page: usize,
    total_pages: usize,
    records: Vec<&'a Record>,
}

#[derive(Debug, Serialize)]
struct StatisticsResponse {
    #[serde(flatten)]
    meta: DatasetMeta,
    #[serde(flatten)]
    statistics: Statistics,
}

#[derive(Debug, Serialize)]
struct CategoriesResponse {
    taxonomy_version: u32,
    categories: Vec<CategoryCount>,
}

#[derive(Debug, Serialize)]
struct DeltaResponse {
    run_id: Option<String>,
    #[serde(flatten)]
    delta: Delta,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/records", get(records_handler))
        .route("/api/v1/records/{identifier}", get(record_detail_handler))
        .route("/api/v1/statistics", get(statistics_handler))
        .route("/api/v1/markets", get(markets_handler))
        .route("/api/v1/boards", get(boards_handler))
        .route("/api/v1/delta", get(delta_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SCDP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let root = std::env::var("SCDP_WORKSPACE_ROOT").unwrap_or_else(|_| ".".to_string());
    let mut state = AppState::new(root);
    if let Ok(dir) = std::env::var("SCDP_EXPORTS_DIR") {
        state = state.with_exports_dir(dir);
    }
    serve(state, port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, exports = %state.exports_dir.display(), "query api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn records_handler(State(state): State<Arc<AppState>>, Query(query): Query<RecordsQuery>) -> Response {
    let dataset = match state.dataset() {
        Ok(dataset) => dataset,
        Err(err) => return server_error(err),
    };
    let all = dataset.as_ref().map(Dataset::records).unwrap_or_default();
    let filtered = filter_records(all, &query.filter());

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let total = filtered.len();
    let records = filtered.into_iter().skip((page - 1) * per_page).take(per_page).collect();

    Json(RecordsPage {
        meta: DatasetMeta::of(dataset.as_ref()),
        total,
        page,
        per_page,
        total_pages,
        records,
    })
    .into_response()
}

async fn record_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(identifier): AxumPath<String>,
) -> Response {
    match state.dataset() {
        Ok(dataset) => match dataset.as_ref().and_then(|d| d.get(&identifier)) {
            Some(record) => Json(record).into_response(),
            None => not_found(format!("no record with identifier {identifier}")),
        },
        Err(err) => server_error(err),
    }
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.dataset() {
        Ok(dataset) => {
            let records = dataset.as_ref().map(Dataset::records).unwrap_or_default();
            Json(StatisticsResponse {
                meta: DatasetMeta::of(dataset.as_ref()),
                statistics: statistics(records),
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn markets_handler(State(state): State<Arc<AppState>>) -> Response {
    categories(&state, |tax, stats| category_counts(&tax.markets, &stats.by_market))
}

async fn boards_handler(State(state): State<Arc<AppState>>) -> Response {
    categories(&state, |tax, stats| category_counts(&tax.certifying_boards, &stats.by_board))
}

fn categories(state: &AppState, pick: impl Fn(&Taxonomy, &Statistics) -> Vec<CategoryCount>) -> Response {
    let loaded = state.taxonomy().and_then(|tax| Ok((tax, state.dataset()?)));
    match loaded {
        Ok((taxonomy, dataset)) => {
            let stats = statistics(dataset.as_ref().map(Dataset::records).unwrap_or_default());
            Json(CategoriesResponse {
                taxonomy_version: taxonomy.version,
                categories: pick(&taxonomy, &stats),
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn delta_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_latest_delta(&state.workspace_root) {
        Ok(Some((run_id, delta))) => Json(DeltaResponse {
            run_id: Some(run_id),
            delta,
        })
        .into_response(),
        Ok(None) => Json(DeltaResponse {
            run_id: None,
            delta: Delta::default(),
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct RunStamp {
    started_at: DateTime<Utc>,
}

fn run_started_at(run_dir: &Path) -> Option<DateTime<Utc>> {
    let text = std::fs::read_to_string(run_dir.join("run_summary.json")).ok()?;
    serde_json::from_str::<RunStamp>(&text).ok().map(|s| s.started_at)
}

/// Delta of the run that started last, by `run_summary.json`; the directory
/// name breaks ties and orders runs without a summary.
fn load_latest_delta(workspace_root: &Path) -> anyhow::Result<Option<(String, Delta)>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(None);
    }
    let mut runs = std::fs::read_dir(&reports_root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.join("delta.json").exists())
        .map(|p| (run_started_at(&p), p))
        .collect::<Vec<_>>();
    runs.sort();
    let Some((_, latest)) = runs.pop() else {
        return Ok(None);
    };
    let run_id = latest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let delta = serde_json::from_str(&std::fs::read_to_string(latest.join("delta.json"))?)?;
    Ok(Some((run_id, delta)))
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
