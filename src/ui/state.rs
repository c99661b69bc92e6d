use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::inference::InferenceRow;
use crate::mapping::MappingCache;
use crate::media::MediaService;
use crate::query_service::QueryService;

/// Shared handles for the HTTP handlers.
pub struct AppState {
    pub conn: Arc<ConnectionManager>,
    pub mappings: Arc<MappingCache>,
    pub query: Arc<QueryService>,
    pub media: Arc<MediaService>,
    pub ui: Mutex<UiState>,
    /// "" or "/prefix"
    pub root_path: String,
    pub default_limit: u32,
}

impl AppState {
    pub fn new(
        conn: Arc<ConnectionManager>,
        query: Arc<QueryService>,
        media: Arc<MediaService>,
        root_path: Option<String>,
        default_limit: u32,
    ) -> Self {
        Self {
            conn,
            mappings: Arc::clone(query.mappings()),
            query,
            media,
            ui: Mutex::new(UiState::default()),
            root_path: root_path.unwrap_or_default(),
            default_limit,
        }
    }

    pub fn media_url(&self, relative: &str) -> String {
        format!("{}/media/{}", self.root_path, relative)
    }
}

/// Rendered selection, replayed when the same row is clicked again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionView {
    pub index: usize,
    pub media_key: String,
    pub details: String,
    pub gif_url: Option<String>,
    pub video_url: Option<String>,
    pub notices: Vec<String>,
}

/// Results of the last query and the current row selection.
#[derive(Debug, Default)]
pub struct UiState {
    pub rows: Vec<InferenceRow>,
    pub selection: Option<SelectionView>,
}

impl UiState {
    pub fn replace_results(&mut self, rows: Vec<InferenceRow>) {
        self.rows = rows;
        self.selection = None;
    }

    /// Cached view if `index` is the current selection.
    pub fn cached_selection(&self, index: usize) -> Option<SelectionView> {
        self.selection.as_ref().filter(|s| s.index == index).cloned()
    }
}
