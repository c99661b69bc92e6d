#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};

use cv_trace_dashboard::config::MediaConfig;
use cv_trace_dashboard::connection::ConnectionManager;
use cv_trace_dashboard::error::{DashboardError, Result};
use cv_trace_dashboard::inference::InferenceRow;
use cv_trace_dashboard::mapping::{CameraEntry, FarmEntry, MappingCache, TenantEntry};
use cv_trace_dashboard::query_service::{InferenceTables, QueryService};
use cv_trace_dashboard::storage::{ObjectFetcher, ObjectUri};
use cv_trace_dashboard::warehouse::{ResultSet, SessionFactory, SqlSession, Statement};

pub const FRAME_1: &str = "gs://cv-frames/frames-to-analyze/042_0000015_2024-01-15T08:30:12_1.jpg";
pub const FRAME_2: &str = "gs://cv-frames/frames-to-analyze/042_0000015_2024-01-15T08:30:12_2.jpg";
pub const VIDEO: &str = "gs://cv-videos/video-to-analyze/042_0000015_2024-01-15T08:30:12.mp4";

// ─── Warehouse ───────────────────────────────────────────────────────────────

/// In-memory warehouse. Answers by table name and records every statement.
#[derive(Default)]
pub struct FakeWarehouse {
    pub executes: AtomicUsize,
    pub connects: AtomicUsize,
    pub statements: Mutex<Vec<Statement>>,
    /// Sessions handed out while this is non-zero report themselves dead.
    pub dead_sessions: AtomicUsize,
    /// Executions left that fail with a connection error.
    pub failing_executes: AtomicUsize,
}

impl FakeWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn last_statement(&self) -> Option<Statement> {
        self.statements.lock().unwrap().last().cloned()
    }

    fn answer(&self, stmt: &Statement) -> ResultSet {
        if stmt.sql.contains("stage1_data") {
            linked_rows()
        } else if stmt.sql.contains("DISTINCT farm_id") {
            single_column("farm_id", &["f1", "f2"])
        } else if stmt.sql.contains("DISTINCT camera_id") {
            single_column("camera_id", &["c1", "c2"])
        } else {
            ResultSet::default()
        }
    }
}

struct FakeSession {
    warehouse: Arc<FakeWarehouse>,
    alive: bool,
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn is_alive(&self) -> bool {
        self.alive
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        self.warehouse.executes.fetch_add(1, Ordering::SeqCst);
        self.warehouse.statements.lock().unwrap().push(statement.clone());
        let failing = &self.warehouse.failing_executes;
        if failing.load(Ordering::SeqCst) > 0 {
            failing.fetch_sub(1, Ordering::SeqCst);
            return Err(DashboardError::Connection("connection reset by peer".into()));
        }
        Ok(self.warehouse.answer(statement))
    }
}

pub struct FakeFactory(pub Arc<FakeWarehouse>);

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn connect(&self) -> Result<Arc<dyn SqlSession>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        let dead = &self.0.dead_sessions;
        let alive = if dead.load(Ordering::SeqCst) > 0 {
            dead.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        };
        Ok(Arc::new(FakeSession { warehouse: Arc::clone(&self.0), alive }))
    }

    fn describe(&self) -> String {
        "fake-warehouse".to_string()
    }
}

fn single_column(name: &str, values: &[&str]) -> ResultSet {
    ResultSet::new(vec![name.to_string()], values.iter().map(|v| vec![Some(v.to_string())]).collect())
}

const LINKED_COLUMNS: [&str; 16] = [
    "session_id",
    "farm_id",
    "camera_id",
    "stage1_timestamp",
    "stage1_category",
    "stage1_confidence",
    "stage1_should_forward",
    "frame_uris",
    "trigger_frame_uri",
    "stage2_inference_id",
    "stage2_classification",
    "stage2_confidence",
    "stage2_should_forward",
    "video_gcs_path",
    "blk_file",
    "event_timestamp",
];

/// Three Stage 1 rows; the first two reached Stage 2.
pub fn linked_rows() -> ResultSet {
    let frames = serde_json::json!([FRAME_2, FRAME_1]).to_string();
    let row = |session: &str, camera: &str, ts: &str, s2: Option<(&str, &str)>, video: Option<&str>| {
        let cell = |v: &str| Some(v.to_string());
        vec![
            cell(session),
            cell("f1"),
            cell(camera),
            cell(&format!("2024-01-15 {}", ts)),
            cell("down_cow"),
            cell("0.91"),
            cell("true"),
            cell(&frames),
            cell(FRAME_1),
            s2.map(|(id, _)| id.to_string()),
            s2.map(|(_, class)| class.to_string()),
            s2.map(|_| "0.8".to_string()),
            s2.map(|_| "false".to_string()),
            video.map(str::to_string),
            cell("042_0000015"),
            cell(&format!("2024-01-15T{}", ts)),
        ]
    };
    ResultSet::new(
        LINKED_COLUMNS.iter().map(|c| c.to_string()).collect(),
        vec![
            row("s-1", "c1", "08:30:12", Some(("inf-1", "down_cow")), Some(VIDEO)),
            row("s-2", "c2", "08:10:00", Some(("inf-2", "no_event")), Some("gs://cv-videos/gone.mp4")),
            row("s-3", "c1", "07:55:41", None, None),
        ],
    )
}

pub fn mappings() -> MappingCache {
    MappingCache::from_entries(
        [
            TenantEntry { id: "t1".into(), name: "Acme Dairy".into(), ui_url: None, slug: Some("acme".into()) },
            TenantEntry { id: "t2".into(), name: "Empty Co".into(), ui_url: None, slug: None },
        ],
        [
            FarmEntry { id: "f1".into(), name: "North".into(), tenant_id: Some("t1".into()) },
            FarmEntry { id: "f2".into(), name: "South".into(), tenant_id: Some("t1".into()) },
        ],
        [
            CameraEntry { id: "c1".into(), name: "Barn A".into(), farm_id: Some("f1".into()) },
            CameraEntry { id: "c2".into(), name: "Barn B".into(), farm_id: Some("f1".into()) },
        ],
    )
}

pub fn tables() -> InferenceTables {
    InferenceTables { stage1: "cat.bronze.stage1".into(), stage2: "cat.bronze.stage2".into() }
}

pub async fn query_service(warehouse: &Arc<FakeWarehouse>) -> (Arc<ConnectionManager>, Arc<QueryService>) {
    let conn = Arc::new(ConnectionManager::init(Arc::new(FakeFactory(Arc::clone(warehouse)))).await.unwrap());
    let query = Arc::new(QueryService::new(Arc::clone(&conn), Arc::new(mappings()), tables()));
    (conn, query)
}

// ─── Object store ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBucket {
    objects: Mutex<HashMap<String, Bytes>>,
    /// Objects whose next fetch fails with a connection error.
    flaky: Mutex<HashSet<String>>,
    pub fetches: AtomicUsize,
}

impl FakeBucket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, uri: &str, body: Bytes) {
        self.objects.lock().unwrap().insert(uri.to_string(), body);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail_once(&self, uri: &str) {
        self.flaky.lock().unwrap().insert(uri.to_string());
    }

    /// Both frames and the video of the first linked row.
    pub fn with_event_media() -> Arc<Self> {
        let bucket = Self::new();
        bucket.put(FRAME_1, png(64, 48, 40));
        bucket.put(FRAME_2, png(64, 48, 200));
        bucket.put(VIDEO, Bytes::from_static(b"\x00\x00\x00\x18ftypmp42fake-video"));
        bucket
    }
}

#[async_trait]
impl ObjectFetcher for FakeBucket {
    async fn fetch(&self, uri: &ObjectUri) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = uri.to_string();
        if self.flaky.lock().unwrap().remove(&key) {
            return Err(DashboardError::Connection(format!("timeout fetching {}", key)));
        }
        self.objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(DashboardError::MediaNotFound(key))
    }
}

pub fn png(width: u32, height: u32, shade: u8) -> Bytes {
    let img = RgbaImage::from_pixel(width, height, Rgba([shade, 0, 255 - shade, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    Bytes::from(out.into_inner())
}

pub fn media_config(root: &std::path::Path, max_bundles: usize) -> MediaConfig {
    MediaConfig {
        root: Some(root.display().to_string()),
        max_bundles,
        transcode: false,
        ..MediaConfig::default()
    }
}

/// Linked rows as the query service would return them.
pub fn rows() -> Vec<InferenceRow> {
    linked_rows().records().map(|r| InferenceRow::from_record(&r)).collect()
}
