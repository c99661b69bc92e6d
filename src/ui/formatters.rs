//! Table rows and details text for the dashboard and the CLI.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::inference::InferenceRow;
use crate::mapping::MappingCache;

pub const NA: &str = "N/A";
const RAW_RESPONSE_LIMIT: usize = 2000;

pub const COLUMNS: [&str; 10] = [
    "Farm",
    "Camera",
    "Stage 1 Time",
    "Event Timestamp",
    "S1 Category",
    "S1 Conf",
    "S1 Forward",
    "S2 Class",
    "S2 Conf",
    "S2 Forward",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayRow {
    pub farm: String,
    pub camera: String,
    pub stage1_time: String,
    pub event_timestamp: String,
    pub s1_category: String,
    pub s1_conf: String,
    pub s1_forward: String,
    pub s2_class: String,
    pub s2_conf: String,
    pub s2_forward: String,
}

impl DisplayRow {
    pub fn cells(&self) -> [&str; 10] {
        [
            &self.farm,
            &self.camera,
            &self.stage1_time,
            &self.event_timestamp,
            &self.s1_category,
            &self.s1_conf,
            &self.s1_forward,
            &self.s2_class,
            &self.s2_conf,
            &self.s2_forward,
        ]
    }
}

pub fn display_row(row: &InferenceRow, mappings: &MappingCache) -> DisplayRow {
    let s2 = row.stage2.as_ref();
    DisplayRow {
        farm: row.farm_id.as_deref().map_or_else(|| NA.to_string(), |f| mappings.farm_name(f)),
        camera: row.camera_id.as_deref().map_or_else(|| NA.to_string(), |c| mappings.camera_name(c)),
        stage1_time: timestamp(row.stage1.timestamp),
        event_timestamp: text(row.event_timestamp.as_deref()),
        s1_category: text(row.stage1.category.as_deref()),
        s1_conf: confidence(row.stage1.confidence),
        s1_forward: check(row.stage1.should_forward),
        s2_class: text(s2.and_then(|s| s.classification.as_deref())),
        s2_conf: confidence(s2.and_then(|s| s.confidence)),
        s2_forward: check(s2.and_then(|s| s.should_forward)),
    }
}

pub fn display_rows(rows: &[InferenceRow], mappings: &MappingCache) -> Vec<DisplayRow> {
    rows.iter().map(|r| display_row(r, mappings)).collect()
}

pub fn confidence(v: Option<f64>) -> String {
    v.map_or_else(|| NA.to_string(), |c| format!("{:.3}", c))
}

pub fn check(v: Option<bool>) -> String {
    match v {
        Some(true) => "✓".to_string(),
        Some(false) => "✗".to_string(),
        None => NA.to_string(),
    }
}

fn yes_no(v: Option<bool>) -> &'static str {
    match v {
        Some(true) => "Yes ✓",
        Some(false) => "No ✗",
        None => NA,
    }
}

pub fn timestamp(v: Option<NaiveDateTime>) -> String {
    v.map_or_else(|| NA.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn text(v: Option<&str>) -> String {
    v.filter(|s| !s.is_empty()).unwrap_or(NA).to_string()
}

/// "Found N results | Date: …" or "No results found. Filters: …".
pub fn status_line(count: usize, filter_summary: &str) -> String {
    if count == 0 {
        format!("No results found. Filters: {}", filter_summary)
    } else {
        format!("Found {} results | {}", count, filter_summary)
    }
}

/// Plain-text details for the selected row.
pub fn details_text(row: &InferenceRow, mappings: &MappingCache) -> String {
    let mut out: Vec<String> = Vec::new();
    let farm_id = row.farm_id.as_deref();
    let camera_id = row.camera_id.as_deref();

    out.push(format!("Session ID: {}", text(row.session_id.as_deref())));
    out.push(String::new());
    out.push("═══ Location ═══".into());
    if let Some(t) = row.tenant_id.as_deref() {
        out.push(format!("  Tenant: {}", mappings.tenant_name(t)));
    }
    out.push(format!("  Farm: {}", farm_id.map_or_else(|| NA.to_string(), |f| mappings.farm_name(f))));
    out.push(format!("  Farm ID: {}", text(farm_id)));
    out.push(format!("  Camera: {}", camera_id.map_or_else(|| NA.to_string(), |c| mappings.camera_name(c))));
    out.push(format!("  Camera ID: {}", text(camera_id)));
    out.push(String::new());

    let s1 = &row.stage1;
    out.push("═══ Stage 1 Results ═══".into());
    out.push(format!("  Category: {}", text(s1.category.as_deref())));
    out.push(format!("  Confidence: {}", confidence(s1.confidence)));
    out.push(format!("  Should Forward: {}", yes_no(s1.should_forward)));
    out.push(format!("  Frame Count: {}", s1.frame_uris.len()));
    out.push(format!("  Timestamp: {}", timestamp(s1.timestamp)));
    out.push(String::new());

    out.push("═══ Stage 2 Results ═══".into());
    match &row.stage2 {
        Some(s2) => {
            out.push(format!("  Classification: {}", text(s2.classification.as_deref())));
            out.push(format!("  Confidence: {}", confidence(s2.confidence)));
            out.push(format!("  Should Forward: {}", yes_no(s2.should_forward)));
        }
        None => out.push("  (No Stage 2 processing - event not forwarded)".into()),
    }

    out.push(String::new());
    out.push("═══ Stage 1 Raw Response ═══".into());
    out.push(raw_response(s1.raw_response.as_deref()));
    out.push(String::new());
    out.push("═══ Stage 2 Raw Response ═══".into());
    out.push(raw_response(row.stage2.as_ref().and_then(|s| s.raw_response.as_deref())));

    out.join("\n")
}

/// Pretty JSON when it parses, otherwise unescaped text cut at 2000 characters.
pub fn raw_response(raw: Option<&str>) -> String {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return "  (No raw response available)".to_string();
    };
    let unescaped = raw.replace("\\n", "\n");
    match serde_json::from_str::<serde_json::Value>(&unescaped) {
        Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(unescaped),
        Err(_) => unescaped.replace("\\\"", "\"").chars().take(RAW_RESPONSE_LIMIT).collect(),
    }
}
