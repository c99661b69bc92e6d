//! Linked Stage 1 / Stage 2 inference rows.

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;

use crate::warehouse::Record;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassProbabilities {
    pub animal_husbandry: Option<f64>,
    pub down_cow: Option<f64>,
    pub quick_movements: Option<f64>,
    pub no_event: Option<f64>,
}

/// Frame-level detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage1Detection {
    pub timestamp: Option<NaiveDateTime>,
    pub category: Option<String>,
    pub confidence: Option<f64>,
    pub should_forward: Option<bool>,
    pub frame_uris: Vec<String>,
    pub trigger_frame_uri: Option<String>,
    pub probabilities: ClassProbabilities,
    pub raw_response: Option<String>,
}

/// Video-level classification, present only when the join matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage2Classification {
    pub inference_id: String,
    pub timestamp: Option<NaiveDateTime>,
    pub classification: Option<String>,
    pub confidence: Option<f64>,
    pub should_forward: Option<bool>,
    pub video_uri: Option<String>,
    pub video_filename: Option<String>,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRow {
    pub session_id: Option<String>,
    pub tenant_id: Option<String>,
    pub farm_id: Option<String>,
    pub camera_id: Option<String>,
    pub blk_file: Option<String>,
    /// `YYYY-MM-DDTHH:MM:SS` key shared by the trigger frame and the video file name
    pub event_timestamp: Option<String>,
    pub stage1: Stage1Detection,
    pub stage2: Option<Stage2Classification>,
    /// Stage 2 video path, or the trigger frame path rewritten to the video bucket layout
    pub derived_video_uri: Option<String>,
}

impl InferenceRow {
    /// Build from one linked query record. `tenant_id` is filled in by the caller.
    pub fn from_record(r: &Record<'_>) -> Self {
        let frame_uris = r.get("frame_uris").map(parse_string_array).unwrap_or_default();
        let trigger_frame_uri = r.string("trigger_frame_uri").or_else(|| frame_uris.first().cloned());

        let stage1 = Stage1Detection {
            timestamp: r.get("stage1_timestamp").and_then(parse_timestamp),
            category: r.string("stage1_category"),
            confidence: r.f64("stage1_confidence"),
            should_forward: r.bool("stage1_should_forward"),
            frame_uris,
            trigger_frame_uri,
            probabilities: ClassProbabilities {
                animal_husbandry: r.f64("probability_animal_husbandry"),
                down_cow: r.f64("probability_down_cow"),
                quick_movements: r.f64("probability_quick_movements"),
                no_event: r.f64("probability_no_event"),
            },
            raw_response: r.string("stage1_raw_response"),
        };

        let stage2 = r.string("stage2_inference_id").map(|inference_id| Stage2Classification {
            inference_id,
            timestamp: r.get("stage2_timestamp").and_then(parse_timestamp),
            classification: r.string("stage2_classification"),
            confidence: r.f64("stage2_confidence"),
            should_forward: r.bool("stage2_should_forward"),
            video_uri: r.string("video_gcs_path"),
            video_filename: r.string("video_filename"),
            raw_response: r.string("stage2_raw_response"),
        });

        let derived_video_uri = r
            .string("video_url_derived")
            .or_else(|| derive_video_uri(stage2.as_ref(), stage1.trigger_frame_uri.as_deref()));

        Self {
            session_id: r.string("session_id"),
            tenant_id: None,
            farm_id: r.string("farm_id"),
            camera_id: r.string("camera_id"),
            blk_file: r.string("blk_file"),
            event_timestamp: r.string("event_timestamp"),
            stage1,
            stage2,
            derived_video_uri,
        }
    }

    /// Filesystem-safe key for this row's media directory.
    pub fn media_key(&self) -> String {
        let parts = [
            self.camera_id.as_deref(),
            self.blk_file.as_deref(),
            self.event_timestamp.as_deref(),
        ];
        let raw = if parts.iter().all(Option::is_none) {
            self.session_id.clone().unwrap_or_else(|| "row".to_string())
        } else {
            parts.iter().map(|p| p.unwrap_or("na")).collect::<Vec<_>>().join("_")
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect()
    }

    /// Video to fetch: only rows that reached Stage 2 have one.
    pub fn video_uri(&self) -> Option<&str> {
        self.stage2.as_ref()?.video_uri.as_deref()
    }
}

fn derive_video_uri(stage2: Option<&Stage2Classification>, trigger: Option<&str>) -> Option<String> {
    if let Some(uri) = stage2.and_then(|s| s.video_uri.clone()) {
        return Some(uri);
    }
    let trigger = trigger?.replace("frames-to-analyze", "video-to-analyze");
    Some(match trigger.strip_suffix(".jpg") {
        Some(stem) => format!("{}.mp4", stem),
        None => trigger,
    })
}

/// Array columns arrive JSON-encoded in JSON_ARRAY results.
pub fn parse_string_array(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<Option<String>>>(raw) {
        Ok(items) => items.into_iter().flatten().collect(),
        Err(_) => raw
            .trim_matches(|c: char| c == '[' || c == ']')
            .split(',')
            .map(|s| s.trim().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` and `YYYY-MM-DDTHH:MM:SS[.fff]`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}
