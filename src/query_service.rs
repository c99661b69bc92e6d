//! Linked Stage 1 / Stage 2 queries.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::DatabricksConfig;
use crate::connection::ConnectionManager;
use crate::error::{DashboardError, Result};
use crate::inference::InferenceRow;
use crate::mapping::{Choice, MappingCache};
use crate::warehouse::Statement;

/// Dropdown sentinel for "no filter".
pub const ALL: &str = "All";

const MAX_LIMIT: u32 = 1000;
const MAX_DISTINCT: u32 = 100;

/// Validated filters for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilters {
    pub date: NaiveDate,
    /// `HH:MM:SS`
    pub start_time: Option<String>,
    /// `HH:MM:SS`
    pub end_time: Option<String>,
    pub tenant_id: Option<String>,
    pub farm_id: Option<String>,
    pub camera_id: Option<String>,
    pub forward_only: bool,
    pub limit: u32,
}

impl QueryFilters {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            start_time: None,
            end_time: None,
            tenant_id: None,
            farm_id: None,
            camera_id: None,
            forward_only: false,
            limit: 100,
        }
    }

    /// Human-readable summary used in status lines and logs.
    pub fn summary(&self, mappings: &MappingCache) -> String {
        let mut parts = vec![format!("Date: {}", self.date)];
        if let Some(t) = &self.start_time {
            parts.push(format!("From: {}", t));
        }
        if let Some(t) = &self.end_time {
            parts.push(format!("To: {}", t));
        }
        if let Some(t) = &self.tenant_id {
            parts.push(format!("Tenant: {}", mappings.tenant_name(t)));
        }
        if let Some(f) = &self.farm_id {
            parts.push(format!("Farm: {}", mappings.farm_name(f)));
        }
        if let Some(c) = &self.camera_id {
            parts.push(format!("Camera: {}", mappings.camera_name(c)));
        }
        if self.forward_only {
            parts.push("Forwarded only".to_string());
        }
        parts.join(" | ")
    }
}

/// Raw filter input as submitted by the dashboard or the CLI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterInput {
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub tenant: Option<String>,
    pub farm: Option<String>,
    pub camera: Option<String>,
    #[serde(default)]
    pub forward_only: bool,
    pub limit: Option<u32>,
}

impl FilterInput {
    pub fn into_filters(self, default_limit: u32) -> Result<QueryFilters> {
        let date = parse_date(self.date.as_deref().unwrap_or(""))?;
        let start_time = self.start_time.as_deref().map(|t| parse_time(t, false)).transpose()?.flatten();
        let end_time = self.end_time.as_deref().map(|t| parse_time(t, true)).transpose()?.flatten();
        if let (Some(s), Some(e)) = (&start_time, &end_time) {
            if s > e {
                return Err(DashboardError::InvalidFilter(format!("start time {} is after end time {}", s, e)));
            }
        }
        Ok(QueryFilters {
            date,
            start_time,
            end_time,
            tenant_id: selection(self.tenant),
            farm_id: selection(self.farm),
            camera_id: selection(self.camera),
            forward_only: self.forward_only,
            limit: self.limit.unwrap_or(default_limit).clamp(1, MAX_LIMIT),
        })
    }
}

/// `YYYY-MM-DD`; required.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DashboardError::InvalidFilter("date is required (YYYY-MM-DD)".into()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| DashboardError::InvalidFilter(format!("invalid date '{}', expected YYYY-MM-DD", raw)))
}

/// `HH:MM` or `HH:MM:SS` → `HH:MM:SS`. A bare `HH:MM` end time covers the whole minute.
pub fn parse_time(raw: &str, is_end: bool) -> Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let full = match raw.matches(':').count() {
        1 if is_end => format!("{}:59", raw),
        1 => format!("{}:00", raw),
        _ => raw.to_string(),
    };
    NaiveTime::parse_from_str(&full, "%H:%M:%S")
        .map(|t| Some(t.format("%H:%M:%S").to_string()))
        .map_err(|_| DashboardError::InvalidFilter(format!("invalid time '{}', expected HH:MM or HH:MM:SS", raw)))
}

/// Empty strings and the `All` sentinel mean no filter.
pub fn selection(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty() && s != ALL)
}

#[derive(Debug, Clone)]
pub struct InferenceTables {
    pub stage1: String,
    pub stage2: String,
}

impl InferenceTables {
    pub fn from_config(cfg: &DatabricksConfig) -> Self {
        Self { stage1: cfg.full_stage1_table(), stage2: cfg.full_stage2_table() }
    }
}

/// Build the linked query. `farm_scope` restricts to a set of farms (tenant filter).
pub fn build_linked_statement(
    tables: &InferenceTables,
    filters: &QueryFilters,
    farm_scope: Option<&[String]>,
) -> Statement {
    let mut conditions: Vec<String> = Vec::new();
    let mut stmt = Statement::new(String::new()).bind_date("date", filters.date);

    if let Some(start) = &filters.start_time {
        conditions.push("DATE_FORMAT(s1.stage1_timestamp, 'HH:mm:ss') >= :start_time".into());
        stmt = stmt.bind("start_time", start.as_str());
    }
    if let Some(end) = &filters.end_time {
        conditions.push("DATE_FORMAT(s1.stage1_timestamp, 'HH:mm:ss') <= :end_time".into());
        stmt = stmt.bind("end_time", end.as_str());
    }
    if let Some(farms) = farm_scope {
        let names: Vec<String> = (0..farms.len()).map(|i| format!(":farm_{}", i)).collect();
        conditions.push(format!("s1.farm_id IN ({})", names.join(", ")));
        for (i, farm) in farms.iter().enumerate() {
            stmt = stmt.bind(&format!("farm_{}", i), farm.as_str());
        }
    }
    if let Some(farm) = &filters.farm_id {
        conditions.push("s1.farm_id = :farm_id".into());
        stmt = stmt.bind("farm_id", farm.as_str());
    }
    if let Some(camera) = &filters.camera_id {
        conditions.push("s1.camera_id = :camera_id".into());
        stmt = stmt.bind("camera_id", camera.as_str());
    }
    if filters.forward_only {
        conditions.push("s1.stage1_should_forward = true".into());
    }

    let where_clause = if conditions.is_empty() { "1=1".to_string() } else { conditions.join("\n  AND ") };

    stmt.sql = format!(
        r#"WITH stage1_data AS (
  SELECT
    session_id,
    farm_id,
    camera_id,
    processing_timestamp AS stage1_timestamp,
    highest_probability_category AS stage1_category,
    highest_probability_value AS stage1_confidence,
    should_forward AS stage1_should_forward,
    frame_uris,
    frame_uris[0] AS trigger_frame_uri,
    REGEXP_EXTRACT(frame_uris[0], '/(\\d{{3}}_\\d{{7}})_', 1) AS blk_file,
    REGEXP_EXTRACT(frame_uris[0], '_(\\d{{4}}-\\d{{2}}-\\d{{2}}T\\d{{2}}:\\d{{2}}:\\d{{2}})', 1) AS frame_timestamp_key,
    probability_animal_husbandry,
    probability_down_cow,
    probability_quick_movements,
    probability_no_event,
    gemini_raw_response AS stage1_raw_response
  FROM {stage1}
  WHERE DATE(processing_timestamp) = :date
),
stage2_data AS (
  SELECT
    inference_id AS stage2_inference_id,
    camera_id,
    inference_timestamp AS stage2_timestamp,
    classification AS stage2_classification,
    max_probability_score AS stage2_confidence,
    should_forward AS stage2_should_forward,
    video_gcs_path,
    file_name AS video_filename,
    REGEXP_EXTRACT(file_name, '^(\\d{{3}}_\\d{{7}})_', 1) AS blk_file,
    REGEXP_EXTRACT(file_name, '_(\\d{{4}}-\\d{{2}}-\\d{{2}}T\\d{{2}}:\\d{{2}}:\\d{{2}})', 1) AS video_timestamp_key,
    model_votes AS stage2_raw_response
  FROM {stage2}
  WHERE DATE(inference_timestamp) BETWEEN DATE_SUB(:date, 2) AND DATE_ADD(:date, 2)
)
SELECT
  s1.session_id,
  s1.farm_id,
  s1.camera_id,
  s1.stage1_timestamp,
  s1.stage1_category,
  s1.stage1_confidence,
  s1.stage1_should_forward,
  s1.frame_uris,
  s1.trigger_frame_uri,
  SIZE(s1.frame_uris) AS frame_count,
  s1.probability_animal_husbandry,
  s1.probability_down_cow,
  s1.probability_quick_movements,
  s1.probability_no_event,
  s1.stage1_raw_response,
  s2.stage2_inference_id,
  s2.stage2_timestamp,
  s2.stage2_classification,
  s2.stage2_confidence,
  s2.stage2_should_forward,
  s2.video_gcs_path,
  s2.video_filename,
  s2.stage2_raw_response,
  s1.blk_file,
  s1.frame_timestamp_key AS event_timestamp,
  CASE
    WHEN s2.video_gcs_path IS NOT NULL THEN s2.video_gcs_path
    ELSE REGEXP_REPLACE(
      REGEXP_REPLACE(s1.trigger_frame_uri, 'frames-to-analyze', 'video-to-analyze'),
      '\\.jpg$', '.mp4'
    )
  END AS video_url_derived
FROM stage1_data s1
LEFT JOIN stage2_data s2
  ON s1.camera_id = s2.camera_id
  AND s1.blk_file = s2.blk_file
  AND s1.frame_timestamp_key = s2.video_timestamp_key
WHERE {where_clause}
ORDER BY s1.stage1_timestamp DESC
LIMIT {limit}"#,
        stage1 = tables.stage1,
        stage2 = tables.stage2,
        where_clause = where_clause,
        limit = filters.limit,
    );
    stmt
}

pub struct QueryService {
    conn: Arc<ConnectionManager>,
    mappings: Arc<MappingCache>,
    tables: InferenceTables,
}

impl QueryService {
    pub fn new(conn: Arc<ConnectionManager>, mappings: Arc<MappingCache>, tables: InferenceTables) -> Self {
        Self { conn, mappings, tables }
    }

    pub fn mappings(&self) -> &Arc<MappingCache> {
        &self.mappings
    }

    /// Linked rows in warehouse order.
    pub async fn query(&self, filters: &QueryFilters) -> Result<Vec<InferenceRow>> {
        let farm_scope = match &filters.tenant_id {
            Some(tenant) => {
                let farms = self.mappings.farm_ids_for_tenant(tenant);
                let outside = filters.farm_id.as_ref().is_some_and(|f| !farms.contains(f));
                if farms.is_empty() || outside {
                    info!("No farms for tenant {} match the filters, skipping query", tenant);
                    return Ok(Vec::new());
                }
                Some(farms)
            }
            None => None,
        };

        let stmt = build_linked_statement(&self.tables, filters, farm_scope.as_deref());
        info!("Linked query: {} (limit {})", filters.summary(&self.mappings), filters.limit);
        debug!("SQL:\n{}", stmt.sql);

        let rs = self.conn.execute(&stmt).await?;
        let rows: Vec<InferenceRow> = rs
            .records()
            .map(|r| {
                let mut row = InferenceRow::from_record(&r);
                row.tenant_id = row
                    .farm_id
                    .as_deref()
                    .and_then(|f| self.mappings.tenant_of_farm(f))
                    .map(str::to_string);
                row
            })
            .collect();

        let with_stage2 = rows.iter().filter(|r| r.stage2.is_some()).count();
        info!("Linked query returned {} rows ({} with Stage 2)", rows.len(), with_stage2);
        Ok(rows)
    }

    /// Farms with Stage 1 data on `date`, optionally limited to a tenant.
    pub async fn available_farms(&self, date: NaiveDate, tenant_id: Option<&str>) -> Result<Vec<Choice>> {
        let stmt = Statement::new(format!(
            "SELECT DISTINCT farm_id FROM {} \
             WHERE DATE(processing_timestamp) = :date AND farm_id IS NOT NULL \
             ORDER BY farm_id LIMIT {}",
            self.tables.stage1, MAX_DISTINCT
        ))
        .bind_date("date", date);

        let rs = self.conn.execute(&stmt).await?;
        let ids = rs.records().filter_map(|r| r.string("farm_id")).filter(|id| {
            tenant_id.map_or(true, |t| self.mappings.tenant_of_farm(id) == Some(t))
        });
        let choices = sorted(ids.map(|id| Choice { label: self.mappings.farm_name(&id), value: id }));
        info!("{} farms with data on {}", choices.len(), date);
        Ok(choices)
    }

    /// Cameras with Stage 1 data on `date`, optionally limited to a farm.
    pub async fn available_cameras(&self, date: NaiveDate, farm_id: Option<&str>) -> Result<Vec<Choice>> {
        let mut sql = format!(
            "SELECT DISTINCT camera_id FROM {} \
             WHERE DATE(processing_timestamp) = :date AND camera_id IS NOT NULL",
            self.tables.stage1
        );
        if farm_id.is_some() {
            sql.push_str(" AND farm_id = :farm_id");
        }
        sql.push_str(&format!(" ORDER BY camera_id LIMIT {}", MAX_DISTINCT));

        let mut stmt = Statement::new(sql).bind_date("date", date);
        if let Some(farm) = farm_id {
            stmt = stmt.bind("farm_id", farm);
        }

        let rs = self.conn.execute(&stmt).await?;
        let choices = sorted(
            rs.records()
                .filter_map(|r| r.string("camera_id"))
                .map(|id| Choice { label: self.mappings.camera_name(&id), value: id }),
        );
        info!("{} cameras with data on {}", choices.len(), date);
        Ok(choices)
    }
}

fn sorted(items: impl Iterator<Item = Choice>) -> Vec<Choice> {
    let mut v: Vec<Choice> = items.collect();
    v.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.value.cmp(&b.value)));
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> InferenceTables {
        InferenceTables { stage1: "c.s.stage1".into(), stage2: "c.s.stage2".into() }
    }

    fn input(date: &str) -> FilterInput {
        FilterInput { date: Some(date.into()), ..Default::default() }
    }

    #[test]
    fn time_normalization() {
        assert_eq!(parse_time("08:30", false).unwrap().as_deref(), Some("08:30:00"));
        assert_eq!(parse_time("08:30", true).unwrap().as_deref(), Some("08:30:59"));
        assert_eq!(parse_time("08:30:15", true).unwrap().as_deref(), Some("08:30:15"));
        assert_eq!(parse_time("  ", false).unwrap(), None);
        assert!(matches!(parse_time("25:00", false), Err(DashboardError::InvalidFilter(_))));
    }

    #[test]
    fn date_is_required() {
        assert!(matches!(FilterInput::default().into_filters(100), Err(DashboardError::InvalidFilter(_))));
        assert!(matches!(input("15/01/2024").into_filters(100), Err(DashboardError::InvalidFilter(_))));
    }

    #[test]
    fn all_sentinel_means_no_filter() {
        let f = FilterInput {
            tenant: Some("All".into()),
            farm: Some("".into()),
            camera: Some("c1".into()),
            ..input("2024-01-15")
        }
        .into_filters(100)
        .unwrap();
        assert_eq!(f.tenant_id, None);
        assert_eq!(f.farm_id, None);
        assert_eq!(f.camera_id.as_deref(), Some("c1"));
    }

    #[test]
    fn reversed_time_range_rejected() {
        let f = FilterInput { start_time: Some("10:00".into()), end_time: Some("09:00".into()), ..input("2024-01-15") };
        assert!(matches!(f.into_filters(100), Err(DashboardError::InvalidFilter(_))));
    }

    #[test]
    fn limit_is_clamped() {
        let f = FilterInput { limit: Some(0), ..input("2024-01-15") }.into_filters(100).unwrap();
        assert_eq!(f.limit, 1);
        let f = input("2024-01-15").into_filters(50).unwrap();
        assert_eq!(f.limit, 50);
    }

    #[test]
    fn statement_binds_every_user_value() {
        let filters = FilterInput {
            start_time: Some("08:00".into()),
            end_time: Some("09:00".into()),
            farm: Some("f1' OR 1=1 --".into()),
            camera: Some("c1".into()),
            forward_only: true,
            ..input("2024-01-15")
        }
        .into_filters(100)
        .unwrap();
        let stmt = build_linked_statement(&tables(), &filters, None);

        assert!(!stmt.sql.contains("OR 1=1"));
        assert!(stmt.sql.contains("LEFT JOIN stage2_data s2"));
        assert!(stmt.sql.contains("s1.farm_id = :farm_id"));
        assert!(stmt.sql.contains("s1.stage1_should_forward = true"));
        assert!(stmt.sql.contains("FROM c.s.stage1"));
        assert!(stmt.sql.contains(r"'/(\\d{3}_\\d{7})_'"));
        assert_eq!(stmt.param("date"), Some("2024-01-15"));
        assert_eq!(stmt.param("start_time"), Some("08:00:00"));
        assert_eq!(stmt.param("end_time"), Some("09:00:59"));
        assert_eq!(stmt.param("farm_id"), Some("f1' OR 1=1 --"));
        assert!(stmt.sql.ends_with("LIMIT 100"));
    }

    #[test]
    fn tenant_scope_expands_to_farm_list() {
        let filters = input("2024-01-15").into_filters(100).unwrap();
        let farms = vec!["f1".to_string(), "f2".to_string()];
        let stmt = build_linked_statement(&tables(), &filters, Some(&farms));
        assert!(stmt.sql.contains("s1.farm_id IN (:farm_0, :farm_1)"));
        assert_eq!(stmt.param("farm_1"), Some("f2"));
    }

    #[test]
    fn no_filters_uses_tautology() {
        let stmt = build_linked_statement(&tables(), &QueryFilters::for_date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()), None);
        assert!(stmt.sql.contains("WHERE 1=1"));
    }
}
