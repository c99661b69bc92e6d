//! Tenant / farm / camera display names, loaded once at startup.
//!
//! The cache is immutable after `load`; new ids appear only after a restart.

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use crate::config::DatabricksConfig;
use crate::connection::ConnectionManager;
use crate::error::{DashboardError, Result};
use crate::warehouse::{ResultSet, Statement};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantEntry {
    pub id: String,
    pub name: String,
    pub ui_url: Option<String>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FarmEntry {
    pub id: String,
    pub name: String,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraEntry {
    pub id: String,
    pub name: String,
    pub farm_id: Option<String>,
}

/// Dropdown option: what the user sees and what gets sent back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub label: String,
    pub value: String,
}

/// Fully qualified names of the three mapping tables.
#[derive(Debug, Clone)]
pub struct MappingTables {
    pub tenants: String,
    pub farms: String,
    pub cameras: String,
}

impl MappingTables {
    pub fn from_config(cfg: &DatabricksConfig) -> Self {
        Self {
            tenants: cfg.mapping_table(&cfg.tenant_table),
            farms: cfg.mapping_table(&cfg.farm_table),
            cameras: cfg.mapping_table(&cfg.camera_table),
        }
    }
}

#[derive(Debug, Default)]
pub struct MappingCache {
    tenants: HashMap<String, TenantEntry>,
    farms: HashMap<String, FarmEntry>,
    cameras: HashMap<String, CameraEntry>,
}

impl MappingCache {
    /// Run the three mapping queries. Any failure is fatal for the caller.
    pub async fn load(conn: &ConnectionManager, tables: &MappingTables) -> Result<Self> {
        let tenants = conn
            .execute(&Statement::new(format!(
                "SELECT tenant_id, tenant_name, tenant_ui_url, tenant_slug FROM {} \
                 WHERE tenant_id IS NOT NULL AND tenant_id != 'tenant_id'",
                tables.tenants
            )))
            .await
            .map_err(|e| mapping_failure("tenant", e))?;

        let farms = conn
            .execute(&Statement::new(format!(
                "SELECT farm_id, farm_name, tenant_id FROM {} \
                 WHERE farm_id IS NOT NULL AND farm_id != 'farm_id'",
                tables.farms
            )))
            .await
            .map_err(|e| mapping_failure("farm", e))?;

        let cameras = conn
            .execute(&Statement::new(format!(
                "SELECT camera_id, camera_name, farm_id FROM {} \
                 WHERE camera_id IS NOT NULL AND camera_id != 'camera_id'",
                tables.cameras
            )))
            .await
            .map_err(|e| mapping_failure("camera", e))?;

        let cache = Self::from_result_sets(&tenants, &farms, &cameras);
        info!(
            "Mapping cache loaded: {} tenants, {} farms, {} cameras",
            cache.tenants.len(),
            cache.farms.len(),
            cache.cameras.len()
        );
        Ok(cache)
    }

    fn from_result_sets(tenants: &ResultSet, farms: &ResultSet, cameras: &ResultSet) -> Self {
        let tenants = tenants.records().filter_map(|r| {
            let id = r.string("tenant_id")?;
            Some(TenantEntry {
                name: r.string("tenant_name").unwrap_or_else(|| id.clone()),
                ui_url: r.string("tenant_ui_url"),
                slug: r.string("tenant_slug"),
                id,
            })
        });
        let farms = farms.records().filter_map(|r| {
            let id = r.string("farm_id")?;
            Some(FarmEntry {
                name: r.string("farm_name").unwrap_or_else(|| id.clone()),
                tenant_id: r.string("tenant_id"),
                id,
            })
        });
        let cameras = cameras.records().filter_map(|r| {
            let id = r.string("camera_id")?;
            Some(CameraEntry {
                name: r.string("camera_name").unwrap_or_else(|| id.clone()),
                farm_id: r.string("farm_id"),
                id,
            })
        });
        Self::from_entries(tenants, farms, cameras)
    }

    pub fn from_entries(
        tenants: impl IntoIterator<Item = TenantEntry>,
        farms: impl IntoIterator<Item = FarmEntry>,
        cameras: impl IntoIterator<Item = CameraEntry>,
    ) -> Self {
        Self {
            tenants: tenants.into_iter().map(|t| (t.id.clone(), t)).collect(),
            farms: farms.into_iter().map(|f| (f.id.clone(), f)).collect(),
            cameras: cameras.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn tenant_name(&self, id: &str) -> String {
        self.tenants.get(id).map_or_else(|| unknown(id), |t| t.name.clone())
    }

    pub fn farm_name(&self, id: &str) -> String {
        self.farms.get(id).map_or_else(|| unknown(id), |f| f.name.clone())
    }

    pub fn camera_name(&self, id: &str) -> String {
        self.cameras.get(id).map_or_else(|| unknown(id), |c| c.name.clone())
    }

    pub fn tenant_of_farm(&self, farm_id: &str) -> Option<&str> {
        self.farms.get(farm_id)?.tenant_id.as_deref()
    }

    pub fn farm_of_camera(&self, camera_id: &str) -> Option<&str> {
        self.cameras.get(camera_id)?.farm_id.as_deref()
    }

    pub fn tenant_choices(&self) -> Vec<Choice> {
        sorted_choices(self.tenants.values().map(|t| (t.name.clone(), t.id.clone())))
    }

    /// Farms, optionally restricted to one tenant.
    pub fn farm_choices(&self, tenant_id: Option<&str>) -> Vec<Choice> {
        sorted_choices(
            self.farms
                .values()
                .filter(|f| tenant_id.map_or(true, |t| f.tenant_id.as_deref() == Some(t)))
                .map(|f| (f.name.clone(), f.id.clone())),
        )
    }

    /// Cameras, optionally restricted to one farm.
    pub fn camera_choices(&self, farm_id: Option<&str>) -> Vec<Choice> {
        sorted_choices(
            self.cameras
                .values()
                .filter(|c| farm_id.map_or(true, |f| c.farm_id.as_deref() == Some(f)))
                .map(|c| (c.name.clone(), c.id.clone())),
        )
    }

    /// Farm ids belonging to a tenant, sorted.
    pub fn farm_ids_for_tenant(&self, tenant_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .farms
            .values()
            .filter(|f| f.tenant_id.as_deref() == Some(tenant_id))
            .map(|f| f.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn tenants(&self) -> Vec<&TenantEntry> {
        let mut v: Vec<_> = self.tenants.values().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn farms(&self) -> Vec<&FarmEntry> {
        let mut v: Vec<_> = self.farms.values().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn cameras(&self) -> Vec<&CameraEntry> {
        let mut v: Vec<_> = self.cameras.values().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }
}

fn unknown(id: &str) -> String {
    format!("unknown-{}", id)
}

fn sorted_choices(items: impl Iterator<Item = (String, String)>) -> Vec<Choice> {
    let mut choices: Vec<Choice> = items.map(|(label, value)| Choice { label, value }).collect();
    choices.sort_by(|a, b| a.label.to_lowercase().cmp(&b.label.to_lowercase()).then_with(|| a.value.cmp(&b.value)));
    choices
}

fn mapping_failure(kind: &str, e: DashboardError) -> DashboardError {
    match e {
        DashboardError::Permission(msg) => DashboardError::Permission(format!("{} mapping: {}", kind, msg)),
        DashboardError::Authentication(msg) => DashboardError::Authentication(format!("{} mapping: {}", kind, msg)),
        other => DashboardError::Query(format!("cannot load {} mapping: {}", kind, other)),
    }
}
