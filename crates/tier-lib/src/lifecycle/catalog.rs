//! Tier catalog: host → machine, machine → tier link, tier link → tier names

use crate::models::TierNames;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Placement of a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    pub machine_type: String,
    pub region: String,
    #[serde(default)]
    pub current_tier: Option<String>,
}

/// Fully resolved lookup chain of one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLookup {
    pub machine: MachineInfo,
    pub tier_link_id: String,
    pub tier_names: TierNames,
}

/// Stage at which the lookup chain broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMiss {
    Machine,
    TierLink,
    TierNames,
}

impl fmt::Display for LookupMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            LookupMiss::Machine => "machine info not found",
            LookupMiss::TierLink => "tier link not found",
            LookupMiss::TierNames => "tier names not found",
        };
        f.write_str(stage)
    }
}

pub trait TierCatalog: Send + Sync {
    fn machine(&self, hostname: &str) -> Option<MachineInfo>;

    fn tier_link(&self, machine_type: &str, region: &str) -> Option<String>;

    fn tier_names(&self, tier_link_id: &str) -> Option<TierNames>;

    /// Walk the whole chain; the first missing stage wins
    fn resolve(&self, hostname: &str) -> Result<TierLookup, LookupMiss> {
        let machine = self.machine(hostname).ok_or(LookupMiss::Machine)?;
        let tier_link_id = self
            .tier_link(&machine.machine_type, &machine.region)
            .ok_or(LookupMiss::TierLink)?;
        let tier_names = self
            .tier_names(&tier_link_id)
            .ok_or(LookupMiss::TierNames)?;

        Ok(TierLookup {
            machine,
            tier_link_id,
            tier_names,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TierLinkEntry {
    machine_type: String,
    region: String,
    tier_link_id: String,
}

/// On-disk catalog format
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CatalogFile {
    machines: HashMap<String, MachineInfo>,
    tier_links: Vec<TierLinkEntry>,
    tier_names: HashMap<String, TierNames>,
}

/// In-memory catalog, optionally loaded from a JSON file
#[derive(Debug, Default)]
pub struct StaticTierCatalog {
    machines: DashMap<String, MachineInfo>,
    links: DashMap<(String, String), String>,
    names: DashMap<String, TierNames>,
}

impl StaticTierCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read tier catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse tier catalog {}", path.display()))?;

        let catalog = Self::new();
        for (hostname, machine) in file.machines {
            catalog.insert_machine(hostname, machine);
        }
        for link in file.tier_links {
            catalog.insert_tier_link(link.machine_type, link.region, link.tier_link_id);
        }
        for (id, names) in file.tier_names {
            catalog.insert_tier_names(id, names);
        }

        info!(
            path = %path.display(),
            machines = catalog.machines.len(),
            tier_links = catalog.links.len(),
            "Loaded tier catalog"
        );
        Ok(catalog)
    }

    pub fn insert_machine(&self, hostname: impl Into<String>, machine: MachineInfo) {
        self.machines.insert(hostname.into(), machine);
    }

    pub fn insert_tier_link(
        &self,
        machine_type: impl Into<String>,
        region: impl Into<String>,
        tier_link_id: impl Into<String>,
    ) {
        self.links
            .insert((machine_type.into(), region.into()), tier_link_id.into());
    }

    pub fn insert_tier_names(&self, tier_link_id: impl Into<String>, names: TierNames) {
        self.names.insert(tier_link_id.into(), names);
    }
}

impl TierCatalog for StaticTierCatalog {
    fn machine(&self, hostname: &str) -> Option<MachineInfo> {
        self.machines.get(hostname).map(|m| m.value().clone())
    }

    fn tier_link(&self, machine_type: &str, region: &str) -> Option<String> {
        self.links
            .get(&(machine_type.to_string(), region.to_string()))
            .map(|l| l.value().clone())
    }

    fn tier_names(&self, tier_link_id: &str) -> Option<TierNames> {
        self.names.get(tier_link_id).map(|n| n.value().clone())
    }
}
