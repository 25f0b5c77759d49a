use std::{collections::HashMap, path::Path};

use meter_client::domain::SiteId;

const SECTION_START: &str = "ROUTING TABLE";
const SECTION_END: &str = "GLOBAL STATS";
const HEADER_PREFIX: &str = "Virtual Address";

/// Site id to reachable address, as published by the VPN server's status log.
///
/// Only the routing-table section is read: each row is
/// `virtual_address,common_name,...` and the common name is the site id.
/// A site listed twice resolves to its last row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<SiteId, String>,
}

impl RoutingTable {
    pub fn parse(status: &str) -> Self {
        let mut routes = HashMap::new();
        let mut in_section = false;

        for line in status.lines().map(str::trim) {
            if line == SECTION_START {
                in_section = true;
                continue;
            }
            if line == SECTION_END {
                break;
            }
            if !in_section || line.is_empty() || line.starts_with(HEADER_PREFIX) {
                continue;
            }

            let mut fields = line.split(',').map(str::trim);
            if let (Some(address), Some(name)) = (fields.next(), fields.next()) {
                if !address.is_empty() && !name.is_empty() {
                    routes.insert(SiteId::new(name), address.to_string());
                }
            }
        }

        Self { routes }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let status = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read routing table {}: {e}", path.display()))?;
        let table = Self::parse(&status);
        tracing::info!(path = %path.display(), routes = table.len(), "loaded routing table");
        Ok(table)
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, String)>,
        S: Into<SiteId>,
    {
        Self {
            routes: entries.into_iter().map(|(site, addr)| (site.into(), addr)).collect(),
        }
    }

    pub fn resolve(&self, site_id: &SiteId) -> Option<&str> {
        self.routes.get(site_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
