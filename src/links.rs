//! Per-host meter link resolution against the Ceilometer v2 API.
//!
//! Ceilometer exposes a resource's meters as `links` entries
//! (`{"rel": "<meter>", "href": "<url>"}`). Compute meters hang off the
//! instance resource itself; network meters hang off the instance's tap
//! interfaces, which are found through `metadata.instance_id`.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::api::ApiClient;
use crate::Result;

/// The meters forwarded to Zabbix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKey {
    CpuUtil,
    Memory,
    DiskRootSize,
    Vcpus,
    NetworkIncomingBytesRate,
    NetworkOutgoingBytesRate,
}

/// Which resource query a meter is found through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFamily {
    /// `q.field=resource_id`
    Compute,
    /// `q.field=metadata.instance_id`
    Network,
}

impl MetricFamily {
    pub fn query_field(self) -> &'static str {
        match self {
            MetricFamily::Compute => "resource_id",
            MetricFamily::Network => "metadata.instance_id",
        }
    }
}

impl MetricKey {
    pub const ALL: [MetricKey; 6] = [
        MetricKey::CpuUtil,
        MetricKey::Memory,
        MetricKey::DiskRootSize,
        MetricKey::Vcpus,
        MetricKey::NetworkIncomingBytesRate,
        MetricKey::NetworkOutgoingBytesRate,
    ];

    /// Meter name, also used as the Zabbix item key.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKey::CpuUtil => "cpu_util",
            MetricKey::Memory => "memory",
            MetricKey::DiskRootSize => "disk.root.size",
            MetricKey::Vcpus => "vcpus",
            MetricKey::NetworkIncomingBytesRate => "network.incoming.bytes.rate",
            MetricKey::NetworkOutgoingBytesRate => "network.outgoing.bytes.rate",
        }
    }

    pub fn family(self) -> MetricFamily {
        match self {
            MetricKey::CpuUtil | MetricKey::Memory | MetricKey::DiskRootSize | MetricKey::Vcpus => {
                MetricFamily::Compute
            }
            MetricKey::NetworkIncomingBytesRate | MetricKey::NetworkOutgoingBytesRate => {
                MetricFamily::Network
            }
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MetricKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("meter '{}' is not forwarded", s))
    }
}

/// A meter endpoint for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLink {
    pub key: MetricKey,
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(default)]
    links: Vec<RawLink>,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    rel: String,
    href: String,
}

/// Keep only links whose relation is a meter of `family`.
fn filter_links(resources: Vec<Resource>, family: MetricFamily) -> Vec<MetricLink> {
    resources
        .into_iter()
        .flat_map(|r| r.links)
        .filter_map(|link| {
            let key = link.rel.parse::<MetricKey>().ok()?;
            (key.family() == family).then_some(MetricLink {
                key,
                href: link.href,
            })
        })
        .collect()
}

/// Looks up meter links for hosts.
#[derive(Clone)]
pub struct LinkResolver {
    api: ApiClient,
    telemetry_base: String,
}

impl LinkResolver {
    pub fn new(api: ApiClient, telemetry_base: impl Into<String>) -> Self {
        Self {
            api,
            telemetry_base: telemetry_base.into(),
        }
    }

    pub fn resources_url(&self, family: MetricFamily, host_id: &str) -> String {
        format!(
            "{}/v2/resources?q.field={}&q.value={}",
            self.telemetry_base.trim_end_matches('/'),
            family.query_field(),
            host_id
        )
    }

    /// Compute links first, then network links.
    pub async fn resolve_links(&self, host_id: &str) -> Result<Vec<MetricLink>> {
        let mut links = self.query(MetricFamily::Compute, host_id).await?;
        links.extend(self.query(MetricFamily::Network, host_id).await?);
        debug!(host = host_id, count = links.len(), "resolved meter links");
        Ok(links)
    }

    async fn query(&self, family: MetricFamily, host_id: &str) -> Result<Vec<MetricLink>> {
        let url = self.resources_url(family, host_id);
        let resources: Vec<Resource> = self.api.get_json(&url).await?;
        Ok(filter_links(resources, family))
    }
}
