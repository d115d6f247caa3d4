//! Active instance discovery through Keystone and Nova.

use serde::Deserialize;
use tracing::{debug, info};

use crate::api::ApiClient;
use crate::{Error, Result};

/// A compute instance to poll metrics for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Host {
    /// Nova server id, also the Ceilometer resource id and the Zabbix host name.
    pub id: String,
    /// Display name.
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    #[serde(default)]
    servers: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct TenantsResponse {
    #[serde(default)]
    tenants: Vec<Tenant>,
}

#[derive(Debug, Deserialize)]
struct Tenant {
    id: String,
    name: String,
}

/// Resolve the id of the tenant named `tenant_name` via the Keystone admin API.
pub async fn admin_tenant_id(
    api: &ApiClient,
    keystone_admin_base: &str,
    tenant_name: &str,
) -> Result<String> {
    let url = format!("{}/v2.0/tenants", keystone_admin_base.trim_end_matches('/'));
    let resp: TenantsResponse = api.get_json(&url).await?;

    let tenant = resp
        .tenants
        .into_iter()
        .find(|t| t.name == tenant_name)
        .ok_or_else(|| {
            Error::Config(format!("tenant '{}' not found in keystone", tenant_name))
        })?;

    info!(tenant = tenant_name, id = %tenant.id, "resolved admin tenant");
    Ok(tenant.id)
}

/// Lists active instances across all tenants.
#[derive(Clone)]
pub struct ResourceDiscovery {
    api: ApiClient,
    compute_base: String,
    admin_tenant_id: String,
}

impl ResourceDiscovery {
    pub fn new(
        api: ApiClient,
        compute_base: impl Into<String>,
        admin_tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            compute_base: compute_base.into(),
            admin_tenant_id: admin_tenant_id.into(),
        }
    }

    pub fn servers_url(&self) -> String {
        format!(
            "{}/v2/{}/servers/detail?all_tenants=1&status=ACTIVE",
            self.compute_base.trim_end_matches('/'),
            self.admin_tenant_id
        )
    }

    /// Active hosts in the order Nova returns them.
    pub async fn list_active_hosts(&self) -> Result<Vec<Host>> {
        let url = self.servers_url();
        let resp: ServersResponse = self.api.get_json(&url).await?;
        debug!(count = resp.servers.len(), "discovered active instances");
        Ok(resp.servers)
    }
}
