//! zcp: Ceilometer to Zabbix metrics bridge
//!
//! Periodically discovers active Nova instances, looks up their Ceilometer
//! meters, takes the latest sample of each forwarded meter and pushes the
//! batch to a Zabbix server over the trapper (sender) protocol.
//!
//! # Pipeline
//!
//! - [`discovery::ResourceDiscovery`] lists active instances.
//! - [`links::LinkResolver`] maps an instance to its meter links.
//! - [`fetcher::MetricFetcher`] reads the latest sample behind a link.
//! - [`sender::SenderClient`] frames and ships the samples.
//! - [`poll::PollCycle`] strings the above together; [`poll::Scheduler`]
//!   runs it on an interval.
//!
//! Every OpenStack request goes through [`api::ApiClient`], which shares a
//! single [`auth::TokenGuard`].
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use zcp::config::Config;
//! use zcp::poll::Scheduler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Path::new("/etc/zcp/zcp.yaml"))?;
//!     let cycle = zcp::build_cycle(&config).await?;
//!
//!     let report = cycle.run_cycle().await?;
//!     println!("sent {} samples", report.samples_sent);
//!
//!     let scheduler = Scheduler::new(
//!         Arc::new(cycle),
//!         config.poll.polling_interval,
//!         config.poll.overlap_policy(),
//!     );
//!     scheduler.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod links;
pub mod logging;
pub mod poll;
pub mod sender;

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

pub use error::{Error, Result};
pub use zcp_protocol as protocol;

use api::{ApiClient, RetryPolicy};
use auth::{KeystoneAuth, TokenGuard};
use config::Config;
use discovery::ResourceDiscovery;
use fetcher::MetricFetcher;
use links::LinkResolver;
use poll::PollCycle;
use sender::SenderClient;

/// Wire up a [`PollCycle`] from configuration.
///
/// Acquires the initial token and resolves the admin tenant, so any error
/// here means the bridge cannot start.
pub async fn build_cycle(config: &Config) -> Result<PollCycle> {
    let client = reqwest::Client::builder()
        .timeout(config.http.request_timeout)
        .build()?;

    let keystone = &config.keystone;
    let provider = KeystoneAuth::new(
        client.clone(),
        config.keystone_public_base(),
        keystone.admin_tenant.clone(),
        keystone.admin_user.clone(),
        SecretString::from(keystone.admin_password.expose_secret().to_owned()),
    );
    let guard = Arc::new(
        TokenGuard::connect(Arc::new(provider), config.poll.token_renewal_threshold).await?,
    );

    let retry = RetryPolicy {
        max_attempts: config.http.retry_max_attempts.max(1),
        base_delay: config.http.retry_base_delay,
        ..RetryPolicy::default()
    };
    let api = ApiClient::new(client, guard.clone(), config.poll.max_auth_retries, retry);

    let tenant_id =
        discovery::admin_tenant_id(&api, &config.keystone_admin_base(), &keystone.admin_tenant)
            .await?;

    let zabbix = &config.zabbix;
    Ok(PollCycle::new(
        guard,
        ResourceDiscovery::new(api.clone(), config.compute_base(), tenant_id),
        LinkResolver::new(api.clone(), config.telemetry_base()),
        MetricFetcher::new(api),
        SenderClient::new(
            config.zabbix_addr(),
            zabbix.proxy_name.clone(),
            zabbix.connect_timeout,
            zabbix.write_timeout,
            zabbix.read_timeout,
            zabbix.max_send_attempts,
        ),
        config.poll.template_name.clone(),
    ))
}
