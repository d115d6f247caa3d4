//! Poll cycle against mocked Nova and Ceilometer endpoints.

mod common;

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use common::{api, dead_addr, guard, sender, CountingProvider, FakeZabbix, INITIAL_TOKEN};
use zcp::api::{ApiClient, RetryPolicy};
use zcp::discovery::{self, ResourceDiscovery};
use zcp::fetcher::{MetricFetcher, SampleOutcome};
use zcp::links::{LinkResolver, MetricKey, MetricLink};
use zcp::poll::PollCycle;
use zcp::Error;

const TENANT: &str = "t-admin";

fn cycle(server: &MockServer, zabbix_addr: &str, provider: std::sync::Arc<CountingProvider>) -> PollCycle {
    let guard = guard(provider);
    let api = api(guard.clone());
    PollCycle::new(
        guard,
        ResourceDiscovery::new(api.clone(), server.base_url(), TENANT),
        LinkResolver::new(api.clone(), server.base_url()),
        MetricFetcher::new(api),
        sender(zabbix_addr),
        "Template ZCP",
    )
}

fn servers_path() -> String {
    format!("/v2/{}/servers/detail", TENANT)
}

#[tokio::test]
async fn empty_discovery_makes_no_further_calls() {
    let server = MockServer::start_async().await;
    let servers = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(servers_path())
                .query_param("all_tenants", "1")
                .query_param("status", "ACTIVE")
                .header("X-Auth-Token", INITIAL_TOKEN)
                .header("Accept", "application/json");
            then.status(200).json_body(json!({"servers": []}));
        })
        .await;
    let resources = server
        .mock_async(|when, then| {
            when.path("/v2/resources");
            then.status(200).json_body(json!([]));
        })
        .await;

    let provider = CountingProvider::new();
    let report = cycle(&server, &dead_addr().await, provider.clone())
        .run_cycle()
        .await
        .unwrap();

    servers.assert_calls_async(1).await;
    resources.assert_calls_async(0).await;
    assert_eq!(report.hosts_seen, 0);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn template_host_is_never_queried() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(servers_path());
            then.status(200).json_body(json!({"servers": [
                {"id": "tpl-1", "name": "Template ZCP"}
            ]}));
        })
        .await;
    let resources = server
        .mock_async(|when, then| {
            when.path("/v2/resources");
            then.status(200).json_body(json!([]));
        })
        .await;

    let report = cycle(&server, &dead_addr().await, CountingProvider::new())
        .run_cycle()
        .await
        .unwrap();

    resources.assert_calls_async(0).await;
    assert_eq!(report.hosts_seen, 1);
    assert_eq!(report.hosts_skipped, 1);
}

#[tokio::test]
async fn full_cycle_forwards_present_samples() {
    let server = MockServer::start_async().await;
    let zabbix = FakeZabbix::accepting().await;
    let base = server.base_url();

    server
        .mock_async(|when, then| {
            when.method(GET).path(servers_path());
            then.status(200).json_body(json!({"servers": [
                {"id": "vm-1", "name": "web"},
                {"id": "tpl-1", "name": "Template ZCP"}
            ]}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v2/resources")
                .query_param("q.field", "resource_id")
                .query_param("q.value", "vm-1");
            then.status(200).json_body(json!([{
                "resource_id": "vm-1",
                "links": [
                    {"rel": "self", "href": format!("{}/v2/resources/vm-1", base)},
                    {"rel": "cpu_util", "href": format!("{}/v2/meters/cpu_util?q.field=resource_id&q.value=vm-1", base)},
                    {"rel": "cpu", "href": format!("{}/v2/meters/cpu?q.field=resource_id&q.value=vm-1", base)},
                    {"rel": "memory", "href": format!("{}/v2/meters/memory?q.field=resource_id&q.value=vm-1", base)},
                    {"rel": "vcpus", "href": format!("{}/v2/meters/vcpus?q.field=resource_id&q.value=vm-1", base)}
                ]
            }]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v2/resources")
                .query_param("q.field", "metadata.instance_id")
                .query_param("q.value", "vm-1");
            then.status(200).json_body(json!([{
                "resource_id": "instance-vm-1-tap0",
                "links": [
                    {"rel": "network.incoming.bytes.rate", "href": format!("{}/v2/meters/network.incoming.bytes.rate?q.field=resource_id&q.value=tap0", base)}
                ]
            }]));
        })
        .await;
    let cpu = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v2/meters/cpu_util")
                .query_param("limit", "1");
            then.status(200).json_body(json!([
                {"counter_name": "cpu_util", "counter_volume": 7.25, "timestamp": "2014-09-01T13:00:00"}
            ]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/meters/memory");
            then.status(200).json_body(json!([]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/meters/vcpus");
            then.status(200).body("<html>bad gateway</html>");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/meters/network.incoming.bytes.rate");
            then.status(200).json_body(json!([{"counter_volume": 2048.0}]));
        })
        .await;
    let unlisted = server
        .mock_async(|when, then| {
            when.path("/v2/meters/cpu");
            then.status(200).json_body(json!([]));
        })
        .await;

    let report = cycle(&server, &zabbix.addr, CountingProvider::new())
        .run_cycle()
        .await
        .unwrap();

    cpu.assert_calls_async(1).await;
    unlisted.assert_calls_async(0).await;
    assert_eq!(report.hosts_seen, 2);
    assert_eq!(report.hosts_skipped, 1);
    assert_eq!(report.hosts_failed, 0);
    assert_eq!(report.samples_sent, 2);
    assert_eq!(report.samples_absent, 1);
    assert_eq!(report.samples_malformed, 1);

    let requests = zabbix.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0]["data"],
        json!([
            {"host": "vm-1", "key": "cpu_util", "value": "7.25", "clock": 1_409_576_400},
            {"host": "vm-1", "key": "network.incoming.bytes.rate", "value": "2048.0"}
        ])
    );
}

#[tokio::test]
async fn one_failing_host_does_not_stop_the_others() {
    let server = MockServer::start_async().await;
    let zabbix = FakeZabbix::accepting().await;
    let base = server.base_url();

    server
        .mock_async(|when, then| {
            when.method(GET).path(servers_path());
            then.status(200).json_body(json!({"servers": [
                {"id": "broken", "name": "a"},
                {"id": "vm-2", "name": "b"}
            ]}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.path("/v2/resources").query_param("q.value", "broken");
            then.status(404).body("no such resource");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.path("/v2/resources")
                .query_param("q.field", "resource_id")
                .query_param("q.value", "vm-2");
            then.status(200).json_body(json!([{"links": [
                {"rel": "memory", "href": format!("{}/v2/meters/memory?q.field=resource_id&q.value=vm-2", base)}
            ]}]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.path("/v2/resources")
                .query_param("q.field", "metadata.instance_id")
                .query_param("q.value", "vm-2");
            then.status(200).json_body(json!([]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.path("/v2/meters/memory");
            then.status(200).json_body(json!([{"counter_volume": 512}]));
        })
        .await;

    let report = cycle(&server, &zabbix.addr, CountingProvider::new())
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.hosts_failed, 1);
    assert_eq!(report.samples_sent, 1);
    assert_eq!(zabbix.requests().await.len(), 1);
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_and_retried() {
    let server = MockServer::start_async().await;
    let stale = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(servers_path())
                .header("X-Auth-Token", INITIAL_TOKEN);
            then.status(401);
        })
        .await;
    let fresh = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(servers_path())
                .header("X-Auth-Token", "token-1");
            then.status(200).json_body(json!({"servers": []}));
        })
        .await;

    let provider = CountingProvider::new();
    cycle(&server, &dead_addr().await, provider.clone())
        .run_cycle()
        .await
        .unwrap();

    stale.assert_calls_async(1).await;
    fresh.assert_calls_async(1).await;
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn second_rejection_aborts_the_cycle() {
    let server = MockServer::start_async().await;
    let servers = server
        .mock_async(|when, then| {
            when.method(GET).path(servers_path());
            then.status(401);
        })
        .await;
    let resources = server
        .mock_async(|when, then| {
            when.path("/v2/resources");
            then.status(200).json_body(json!([]));
        })
        .await;

    let provider = CountingProvider::new();
    let err = cycle(&server, &dead_addr().await, provider.clone())
        .run_cycle()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AuthExpired { attempts: 2, .. }), "{err:?}");
    assert!(err.is_cycle_fatal());
    servers.assert_calls_async(2).await;
    resources.assert_calls_async(0).await;
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn auth_failure_mid_host_aborts_remaining_hosts() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(servers_path());
            then.status(200).json_body(json!({"servers": [
                {"id": "vm-1", "name": "a"},
                {"id": "vm-2", "name": "b"}
            ]}));
        })
        .await;
    let first = server
        .mock_async(|when, then| {
            when.path("/v2/resources").query_param("q.value", "vm-1");
            then.status(401);
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.path("/v2/resources").query_param("q.value", "vm-2");
            then.status(200).json_body(json!([]));
        })
        .await;

    let err = cycle(&server, &dead_addr().await, CountingProvider::new())
        .run_cycle()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AuthExpired { .. }));
    first.assert_calls_async(2).await;
    second.assert_calls_async(0).await;
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let server = MockServer::start_async().await;
    let unavailable = server
        .mock_async(|when, then| {
            when.method(GET).path(servers_path());
            then.status(503);
        })
        .await;

    let err = cycle(&server, &dead_addr().await, CountingProvider::new())
        .run_cycle()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransientHttp { status: 503, .. }), "{err:?}");
    assert!(!err.is_cycle_fatal());
    unavailable.assert_calls_async(2).await;
}

#[tokio::test]
async fn token_refresh_does_not_use_up_transient_attempts() {
    let server = MockServer::start_async().await;
    let stale = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(servers_path())
                .header("X-Auth-Token", INITIAL_TOKEN);
            then.status(401);
        })
        .await;
    let unavailable = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(servers_path())
                .header("X-Auth-Token", "token-1");
            then.status(503);
        })
        .await;

    let provider = CountingProvider::new();
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    let client = ApiClient::new(reqwest::Client::new(), guard(provider.clone()), 1, retry);

    let err = client
        .get_bytes(&server.url(servers_path()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransientHttp { status: 503, .. }), "{err:?}");
    stale.assert_calls_async(1).await;
    unavailable.assert_calls_async(3).await;
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn empty_meter_is_absent_not_an_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.path("/v2/meters/cpu_util").query_param("limit", "1");
            then.status(200).json_body(json!([]));
        })
        .await;

    let guard = guard(CountingProvider::new());
    let fetcher = MetricFetcher::new(api(guard));
    let link = MetricLink {
        key: MetricKey::CpuUtil,
        href: server.url("/v2/meters/cpu_util?q.field=resource_id&q.value=vm-1"),
    };

    let outcome = fetcher.fetch_latest_sample(&link, "vm-1").await.unwrap();
    assert_eq!(outcome, SampleOutcome::Absent);
}

#[tokio::test]
async fn malformed_meter_is_reported_as_such() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.path("/v2/meters/memory");
            then.status(200).json_body(json!([{"counter_name": "memory"}]));
        })
        .await;

    let guard = guard(CountingProvider::new());
    let fetcher = MetricFetcher::new(api(guard));
    let link = MetricLink {
        key: MetricKey::Memory,
        href: server.url("/v2/meters/memory"),
    };

    let outcome = fetcher.fetch_latest_sample(&link, "vm-1").await.unwrap();
    assert!(matches!(outcome, SampleOutcome::Malformed(_)));
}

#[tokio::test]
async fn resolved_links_stay_within_the_allow_list() {
    let server = MockServer::start_async().await;
    let rels = [
        "cpu", "cpu_util", "cpu.delta", "memory", "memory.usage", "disk.root.size",
        "disk.read.bytes", "vcpus", "instance", "network.incoming.bytes",
        "network.incoming.bytes.rate", "network.outgoing.bytes.rate", "network.outgoing.packets",
    ];
    let links: Vec<_> = rels
        .iter()
        .map(|rel| json!({"rel": rel, "href": format!("http://ceilometer/v2/meters/{}", rel)}))
        .collect();
    server
        .mock_async(|when, then| {
            when.path("/v2/resources");
            then.status(200).json_body(json!([{"links": links}]));
        })
        .await;

    let resolver = LinkResolver::new(api(guard(CountingProvider::new())), server.base_url());
    let resolved = resolver.resolve_links("vm-1").await.unwrap();

    let keys: Vec<_> = resolved.iter().map(|l| l.key).collect();
    assert_eq!(
        keys,
        vec![
            MetricKey::CpuUtil,
            MetricKey::Memory,
            MetricKey::DiskRootSize,
            MetricKey::Vcpus,
            MetricKey::NetworkIncomingBytesRate,
            MetricKey::NetworkOutgoingBytesRate,
        ]
    );
}

#[tokio::test]
async fn admin_tenant_is_looked_up_by_name() {
    let server = MockServer::start_async().await;
    let tenants = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v2.0/tenants")
                .header("X-Auth-Token", INITIAL_TOKEN);
            then.status(200).json_body(json!({"tenants": [
                {"id": "t-demo", "name": "demo", "enabled": true},
                {"id": "t-admin", "name": "admin", "enabled": true}
            ]}));
        })
        .await;

    let api = api(guard(CountingProvider::new()));
    let id = discovery::admin_tenant_id(&api, &server.base_url(), "admin")
        .await
        .unwrap();
    assert_eq!(id, "t-admin");

    let missing = discovery::admin_tenant_id(&api, &server.base_url(), "ops").await;
    assert!(matches!(missing, Err(Error::Config(_))));
    tenants.assert_calls_async(2).await;
}
