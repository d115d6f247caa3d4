//! Latest-sample retrieval for a single meter link.

use std::time::UNIX_EPOCH;

use serde_json::Value;
use tracing::debug;
use zcp_protocol::HistoryItem;

use crate::api::ApiClient;
use crate::links::{MetricKey, MetricLink};
use crate::Result;

/// One measurement ready to be forwarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub host_id: String,
    pub key: MetricKey,
    /// `counter_volume` as reported by Ceilometer (number or string).
    pub value: Value,
    /// Measurement time in Unix seconds, when Ceilometer reported one.
    pub clock: Option<i64>,
}

impl Sample {
    /// Zabbix item values travel as strings.
    pub fn to_history_item(&self) -> HistoryItem {
        let value = match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        HistoryItem {
            host: self.host_id.clone(),
            key: self.key.as_str().to_string(),
            value,
            clock: self.clock,
        }
    }
}

/// Result of asking for the latest data point of a meter.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Present(Sample),
    /// The meter has no data yet.
    Absent,
    /// The upstream body could not be interpreted.
    Malformed(String),
}

impl SampleOutcome {
    pub fn into_sample(self) -> Option<Sample> {
        match self {
            SampleOutcome::Present(sample) => Some(sample),
            _ => None,
        }
    }
}

/// `href` with `limit=1` appended.
pub fn latest_sample_url(href: &str) -> String {
    let sep = if href.contains('?') { '&' } else { '?' };
    format!("{}{}limit=1", href, sep)
}

/// Interpret a `GET /v2/meters/<name>` body.
pub fn parse_latest(body: &[u8], host_id: &str, key: MetricKey) -> SampleOutcome {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return SampleOutcome::Malformed(format!("invalid JSON: {}", e)),
    };

    let Some(samples) = parsed.as_array() else {
        return SampleOutcome::Malformed("expected a list of samples".into());
    };

    let Some(latest) = samples.first() else {
        return SampleOutcome::Absent;
    };

    let value = match latest.get("counter_volume") {
        Some(v @ (Value::Number(_) | Value::String(_))) => v.clone(),
        Some(Value::Null) | None => {
            return SampleOutcome::Malformed("sample without counter_volume".into())
        }
        Some(other) => {
            return SampleOutcome::Malformed(format!("unsupported counter_volume {}", other))
        }
    };

    let clock = latest
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| humantime::parse_rfc3339_weak(ts).ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    SampleOutcome::Present(Sample {
        host_id: host_id.to_string(),
        key,
        value,
        clock,
    })
}

/// Fetches single data points from Ceilometer.
#[derive(Clone)]
pub struct MetricFetcher {
    api: ApiClient,
}

impl MetricFetcher {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Latest data point behind `link`.
    ///
    /// Empty and unparsable responses are outcomes, not errors; only request
    /// failures (auth, transport, HTTP status) come back as `Err`.
    pub async fn fetch_latest_sample(&self, link: &MetricLink, host_id: &str) -> Result<SampleOutcome> {
        let url = latest_sample_url(&link.href);
        let body = self.api.get_bytes(&url).await?;
        let outcome = parse_latest(&body, host_id, link.key);
        match &outcome {
            SampleOutcome::Present(sample) => {
                debug!(host = host_id, item = %link.key, value = %sample.value, "sample")
            }
            SampleOutcome::Absent => debug!(host = host_id, item = %link.key, "no data yet"),
            SampleOutcome::Malformed(reason) => {
                debug!(host = host_id, item = %link.key, %reason, "discarding malformed sample")
            }
        }
        Ok(outcome)
    }
}
