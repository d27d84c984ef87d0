use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{NameHelper, RbacFilter, RbacFilterIncludeAll, ServiceGraphBackend, StaticNameHelper};
use crate::errors::Result;
use crate::flows::{reconcile_l3_flows, DnsLog, Event, Fetched, FlowConfig, L3Flow, L7Flow, LabelMap, RawL3Flow};
use crate::graph::{HostAggregationSelector, NamespacedName, TimeRange};

/// Labels of one named resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLabels {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotFlowConfig {
    pub l3_flow_flush_interval_secs: u64,
    pub l7_flow_flush_interval_secs: u64,
    pub dns_log_flush_interval_secs: u64,
}

impl Default for SnapshotFlowConfig {
    fn default() -> Self {
        let defaults = FlowConfig::default();
        Self {
            l3_flow_flush_interval_secs: defaults.l3_flow_flush_interval.as_secs(),
            l7_flow_flush_interval_secs: defaults.l7_flow_flush_interval.as_secs(),
            dns_log_flush_interval_secs: defaults.dns_log_flush_interval.as_secs(),
        }
    }
}

impl From<SnapshotFlowConfig> for FlowConfig {
    fn from(c: SnapshotFlowConfig) -> Self {
        FlowConfig {
            l3_flow_flush_interval: Duration::from_secs(c.l3_flow_flush_interval_secs),
            l7_flow_flush_interval: Duration::from_secs(c.l7_flow_flush_interval_secs),
            dns_log_flush_interval: Duration::from_secs(c.dns_log_flush_interval_secs),
        }
    }
}

/// Recorded backend data for one cluster.
///
/// L3 records are stored raw, in pages, exactly as the log store returns them, so they go through the same
/// reconciliation as live data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub flow_config: SnapshotFlowConfig,
    pub l3_pages: Vec<Vec<RawL3Flow>>,
    pub l7: Vec<L7Flow>,
    pub dns: Vec<DnsLog>,
    pub events: Vec<Event>,
    pub service_labels: Vec<ResourceLabels>,
    pub replica_set_labels: Vec<ResourceLabels>,
    pub stateful_set_labels: Vec<ResourceLabels>,
    pub daemon_set_labels: Vec<ResourceLabels>,
    pub pod_labels: Vec<ResourceLabels>,
    /// Host name to node labels, used to evaluate host aggregation selectors.
    pub host_labels: BTreeMap<String, BTreeMap<String, String>>,
}

/// Backend serving a [`Snapshot`] for every cluster and time range. Everything is visible to everyone.
#[derive(Debug, Clone)]
pub struct SnapshotBackend {
    snapshot: Arc<Snapshot>,
    max_aggregated_records: usize,
}

impl SnapshotBackend {
    pub fn new(snapshot: Snapshot, max_aggregated_records: usize) -> Self {
        Self { snapshot: Arc::new(snapshot), max_aggregated_records }
    }

    pub fn load(path: &Path, max_aggregated_records: usize) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot file: {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot file: {}", path.display()))?;
        info!(
            "📂 Loaded snapshot {} ({} L3 pages, {} L7 flows, {} DNS logs, {} events)",
            path.display(),
            snapshot.l3_pages.len(),
            snapshot.l7.len(),
            snapshot.dns.len(),
            snapshot.events.len()
        );
        Ok(Self::new(snapshot, max_aggregated_records))
    }

    fn capped<T: Clone>(&self, items: &[T]) -> Fetched<Vec<T>> {
        if items.len() > self.max_aggregated_records {
            Fetched::truncated(items[..self.max_aggregated_records].to_vec())
        } else {
            Fetched::complete(items.to_vec())
        }
    }
}

fn label_map(labels: &[ResourceLabels]) -> LabelMap {
    labels
        .iter()
        .map(|r| (NamespacedName::new(r.namespace.clone(), r.name.clone()), r.labels.clone()))
        .collect()
}

#[async_trait]
impl ServiceGraphBackend for SnapshotBackend {
    async fn get_flow_config(&self, _cluster: &str) -> Result<FlowConfig> {
        Ok(self.snapshot.flow_config.into())
    }

    async fn get_l3_flow_data(
        &self,
        cluster: &str,
        time_range: &TimeRange,
        flow_config: &FlowConfig,
    ) -> Result<Fetched<Vec<L3Flow>>> {
        debug!("Reconciling {} snapshot L3 pages for {}", self.snapshot.l3_pages.len(), cluster);
        let pages = futures::stream::iter(self.snapshot.l3_pages.iter().cloned().map(Ok));
        reconcile_l3_flows(pages, time_range, flow_config, self.max_aggregated_records).await
    }

    async fn get_l7_flow_data(
        &self,
        _cluster: &str,
        _time_range: &TimeRange,
        _flow_config: &FlowConfig,
    ) -> Result<Fetched<Vec<L7Flow>>> {
        Ok(self.capped(&self.snapshot.l7))
    }

    async fn get_dns_data(
        &self,
        _cluster: &str,
        _time_range: &TimeRange,
        _flow_config: &FlowConfig,
    ) -> Result<Fetched<Vec<DnsLog>>> {
        Ok(self.capped(&self.snapshot.dns))
    }

    async fn get_events(&self, _cluster: &str, time_range: &TimeRange) -> Result<Fetched<Vec<Event>>> {
        let in_range: Vec<Event> = self
            .snapshot
            .events
            .iter()
            .filter(|ev| ev.details.timestamp.map_or(true, |t| t >= time_range.from && t <= time_range.to))
            .cloned()
            .collect();
        Ok(self.capped(&in_range))
    }

    async fn get_service_labels(&self, _cluster: &str) -> Result<LabelMap> {
        Ok(label_map(&self.snapshot.service_labels))
    }

    async fn get_replica_set_labels(&self, _cluster: &str) -> Result<LabelMap> {
        Ok(label_map(&self.snapshot.replica_set_labels))
    }

    async fn get_stateful_set_labels(&self, _cluster: &str) -> Result<LabelMap> {
        Ok(label_map(&self.snapshot.stateful_set_labels))
    }

    async fn get_daemon_set_labels(&self, _cluster: &str) -> Result<LabelMap> {
        Ok(label_map(&self.snapshot.daemon_set_labels))
    }

    async fn get_pod_labels(&self, _cluster: &str) -> Result<LabelMap> {
        Ok(label_map(&self.snapshot.pod_labels))
    }

    async fn new_rbac_filter(&self, _cluster: &str) -> Result<Arc<dyn RbacFilter>> {
        Ok(Arc::new(RbacFilterIncludeAll))
    }

    async fn new_name_helper(
        &self,
        _cluster: &str,
        selectors: &[HostAggregationSelector],
    ) -> Result<Arc<dyn NameHelper>> {
        Ok(Arc::new(StaticNameHelper::from_selectors(selectors, &self.snapshot.host_labels)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::EventDetails;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    const SNAPSHOT: &str = r#"{
        "flow_config": {"l3_flow_flush_interval_secs": 60},
        "l3_pages": [[{
            "reporter": "src",
            "action": "allow",
            "protocol": "tcp",
            "source": {"type": "wep", "namespace": "n1", "aggregated_name": "a-*"},
            "destination": {"type": "wep", "namespace": "n2", "aggregated_name": "b-*", "port": 80},
            "log_stats": {"log_count": 1, "flow_log_count": 1},
            "traffic_stats": {"packets_in": 5, "packets_out": 5, "bytes_in": 50, "bytes_out": 50}
        }]],
        "service_labels": [{"namespace": "n2", "name": "svc", "labels": ["app == \"b\""]}],
        "pod_labels": [{"namespace": "n2", "name": "b-1", "labels": ["app == \"b\""]}]
    }"#;

    #[tokio::test]
    async fn test_load_and_serve() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(SNAPSHOT.as_bytes())?;
        let backend = SnapshotBackend::load(file.path(), 100)?;

        let fc = backend.get_flow_config("c").await?;
        assert_eq!(fc.l3_flow_flush_interval, Duration::from_secs(60));
        assert_eq!(fc.l7_flow_flush_interval, Duration::from_secs(300));

        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let tr = TimeRange::absolute(from, from + chrono::Duration::minutes(15));
        let l3 = backend.get_l3_flow_data("c", &tr, &fc).await?;
        assert!(!l3.truncated);
        assert_eq!(l3.items.len(), 1);
        assert_eq!(l3.items[0].edge.dest.namespace, "n2");

        let svc = backend.get_service_labels("c").await?;
        assert_eq!(svc.get(&NamespacedName::new("n2", "svc")).map(Vec::len), Some(1));
        assert!(backend.get_replica_set_labels("c").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_caps_and_event_window() -> anyhow::Result<()> {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = |id: &str, minutes: i64| Event {
            id: id.to_string(),
            details: EventDetails { timestamp: Some(from + chrono::Duration::minutes(minutes)), ..Default::default() },
            endpoints: Vec::new(),
        };
        let snapshot = Snapshot { events: vec![event("in", 5), event("out", 60), event("in2", 10)], ..Default::default() };
        let backend = SnapshotBackend::new(snapshot, 1);

        let tr = TimeRange::absolute(from, from + chrono::Duration::minutes(15));
        let events = backend.get_events("c", &tr).await?;
        assert!(events.truncated);
        assert_eq!(events.items.len(), 1);
        assert_eq!(events.items[0].id, "in");
        Ok(())
    }
}
