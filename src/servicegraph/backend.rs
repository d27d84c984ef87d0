use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::view::validate_host_aggregation_selectors;
use crate::errors::{Result, ServiceGraphError};
use crate::flows::{DnsLog, Event, Fetched, FlowConfig, FlowEdge, FlowEndpoint, L3Flow, L7Flow, LabelMap};
use crate::graph::{GraphNodeType, HostAggregationSelector, TimeRange};

/// Source of the raw data behind a service graph.
///
/// Flow, DNS and event queries report a capped result through [`Fetched::truncated`] rather than failing.
#[async_trait]
pub trait ServiceGraphBackend: Send + Sync {
    async fn get_flow_config(&self, cluster: &str) -> Result<FlowConfig>;

    async fn get_l3_flow_data(
        &self,
        cluster: &str,
        time_range: &TimeRange,
        flow_config: &FlowConfig,
    ) -> Result<Fetched<Vec<L3Flow>>>;

    async fn get_l7_flow_data(
        &self,
        cluster: &str,
        time_range: &TimeRange,
        flow_config: &FlowConfig,
    ) -> Result<Fetched<Vec<L7Flow>>>;

    async fn get_dns_data(
        &self,
        cluster: &str,
        time_range: &TimeRange,
        flow_config: &FlowConfig,
    ) -> Result<Fetched<Vec<DnsLog>>>;

    async fn get_events(&self, cluster: &str, time_range: &TimeRange) -> Result<Fetched<Vec<Event>>>;

    async fn get_service_labels(&self, cluster: &str) -> Result<LabelMap>;
    async fn get_replica_set_labels(&self, cluster: &str) -> Result<LabelMap>;
    async fn get_stateful_set_labels(&self, cluster: &str) -> Result<LabelMap>;
    async fn get_daemon_set_labels(&self, cluster: &str) -> Result<LabelMap>;
    async fn get_pod_labels(&self, cluster: &str) -> Result<LabelMap>;

    /// The permissions of the requesting user.
    async fn new_rbac_filter(&self, cluster: &str) -> Result<Arc<dyn RbacFilter>>;

    /// Host naming for the requested host aggregation.
    async fn new_name_helper(
        &self,
        cluster: &str,
        selectors: &[HostAggregationSelector],
    ) -> Result<Arc<dyn NameHelper>>;
}

/// Per-user visibility of the graph data.
pub trait RbacFilter: Send + Sync {
    fn include_flow(&self, edge: &FlowEdge) -> bool;
    fn include_endpoint(&self, endpoint: &FlowEndpoint) -> bool;
    fn include_l7_logs(&self) -> bool;
    fn include_dns_logs(&self) -> bool;
    fn include_alerts(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RbacFilterIncludeAll;

impl RbacFilter for RbacFilterIncludeAll {
    fn include_flow(&self, _edge: &FlowEdge) -> bool {
        true
    }
    fn include_endpoint(&self, _endpoint: &FlowEndpoint) -> bool {
        true
    }
    fn include_l7_logs(&self) -> bool {
        true
    }
    fn include_dns_logs(&self) -> bool {
        true
    }
    fn include_alerts(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RbacFilterIncludeNone;

impl RbacFilter for RbacFilterIncludeNone {
    fn include_flow(&self, _edge: &FlowEdge) -> bool {
        false
    }
    fn include_endpoint(&self, _endpoint: &FlowEndpoint) -> bool {
        false
    }
    fn include_l7_logs(&self) -> bool {
        false
    }
    fn include_dns_logs(&self) -> bool {
        false
    }
    fn include_alerts(&self) -> bool {
        false
    }
}

/// Rewrites host endpoint names according to the requested host aggregation.
pub trait NameHelper: Send + Sync {
    fn convert_l3_flow(&self, flow: L3Flow) -> L3Flow;
    fn convert_l7_flow(&self, flow: L7Flow) -> L7Flow;
    fn convert_event(&self, event: Event) -> Event;

    /// The host names that make up a host group. Empty when unknown.
    fn compiled_host_names_from_aggregated_name(&self, name_aggr: &str) -> Vec<String>;
}

/// Hosts that do not belong to any named group are aggregated under this name.
pub const ALL_HOSTS_AGGREGATED_NAME: &str = "*";

static SELECTOR_TERM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*([A-Za-z0-9_./-]+)\s*==\s*"([^"]*)"\s*$"#).expect("valid selector term regex"));

/// A host label selector: `all()` or `key == "value"` terms joined with `&&`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostSelector {
    All,
    Terms(Vec<(String, String)>),
}

impl HostSelector {
    fn parse(selector: &str) -> Result<Self> {
        let trimmed = selector.trim();
        if trimmed == "all()" {
            return Ok(HostSelector::All);
        }
        let terms = trimmed
            .split("&&")
            .map(|term| {
                SELECTOR_TERM
                    .captures(term)
                    .map(|c| (c[1].to_string(), c[2].to_string()))
                    .ok_or_else(|| ServiceGraphError::invalid_request(format!("invalid selector: {}", selector)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(HostSelector::Terms(terms))
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            HostSelector::All => true,
            HostSelector::Terms(terms) => terms.iter().all(|(k, v)| labels.get(k) == Some(v)),
        }
    }
}

/// Name helper backed by a fixed host to group assignment.
///
/// Host endpoints carry the host name in `name_aggr` when read from the logs. Conversion moves it into `name` and
/// sets `name_aggr` to the host group, or `*` when the host is in no group.
#[derive(Debug, Clone, Default)]
pub struct StaticNameHelper {
    host_to_group: HashMap<String, String>,
    group_to_hosts: HashMap<String, Vec<String>>,
}

impl StaticNameHelper {
    pub fn new(host_to_group: HashMap<String, String>) -> Self {
        let mut group_to_hosts: HashMap<String, Vec<String>> = HashMap::new();
        for (host, group) in &host_to_group {
            group_to_hosts.entry(group.clone()).or_default().push(host.clone());
        }
        for hosts in group_to_hosts.values_mut() {
            hosts.sort();
        }
        Self { host_to_group, group_to_hosts }
    }

    /// Assigns each host to the first selector its labels match.
    pub fn from_selectors(
        selectors: &[HostAggregationSelector],
        host_labels: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Self> {
        validate_host_aggregation_selectors(selectors)?;
        let parsed = selectors
            .iter()
            .map(|s| Ok((s.name.clone(), HostSelector::parse(&s.selector)?)))
            .collect::<Result<Vec<_>>>()?;

        let host_to_group = host_labels
            .iter()
            .filter_map(|(host, labels)| {
                parsed.iter().find(|(_, sel)| sel.matches(labels)).map(|(name, _)| (host.clone(), name.clone()))
            })
            .collect();
        Ok(Self::new(host_to_group))
    }

    fn convert_endpoint(&self, ep: &mut FlowEndpoint) {
        if ep.endpoint_type != GraphNodeType::Host {
            return;
        }
        ep.name = std::mem::take(&mut ep.name_aggr);
        ep.name_aggr = self
            .host_to_group
            .get(&ep.name)
            .cloned()
            .unwrap_or_else(|| ALL_HOSTS_AGGREGATED_NAME.to_string());
    }
}

impl NameHelper for StaticNameHelper {
    fn convert_l3_flow(&self, mut flow: L3Flow) -> L3Flow {
        self.convert_endpoint(&mut flow.edge.source);
        self.convert_endpoint(&mut flow.edge.dest);
        flow
    }

    fn convert_l7_flow(&self, mut flow: L7Flow) -> L7Flow {
        self.convert_endpoint(&mut flow.edge.source);
        self.convert_endpoint(&mut flow.edge.dest);
        flow
    }

    fn convert_event(&self, mut event: Event) -> Event {
        for ep in &mut event.endpoints {
            self.convert_endpoint(ep);
        }
        event
    }

    fn compiled_host_names_from_aggregated_name(&self, name_aggr: &str) -> Vec<String> {
        self.group_to_hosts.get(name_aggr).cloned().unwrap_or_default()
    }
}
