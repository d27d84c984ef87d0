pub mod l3;
pub mod port_ranges;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::graph::{
    AggregatedProtoPorts, GraphDnsStats, GraphL3Stats, GraphL7Stats, GraphNodeType, GraphProcesses, NamespacedName,
    ServicePort,
};

pub use l3::{reconcile_l3_flows, RawL3Flow, MAX_AGGREGATED_PORT_RANGES_PER_PROTOCOL, MAX_AGGREGATED_PROTOCOLS};
pub use port_ranges::PortRangeSet;

fn is_zero_port(p: &u16) -> bool {
    *p == 0
}

/// The pre-graph identity of one side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowEndpoint {
    #[serde(rename = "type")]
    pub endpoint_type: GraphNodeType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_aggr: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl FlowEndpoint {
    pub fn new(endpoint_type: GraphNodeType, namespace: &str, name: &str, name_aggr: &str) -> Self {
        Self {
            endpoint_type,
            namespace: namespace.to_string(),
            name: name.to_string(),
            name_aggr: name_aggr.to_string(),
            port: 0,
            protocol: String::new(),
        }
    }

    pub fn with_port(mut self, protocol: &str, port: u16) -> Self {
        self.protocol = protocol.to_string();
        self.port = port;
        self
    }

    /// Key used to group endpoints into service groups.
    ///
    /// Pods key on their replica set so all replicas share a group. Hosts and networks key on the exact endpoint,
    /// port included, so unrelated services on a shared host are not merged.
    pub fn service_group_key(&self) -> Option<FlowEndpoint> {
        match self.endpoint_type {
            GraphNodeType::Workload | GraphNodeType::ReplicaSet => Some(FlowEndpoint::new(
                GraphNodeType::ReplicaSet,
                &self.namespace,
                "",
                &self.name_aggr,
            )),
            GraphNodeType::Host | GraphNodeType::Hosts | GraphNodeType::Network | GraphNodeType::NetworkSet => {
                Some(self.clone())
            }
            _ => None,
        }
    }
}

impl fmt::Display for FlowEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}/{}/{}]", self.endpoint_type, self.namespace, self.name, self.name_aggr)?;
        if self.port != 0 {
            write!(f, ":{}/{}", self.protocol, self.port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: FlowEndpoint,
    pub dest: FlowEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<ServicePort>,
}

impl fmt::Display for FlowEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service_port {
            Some(sp) => write!(f, "{} -> {} ({}:{})", self.source, self.dest, sp.service, sp.port),
            None => write!(f, "{} -> {}", self.source, self.dest),
        }
    }
}

/// A reconciled L3 flow between a source and a destination (group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L3Flow {
    pub edge: FlowEdge,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_proto_ports: Option<AggregatedProtoPorts>,
    pub stats: GraphL3Stats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<GraphProcesses>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L7Flow {
    pub edge: FlowEdge,
    pub stats: GraphL7Stats,
}

/// DNS client statistics for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsLog {
    pub endpoint: FlowEndpoint,
    pub stats: GraphDnsStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    #[serde(default)]
    pub severity: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A security event (alert) and the endpoints it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub details: EventDetails,
    #[serde(default)]
    pub endpoints: Vec<FlowEndpoint>,
}

/// Flush intervals configured for the log collectors. Used to normalise per-interval statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    pub l3_flow_flush_interval: Duration,
    pub l7_flow_flush_interval: Duration,
    pub dns_log_flush_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            l3_flow_flush_interval: Duration::from_secs(300),
            l7_flow_flush_interval: Duration::from_secs(300),
            dns_log_flush_interval: Duration::from_secs(300),
        }
    }
}

/// Result of a backend query that may have hit its record cap. Truncated results still carry what was gathered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched<T> {
    pub items: T,
    pub truncated: bool,
}

impl<T> Fetched<T> {
    pub fn complete(items: T) -> Self {
        Self { items, truncated: false }
    }

    pub fn truncated(items: T) -> Self {
        Self { items, truncated: true }
    }
}

/// Label selector strings (`key == "value"`) for a resource.
pub type LabelSelectors = Vec<String>;

pub type LabelMap = HashMap<NamespacedName, LabelSelectors>;
