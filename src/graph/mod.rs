pub mod ports;
pub mod request;
pub mod stats;
pub mod time;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use ports::{merge_port_ranges, AggregatedPorts, AggregatedProtoPorts, PortRange};
pub use request::{GraphView, HostAggregationSelector, Layer, ServiceGraphRequest};
pub use stats::*;
pub use time::TimeRange;

/// The kind of a graph node. The serialized names double as the type segment of a node ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GraphNodeType {
    #[serde(rename = "layer")]
    Layer,
    #[serde(rename = "namespace")]
    Namespace,
    #[serde(rename = "svcgp")]
    ServiceGroup,
    #[serde(rename = "rep")]
    ReplicaSet,
    #[serde(rename = "wep")]
    Workload,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "hosts")]
    Hosts,
    #[serde(rename = "net")]
    Network,
    #[serde(rename = "ns")]
    NetworkSet,
    #[serde(rename = "port")]
    Port,
    #[serde(rename = "svc")]
    Service,
    #[serde(rename = "svcport")]
    ServicePort,
}

impl GraphNodeType {
    pub const ALL: [GraphNodeType; 12] = [
        GraphNodeType::Layer,
        GraphNodeType::Namespace,
        GraphNodeType::ServiceGroup,
        GraphNodeType::ReplicaSet,
        GraphNodeType::Workload,
        GraphNodeType::Host,
        GraphNodeType::Hosts,
        GraphNodeType::Network,
        GraphNodeType::NetworkSet,
        GraphNodeType::Port,
        GraphNodeType::Service,
        GraphNodeType::ServicePort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphNodeType::Layer => "layer",
            GraphNodeType::Namespace => "namespace",
            GraphNodeType::ServiceGroup => "svcgp",
            GraphNodeType::ReplicaSet => "rep",
            GraphNodeType::Workload => "wep",
            GraphNodeType::Host => "host",
            GraphNodeType::Hosts => "hosts",
            GraphNodeType::Network => "net",
            GraphNodeType::NetworkSet => "ns",
            GraphNodeType::Port => "port",
            GraphNodeType::Service => "svc",
            GraphNodeType::ServicePort => "svcport",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// True for node types that represent one side of a flow.
    pub fn is_endpoint(&self) -> bool {
        matches!(
            self,
            GraphNodeType::Hosts
                | GraphNodeType::Host
                | GraphNodeType::ReplicaSet
                | GraphNodeType::Workload
                | GraphNodeType::NetworkSet
                | GraphNodeType::Network
        )
    }

    /// The aggregated form of an endpoint type: pods roll up into replica sets, hosts into host groups.
    pub fn to_aggregated(self) -> Self {
        match self {
            GraphNodeType::Workload => GraphNodeType::ReplicaSet,
            GraphNodeType::Host => GraphNodeType::Hosts,
            other => other,
        }
    }
}

impl fmt::Display for GraphNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn is_zero_port(p: &u16) -> bool {
    *p == 0
}

/// A service port. The default value stands for "no service".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(flatten)]
    pub service: NamespacedName,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_name: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl ServicePort {
    pub fn is_service(&self) -> bool {
        !self.service.name.is_empty()
    }
}

pub type ServicePorts = BTreeSet<ServicePort>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphNodeId(String);

impl GraphNodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for GraphNodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GraphNodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for GraphNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdgeId {
    pub source_node_id: GraphNodeId,
    pub dest_node_id: GraphNodeId,
}

/// Query selectors for the logs associated with a node, an edge or the whole view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSelectors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3_flows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l7_flows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_capture: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_count(c: &u32) -> bool {
    *c == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: GraphNodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<GraphNodeId>,
    #[serde(rename = "type")]
    pub node_type: GraphNodeType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub service_ports: ServicePorts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_proto_ports: Option<AggregatedProtoPorts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_within: Vec<GraphStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_ingress: Vec<GraphStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_egress: Vec<GraphStats>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub expandable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub expanded: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub follow_ingress: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub follow_egress: bool,
    #[serde(default)]
    pub selectors: GraphSelectors,
    #[serde(default, skip_serializing_if = "is_zero_count")]
    pub events_count: u32,
}

impl GraphNode {
    pub fn new(id: GraphNodeId, node_type: GraphNodeType) -> Self {
        Self {
            id,
            parent_id: None,
            node_type,
            namespace: String::new(),
            name: String::new(),
            port: 0,
            protocol: String::new(),
            service_ports: ServicePorts::new(),
            aggregated_proto_ports: None,
            stats_within: Vec::new(),
            stats_ingress: Vec::new(),
            stats_egress: Vec::new(),
            expandable: false,
            expanded: false,
            follow_ingress: false,
            follow_egress: false,
            selectors: GraphSelectors::default(),
            events_count: 0,
        }
    }

    pub fn include_stats_within(&mut self, stats: &[GraphStats]) {
        combine_stats_slices(&mut self.stats_within, stats);
    }

    pub fn include_stats_ingress(&mut self, stats: &[GraphStats]) {
        combine_stats_slices(&mut self.stats_ingress, stats);
    }

    pub fn include_stats_egress(&mut self, stats: &[GraphStats]) {
        combine_stats_slices(&mut self.stats_egress, stats);
    }

    pub fn include_service_port(&mut self, sp: &ServicePort) {
        self.service_ports.insert(sp.clone());
    }

    pub fn include_aggregated_proto_ports(&mut self, app: Option<&AggregatedProtoPorts>) {
        let Some(app) = app else { return };
        match self.aggregated_proto_ports.as_mut() {
            Some(existing) => existing.combine(app),
            None => self.aggregated_proto_ports = Some(app.clone()),
        }
    }

    /// Distinct services referenced by this node, sorted.
    pub fn services(&self) -> Vec<NamespacedName> {
        let set: BTreeSet<NamespacedName> = self.service_ports.iter().map(|sp| sp.service.clone()).collect();
        set.into_iter().collect()
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent_id {
            Some(parent) => write!(f, "Node({}; parent={}; expandable={})", self.id, parent, self.expandable),
            None => write!(f, "Node({}; expandable={})", self.id, self.expandable),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: GraphEdgeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<GraphStats>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub service_ports: ServicePorts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_proto_ports: Option<AggregatedProtoPorts>,
    #[serde(default)]
    pub selectors: GraphSelectors,
}

impl GraphEdge {
    pub fn new(id: GraphEdgeId, stats: &[GraphStats], endpoint_proto_ports: Option<&AggregatedProtoPorts>) -> Self {
        Self {
            id,
            stats: stats.to_vec(),
            service_ports: ServicePorts::new(),
            endpoint_proto_ports: endpoint_proto_ports.cloned(),
            selectors: GraphSelectors::default(),
        }
    }

    pub fn include_stats(&mut self, stats: &[GraphStats]) {
        combine_stats_slices(&mut self.stats, stats);
    }

    pub fn include_service_port(&mut self, sp: &ServicePort) {
        self.service_ports.insert(sp.clone());
    }

    pub fn include_endpoint_proto_ports(&mut self, app: Option<&AggregatedProtoPorts>) {
        let Some(app) = app else { return };
        match self.endpoint_proto_ports.as_mut() {
            Some(existing) => existing.combine(app),
            None => self.endpoint_proto_ports = Some(app.clone()),
        }
    }
}

impl fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge({} -> {})", self.id.source_node_id, self.id.dest_node_id)
    }
}

/// The rendered service graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceGraphResponse {
    pub time_intervals: Vec<TimeRange>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub selectors: GraphSelectors,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
}
