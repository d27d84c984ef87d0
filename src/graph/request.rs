use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{GraphNodeId, TimeRange};

/// A named group of nodes that collapses into a single node in the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<GraphNodeId>,
}

/// A named host group. The selector is evaluated by the name helper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAggregationSelector {
    pub name: String,
    pub selector: String,
}

/// The view requested by the client: which nodes are in focus, expanded, followed, and how they are grouped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphView {
    pub focus: Vec<GraphNodeId>,
    pub expanded: Vec<GraphNodeId>,
    pub followed_ingress: Vec<GraphNodeId>,
    pub followed_egress: Vec<GraphNodeId>,
    pub layers: Vec<Layer>,
    pub host_aggregation_selectors: Vec<HostAggregationSelector>,
    pub split_ingress_egress: bool,
    pub follow_connection_direction: bool,
    pub expand_ports: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceGraphRequest {
    pub cluster: String,
    pub time_range: TimeRange,
    pub view: GraphView,
    /// How long the request waits for data before giving up. The backend query carries on regardless.
    pub timeout: Duration,
    pub force_refresh: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_defaults_from_partial_json() {
        let view: GraphView = serde_json::from_str(
            r#"{"focus": ["namespace/n1"], "layers": [{"name": "infra", "nodes": ["namespace/kube-system"]}]}"#,
        )
        .unwrap();
        assert_eq!(view.focus, vec![GraphNodeId::from("namespace/n1")]);
        assert_eq!(view.layers[0].nodes.len(), 1);
        assert!(!view.split_ingress_egress);
        assert!(view.expanded.is_empty());
    }
}
