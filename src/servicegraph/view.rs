use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::id::{get_normalized_ids, parse_graph_node_id, ComponentKind, IdInfo};
use super::service_groups::{ServiceGroup, ServiceGroupLookup, ServiceGroups};
use crate::errors::{Result, ServiceGraphError};
use crate::flows::FlowEndpoint;
use crate::graph::{GraphNodeId, GraphNodeType, GraphView, HostAggregationSelector};

static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-zA-Z_.-]+$").expect("valid name regex"));

/// Per-node flags requested by the view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeViewData {
    pub in_focus: bool,
    pub expanded: bool,
    pub followed_ingress: bool,
    pub followed_egress: bool,
}

impl NodeViewData {
    pub fn combine(self, other: NodeViewData) -> NodeViewData {
        NodeViewData {
            in_focus: self.in_focus || other.in_focus,
            expanded: self.expanded || other.expanded,
            followed_ingress: self.followed_ingress || other.followed_ingress,
            followed_egress: self.followed_egress || other.followed_egress,
        }
    }
}

/// Layer membership in both directions.
///
/// Layers only hold indivisible groups: an endpoint in a layer pulls in its service group, or failing that its
/// aggregated endpoint. When a group is listed in more than one layer the first layer wins.
#[derive(Debug, Clone, Default)]
pub struct ParsedLayers {
    pub namespace_to_layer: HashMap<String, String>,
    pub service_group_to_layer: HashMap<GraphNodeId, String>,
    /// Keyed by aggregated endpoint ID.
    pub endpoint_to_layer: HashMap<GraphNodeId, String>,
    pub layer_to_namespaces: BTreeMap<String, Vec<String>>,
    pub layer_to_service_groups: BTreeMap<String, Vec<Arc<ServiceGroup>>>,
    pub layer_to_endpoints: BTreeMap<String, Vec<FlowEndpoint>>,
}

impl ParsedLayers {
    fn add_namespace(&mut self, layer: &str, namespace: &str) {
        if self.namespace_to_layer.contains_key(namespace) {
            return;
        }
        self.namespace_to_layer.insert(namespace.to_string(), layer.to_string());
        self.layer_to_namespaces.entry(layer.to_string()).or_default().push(namespace.to_string());
    }

    fn add_service_group(&mut self, layer: &str, sg: Arc<ServiceGroup>) {
        if self.service_group_to_layer.contains_key(&sg.id) {
            return;
        }
        self.service_group_to_layer.insert(sg.id.clone(), layer.to_string());
        self.layer_to_service_groups.entry(layer.to_string()).or_default().push(sg);
    }

    fn add_endpoint(&mut self, layer: &str, info: &IdInfo) {
        let (Some(id), Some(endpoint_type)) = (info.aggr_endpoint_id(), info.aggr_endpoint_type()) else {
            return;
        };
        if self.endpoint_to_layer.contains_key(&id) {
            return;
        }
        self.endpoint_to_layer.insert(id, layer.to_string());
        self.layer_to_endpoints.entry(layer.to_string()).or_default().push(FlowEndpoint::new(
            endpoint_type,
            &info.namespace,
            "",
            &info.name_aggr,
        ));
    }
}

/// A view with every node ID resolved against the current service groups.
#[derive(Debug, Clone, Default)]
pub struct ParsedView {
    pub node_view_data: HashMap<GraphNodeId, NodeViewData>,
    pub layers: ParsedLayers,
    /// No focus means the whole graph is in view.
    pub empty_focus: bool,
    pub split_ingress_egress: bool,
    pub follow_connection_direction: bool,
    pub expand_ports: bool,
}

impl ParsedView {
    pub fn view_data(&self, id: &GraphNodeId) -> NodeViewData {
        self.node_view_data.get(id).copied().unwrap_or_default()
    }

    fn mark(
        &mut self,
        ids: &[GraphNodeId],
        what: &str,
        sgs: &ServiceGroups,
        set: impl Fn(&mut NodeViewData),
    ) -> Result<()> {
        for id in ids {
            let normalized = get_normalized_ids(id, sgs, self.split_ingress_egress)
                .map_err(|err| ServiceGraphError::invalid_request(format!("invalid {} node: {}", what, err)))?;
            for nid in normalized {
                set(self.node_view_data.entry(nid).or_default());
            }
        }
        Ok(())
    }
}

pub fn validate_host_aggregation_selectors(selectors: &[HostAggregationSelector]) -> Result<()> {
    let mut names = HashSet::new();
    for s in selectors {
        if !NAME.is_match(&s.name) {
            return Err(ServiceGraphError::invalid_request(format!("invalid aggregated host name: {}", s.name)));
        }
        if !names.insert(s.name.as_str()) {
            return Err(ServiceGraphError::invalid_request(format!("duplicate aggregated host name: {}", s.name)));
        }
    }
    Ok(())
}

/// Syntax checks on a view. Runs before any data is fetched, so service group membership is not checked here.
pub fn validate_view(view: &GraphView) -> Result<()> {
    validate_host_aggregation_selectors(&view.host_aggregation_selectors)?;
    parse_view(view, &ServiceGroups::default()).map(|_| ())
}

/// Resolves the view node IDs for the given service groups.
pub fn parse_view(view: &GraphView, sgs: &ServiceGroups) -> Result<ParsedView> {
    let mut pv = ParsedView {
        empty_focus: view.focus.is_empty(),
        split_ingress_egress: view.split_ingress_egress,
        follow_connection_direction: view.follow_connection_direction,
        expand_ports: view.expand_ports,
        ..Default::default()
    };

    pv.mark(&view.focus, "focus", sgs, |vd| vd.in_focus = true)?;
    pv.mark(&view.expanded, "expanded", sgs, |vd| vd.expanded = true)?;
    pv.mark(&view.followed_ingress, "followed_ingress", sgs, |vd| vd.followed_ingress = true)?;
    pv.mark(&view.followed_egress, "followed_egress", sgs, |vd| vd.followed_egress = true)?;

    let mut layer_names = HashSet::new();
    for layer in &view.layers {
        if !NAME.is_match(&layer.name) {
            return Err(ServiceGraphError::invalid_request(format!("invalid layer name: {}", layer.name)));
        }
        if !layer_names.insert(layer.name.as_str()) {
            return Err(ServiceGraphError::invalid_request(format!("duplicate layer name: {}", layer.name)));
        }

        for id in &layer.nodes {
            let info = parse_graph_node_id(id, sgs)
                .map_err(|err| ServiceGraphError::invalid_request(format!("invalid layer node: {}", err)))?;
            add_layer_node(&mut pv.layers, &layer.name, id, &info, sgs)?;
        }
    }

    debug!(
        "Parsed view: {} nodes with view data, {} layers, empty focus={}",
        pv.node_view_data.len(),
        view.layers.len(),
        pv.empty_focus
    );
    Ok(pv)
}

fn add_layer_node(
    layers: &mut ParsedLayers,
    layer: &str,
    id: &GraphNodeId,
    info: &IdInfo,
    sgs: &ServiceGroups,
) -> Result<()> {
    let Some(ComponentKind::Node(t)) = info.parsed_type else {
        return Err(invalid_layer_node(id));
    };
    match t {
        GraphNodeType::Layer => return Err(invalid_layer_node(id)),
        GraphNodeType::Namespace => layers.add_namespace(layer, &info.namespace),
        GraphNodeType::ServiceGroup | GraphNodeType::Service | GraphNodeType::ServicePort => {
            let sg = info.service_group.clone().or_else(|| sgs.get_by_service(&info.service.service));
            match sg {
                Some(sg) => layers.add_service_group(layer, sg),
                None => debug!("Layer {} references unknown service {}", layer, id),
            }
        }
        _ => match info.service_group.clone() {
            Some(sg) => layers.add_service_group(layer, sg),
            None => layers.add_endpoint(layer, info),
        },
    }
    Ok(())
}

fn invalid_layer_node(id: &GraphNodeId) -> ServiceGraphError {
    ServiceGraphError::invalid_request(format!(
        "invalid layer node: {}",
        ServiceGraphError::invalid_node_id(id.as_str(), Some("layers may not contain layers"))
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Layer, NamespacedName, ServicePort};

    fn ids(ids: &[&str]) -> Vec<GraphNodeId> {
        ids.iter().map(|s| GraphNodeId::from(*s)).collect()
    }

    fn groups() -> ServiceGroups {
        let sp = ServicePort {
            service: NamespacedName::new("n1", "frontend"),
            port_name: "http".to_string(),
            port: 80,
            protocol: "tcp".to_string(),
        };
        let mut builder = ServiceGroups::builder();
        builder.add_mapping(&sp, &FlowEndpoint::new(GraphNodeType::Workload, "n1", "fe-1", "fe-*").with_port("tcp", 8080));
        builder.finish()
    }

    #[test]
    fn test_view_flags_are_normalized() {
        let view = GraphView {
            focus: ids(&["namespace/n1"]),
            expanded: ids(&["svcgp;svc/n1/frontend"]),
            followed_egress: ids(&["net/pub"]),
            split_ingress_egress: true,
            ..Default::default()
        };
        let pv = parse_view(&view, &groups()).unwrap();

        assert!(!pv.empty_focus);
        assert!(pv.view_data(&"namespace/n1".into()).in_focus);
        assert!(pv.view_data(&"svcgp;svc/n1/frontend".into()).expanded);
        assert!(pv.view_data(&"net/pub;dir/ingress".into()).followed_egress);
        assert!(pv.view_data(&"net/pub;dir/egress".into()).followed_egress);
        assert_eq!(pv.view_data(&"namespace/n2".into()), NodeViewData::default());
    }

    #[test]
    fn test_layers_hold_indivisible_groups() {
        let view = GraphView {
            layers: vec![
                Layer {
                    name: "infra".to_string(),
                    nodes: ids(&["namespace/kube-system", "wep/n1/fe-1/fe-*", "rep/n2/db-*"]),
                },
                Layer { name: "other".to_string(), nodes: ids(&["namespace/kube-system"]) },
            ],
            ..Default::default()
        };
        let pv = parse_view(&view, &groups()).unwrap();

        assert_eq!(pv.layers.namespace_to_layer["kube-system"], "infra");
        assert!(!pv.layers.layer_to_namespaces.contains_key("other"));
        assert_eq!(pv.layers.service_group_to_layer[&GraphNodeId::from("svcgp;svc/n1/frontend")], "infra");
        assert_eq!(pv.layers.endpoint_to_layer[&GraphNodeId::from("rep/n2/db-*")], "infra");
        assert_eq!(
            pv.layers.layer_to_endpoints["infra"],
            vec![FlowEndpoint::new(GraphNodeType::ReplicaSet, "n2", "", "db-*")]
        );
        assert!(pv.empty_focus);
    }

    #[test]
    fn test_view_errors() {
        let cases: Vec<(GraphView, &str)> = vec![
            (
                GraphView { focus: ids(&["foo/bar"]), ..Default::default() },
                "invalid focus node: unexpected format of node ID foo/bar",
            ),
            (
                GraphView { expanded: ids(&["port/tcp/x;rep/n/a"]), ..Default::default() },
                "invalid expanded node: unexpected format of node ID port/tcp/x;rep/n/a: port is not a number",
            ),
            (
                GraphView {
                    layers: vec![Layer { name: "bad name".to_string(), nodes: vec![] }],
                    ..Default::default()
                },
                "invalid layer name: bad name",
            ),
            (
                GraphView {
                    layers: vec![
                        Layer { name: "a".to_string(), nodes: vec![] },
                        Layer { name: "a".to_string(), nodes: vec![] },
                    ],
                    ..Default::default()
                },
                "duplicate layer name: a",
            ),
            (
                GraphView {
                    host_aggregation_selectors: vec![HostAggregationSelector {
                        name: "a b".to_string(),
                        selector: "all()".to_string(),
                    }],
                    ..Default::default()
                },
                "invalid aggregated host name: a b",
            ),
        ];
        for (view, expected) in cases {
            assert_eq!(validate_view(&view).unwrap_err().to_string(), expected);
        }
    }
}
