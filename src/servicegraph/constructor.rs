//! Builds the service graph response from filtered flow data and a parsed view.
//!
//! Nodes are tracked in an arena and addressed by index. A tracked group is the least divisible unit for pruning: a
//! collapsed layer or namespace, a service group, or an aggregated endpoint outside any service group. Pruning only
//! looks at connectivity between groups.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

use super::id::{Direction, IdInfo};
use super::selectors::{LogSelectors, Selector, SelectorHelper, SelectorPairs};
use super::service_groups::{ServiceGroup, ServiceGroupLookup};
use super::view::{NodeViewData, ParsedView};
use super::{ServiceGraphData, TimeSeriesFlow};
use crate::errors::{Result, ServiceGraphError};
use crate::flows::FlowEndpoint;
use crate::graph::{
    AggregatedProtoPorts, GraphEdge, GraphEdgeId, GraphNode, GraphNodeId, GraphNodeType, GraphSelectors, GraphStats,
    NamespacedName, ServiceGraphResponse, ServicePort,
};

/// Packet capture selector for a namespace node.
pub const K8S_ALL_SELECTOR: &str = "all()";

type NodeIdx = usize;
type GroupIdx = usize;

struct TrackedNode {
    graph_node: GraphNode,
    parent: Option<NodeIdx>,
    selectors: SelectorPairs,
    view_data: NodeViewData,
}

struct TrackedGroup {
    node: NodeIdx,
    parents: Vec<NodeIdx>,
    children: BTreeSet<NodeIdx>,
    view_data: NodeViewData,
    ingress: BTreeSet<GroupIdx>,
    egress: BTreeSet<GroupIdx>,
    processed_ingress: bool,
    processed_egress: bool,
    followed_ingress: bool,
    followed_egress: bool,
}

/// Endpoint nodes on either side of connections through a service node.
#[derive(Default)]
struct ServiceEdges {
    dest_nodes_by_source_node: HashMap<NodeIdx, BTreeSet<NodeIdx>>,
    source_nodes_by_dest_node: HashMap<NodeIdx, BTreeSet<NodeIdx>>,
}

impl ServiceEdges {
    fn add(&mut self, source: NodeIdx, dest: NodeIdx) {
        self.dest_nodes_by_source_node.entry(source).or_default().insert(dest);
        self.source_nodes_by_dest_node.entry(dest).or_default().insert(source);
    }
}

/// Nodes an endpoint resolved to, outermost first.
struct Hierarchy {
    group: GroupIdx,
    endpoint_nodes: Vec<NodeIdx>,
    /// Up to the service or service port node, when the service group is expanded.
    service_nodes: Vec<NodeIdx>,
}

/// Calculates the service graph from the flow data and parsed view.
pub fn get_service_graph_response(data: &ServiceGraphData, view: &ParsedView) -> ServiceGraphResponse {
    let mut s = ServiceGraphConstructor::new(data, view);
    s.populate();
    s.prune();
    s.overlay_events();
    s.overlay_dns();
    s.overlay_selectors();
    s.into_response()
}

struct ServiceGraphConstructor<'a> {
    nodes: Vec<TrackedNode>,
    node_index: HashMap<GraphNodeId, NodeIdx>,
    groups: Vec<TrackedGroup>,
    group_index: HashMap<GraphNodeId, GroupIdx>,
    edges: BTreeMap<GraphEdgeId, GraphEdge>,
    service_edges: HashMap<NodeIdx, ServiceEdges>,
    data: &'a ServiceGraphData,
    view: &'a ParsedView,
    selh: SelectorHelper<'a>,
    view_selectors: GraphSelectors,
}

impl<'a> ServiceGraphConstructor<'a> {
    fn new(data: &'a ServiceGraphData, view: &'a ParsedView) -> Self {
        Self {
            nodes: Vec::new(),
            node_index: HashMap::new(),
            groups: Vec::new(),
            group_index: HashMap::new(),
            edges: BTreeMap::new(),
            service_edges: HashMap::new(),
            data,
            view,
            selh: SelectorHelper::new(&view.layers, data.name_helper.as_ref(), &data.service_groups),
            view_selectors: GraphSelectors::default(),
        }
    }

    fn populate(&mut self) {
        let data = self.data;
        for flow in &data.filtered_flows {
            if let Err(err) = self.track_flow(flow) {
                error!("Unable to process flow {}: {}", flow, err);
            }
        }
    }

    /// Converts a flow into its source and dest node hierarchies and at most two edges, aggregating the stats.
    fn track_flow(&mut self, flow: &TimeSeriesFlow) -> Result<()> {
        debug!("Processing: {}", flow);

        let (egress, ingress) = if self.view.split_ingress_egress {
            (Some(Direction::Egress), Some(Direction::Ingress))
        } else {
            (None, None)
        };
        let service_port = flow.edge.service_port.as_ref().filter(|sp| sp.is_service());

        let src = self.track_nodes(&flow.edge.source, None, egress)?;
        let dst = self.track_nodes(&flow.edge.dest, service_port, ingress)?;

        let dest_ep = &flow.edge.dest;
        let proto_ports = if dest_ep.port != 0 {
            Some(AggregatedProtoPorts::single(&dest_ep.protocol, dest_ep.port))
        } else {
            flow.aggregated_proto_ports.clone()
        };

        // The service port node already carries its own port, so stop above it.
        if let Some(sp) = service_port {
            if !dst.service_nodes.is_empty() {
                for &t in &dst.service_nodes {
                    if self.nodes[t].graph_node.node_type == GraphNodeType::ServicePort {
                        break;
                    }
                    self.nodes[t].graph_node.include_service_port(sp);
                }
            } else {
                for &t in &dst.endpoint_nodes {
                    self.nodes[t].graph_node.include_service_port(sp);
                }
            }
        }

        if let Some(app) = &proto_ports {
            for &t in &dst.endpoint_nodes {
                if self.nodes[t].graph_node.node_type.is_endpoint() {
                    self.nodes[t].graph_node.include_aggregated_proto_ports(Some(app));
                }
            }
        }

        // Shared ancestors see the traffic as within, the divergent parts as egress and ingress.
        let max_idx = src.endpoint_nodes.len().min(dst.endpoint_nodes.len());
        let mut divergent = 0;
        while divergent < max_idx && src.endpoint_nodes[divergent] == dst.endpoint_nodes[divergent] {
            self.nodes[src.endpoint_nodes[divergent]].graph_node.include_stats_within(&flow.stats);
            divergent += 1;
        }
        for &t in &src.endpoint_nodes[divergent..] {
            self.nodes[t].graph_node.include_stats_egress(&flow.stats);
        }
        for &t in &dst.endpoint_nodes[divergent..] {
            self.nodes[t].graph_node.include_stats_ingress(&flow.stats);
        }

        if src.group == dst.group {
            return Ok(());
        }

        let (Some(&src_ep), Some(&dst_ep)) = (src.endpoint_nodes.last(), dst.endpoint_nodes.last()) else {
            return Err(ServiceGraphError::Internal { message: format!("empty node hierarchy for flow {}", flow) });
        };

        match dst.service_nodes.last() {
            Some(&svc_node) => {
                self.track_edge(src_ep, svc_node, &flow.stats, service_port, proto_ports.as_ref());
                self.track_edge(svc_node, dst_ep, &flow.stats, None, proto_ports.as_ref());
                self.service_edges.entry(svc_node).or_default().add(src_ep, dst_ep);
            }
            None => self.track_edge(src_ep, dst_ep, &flow.stats, service_port, proto_ports.as_ref()),
        }

        self.groups[src.group].egress.insert(dst.group);
        self.groups[dst.group].ingress.insert(src.group);
        Ok(())
    }

    fn track_edge(
        &mut self,
        source: NodeIdx,
        dest: NodeIdx,
        stats: &[GraphStats],
        service_port: Option<&ServicePort>,
        proto_ports: Option<&AggregatedProtoPorts>,
    ) {
        let id = GraphEdgeId {
            source_node_id: self.nodes[source].graph_node.id.clone(),
            dest_node_id: self.nodes[dest].graph_node.id.clone(),
        };
        debug!("Tracking: {} -> {}", id.source_node_id, id.dest_node_id);

        let edge = match self.edges.entry(id) {
            Entry::Occupied(entry) => {
                let edge = entry.into_mut();
                edge.include_stats(stats);
                edge.include_endpoint_proto_ports(proto_ports);
                edge
            }
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                entry.insert(GraphEdge::new(id, stats, proto_ports))
            }
        };
        if let Some(sp) = service_port {
            edge.include_service_port(sp);
        }
    }

    fn insert_node(&mut self, node: TrackedNode) -> NodeIdx {
        let idx = self.nodes.len();
        self.node_index.insert(node.graph_node.id.clone(), idx);
        self.nodes.push(node);
        idx
    }

    fn new_node(
        &self,
        id: &GraphNodeId,
        node_type: GraphNodeType,
        parent: Option<NodeIdx>,
        selectors: SelectorPairs,
    ) -> TrackedNode {
        let mut graph_node = GraphNode::new(id.clone(), node_type);
        graph_node.parent_id = parent.map(|p| self.nodes[p].graph_node.id.clone());
        TrackedNode { graph_node, parent, selectors, view_data: self.view.view_data(id) }
    }

    /// The group for a node and its ancestors, created on first use.
    fn group_for(&mut self, id: &GraphNodeId, node: NodeIdx, parents: &[NodeIdx]) -> GroupIdx {
        if let Some(&g) = self.group_index.get(id) {
            return g;
        }
        let view_data =
            parents.iter().fold(self.nodes[node].view_data, |vd, &p| vd.combine(self.nodes[p].view_data));
        let idx = self.groups.len();
        self.groups.push(TrackedGroup {
            node,
            parents: parents.to_vec(),
            children: BTreeSet::new(),
            view_data,
            ingress: BTreeSet::new(),
            egress: BTreeSet::new(),
            processed_ingress: false,
            processed_egress: false,
            followed_ingress: false,
            followed_egress: false,
        });
        self.group_index.insert(id.clone(), idx);
        idx
    }

    fn add_child(&mut self, group: GroupIdx, child: NodeIdx) {
        let vd = self.nodes[child].view_data;
        let g = &mut self.groups[group];
        if g.children.insert(child) {
            g.view_data = g.view_data.combine(vd);
        }
    }

    /// Resolves an endpoint (and the service it was reached through) to its node hierarchy, creating only the nodes
    /// the view's aggregation requires.
    fn track_nodes(
        &mut self,
        endpoint: &FlowEndpoint,
        svc: Option<&ServicePort>,
        dir: Option<Direction>,
    ) -> Result<Hierarchy> {
        let sg: Option<Arc<ServiceGroup>> = match svc {
            Some(sp) => self.data.service_groups.get_by_service(&sp.service),
            None => self.data.service_groups.get_by_endpoint(endpoint),
        };
        let mut idi = IdInfo {
            service_group: sg.clone(),
            direction: dir,
            service: svc.cloned().unwrap_or_default(),
            ..IdInfo::for_endpoint(endpoint)
        };

        // Layer selection and namespace expansion use the service group namespace when there is one.
        let group_namespace = idi.effective_namespace().to_string();

        let non_aggr_id = idi.endpoint_id();
        let aggr_id = idi
            .aggr_endpoint_id()
            .ok_or_else(|| ServiceGraphError::Internal { message: format!("no aggregated endpoint for {}", endpoint) })?;
        let aggr_type = idi.aggr_endpoint_type().unwrap_or(endpoint.endpoint_type);

        let layers = &self.view.layers;
        let direct_layer = non_aggr_id
            .as_ref()
            .and_then(|id| layers.endpoint_to_layer.get(id))
            .or_else(|| layers.endpoint_to_layer.get(&aggr_id))
            .or_else(|| sg.as_ref().and_then(|sg| layers.service_group_to_layer.get(&sg.id)));
        // A group placed directly in an expanded layer bypasses its namespace.
        let skip_namespace = direct_layer.is_some();
        let layer_name = direct_layer.or_else(|| layers.namespace_to_layer.get(&group_namespace)).cloned();

        let mut endpoint_nodes: Vec<NodeIdx> = Vec::new();
        let mut service_nodes: Vec<NodeIdx> = Vec::new();
        let mut group: Option<GroupIdx> = None;

        if let Some(layer_name) = layer_name {
            idi.layer = layer_name.clone();
            let layer_id = idi
                .layer_id()
                .ok_or_else(|| ServiceGraphError::Internal { message: format!("empty layer for {}", endpoint) })?;
            let layer = match self.node_index.get(&layer_id) {
                Some(&idx) => idx,
                None => {
                    let sel = self.selh.layer_node_selectors(&layer_name);
                    let mut node = self.new_node(&layer_id, GraphNodeType::Layer, None, sel);
                    node.graph_node.name = layer_name;
                    node.graph_node.expandable = true;
                    node.graph_node.expanded = node.view_data.expanded;
                    self.insert_node(node)
                }
            };
            if !self.nodes[layer].view_data.expanded {
                let group = self.group_for(&layer_id, layer, &endpoint_nodes);
                endpoint_nodes.push(layer);
                return Ok(Hierarchy { group, endpoint_nodes, service_nodes });
            }
            endpoint_nodes.push(layer);
        }

        if !group_namespace.is_empty() && !skip_namespace {
            if let Some(namespace_id) = idi.namespace_id() {
                let namespace = match self.node_index.get(&namespace_id) {
                    Some(&idx) => idx,
                    None => {
                        let sel = self.selh.namespace_node_selectors(&group_namespace);
                        let mut node =
                            self.new_node(&namespace_id, GraphNodeType::Namespace, endpoint_nodes.last().copied(), sel);
                        node.graph_node.name = group_namespace.clone();
                        node.graph_node.expandable = true;
                        node.graph_node.expanded = node.view_data.expanded;
                        self.insert_node(node)
                    }
                };
                if !self.nodes[namespace].view_data.expanded {
                    let group = self.group_for(&namespace_id, namespace, &endpoint_nodes);
                    endpoint_nodes.push(namespace);
                    return Ok(Hierarchy { group, endpoint_nodes, service_nodes });
                }
                endpoint_nodes.push(namespace);
            }
        }

        // Service groups and aggregated endpoints are never split: an endpoint only ever appears beneath them.
        if let Some(sg) = &sg {
            let service_group = match self.node_index.get(&sg.id) {
                Some(&idx) => idx,
                None => {
                    let sel = self.selh.service_group_node_selectors(sg);
                    let mut node =
                        self.new_node(&sg.id, GraphNodeType::ServiceGroup, endpoint_nodes.last().copied(), sel);
                    node.graph_node.namespace = sg.namespace.clone();
                    node.graph_node.name = sg.name.clone();
                    node.graph_node.expandable = true;
                    node.graph_node.expanded = node.view_data.expanded;
                    self.insert_node(node)
                }
            };
            // The service group is the pruning group even when expanded.
            let g = self.group_for(&sg.id, service_group, &endpoint_nodes);
            endpoint_nodes.push(service_group);
            group = Some(g);

            if !self.nodes[service_group].view_data.expanded {
                return Ok(Hierarchy { group: g, endpoint_nodes, service_nodes });
            }

            if let Some(sp) = svc {
                service_nodes = endpoint_nodes.clone();
                if let Some(service_id) = idi.service_id() {
                    let service = match self.node_index.get(&service_id) {
                        Some(&idx) => idx,
                        None => {
                            let sel = self.selh.service_node_selectors(&sp.service);
                            let mut node =
                                self.new_node(&service_id, GraphNodeType::Service, service_nodes.last().copied(), sel);
                            node.graph_node.namespace = sp.service.namespace.clone();
                            node.graph_node.name = sp.service.name.clone();
                            let idx = self.insert_node(node);
                            self.add_child(g, idx);
                            idx
                        }
                    };
                    service_nodes.push(service);
                }

                if self.view.expand_ports {
                    if let Some(service_port_id) = idi.service_port_id() {
                        let service_port = match self.node_index.get(&service_port_id) {
                            Some(&idx) => idx,
                            None => {
                                let sel = self.selh.service_port_node_selectors(sp);
                                let mut node = self.new_node(
                                    &service_port_id,
                                    GraphNodeType::ServicePort,
                                    service_nodes.last().copied(),
                                    sel,
                                );
                                node.graph_node.name = sp.port_name.clone();
                                node.graph_node.port = sp.port;
                                node.graph_node.protocol = sp.protocol.clone();
                                let idx = self.insert_node(node);
                                self.add_child(g, idx);
                                idx
                            }
                        };
                        service_nodes.push(service_port);
                    }
                }
            }
        }

        let aggr_endpoint = match self.node_index.get(&aggr_id) {
            Some(&idx) => idx,
            None => {
                let sel_ep = FlowEndpoint {
                    endpoint_type: aggr_type,
                    port: 0,
                    protocol: String::new(),
                    ..endpoint.clone()
                };
                let sel = self.selh.endpoint_node_selectors(&sel_ep, dir);
                let mut node = self.new_node(&aggr_id, aggr_type, endpoint_nodes.last().copied(), sel);
                let expandable = non_aggr_id.is_some();
                node.graph_node.namespace = endpoint.namespace.clone();
                node.graph_node.name = endpoint.name_aggr.clone();
                node.graph_node.expandable = expandable;
                node.graph_node.expanded = expandable && node.view_data.expanded;
                self.insert_node(node)
            }
        };
        let group = match group {
            Some(g) => {
                self.add_child(g, aggr_endpoint);
                g
            }
            None => self.group_for(&aggr_id, aggr_endpoint, &endpoint_nodes),
        };
        endpoint_nodes.push(aggr_endpoint);

        let non_aggr_id = match non_aggr_id {
            Some(id) if self.nodes[aggr_endpoint].graph_node.expanded => id,
            _ => {
                if self.view.expand_ports {
                    if let Some(port_id) = idi.aggr_endpoint_port_id() {
                        let sel_ep = FlowEndpoint { endpoint_type: aggr_type, ..endpoint.clone() };
                        let port = self.track_port_node(&port_id, &sel_ep, endpoint, group, aggr_endpoint, dir);
                        endpoint_nodes.push(port);
                    }
                }
                return Ok(Hierarchy { group, endpoint_nodes, service_nodes });
            }
        };

        let non_aggr = match self.node_index.get(&non_aggr_id) {
            Some(&idx) => idx,
            None => {
                let sel_ep = FlowEndpoint { port: 0, protocol: String::new(), ..endpoint.clone() };
                let sel = self.selh.endpoint_node_selectors(&sel_ep, dir);
                let mut node = self.new_node(&non_aggr_id, endpoint.endpoint_type, Some(aggr_endpoint), sel);
                node.graph_node.namespace = endpoint.namespace.clone();
                node.graph_node.name = endpoint.name.clone();
                let idx = self.insert_node(node);
                self.add_child(group, idx);
                idx
            }
        };
        endpoint_nodes.push(non_aggr);

        if self.view.expand_ports {
            if let Some(port_id) = idi.endpoint_port_id() {
                let port = self.track_port_node(&port_id, endpoint, endpoint, group, non_aggr, dir);
                endpoint_nodes.push(port);
            }
        }

        Ok(Hierarchy { group, endpoint_nodes, service_nodes })
    }

    fn track_port_node(
        &mut self,
        port_id: &GraphNodeId,
        selector_endpoint: &FlowEndpoint,
        endpoint: &FlowEndpoint,
        group: GroupIdx,
        parent: NodeIdx,
        dir: Option<Direction>,
    ) -> NodeIdx {
        if let Some(&idx) = self.node_index.get(port_id) {
            return idx;
        }
        let sel = self.selh.endpoint_node_selectors(selector_endpoint, dir);
        let mut node = self.new_node(port_id, GraphNodeType::Port, Some(parent), sel);
        node.graph_node.port = endpoint.port;
        node.graph_node.protocol = endpoint.protocol.clone();
        let idx = self.insert_node(node);
        self.add_child(group, idx);
        idx
    }

    /// Reduces the graph to the groups in view.
    ///
    /// In-focus groups pull in their direct neighbours. With connection-direction following the expansion carries
    /// on outwards in the same direction. Otherwise neighbours that are explicitly followed keep expanding along
    /// their followed directions. Each group expands each direction at most once.
    fn prune(&mut self) {
        if self.view.empty_focus {
            debug!("No focus - include all nodes and edges");
            return;
        }

        let mut in_view: BTreeSet<GroupIdx> = BTreeSet::new();
        let mut expand_ingress: Vec<GroupIdx> = Vec::new();
        let mut expand_egress: Vec<GroupIdx> = Vec::new();
        let mut expand_following: Vec<GroupIdx> = Vec::new();

        for (idx, gp) in self.groups.iter().enumerate() {
            if gp.view_data.in_focus {
                debug!("Expand ingress and egress for in-focus node: {}", self.nodes[gp.node].graph_node.id);
                in_view.insert(idx);
                expand_ingress.push(idx);
                expand_egress.push(idx);
            }
        }

        let follow_direction = self.view.follow_connection_direction;

        while let Some(gi) = expand_ingress.pop() {
            if self.groups[gi].processed_ingress {
                continue;
            }
            self.groups[gi].processed_ingress = true;
            let connected: Vec<GroupIdx> = self.groups[gi].ingress.iter().copied().collect();
            for c in connected {
                in_view.insert(c);
                if follow_direction {
                    expand_ingress.push(c);
                    self.groups[gi].followed_ingress = true;
                } else if self.groups[c].view_data.followed_ingress || self.groups[c].view_data.followed_egress {
                    expand_following.push(c);
                }
            }
        }

        while let Some(gi) = expand_egress.pop() {
            if self.groups[gi].processed_egress {
                continue;
            }
            self.groups[gi].processed_egress = true;
            let connected: Vec<GroupIdx> = self.groups[gi].egress.iter().copied().collect();
            for c in connected {
                in_view.insert(c);
                if follow_direction {
                    expand_egress.push(c);
                    self.groups[gi].followed_egress = true;
                } else if self.groups[c].view_data.followed_ingress || self.groups[c].view_data.followed_egress {
                    expand_following.push(c);
                }
            }
        }

        while let Some(gi) = expand_following.pop() {
            let vd = self.groups[gi].view_data;
            if vd.followed_ingress && !self.groups[gi].processed_ingress {
                let gp = &mut self.groups[gi];
                gp.processed_ingress = true;
                gp.followed_ingress = true;
                for &c in &gp.ingress {
                    in_view.insert(c);
                    expand_following.push(c);
                }
            }
            if vd.followed_egress && !self.groups[gi].processed_egress {
                let gp = &mut self.groups[gi];
                gp.processed_egress = true;
                gp.followed_egress = true;
                for &c in &gp.egress {
                    in_view.insert(c);
                    expand_following.push(c);
                }
            }
        }

        let mut visible_nodes: HashMap<GraphNodeId, NodeIdx> = HashMap::new();
        let mut visible_groups: HashMap<GraphNodeId, GroupIdx> = HashMap::new();
        for &gi in &in_view {
            let gp = &self.groups[gi];
            for &n in std::iter::once(&gp.node).chain(gp.children.iter()).chain(gp.parents.iter()) {
                visible_nodes.insert(self.nodes[n].graph_node.id.clone(), n);
            }
            visible_groups.insert(self.nodes[gp.node].graph_node.id.clone(), gi);
        }

        // Edges leaving the view mark where the graph can be followed further.
        let mut visible_edges = BTreeMap::new();
        if !visible_nodes.is_empty() {
            for (id, edge) in std::mem::take(&mut self.edges) {
                let source = visible_nodes.get(&id.source_node_id).copied();
                let dest = visible_nodes.get(&id.dest_node_id).copied();
                match (source, dest) {
                    (Some(_), Some(_)) => {
                        visible_edges.insert(id, edge);
                    }
                    (Some(s), None) => self.nodes[s].graph_node.follow_egress = true,
                    (None, Some(d)) => self.nodes[d].graph_node.follow_ingress = true,
                    (None, None) => {}
                }
            }
        }

        self.node_index = visible_nodes;
        self.group_index = visible_groups;
        self.edges = visible_edges;
    }

    /// Increments the event count on the most granular visible node of each event endpoint. Never adds nodes.
    fn overlay_events(&mut self) {
        if self.node_index.is_empty() {
            return;
        }
        let data = self.data;
        let sgs = &data.service_groups;
        for event in &data.events {
            for ep in &event.endpoints {
                let (ep, sg) = if ep.endpoint_type == GraphNodeType::Service {
                    let fep = FlowEndpoint::new(GraphNodeType::Service, &ep.namespace, "", "");
                    let sg = sgs.get_by_service(&NamespacedName::new(ep.namespace.clone(), ep.name.clone()));
                    (fep, sg)
                } else {
                    (ep.clone(), sgs.get_by_endpoint(ep))
                };
                if let Some(idx) = self.most_granular_node_in_view(&ep, sg) {
                    self.nodes[idx].graph_node.events_count += 1;
                }
            }
        }
    }

    /// Adds DNS client stats to the most granular visible node and all of its ancestors.
    fn overlay_dns(&mut self) {
        if self.node_index.is_empty() {
            return;
        }
        let data = self.data;
        for dl in &data.filtered_dns_client_logs {
            let sg = data.service_groups.get_by_endpoint(&dl.endpoint);
            let mut current = self.most_granular_node_in_view(&dl.endpoint, sg);
            while let Some(idx) = current {
                self.nodes[idx].graph_node.include_stats_within(&dl.stats);
                current = self.nodes[idx].parent;
            }
        }
    }

    fn most_granular_node_in_view(&self, ep: &FlowEndpoint, sg: Option<Arc<ServiceGroup>>) -> Option<NodeIdx> {
        let mut idi = IdInfo { service_group: sg, ..IdInfo::for_endpoint(ep) };
        let lookup = |id: &GraphNodeId| self.node_index.get(id).copied();

        let non_aggr_id = idi.endpoint_id();
        if let Some(idx) = non_aggr_id.as_ref().and_then(lookup) {
            return Some(idx);
        }
        let aggr_id = idi.aggr_endpoint_id();
        if let Some(idx) = aggr_id.as_ref().and_then(lookup) {
            return Some(idx);
        }
        let sg_id = idi.service_group_id();
        if let Some(idx) = sg_id.as_ref().and_then(lookup) {
            return Some(idx);
        }

        let layers = &self.view.layers;
        let layer = non_aggr_id
            .as_ref()
            .and_then(|id| layers.endpoint_to_layer.get(id))
            .or_else(|| aggr_id.as_ref().and_then(|id| layers.endpoint_to_layer.get(id)))
            .or_else(|| sg_id.as_ref().and_then(|id| layers.service_group_to_layer.get(id)));
        if let Some(layer) = layer {
            idi.layer = layer.clone();
            return idi.layer_id().as_ref().and_then(lookup);
        }

        let namespace = idi.effective_namespace().to_string();
        if namespace.is_empty() {
            return None;
        }
        if let Some(idx) = idi.namespace_id().as_ref().and_then(lookup) {
            return Some(idx);
        }
        idi.layer = layers.namespace_to_layer.get(&namespace)?.clone();
        idi.layer_id().as_ref().and_then(lookup)
    }

    fn overlay_selectors(&mut self) {
        let data = self.data;
        let mut view_alerts: Option<Selector> = None;

        for &idx in self.node_index.values() {
            let node = &mut self.nodes[idx];
            let mut selectors = node.selectors.to_node_selectors().to_graph_selectors();
            let gn = &node.graph_node;
            selectors.packet_capture = match gn.node_type {
                GraphNodeType::Namespace => Some(K8S_ALL_SELECTOR.to_string()),
                GraphNodeType::Service => {
                    non_empty(label_selector(data, &NamespacedName::new(gn.namespace.clone(), gn.name.clone())))
                }
                GraphNodeType::ServiceGroup => non_empty(service_group_selectors(data, &gn.services())),
                GraphNodeType::ReplicaSet => {
                    let name = gn.name.strip_suffix("-*").unwrap_or(&gn.name);
                    let rs = NamespacedName::new(gn.namespace.clone(), name);
                    non_empty(data.resource_labels.get(&rs).map(|l| l.join(" && ")).unwrap_or_default())
                }
                _ => None,
            };
            node.graph_node.selectors = selectors;

            if node.selectors.source.alerts.is_some() {
                view_alerts = Selector::or([view_alerts, node.selectors.source.alerts.clone()]);
            }
        }

        for (id, edge) in self.edges.iter_mut() {
            let (Some(&src), Some(&dst)) =
                (self.node_index.get(&id.source_node_id), self.node_index.get(&id.dest_node_id))
            else {
                continue;
            };
            let nodes = &self.nodes;
            let selectors = if let Some(se) = self.service_edges.get(&src) {
                // The source is a service: any of its sources could have reached this dest.
                let mut source = LogSelectors::default();
                for &ep in se.source_nodes_by_dest_node.get(&dst).into_iter().flatten() {
                    source = source.or(&nodes[ep].selectors.source);
                }
                source.and(&nodes[dst].selectors.dest)
            } else if let Some(se) = self.service_edges.get(&dst) {
                let mut dest = LogSelectors::default();
                for &ep in se.dest_nodes_by_source_node.get(&src).into_iter().flatten() {
                    dest = dest.or(&nodes[ep].selectors.dest);
                }
                nodes[src].selectors.source.and(&dest)
            } else {
                nodes[src].selectors.source.and(&nodes[dst].selectors.dest)
            };
            edge.selectors = selectors.to_graph_selectors();
        }

        if self.view.empty_focus {
            let all = Some(String::new());
            self.view_selectors = GraphSelectors {
                l3_flows: all.clone(),
                l7_flows: all.clone(),
                dns_logs: all.clone(),
                alerts: all,
                packet_capture: None,
            };
            return;
        }

        // Focused and explicitly followed nodes, plus groups followed implicitly along the connection direction.
        let mut view = LogSelectors::default();
        for (id, vd) in &self.view.node_view_data {
            let Some(&idx) = self.node_index.get(id) else {
                continue;
            };
            let sel = &self.nodes[idx].selectors;
            if vd.in_focus {
                view = view.or(&sel.to_node_selectors());
            } else {
                if vd.followed_egress {
                    view = view.or(&sel.source);
                }
                if vd.followed_ingress {
                    view = view.or(&sel.dest);
                }
            }
        }
        for &gi in self.group_index.values() {
            let gp = &self.groups[gi];
            if gp.view_data.in_focus {
                continue;
            }
            if gp.followed_egress && !gp.view_data.followed_egress {
                view = view.or(&self.nodes[gp.node].selectors.source);
            }
            if gp.followed_ingress && !gp.view_data.followed_ingress {
                view = view.or(&self.nodes[gp.node].selectors.dest);
            }
        }

        self.view_selectors = view.to_graph_selectors();
        self.view_selectors.alerts = view_alerts.as_ref().and_then(Selector::selector_string);
    }

    fn into_response(mut self) -> ServiceGraphResponse {
        let mut visible: Vec<NodeIdx> = self.node_index.values().copied().collect();
        visible.sort_by(|a, b| self.nodes[*a].graph_node.id.cmp(&self.nodes[*b].graph_node.id));

        let mut nodes = Vec::with_capacity(visible.len());
        for idx in visible {
            let node = std::mem::replace(
                &mut self.nodes[idx].graph_node,
                GraphNode::new(GraphNodeId::default(), GraphNodeType::Layer),
            );
            debug!("{}", node);
            nodes.push(node);
        }
        let edges: Vec<GraphEdge> = self.edges.into_values().collect();
        for edge in &edges {
            debug!("{}", edge);
        }

        ServiceGraphResponse {
            time_intervals: self.data.time_intervals.clone(),
            nodes,
            edges,
            selectors: self.view_selectors,
            truncated: self.data.truncated,
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn label_selector(data: &ServiceGraphData, svc: &NamespacedName) -> String {
    data.service_labels.get(svc).map(|l| l.join(" && ")).unwrap_or_default()
}

fn service_group_selectors(data: &ServiceGraphData, services: &[NamespacedName]) -> String {
    let mut selectors: Vec<String> =
        services.iter().map(|svc| label_selector(data, svc)).filter(|s| !s.is_empty()).collect();
    selectors.sort();
    selectors.join(" || ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{Event, FlowEdge, LabelMap};
    use crate::graph::{GraphDnsStats, GraphL3Stats, GraphPacketStats, GraphView, Layer};
    use crate::servicegraph::backend::StaticNameHelper;
    use crate::servicegraph::service_groups::ServiceGroups;
    use crate::servicegraph::view::parse_view;
    use crate::servicegraph::TimeSeriesDns;

    fn rep(ns: &str, aggr: &str) -> FlowEndpoint {
        FlowEndpoint::new(GraphNodeType::ReplicaSet, ns, "", aggr)
    }

    fn stats(packets: i64) -> Vec<GraphStats> {
        vec![GraphStats {
            l3: Some(GraphL3Stats {
                allowed: Some(GraphPacketStats { packets_in: packets, ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        }]
    }

    fn flow(source: FlowEndpoint, dest: FlowEndpoint, service_port: Option<ServicePort>) -> TimeSeriesFlow {
        TimeSeriesFlow { edge: FlowEdge { source, dest, service_port }, aggregated_proto_ports: None, stats: stats(1) }
    }

    fn data(flows: Vec<TimeSeriesFlow>, sgs: ServiceGroups) -> ServiceGraphData {
        ServiceGraphData {
            time_intervals: Vec::new(),
            filtered_flows: flows,
            filtered_dns_client_logs: Vec::new(),
            events: Vec::new(),
            service_groups: sgs,
            name_helper: Arc::new(StaticNameHelper::default()),
            service_labels: LabelMap::new(),
            resource_labels: LabelMap::new(),
            truncated: false,
        }
    }

    fn ids(nodes: &[GraphNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn node<'r>(resp: &'r ServiceGraphResponse, id: &str) -> &'r GraphNode {
        resp.nodes.iter().find(|n| n.id.as_str() == id).unwrap()
    }

    fn view(v: GraphView, sgd: &ServiceGraphData) -> ParsedView {
        parse_view(&v, &sgd.service_groups).unwrap()
    }

    #[test]
    fn test_collapsed_namespaces() {
        let sgd = data(
            vec![flow(rep("n1", "a-*"), rep("n2", "b-*"), None), flow(rep("n1", "c-*"), rep("n1", "a-*"), None)],
            ServiceGroups::default(),
        );
        let resp = get_service_graph_response(&sgd, &view(GraphView::default(), &sgd));

        assert_eq!(ids(&resp.nodes), vec!["namespace/n1", "namespace/n2"]);
        assert_eq!(resp.edges.len(), 1);
        assert_eq!(resp.edges[0].id.source_node_id.as_str(), "namespace/n1");

        let n1 = node(&resp, "namespace/n1");
        assert_eq!(n1.stats_within, stats(1));
        assert_eq!(n1.stats_egress, stats(1));
        assert_eq!(n1.selectors.packet_capture.as_deref(), Some(K8S_ALL_SELECTOR));
        assert_eq!(resp.selectors.l3_flows.as_deref(), Some(""));
    }

    #[test]
    fn test_expanded_namespace_with_service() {
        let sp = ServicePort {
            service: NamespacedName::new("n2", "db"),
            port_name: "pg".to_string(),
            port: 5432,
            protocol: "tcp".to_string(),
        };
        let dest = rep("n2", "db-*").with_port("tcp", 5432);
        let mut builder = ServiceGroups::builder();
        builder.add_mapping(&sp, &dest);
        let sgd = data(vec![flow(rep("n1", "a-*"), dest, Some(sp.clone()))], builder.finish());

        let v = view(
            GraphView {
                expanded: vec!["namespace/n2".into(), "svcgp;svc/n2/db".into()],
                expand_ports: true,
                ..Default::default()
            },
            &sgd,
        );
        let resp = get_service_graph_response(&sgd, &v);

        assert_eq!(
            ids(&resp.nodes),
            vec![
                "namespace/n1",
                "namespace/n2",
                "port/tcp/5432;rep/n2/db-*",
                "rep/n2/db-*",
                "svc/n2/db",
                "svcgp;svc/n2/db",
                "svcport/tcp/pg/5432;svc/n2/db",
            ]
        );
        let edge_ids: Vec<(&str, &str)> =
            resp.edges.iter().map(|e| (e.id.source_node_id.as_str(), e.id.dest_node_id.as_str())).collect();
        assert_eq!(
            edge_ids,
            vec![
                ("namespace/n1", "svcport/tcp/pg/5432;svc/n2/db"),
                ("svcport/tcp/pg/5432;svc/n2/db", "port/tcp/5432;rep/n2/db-*"),
            ]
        );
        assert!(resp.edges[0].service_ports.contains(&sp));
        assert!(node(&resp, "svc/n2/db").service_ports.contains(&sp));
        assert!(node(&resp, "svcport/tcp/pg/5432;svc/n2/db").service_ports.is_empty());
        assert_eq!(
            node(&resp, "rep/n2/db-*").parent_id.as_ref().map(GraphNodeId::as_str),
            Some("svcgp;svc/n2/db")
        );
    }

    #[test]
    fn test_layers_collapse_namespaces() {
        let sgd = data(vec![flow(rep("kube-system", "dns-*"), rep("n2", "b-*"), None)], ServiceGroups::default());
        let v = view(
            GraphView {
                layers: vec![Layer { name: "infra".to_string(), nodes: vec!["namespace/kube-system".into()] }],
                ..Default::default()
            },
            &sgd,
        );
        let resp = get_service_graph_response(&sgd, &v);
        assert_eq!(ids(&resp.nodes), vec!["layer/infra", "namespace/n2"]);
        assert_eq!(
            node(&resp, "layer/infra").selectors.l3_flows.as_deref(),
            Some(r#"dest_namespace == "kube-system" || dest_service_namespace == "kube-system" || source_namespace == "kube-system""#)
        );
    }

    #[test]
    fn test_events_and_dns_overlay_visible_nodes_only() {
        let mut sgd = data(vec![flow(rep("n1", "a-*"), rep("n2", "b-*"), None)], ServiceGroups::default());
        sgd.events = vec![Event {
            id: "e1".to_string(),
            details: Default::default(),
            endpoints: vec![
                FlowEndpoint::new(GraphNodeType::Workload, "n1", "a-1", "a-*"),
                FlowEndpoint::new(GraphNodeType::Workload, "n3", "x-1", "x-*"),
            ],
        }];
        let dns = vec![GraphStats { dns: Some(GraphDnsStats::default()), ..Default::default() }];
        sgd.filtered_dns_client_logs = vec![TimeSeriesDns {
            endpoint: FlowEndpoint::new(GraphNodeType::Workload, "n1", "a-1", "a-*"),
            stats: dns.clone(),
        }];

        let v = view(GraphView { expanded: vec!["namespace/n1".into()], ..Default::default() }, &sgd);
        let resp = get_service_graph_response(&sgd, &v);

        assert_eq!(ids(&resp.nodes), vec!["namespace/n1", "namespace/n2", "rep/n1/a-*"]);
        assert_eq!(node(&resp, "rep/n1/a-*").events_count, 1);
        assert_eq!(node(&resp, "namespace/n1").events_count, 0);
        assert!(node(&resp, "rep/n1/a-*").stats_within.iter().any(|s| s.dns.is_some()));
        assert!(node(&resp, "namespace/n1").stats_within.iter().any(|s| s.dns.is_some()));
        assert!(node(&resp, "namespace/n2").stats_within.is_empty());
    }

    #[test]
    fn test_focus_marks_followable_edges() {
        let sgd = data(
            vec![flow(rep("n1", "a-*"), rep("n2", "b-*"), None), flow(rep("n2", "b-*"), rep("n3", "c-*"), None)],
            ServiceGroups::default(),
        );
        let v = view(GraphView { focus: vec!["namespace/n1".into()], ..Default::default() }, &sgd);
        let resp = get_service_graph_response(&sgd, &v);

        assert_eq!(ids(&resp.nodes), vec!["namespace/n1", "namespace/n2"]);
        assert_eq!(resp.edges.len(), 1);
        assert!(node(&resp, "namespace/n2").follow_egress);
        assert!(!node(&resp, "namespace/n1").follow_ingress);
        assert!(resp.selectors.l3_flows.as_deref().unwrap_or_default().contains(r#"source_namespace == "n1""#));
    }
}
