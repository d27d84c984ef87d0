//! Log query selectors for nodes, edges and the view.
//!
//! Selectors are rendered in the flow-log query syntax, for example
//! `source_namespace == "n1" || (dest_type == "wep" && dest_namespace == "n2")`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use super::backend::NameHelper;
use super::id::Direction;
use super::service_groups::{ServiceGroup, ServiceGroupLookup, ServiceGroups};
use super::view::ParsedLayers;
use crate::flows::FlowEndpoint;
use crate::graph::{GraphNodeType, GraphSelectors, NamespacedName, ServicePort};

/// Host groups larger than this select on the endpoint type only.
pub const MAX_SELECTOR_ITEMS_PER_GROUP: usize = 50;

const OP_AND: &str = " && ";
const OP_OR: &str = " || ";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectorValue {
    Str(String),
    Int(i64),
}

impl From<&str> for SelectorValue {
    fn from(s: &str) -> Self {
        SelectorValue::Str(s.to_string())
    }
}

impl From<String> for SelectorValue {
    fn from(s: String) -> Self {
        SelectorValue::Str(s)
    }
}

impl From<u16> for SelectorValue {
    fn from(n: u16) -> Self {
        SelectorValue::Int(n.into())
    }
}

impl fmt::Display for SelectorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorValue::Str(s) => write!(f, "\"{}\"", s),
            SelectorValue::Int(n) => write!(f, "{}", n),
        }
    }
}

/// A selector expression.
///
/// Constructors return `Option<Selector>`: `None` means "no constraint" and is dropped when combined. `NoMatch` means
/// nothing can match; it swallows an AND and is dropped from an OR unless every part is a no-match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    NoMatch,
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Equal(String, SelectorValue),
    NotEqual(String, SelectorValue),
    In(String, Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    And,
    Or,
}

impl Selector {
    pub fn equal(key: &str, value: impl Into<SelectorValue>) -> Option<Selector> {
        Some(Selector::Equal(key.to_string(), value.into()))
    }

    pub fn not_equal(key: &str, value: impl Into<SelectorValue>) -> Option<Selector> {
        Some(Selector::NotEqual(key.to_string(), value.into()))
    }

    /// Matches any of the values. An empty list matches nothing.
    pub fn in_list(key: &str, values: impl IntoIterator<Item = String>) -> Option<Selector> {
        let values: BTreeSet<String> = values.into_iter().collect();
        if values.is_empty() {
            return Some(Selector::NoMatch);
        }
        Some(Selector::In(key.to_string(), values.into_iter().collect()))
    }

    pub fn no_match() -> Option<Selector> {
        Some(Selector::NoMatch)
    }

    pub fn and(parts: impl IntoIterator<Item = Option<Selector>>) -> Option<Selector> {
        combine(Op::And, parts)
    }

    pub fn or(parts: impl IntoIterator<Item = Option<Selector>>) -> Option<Selector> {
        combine(Op::Or, parts)
    }

    /// The rendered selector. A no-match has no string form.
    pub fn selector_string(&self) -> Option<String> {
        match self {
            Selector::NoMatch => None,
            _ => Some(self.render(false)),
        }
    }

    fn render(&self, nested: bool) -> String {
        match self {
            Selector::And(parts) | Selector::Or(parts) => {
                let sep = if matches!(self, Selector::And(_)) { OP_AND } else { OP_OR };
                let mut rendered: Vec<String> = parts.iter().map(|p| p.render(true)).collect();
                rendered.sort();
                rendered.dedup();
                match rendered.len() {
                    0 => String::new(),
                    1 => rendered.remove(0),
                    _ if nested => format!("({})", rendered.join(sep)),
                    _ => rendered.join(sep),
                }
            }
            Selector::Equal(key, value) => format!("{} == {}", quote_key(key), value),
            Selector::NotEqual(key, value) => format!("{} != {}", quote_key(key), value),
            Selector::In(key, values) => {
                let key = quote_key(key);
                let joined = values.iter().map(|v| format!("{} == \"{}\"", key, v)).collect::<Vec<_>>().join(OP_OR);
                if nested && values.len() > 1 {
                    format!("({})", joined)
                } else {
                    joined
                }
            }
            // Combination always lifts a no-match to the top level.
            Selector::NoMatch => String::new(),
        }
    }
}

fn quote_key(key: &str) -> String {
    if key.contains('.') {
        format!("\"{}\"", key)
    } else {
        key.to_string()
    }
}

fn combine(op: Op, parts: impl IntoIterator<Item = Option<Selector>>) -> Option<Selector> {
    let mut updated = Vec::new();
    let mut found_no_match = false;
    let mut in_by_key: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for part in parts.into_iter().flatten() {
        match part {
            Selector::NoMatch if op == Op::And => return Some(Selector::NoMatch),
            Selector::NoMatch => found_no_match = true,
            Selector::In(key, values) => {
                let merged = match in_by_key.remove(&key) {
                    Some(existing) => combine_in(op, existing, values),
                    None => values,
                };
                in_by_key.insert(key, merged);
            }
            other => updated.push(other),
        }
    }

    for (key, values) in in_by_key {
        if values.is_empty() {
            // Disjoint IN lists under an AND.
            return Some(Selector::NoMatch);
        }
        updated.push(Selector::In(key, values));
    }

    if found_no_match && updated.is_empty() {
        return Some(Selector::NoMatch);
    }

    let mut children = Vec::with_capacity(updated.len());
    for sel in updated {
        match (op, sel) {
            (Op::And, Selector::And(inner)) | (Op::Or, Selector::Or(inner)) => children.extend(inner),
            (_, other) => children.push(other),
        }
    }

    match children.len() {
        0 => None,
        1 => children.pop(),
        _ => Some(match op {
            Op::And => Selector::And(children),
            Op::Or => Selector::Or(children),
        }),
    }
}

fn combine_in(op: Op, a: Vec<String>, b: Vec<String>) -> Vec<String> {
    let a: BTreeSet<String> = a.into_iter().collect();
    let b: BTreeSet<String> = b.into_iter().collect();
    match op {
        Op::And => a.intersection(&b).cloned().collect(),
        Op::Or => a.union(&b).cloned().collect(),
    }
}

fn render(selector: &Option<Selector>) -> Option<String> {
    selector.as_ref().and_then(Selector::selector_string)
}

/// One selector per log type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSelectors {
    pub l3_flows: Option<Selector>,
    pub l7_flows: Option<Selector>,
    pub dns_logs: Option<Selector>,
    pub alerts: Option<Selector>,
}

impl LogSelectors {
    pub fn and(&self, other: &LogSelectors) -> LogSelectors {
        LogSelectors {
            l3_flows: Selector::and([self.l3_flows.clone(), other.l3_flows.clone()]),
            l7_flows: Selector::and([self.l7_flows.clone(), other.l7_flows.clone()]),
            dns_logs: Selector::and([self.dns_logs.clone(), other.dns_logs.clone()]),
            alerts: Selector::and([self.alerts.clone(), other.alerts.clone()]),
        }
    }

    pub fn or(&self, other: &LogSelectors) -> LogSelectors {
        LogSelectors {
            l3_flows: Selector::or([self.l3_flows.clone(), other.l3_flows.clone()]),
            l7_flows: Selector::or([self.l7_flows.clone(), other.l7_flows.clone()]),
            dns_logs: Selector::or([self.dns_logs.clone(), other.dns_logs.clone()]),
            alerts: Selector::or([self.alerts.clone(), other.alerts.clone()]),
        }
    }

    pub fn to_graph_selectors(&self) -> GraphSelectors {
        GraphSelectors {
            l3_flows: render(&self.l3_flows),
            l7_flows: render(&self.l7_flows),
            dns_logs: render(&self.dns_logs),
            alerts: render(&self.alerts),
            packet_capture: None,
        }
    }
}

/// Selectors for the logs where a node is the source of a connection and where it is the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorPairs {
    pub source: LogSelectors,
    pub dest: LogSelectors,
}

impl SelectorPairs {
    pub fn to_node_selectors(&self) -> LogSelectors {
        self.source.or(&self.dest)
    }

    pub fn and(&self, other: &SelectorPairs) -> SelectorPairs {
        SelectorPairs { source: self.source.and(&other.source), dest: self.dest.and(&other.dest) }
    }

    pub fn or(&self, other: &SelectorPairs) -> SelectorPairs {
        SelectorPairs { source: self.source.or(&other.source), dest: self.dest.or(&other.dest) }
    }
}

/// Raw log endpoint type for a graph node type, and whether the node is aggregated.
fn raw_type(t: GraphNodeType) -> (&'static str, bool) {
    match t {
        GraphNodeType::Workload => ("wep", false),
        GraphNodeType::ReplicaSet => ("wep", true),
        GraphNodeType::Hosts => ("hep", true),
        GraphNodeType::Host => ("hep", false),
        GraphNodeType::Network => ("net", true),
        GraphNodeType::NetworkSet => ("ns", true),
        _ => ("", false),
    }
}

fn blank_to_single_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn eq_pair(k1: &str, v1: &str, k2: &str, v2: &str) -> Option<Selector> {
    Selector::and([Selector::equal(k1, v1), Selector::equal(k2, v2)])
}

/// Builds node selectors for the current view, host naming and service groups.
pub struct SelectorHelper<'a> {
    layers: &'a ParsedLayers,
    name_helper: &'a dyn NameHelper,
    service_groups: &'a ServiceGroups,
}

impl<'a> SelectorHelper<'a> {
    pub fn new(layers: &'a ParsedLayers, name_helper: &'a dyn NameHelper, service_groups: &'a ServiceGroups) -> Self {
        Self { layers, name_helper, service_groups }
    }

    pub fn layer_node_selectors(&self, layer: &str) -> SelectorPairs {
        let mut gs = SelectorPairs::default();
        for ns in self.layers.layer_to_namespaces.get(layer).into_iter().flatten() {
            gs = gs.or(&self.namespace_node_selectors(ns));
        }
        for sg in self.layers.layer_to_service_groups.get(layer).into_iter().flatten() {
            gs = gs.or(&self.service_group_node_selectors(sg));
        }
        for ep in self.layers.layer_to_endpoints.get(layer).into_iter().flatten() {
            gs = gs.or(&self.endpoint_node_selectors(ep, None));
        }
        gs
    }

    pub fn namespace_node_selectors(&self, namespace: &str) -> SelectorPairs {
        let dest_flows = || {
            Selector::or([
                Selector::equal("dest_service_namespace", namespace),
                Selector::equal("dest_namespace", namespace),
            ])
        };
        SelectorPairs {
            source: LogSelectors {
                l3_flows: Selector::equal("source_namespace", namespace),
                l7_flows: Selector::equal("src_namespace", namespace),
                dns_logs: Selector::equal("client_namespace", namespace),
                alerts: Selector::equal("source_namespace", namespace),
            },
            dest: LogSelectors {
                l3_flows: dest_flows(),
                l7_flows: dest_flows(),
                dns_logs: Selector::equal("servers.namespace", namespace),
                alerts: Selector::equal("dest_namespace", namespace),
            },
        }
    }

    /// Service selectors, without DNS. Service nodes only contribute to service group and edge selectors.
    pub fn service_node_selectors(&self, svc: &NamespacedName) -> SelectorPairs {
        let mut selectors = base_service_selectors(svc);

        let mut endpoints = BTreeSet::new();
        if let Some(sg) = self.service_groups.get_by_service(svc) {
            for eps in sg.service_ports.values() {
                endpoints.extend(eps.iter().filter(|ep| selects_service_endpoint(ep)).cloned());
            }
        }

        let mut eps = SelectorPairs::default();
        for ep in endpoints {
            let ep = FlowEndpoint { protocol: String::new(), ..ep };
            eps = eps.or(&self.endpoint_node_selectors(&ep, None));
        }

        // Only the destination side of the backing endpoints is relevant.
        selectors.dest = selectors.dest.or(&eps.dest);
        selectors
    }

    pub fn service_port_node_selectors(&self, sp: &ServicePort) -> SelectorPairs {
        let mut selectors = base_service_selectors(&sp.service);

        if sp.protocol != "tcp" {
            // L7 logs are only recorded for TCP.
            selectors.source.l7_flows = Selector::no_match();
            selectors.dest.l7_flows = Selector::no_match();
        } else {
            selectors.dest.l7_flows = Selector::and([
                selectors.dest.l7_flows.take(),
                Selector::equal("dest_service_port_name", sp.port_name.as_str()),
                Selector::equal("dest_service_port", sp.port),
            ]);
        }
        selectors.dest.l3_flows = Selector::and([
            selectors.dest.l3_flows.take(),
            Selector::equal("dest_service_port", sp.port_name.as_str()),
            Selector::equal("dest_service_port_num", sp.port),
            Selector::equal("proto", sp.protocol.as_str()),
        ]);

        let mut endpoints = BTreeSet::new();
        if let Some(sg) = self.service_groups.get_by_service(&sp.service) {
            if let Some(eps) = sg.service_ports.get(sp) {
                endpoints.extend(eps.iter().filter(|ep| selects_service_endpoint(ep)).cloned());
            }
        }

        let mut eps = SelectorPairs::default();
        for ep in endpoints {
            eps = eps.or(&self.endpoint_node_selectors(&ep, None));
        }
        selectors.dest = selectors.dest.or(&eps.dest);
        selectors
    }

    /// Endpoints that record their flows are selected directly. Anything else is selected through its service.
    pub fn service_group_node_selectors(&self, sg: &ServiceGroup) -> SelectorPairs {
        let mut services = BTreeSet::new();
        let mut endpoints = BTreeSet::new();
        for (sp, eps) in &sg.service_ports {
            for ep in eps {
                match ep.endpoint_type {
                    GraphNodeType::Host | GraphNodeType::Workload | GraphNodeType::ReplicaSet => {
                        endpoints.insert(FlowEndpoint { protocol: String::new(), ..ep.clone() });
                    }
                    _ => {
                        services.insert(sp.service.clone());
                    }
                }
            }
        }

        let mut gs = SelectorPairs::default();
        for svc in &services {
            gs = gs.or(&self.service_node_selectors(svc));
        }
        for ep in &endpoints {
            gs = gs.or(&self.endpoint_node_selectors(ep, None));
        }
        gs
    }

    /// Selectors for an endpoint node. An empty protocol or a zero port leave that field unconstrained. With a
    /// direction only the matching side of the flow is selected.
    pub fn endpoint_node_selectors(&self, ep: &FlowEndpoint, dir: Option<Direction>) -> SelectorPairs {
        let (raw, is_aggr) = raw_type(ep.endpoint_type);
        let namespace = blank_to_single_dash(&ep.namespace);
        let name_aggr = ep.name_aggr.as_str();
        let proto = ep.protocol.as_str();

        let (mut dns_source, mut dns_dest) = (None, None);
        let (l7_source, l7_dest);
        if raw == "wep" {
            if is_aggr {
                dns_source = eq_pair("client_namespace", namespace, "client_name_aggr", name_aggr);
                dns_dest = eq_pair("servers.namespace", namespace, "servers.name_aggr", name_aggr);
            } else {
                dns_dest = eq_pair("servers.namespace", namespace, "servers.name", &ep.name);
            }
            if is_aggr && (proto.is_empty() || proto == "tcp") {
                l7_source = eq_pair("src_namespace", namespace, "src_name_aggr", name_aggr);
                l7_dest = eq_pair("dest_namespace", namespace, "dest_name_aggr", name_aggr);
            } else {
                l7_source = Selector::no_match();
                l7_dest = Selector::no_match();
            }
        } else {
            l7_source = Selector::no_match();
            l7_dest = Selector::no_match();
            dns_source = Selector::no_match();
            dns_dest = Selector::no_match();
        }

        let (mut alert_source, mut alert_dest) = (None, None);
        let (mut l3_source, mut l3_dest);
        match ep.endpoint_type {
            GraphNodeType::Hosts => {
                let mut hosts = self.name_helper.compiled_host_names_from_aggregated_name(name_aggr);
                if hosts.is_empty() || hosts.len() > MAX_SELECTOR_ITEMS_PER_GROUP {
                    debug!("Selecting host group {} by type only ({} hosts)", name_aggr, hosts.len());
                    l3_source = Selector::equal("source_type", raw);
                    l3_dest = Selector::equal("dest_type", raw);
                } else if hosts.len() == 1 {
                    l3_source = eq_pair("source_type", raw, "source_name_aggr", &hosts[0]);
                    l3_dest = eq_pair("dest_type", raw, "dest_name_aggr", &hosts[0]);
                } else {
                    hosts.sort();
                    l3_source =
                        Selector::and([Selector::equal("source_type", raw), Selector::in_list("source_name_aggr", hosts.clone())]);
                    l3_dest = Selector::and([Selector::equal("dest_type", raw), Selector::in_list("dest_name_aggr", hosts)]);
                }
            }
            GraphNodeType::Host => {
                // Host endpoints carry the host name in the log's aggregated name field.
                l3_source = eq_pair("source_type", raw, "source_name_aggr", &ep.name);
                l3_dest = eq_pair("dest_type", raw, "dest_name_aggr", &ep.name);
            }
            _ => {
                let (src_name_key, dst_name_key) =
                    if is_aggr { ("source_name_aggr", "dest_name_aggr") } else { ("source_name", "dest_name") };
                l3_source = Selector::and([
                    Selector::equal("source_type", raw),
                    Selector::equal("source_namespace", namespace),
                    Selector::equal(src_name_key, name_aggr),
                ]);
                l3_dest = Selector::and([
                    Selector::equal("dest_type", raw),
                    Selector::equal("dest_namespace", namespace),
                    Selector::equal(dst_name_key, name_aggr),
                ]);
                alert_source = eq_pair("source_namespace", namespace, src_name_key, name_aggr);
                alert_dest = eq_pair("dest_namespace", namespace, dst_name_key, name_aggr);
            }
        }

        if ep.port != 0 {
            l3_dest = Selector::and([Selector::equal("dest_port", ep.port), l3_dest]);
        }
        if !proto.is_empty() {
            l3_source = Selector::and([Selector::equal("proto", proto), l3_source]);
            l3_dest = Selector::and([Selector::equal("proto", proto), l3_dest]);
        }

        let mut gsp = SelectorPairs::default();
        if dir != Some(Direction::Ingress) {
            gsp.source =
                LogSelectors { l3_flows: l3_source, l7_flows: l7_source, dns_logs: dns_source, alerts: alert_source };
        }
        if dir != Some(Direction::Egress) {
            gsp.dest = LogSelectors { l3_flows: l3_dest, l7_flows: l7_dest, dns_logs: dns_dest, alerts: alert_dest };
        }
        gsp
    }
}

fn selects_service_endpoint(ep: &FlowEndpoint) -> bool {
    let included = matches!(
        ep.endpoint_type,
        GraphNodeType::Host | GraphNodeType::Workload | GraphNodeType::ReplicaSet | GraphNodeType::NetworkSet
    );
    if !included {
        debug!("Endpoint {} not included in service selector", ep);
    }
    included
}

fn base_service_selectors(svc: &NamespacedName) -> SelectorPairs {
    let ns = svc.namespace.as_str();
    let name = svc.name.as_str();
    let l7 = || eq_pair("dest_service_namespace", ns, "dest_service_name", name);
    SelectorPairs {
        source: LogSelectors {
            // The service is always known for L7 logs so source and dest match.
            l7_flows: l7(),
            alerts: eq_pair("source_namespace", ns, "source_name", name),
            ..Default::default()
        },
        dest: LogSelectors {
            l3_flows: eq_pair("dest_service_namespace", ns, "dest_service_name", name),
            l7_flows: l7(),
            alerts: eq_pair("dest_namespace", ns, "dest_name", name),
            ..Default::default()
        },
    }
}
