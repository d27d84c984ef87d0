//! Graph node identities.
//!
//! A node ID is a chain of `;` separated components, innermost first, each made of `/` separated segments. The first
//! segment of a component names its kind. For example, a port on a pod reads `port/tcp/8080;wep/ns1/pod-1/pod-*`.
//!
//! [`IdInfo`] holds everything that can be extracted from, or is needed to build, an ID. The builders on [`IdInfo`]
//! produce a typed [`NodeIdentity`] which renders to the string form through `Display`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

use super::service_groups::{ServiceGroup, ServiceGroupLookup};
use crate::errors::{Result, ServiceGraphError};
use crate::flows::FlowEndpoint;
use crate::graph::{GraphNodeId, GraphNodeType, NamespacedName, ServicePort};

static ID_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[|*0-9a-zA-Z_.-]+$").expect("valid node ID segment regex"));
static ID_SEGMENT_ALLOW_EMPTY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[|*0-9a-zA-Z_.-]*$").expect("valid node ID segment regex"));

const DIRECTION_KIND: &str = "dir";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ingress" => Some(Direction::Ingress),
            "egress" => Some(Direction::Egress),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of one ID component: a graph node type or the direction qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Node(GraphNodeType),
    Direction,
}

impl ComponentKind {
    fn parse(s: &str) -> Option<Self> {
        if s == DIRECTION_KIND {
            return Some(ComponentKind::Direction);
        }
        GraphNodeType::from_str_opt(s).map(ComponentKind::Node)
    }

    /// Whether `parent` may follow this kind in an ID chain.
    fn allows_parent(self, parent: ComponentKind) -> bool {
        use GraphNodeType as T;
        let ComponentKind::Node(this) = self else {
            return false;
        };
        match (this, parent) {
            (T::Port, ComponentKind::Node(p)) => {
                matches!(p, T::ReplicaSet | T::Workload | T::Host | T::Network | T::NetworkSet)
            }
            (T::Network | T::NetworkSet, ComponentKind::Node(T::ServiceGroup) | ComponentKind::Direction) => true,
            (T::Host | T::Hosts, ComponentKind::Node(T::ServiceGroup)) => true,
            (T::ServicePort | T::ServiceGroup | T::Service, ComponentKind::Node(T::Service)) => true,
            _ => false,
        }
    }

    fn templates(self) -> &'static [&'static [Field]] {
        use Field::*;
        let ComponentKind::Node(t) = self else {
            return &[&[Kind, Dir]];
        };
        match t {
            GraphNodeType::Layer => &[&[Kind, Layer]],
            GraphNodeType::Namespace => &[&[Kind, Namespace]],
            GraphNodeType::ServiceGroup => &[&[Kind]],
            GraphNodeType::ReplicaSet => &[&[Kind, Namespace, NameAggr]],
            GraphNodeType::Host => &[&[Kind, Name, NameAggr]],
            GraphNodeType::Network | GraphNodeType::Hosts => &[&[Kind, NameAggr]],
            GraphNodeType::NetworkSet => &[&[Kind, NameAggr], &[Kind, Namespace, NameAggr]],
            GraphNodeType::Workload => &[&[Kind, Namespace, Name, NameAggr]],
            GraphNodeType::Port => &[&[Kind, Protocol, PortNum]],
            GraphNodeType::Service => &[&[Kind, ServiceNamespace, ServiceName]],
            GraphNodeType::ServicePort => &[&[Kind, ServiceProtocol, ServicePortName, ServicePortNum]],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Kind,
    Layer,
    Namespace,
    Name,
    NameAggr,
    Protocol,
    PortNum,
    ServiceNamespace,
    ServiceName,
    ServicePortName,
    ServicePortNum,
    ServiceProtocol,
    Dir,
}

/// What an aggregated endpoint or host ID is qualified with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualifier {
    None,
    ServiceGroup(GraphNodeId),
    Direction(Direction),
}

/// Typed form of a node ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeIdentity {
    Layer {
        name: String,
    },
    Namespace {
        name: String,
    },
    ServiceGroup {
        services: Vec<NamespacedName>,
    },
    Service {
        service: NamespacedName,
    },
    ServicePort {
        service: ServicePort,
    },
    /// Replica sets, host groups, networks and network sets.
    AggrEndpoint {
        endpoint_type: GraphNodeType,
        namespace: String,
        name_aggr: String,
        qualifier: Qualifier,
    },
    /// Pods and individual hosts.
    Endpoint {
        endpoint_type: GraphNodeType,
        namespace: String,
        name: String,
        name_aggr: String,
        qualifier: Qualifier,
    },
    Port {
        protocol: String,
        port: u16,
        parent: Box<NodeIdentity>,
    },
}

fn write_qualifier(f: &mut fmt::Formatter<'_>, q: &Qualifier) -> fmt::Result {
    match q {
        Qualifier::None => Ok(()),
        Qualifier::ServiceGroup(id) => write!(f, ";{}", id),
        Qualifier::Direction(d) => write!(f, ";{}/{}", DIRECTION_KIND, d),
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeIdentity::Layer { name } => write!(f, "{}/{}", GraphNodeType::Layer, name),
            NodeIdentity::Namespace { name } => write!(f, "{}/{}", GraphNodeType::Namespace, name),
            NodeIdentity::ServiceGroup { services } => {
                write!(f, "{}", GraphNodeType::ServiceGroup)?;
                for s in services {
                    write!(f, ";{}/{}/{}", GraphNodeType::Service, s.namespace, s.name)?;
                }
                Ok(())
            }
            NodeIdentity::Service { service } => {
                write!(f, "{}/{}/{}", GraphNodeType::Service, service.namespace, service.name)
            }
            NodeIdentity::ServicePort { service } => write!(
                f,
                "{}/{}/{}/{};{}/{}/{}",
                GraphNodeType::ServicePort,
                service.protocol,
                service.port_name,
                service.port,
                GraphNodeType::Service,
                service.service.namespace,
                service.service.name
            ),
            NodeIdentity::AggrEndpoint { endpoint_type, namespace, name_aggr, qualifier } => {
                if namespace.is_empty() {
                    write!(f, "{}/{}", endpoint_type, name_aggr)?;
                } else {
                    write!(f, "{}/{}/{}", endpoint_type, namespace, name_aggr)?;
                }
                write_qualifier(f, qualifier)
            }
            NodeIdentity::Endpoint { endpoint_type, namespace, name, name_aggr, qualifier } => {
                if *endpoint_type == GraphNodeType::Workload {
                    write!(f, "{}/{}/{}/{}", endpoint_type, namespace, name, name_aggr)?;
                } else {
                    write!(f, "{}/{}/{}", endpoint_type, name, name_aggr)?;
                }
                write_qualifier(f, qualifier)
            }
            NodeIdentity::Port { protocol, port, parent } => {
                write!(f, "{}/{}/{};{}", GraphNodeType::Port, protocol, port, parent)
            }
        }
    }
}

impl From<NodeIdentity> for GraphNodeId {
    fn from(identity: NodeIdentity) -> Self {
        GraphNodeId::from(identity.to_string())
    }
}

/// The service group ID for a set of services. Empty services yield no ID.
pub fn service_group_id(services: &[NamespacedName]) -> GraphNodeId {
    if services.is_empty() {
        return GraphNodeId::default();
    }
    NodeIdentity::ServiceGroup { services: services.to_vec() }.into()
}

/// Data parsed from a node ID, or used to construct one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdInfo {
    /// Kind of the first component of a parsed ID.
    pub parsed_type: Option<ComponentKind>,
    pub endpoint_type: Option<GraphNodeType>,
    pub namespace: String,
    pub name: String,
    pub name_aggr: String,
    pub protocol: String,
    pub port: u16,
    pub service: ServicePort,
    pub service_group: Option<Arc<ServiceGroup>>,
    pub layer: String,
    pub direction: Option<Direction>,
}

impl IdInfo {
    pub fn for_endpoint(ep: &FlowEndpoint) -> Self {
        Self {
            endpoint_type: Some(ep.endpoint_type),
            namespace: ep.namespace.clone(),
            name: ep.name.clone(),
            name_aggr: ep.name_aggr.clone(),
            protocol: ep.protocol.clone(),
            port: ep.port,
            ..Default::default()
        }
    }

    /// The endpoint described by this ID, if it names one.
    pub fn endpoint(&self) -> Option<FlowEndpoint> {
        let endpoint_type = self.endpoint_type?;
        Some(
            FlowEndpoint::new(endpoint_type, &self.namespace, &self.name, &self.name_aggr)
                .with_port(&self.protocol, self.port),
        )
    }

    pub fn aggr_endpoint_type(&self) -> Option<GraphNodeType> {
        self.endpoint_type.map(GraphNodeType::to_aggregated)
    }

    fn service_group_qualifier(&self) -> Option<Qualifier> {
        self.service_group_id().map(Qualifier::ServiceGroup)
    }

    pub fn aggr_endpoint(&self) -> Option<NodeIdentity> {
        let endpoint_type = self.aggr_endpoint_type()?;
        let (namespace, qualifier) = match endpoint_type {
            GraphNodeType::ReplicaSet => (self.namespace.clone(), Qualifier::None),
            GraphNodeType::Network | GraphNodeType::NetworkSet => {
                let qualifier = self
                    .service_group_qualifier()
                    .or_else(|| self.direction.map(Qualifier::Direction))
                    .unwrap_or(Qualifier::None);
                (self.namespace.clone(), qualifier)
            }
            GraphNodeType::Hosts => (String::new(), self.service_group_qualifier().unwrap_or(Qualifier::None)),
            _ => return None,
        };
        Some(NodeIdentity::AggrEndpoint { endpoint_type, namespace, name_aggr: self.name_aggr.clone(), qualifier })
    }

    pub fn endpoint_identity(&self) -> Option<NodeIdentity> {
        let endpoint_type = self.endpoint_type?;
        let (namespace, qualifier) = match endpoint_type {
            GraphNodeType::Workload => (self.namespace.clone(), Qualifier::None),
            GraphNodeType::Host => (String::new(), self.service_group_qualifier().unwrap_or(Qualifier::None)),
            _ => return None,
        };
        Some(NodeIdentity::Endpoint {
            endpoint_type,
            namespace,
            name: self.name.clone(),
            name_aggr: self.name_aggr.clone(),
            qualifier,
        })
    }

    pub fn aggr_endpoint_id(&self) -> Option<GraphNodeId> {
        self.aggr_endpoint().map(Into::into)
    }

    /// The non-aggregated endpoint ID. Only pods and hosts have one.
    pub fn endpoint_id(&self) -> Option<GraphNodeId> {
        self.endpoint_identity().map(Into::into)
    }

    /// Port on the endpoint, falling back to the port on the aggregated endpoint.
    pub fn endpoint_port_id(&self) -> Option<GraphNodeId> {
        if self.port == 0 {
            return None;
        }
        match self.endpoint_identity() {
            Some(parent) => Some(self.port_identity(parent).into()),
            None => self.aggr_endpoint_port_id(),
        }
    }

    pub fn aggr_endpoint_port_id(&self) -> Option<GraphNodeId> {
        if self.port == 0 {
            return None;
        }
        let parent = self.aggr_endpoint()?;
        Some(self.port_identity(parent).into())
    }

    fn port_identity(&self, parent: NodeIdentity) -> NodeIdentity {
        NodeIdentity::Port { protocol: self.protocol.clone(), port: self.port, parent: Box::new(parent) }
    }

    pub fn service_id(&self) -> Option<GraphNodeId> {
        if !self.service.is_service() {
            return None;
        }
        Some(NodeIdentity::Service { service: self.service.service.clone() }.into())
    }

    pub fn service_port_id(&self) -> Option<GraphNodeId> {
        if !self.service.is_service() {
            return None;
        }
        Some(NodeIdentity::ServicePort { service: self.service.clone() }.into())
    }

    pub fn service_group_id(&self) -> Option<GraphNodeId> {
        self.service_group.as_ref().map(|sg| sg.id.clone()).filter(|id| !id.is_empty())
    }

    pub fn layer_id(&self) -> Option<GraphNodeId> {
        if self.layer.is_empty() {
            return None;
        }
        Some(NodeIdentity::Layer { name: self.layer.clone() }.into())
    }

    pub fn namespace_id(&self) -> Option<GraphNodeId> {
        let namespace = self.effective_namespace();
        if namespace.is_empty() {
            return None;
        }
        Some(NodeIdentity::Namespace { name: namespace.to_string() }.into())
    }

    /// The namespace the endpoint is grouped under. A service group namespace takes precedence.
    pub fn effective_namespace(&self) -> &str {
        match &self.service_group {
            Some(sg) => &sg.namespace,
            None => &self.namespace,
        }
    }

    /// Re-encodes this ID in the form matching its parsed kind.
    fn normalized_id(&self) -> Option<GraphNodeId> {
        let ComponentKind::Node(t) = self.parsed_type? else {
            return None;
        };
        match t {
            GraphNodeType::Layer => self.layer_id(),
            GraphNodeType::Namespace => self.namespace_id(),
            GraphNodeType::ServiceGroup => self.service_group_id(),
            GraphNodeType::ReplicaSet | GraphNodeType::Hosts | GraphNodeType::Network | GraphNodeType::NetworkSet => {
                self.aggr_endpoint_id()
            }
            GraphNodeType::Host | GraphNodeType::Workload => self.endpoint_id(),
            GraphNodeType::Port => self.endpoint_port_id(),
            GraphNodeType::ServicePort => self.service_port_id(),
            GraphNodeType::Service => self.service_id(),
        }
    }
}

fn check_segment(id: &str, field: Field, value: &str) -> Result<()> {
    if field == Field::ServicePortName {
        if !ID_SEGMENT_ALLOW_EMPTY.is_match(value) {
            return Err(ServiceGraphError::invalid_node_id(id, Some("unexpected empty segment")));
        }
    } else if !ID_SEGMENT.is_match(value) {
        return Err(ServiceGraphError::invalid_node_id(id, Some("badly formatted segment")));
    }
    Ok(())
}

fn parse_port(id: &str, value: &str) -> Result<u16> {
    value.parse().map_err(|_| ServiceGraphError::invalid_node_id(id, Some("port is not a number")))
}

/// Parses an external node ID.
///
/// Fails on an unknown kind, a wrong segment count, a disallowed parent chain or a segment outside the ID grammar.
/// Services listed under a service group must all belong to the same known group.
pub fn parse_graph_node_id(id: &GraphNodeId, sgs: &dyn ServiceGroupLookup) -> Result<IdInfo> {
    let id = id.as_str();
    let first = id.split(|c| c == ';' || c == '/').next().unwrap_or_default();

    let mut info = IdInfo { parsed_type: ComponentKind::parse(first), ..Default::default() };
    let mut previous: Option<ComponentKind> = None;
    let mut is_service_group = false;

    for component in id.split(';') {
        let parts: Vec<&str> = component.split('/').collect();
        let kind = ComponentKind::parse(parts[0]);

        if let Some(prev) = previous {
            if !kind.is_some_and(|k| prev.allows_parent(k)) {
                return Err(ServiceGraphError::InvalidNodeId {
                    message: format!("unexpected format of node ID: {}", id),
                });
            }
        }
        let Some(kind) = kind else {
            return Err(ServiceGraphError::invalid_node_id(id, None));
        };

        if kind == ComponentKind::Node(GraphNodeType::ServiceGroup) {
            is_service_group = true;
        }
        if let ComponentKind::Node(t) = kind {
            if t.is_endpoint() {
                info.endpoint_type = Some(t);
            }
        }

        let template = kind
            .templates()
            .iter()
            .find(|t| t.len() == parts.len())
            .ok_or_else(|| ServiceGraphError::invalid_node_id(id, None))?;

        for (field, value) in template.iter().zip(parts.iter().copied()) {
            check_segment(id, *field, value)?;
            match field {
                Field::Kind => {}
                Field::Layer => info.layer = value.to_string(),
                Field::Namespace => info.namespace = value.to_string(),
                Field::Name => info.name = value.to_string(),
                Field::NameAggr => info.name_aggr = value.to_string(),
                Field::Protocol => info.protocol = value.to_string(),
                Field::PortNum => info.port = parse_port(id, value)?,
                Field::ServiceNamespace => info.service.service.namespace = value.to_string(),
                Field::ServiceName => info.service.service.name = value.to_string(),
                Field::ServicePortName => info.service.port_name = value.to_string(),
                Field::ServicePortNum => info.service.port = parse_port(id, value)?,
                Field::ServiceProtocol => info.service.protocol = value.to_string(),
                Field::Dir => {
                    info.direction = Some(
                        Direction::parse(value)
                            .ok_or_else(|| ServiceGraphError::invalid_node_id(id, Some("unknown direction")))?,
                    );
                }
            }
        }

        // Services in a group ID identify the group. Logs may miss some of the services, but they must not span
        // more than one group.
        if is_service_group && kind == ComponentKind::Node(GraphNodeType::Service) {
            let sg = sgs.get_by_service(&info.service.service);
            if let (Some(current), Some(found)) = (&info.service_group, &sg) {
                if current.id != found.id {
                    return Err(ServiceGraphError::invalid_node_id(
                        id,
                        Some("unrelated services specified as a group"),
                    ));
                }
            }
            if sg.is_some() {
                info.service_group = sg;
            }
            info.service = ServicePort::default();
        }

        previous = Some(kind);
    }

    if info.service_group.is_none() {
        info.service_group = info.endpoint().and_then(|ep| sgs.get_by_endpoint(&ep));
    }

    Ok(info)
}

/// Normalizes an ID supplied in a view for the current service groups and direction split.
///
/// Without a split any direction is dropped. With a split, a directional ID is kept as is and a non-directional one is
/// expanded to its ingress and egress forms, which collapse to one when the kind carries no direction.
pub fn get_normalized_ids(
    id: &GraphNodeId,
    sgs: &dyn ServiceGroupLookup,
    split_ingress_egress: bool,
) -> Result<Vec<GraphNodeId>> {
    let mut info = parse_graph_node_id(id, sgs)?;

    let mut ids = Vec::with_capacity(2);
    if !split_ingress_egress {
        info.direction = None;
        ids.extend(info.normalized_id());
    } else if info.direction.is_some() {
        ids.extend(info.normalized_id());
    } else {
        info.direction = Some(Direction::Ingress);
        let ingress = info.normalized_id();
        info.direction = Some(Direction::Egress);
        let egress = info.normalized_id();

        if let Some(ingress) = &ingress {
            ids.push(ingress.clone());
        }
        if let Some(egress) = egress {
            if ingress.as_ref() != Some(&egress) {
                ids.push(egress);
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FixedGroup(Arc<ServiceGroup>);

    impl ServiceGroupLookup for FixedGroup {
        fn get_by_service(&self, _svc: &NamespacedName) -> Option<Arc<ServiceGroup>> {
            Some(self.0.clone())
        }

        fn get_by_endpoint(&self, _ep: &FlowEndpoint) -> Option<Arc<ServiceGroup>> {
            None
        }
    }

    fn dummy_group() -> Arc<ServiceGroup> {
        let services = vec![NamespacedName::new("my-service-namespace", "my-service-name")];
        Arc::new(ServiceGroup {
            id: service_group_id(&services),
            services,
            namespace: "my-service-namespace".to_string(),
            name: "my-service-name".to_string(),
            service_ports: BTreeMap::new(),
        })
    }

    fn parse(id: &str) -> Result<IdInfo> {
        parse_graph_node_id(&GraphNodeId::from(id), &FixedGroup(dummy_group()))
    }

    fn normalized(id: &str, split: bool) -> Vec<String> {
        get_normalized_ids(&GraphNodeId::from(id), &FixedGroup(dummy_group()), split)
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalized("layer/my-layer", true), vec!["layer/my-layer"]);
        assert_eq!(normalized("hosts/*", false), vec!["hosts/*"]);
        assert_eq!(normalized("hosts/*", true), vec!["hosts/*"]);
        assert_eq!(normalized("ns/netset", true), vec!["ns/netset;dir/ingress", "ns/netset;dir/egress"]);
        assert_eq!(normalized("ns/netset;dir/egress", false), vec!["ns/netset"]);
        assert_eq!(normalized("ns/netset;dir/egress", true), vec!["ns/netset;dir/egress"]);
        assert_eq!(normalized("host/host1/*", true), vec!["host/host1/*"]);
        assert!(normalized("dir/ingress", true).is_empty());
    }

    #[test]
    fn test_parse_endpoints() {
        let info = parse("wep/ns1/n1/na1").unwrap();
        assert_eq!(info.parsed_type, Some(ComponentKind::Node(GraphNodeType::Workload)));
        assert_eq!(info.endpoint_type, Some(GraphNodeType::Workload));
        assert_eq!((info.namespace.as_str(), info.name.as_str(), info.name_aggr.as_str()), ("ns1", "n1", "na1"));

        let info = parse("ns/ns1/na1;svcgp;svc/my-service-namespace/my-service-name").unwrap();
        assert_eq!(info.endpoint_type, Some(GraphNodeType::NetworkSet));
        assert_eq!(info.service_group, Some(dummy_group()));
        assert!(!info.service.is_service());

        let info = parse("ns/na1;dir/egress").unwrap();
        assert_eq!(info.direction, Some(Direction::Egress));
        assert!(info.namespace.is_empty());
    }

    #[test]
    fn test_parse_service_ports() {
        let info = parse("svcport/udp//1233;svc/svc-namespace/svc-name").unwrap();
        assert_eq!(info.parsed_type, Some(ComponentKind::Node(GraphNodeType::ServicePort)));
        assert_eq!(info.service.service, NamespacedName::new("svc-namespace", "svc-name"));
        assert_eq!(info.service.protocol, "udp");
        assert_eq!(info.service.port, 1233);
        assert!(info.service.port_name.is_empty());

        let info = parse("svcport/sctp/po.rt-name/1234;svc/svc-namespace/svc-name").unwrap();
        assert_eq!(info.service.port_name, "po.rt-name");
    }

    #[test]
    fn test_parse_errors() {
        for id in ["layer/my/layer", "layer/my%layer", "layer/my-layer;ns/na1", "layer/my-layer;svc/ns1/n1", "ns/a/b/c"]
        {
            assert!(parse(id).is_err(), "{} should not parse", id);
        }
        assert_eq!(
            parse("layer/my-layer;ns/na1").unwrap_err().to_string(),
            "unexpected format of node ID: layer/my-layer;ns/na1"
        );
        assert_eq!(
            parse("port/tcp/http;rep/ns/n").unwrap_err().to_string(),
            "unexpected format of node ID port/tcp/http;rep/ns/n: port is not a number"
        );
        assert_eq!(
            parse("rep/ns/n%").unwrap_err().to_string(),
            "unexpected format of node ID rep/ns/n%: badly formatted segment"
        );
        assert_eq!(parse("bogus/a").unwrap_err().to_string(), "unexpected format of node ID bogus/a");
    }

    #[test]
    fn test_encoders() {
        let info = IdInfo {
            endpoint_type: Some(GraphNodeType::Network),
            name_aggr: "pub".to_string(),
            port: 88,
            protocol: "udp".to_string(),
            service: ServicePort {
                service: NamespacedName::new("service-namespace", "service-name"),
                port_name: "http".to_string(),
                port: 88,
                protocol: "udp".to_string(),
            },
            service_group: Some(dummy_group()),
            ..Default::default()
        };
        let sg = "svcgp;svc/my-service-namespace/my-service-name";
        assert_eq!(info.namespace_id().unwrap().as_str(), "namespace/my-service-namespace");
        assert_eq!(info.service_id().unwrap().as_str(), "svc/service-namespace/service-name");
        assert_eq!(
            info.service_port_id().unwrap().as_str(),
            "svcport/udp/http/88;svc/service-namespace/service-name"
        );
        assert_eq!(info.aggr_endpoint_id().unwrap().to_string(), format!("net/pub;{}", sg));
        assert!(info.endpoint_id().is_none());
        assert_eq!(info.endpoint_port_id().unwrap().to_string(), format!("port/udp/88;net/pub;{}", sg));

        let pod = IdInfo::for_endpoint(
            &FlowEndpoint::new(GraphNodeType::Workload, "ns1", "pod-1", "pod-*").with_port("tcp", 8080),
        );
        assert_eq!(pod.aggr_endpoint_id().unwrap().as_str(), "rep/ns1/pod-*");
        assert_eq!(pod.endpoint_port_id().unwrap().as_str(), "port/tcp/8080;wep/ns1/pod-1/pod-*");
        assert_eq!(pod.aggr_endpoint_port_id().unwrap().as_str(), "port/tcp/8080;rep/ns1/pod-*");
        assert!(pod.layer_id().is_none());
    }

    #[test]
    fn test_round_trip_for_every_kind() {
        let ids = [
            "layer/my-layer",
            "namespace/ns1",
            "svcgp;svc/my-service-namespace/my-service-name",
            "svc/ns1/svc1",
            "svcport/tcp/http/80;svc/ns1/svc1",
            "rep/ns1/na1",
            "wep/ns1/n1/na1",
            "host/h1/*",
            "host/h1/*;svcgp;svc/my-service-namespace/my-service-name",
            "hosts/*",
            "net/pub",
            "net/pub;dir/ingress",
            "ns/ns1/na1",
            "ns/na1;svcgp;svc/my-service-namespace/my-service-name",
            "port/tcp/80;rep/ns1/na1",
            "port/udp/53;wep/ns1/n1/na1",
            "port/tcp/443;host/h1/*",
        ];
        for id in ids {
            let info = parse(id).unwrap();
            assert_eq!(info.normalized_id().unwrap().as_str(), id, "round trip of {}", id);
        }
    }
}
