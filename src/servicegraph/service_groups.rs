use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::id::service_group_id;
use crate::flows::FlowEndpoint;
use crate::graph::{GraphNodeId, NamespacedName, ServicePort};

/// A set of services that share backing endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGroup {
    pub id: GraphNodeId,
    /// Sorted services in the group.
    pub services: Vec<NamespacedName>,
    /// The common namespace of the services, or `*` when they differ.
    pub namespace: String,
    /// The sorted, unique service names joined with `/`.
    pub name: String,
    pub service_ports: BTreeMap<ServicePort, BTreeSet<FlowEndpoint>>,
}

impl ServiceGroup {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Lookup of the service group a service or endpoint belongs to.
pub trait ServiceGroupLookup: Send + Sync {
    fn get_by_service(&self, svc: &NamespacedName) -> Option<Arc<ServiceGroup>>;
    fn get_by_endpoint(&self, ep: &FlowEndpoint) -> Option<Arc<ServiceGroup>>;
}

/// The finished service group index. The default value contains no groups.
#[derive(Debug, Clone, Default)]
pub struct ServiceGroups {
    groups: Vec<Arc<ServiceGroup>>,
    by_service: HashMap<NamespacedName, Arc<ServiceGroup>>,
    by_endpoint: HashMap<FlowEndpoint, Arc<ServiceGroup>>,
}

impl ServiceGroups {
    pub fn builder() -> ServiceGroupsBuilder {
        ServiceGroupsBuilder::default()
    }

    /// Groups sorted by ID.
    pub fn groups(&self) -> &[Arc<ServiceGroup>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl ServiceGroupLookup for ServiceGroups {
    fn get_by_service(&self, svc: &NamespacedName) -> Option<Arc<ServiceGroup>> {
        self.by_service.get(svc).cloned()
    }

    fn get_by_endpoint(&self, ep: &FlowEndpoint) -> Option<Arc<ServiceGroup>> {
        let key = ep.service_group_key()?;
        self.by_endpoint.get(&key).cloned()
    }
}

#[derive(Debug, Default)]
struct PendingGroup {
    service_ports: BTreeMap<ServicePort, BTreeSet<FlowEndpoint>>,
}

/// Accumulates service to endpoint mappings. Groups that end up sharing a service or an endpoint are merged.
///
/// Consumed by [`ServiceGroupsBuilder::finish`], so a finished index can never be extended.
#[derive(Debug, Default)]
pub struct ServiceGroupsBuilder {
    groups: Vec<Option<PendingGroup>>,
    by_service: HashMap<NamespacedName, usize>,
    by_endpoint: HashMap<FlowEndpoint, usize>,
}

impl ServiceGroupsBuilder {
    pub fn add_mapping(&mut self, svc: &ServicePort, endpoint: &FlowEndpoint) {
        let key = endpoint.service_group_key();
        let by_svc = self.by_service.get(&svc.service).copied();
        let by_ep = key.as_ref().and_then(|k| self.by_endpoint.get(k).copied());

        let idx = match (by_svc, by_ep) {
            (Some(a), Some(b)) if a != b => {
                debug!("Merging service groups for {} and {}", svc.service, endpoint);
                self.merge(a, b);
                a
            }
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => {
                self.groups.push(Some(PendingGroup::default()));
                self.groups.len() - 1
            }
        };

        self.by_service.insert(svc.service.clone(), idx);
        if let Some(key) = key {
            self.by_endpoint.insert(key, idx);
        }
        if let Some(group) = self.groups[idx].as_mut() {
            group.service_ports.entry(svc.clone()).or_default().insert(endpoint.clone());
        }
    }

    /// Moves everything from group `from` into group `into` and repoints the indexes.
    fn merge(&mut self, into: usize, from: usize) {
        let Some(moved) = self.groups[from].take() else {
            return;
        };
        if let Some(target) = self.groups[into].as_mut() {
            for (sp, eps) in moved.service_ports {
                target.service_ports.entry(sp).or_default().extend(eps);
            }
        }
        for idx in self.by_service.values_mut().chain(self.by_endpoint.values_mut()) {
            if *idx == from {
                *idx = into;
            }
        }
    }

    /// Computes group names and IDs and collapses one-to-one endpoint mappings.
    pub fn finish(self) -> ServiceGroups {
        let mut finished: Vec<Option<Arc<ServiceGroup>>> = Vec::with_capacity(self.groups.len());
        for pending in self.groups {
            finished.push(pending.map(|p| Arc::new(finish_group(p))));
        }

        let resolve = |idx: usize| finished.get(idx).cloned().flatten();
        let by_service = self.by_service.into_iter().filter_map(|(k, idx)| Some((k, resolve(idx)?))).collect();
        let by_endpoint = self.by_endpoint.into_iter().filter_map(|(k, idx)| Some((k, resolve(idx)?))).collect();

        let mut groups: Vec<Arc<ServiceGroup>> = finished.into_iter().flatten().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));

        debug!("Finished {} service groups", groups.len());
        ServiceGroups { groups, by_service, by_endpoint }
    }
}

fn finish_group(pending: PendingGroup) -> ServiceGroup {
    let services: Vec<NamespacedName> =
        pending.service_ports.keys().map(|sp| sp.service.clone()).collect::<BTreeSet<_>>().into_iter().collect();

    let names: BTreeSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
    let namespaces: BTreeSet<&str> = services.iter().map(|s| s.namespace.as_str()).collect();
    let name = names.into_iter().collect::<Vec<_>>().join("/");
    let namespace = match namespaces.len() {
        1 => namespaces.into_iter().next().unwrap_or_default().to_string(),
        _ => "*".to_string(),
    };

    ServiceGroup {
        id: service_group_id(&services),
        service_ports: collapse_endpoints(pending.service_ports),
        services,
        namespace,
        name,
    }
}

/// Replaces endpoints with their aggregated form where every endpoint of that aggregated endpoint, protocol and port
/// maps to a single service port.
fn collapse_endpoints(
    service_ports: BTreeMap<ServicePort, BTreeSet<FlowEndpoint>>,
) -> BTreeMap<ServicePort, BTreeSet<FlowEndpoint>> {
    let mut owners: HashMap<FlowEndpoint, BTreeSet<&ServicePort>> = HashMap::new();
    for (sp, eps) in &service_ports {
        for ep in eps {
            owners.entry(aggregated(ep)).or_default().insert(sp);
        }
    }

    let collapsible: HashMap<FlowEndpoint, ServicePort> = owners
        .into_iter()
        .filter(|(_, sps)| sps.len() == 1)
        .filter_map(|(agg, sps)| Some((agg, (*sps.iter().next()?).clone())))
        .collect();

    service_ports
        .into_iter()
        .map(|(sp, eps)| {
            let eps = eps
                .into_iter()
                .map(|ep| {
                    let agg = aggregated(&ep);
                    if collapsible.get(&agg) == Some(&sp) {
                        agg
                    } else {
                        ep
                    }
                })
                .collect();
            (sp, eps)
        })
        .collect()
}

fn aggregated(ep: &FlowEndpoint) -> FlowEndpoint {
    FlowEndpoint {
        endpoint_type: ep.endpoint_type.to_aggregated(),
        name: String::new(),
        ..ep.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphNodeType;

    fn svc(ns: &str, name: &str, port: u16) -> ServicePort {
        ServicePort {
            service: NamespacedName::new(ns, name),
            port_name: "http".to_string(),
            port,
            protocol: "tcp".to_string(),
        }
    }

    fn pod(ns: &str, name: &str, aggr: &str, port: u16) -> FlowEndpoint {
        FlowEndpoint::new(GraphNodeType::Workload, ns, name, aggr).with_port("tcp", port)
    }

    #[test]
    fn test_services_sharing_a_replica_set_are_merged() {
        let mut builder = ServiceGroups::builder();
        builder.add_mapping(&svc("ns1", "frontend", 80), &pod("ns1", "fe-1", "fe-*", 8080));
        builder.add_mapping(&svc("ns2", "backend", 80), &pod("ns2", "be-1", "be-*", 9090));
        builder.add_mapping(&svc("ns1", "api", 443), &pod("ns1", "fe-2", "fe-*", 8443));
        let sgs = builder.finish();

        assert_eq!(sgs.len(), 2);
        let group = sgs.get_by_service(&NamespacedName::new("ns1", "frontend")).unwrap();
        assert_eq!(group.name, "api/frontend");
        assert_eq!(group.namespace, "ns1");
        assert_eq!(group.id.as_str(), "svcgp;svc/ns1/api;svc/ns1/frontend");
        assert_eq!(
            sgs.get_by_service(&NamespacedName::new("ns1", "api")).unwrap().id,
            group.id
        );
        let by_ep = sgs.get_by_endpoint(&FlowEndpoint::new(GraphNodeType::Workload, "ns1", "other", "fe-*")).unwrap();
        assert_eq!(by_ep.id, group.id);
    }

    #[test]
    fn test_transitive_merge_across_namespaces() {
        let mut builder = ServiceGroups::builder();
        builder.add_mapping(&svc("ns1", "a", 80), &pod("ns1", "x-1", "x-*", 80));
        builder.add_mapping(&svc("ns2", "b", 80), &pod("ns2", "y-1", "y-*", 80));
        // "c" links both groups together.
        builder.add_mapping(&svc("ns3", "c", 80), &pod("ns1", "x-2", "x-*", 80));
        builder.add_mapping(&svc("ns3", "c", 80), &pod("ns2", "y-2", "y-*", 80));
        let sgs = builder.finish();

        assert_eq!(sgs.len(), 1);
        let group = &sgs.groups()[0];
        assert_eq!(group.name, "a/b/c");
        assert_eq!(group.namespace, "*");
        assert_eq!(group.services.len(), 3);
    }

    #[test]
    fn test_hosts_key_on_exact_port() {
        let host = |port| FlowEndpoint::new(GraphNodeType::Host, "", "h1", "*").with_port("tcp", port);
        let mut builder = ServiceGroups::builder();
        builder.add_mapping(&svc("ns1", "a", 80), &host(80));
        builder.add_mapping(&svc("ns1", "b", 81), &host(81));
        let sgs = builder.finish();
        assert_eq!(sgs.len(), 2);
    }

    #[test]
    fn test_one_to_one_endpoints_collapse_to_aggregate() {
        let mut builder = ServiceGroups::builder();
        let sp = svc("ns1", "frontend", 80);
        builder.add_mapping(&sp, &pod("ns1", "fe-1", "fe-*", 8080));
        builder.add_mapping(&sp, &pod("ns1", "fe-2", "fe-*", 8080));
        let sgs = builder.finish();

        let group = sgs.get_by_service(&sp.service).unwrap();
        let eps = &group.service_ports[&sp];
        assert_eq!(eps.len(), 1);
        let ep = eps.iter().next().unwrap();
        assert_eq!(ep.endpoint_type, GraphNodeType::ReplicaSet);
        assert!(ep.name.is_empty());
        assert_eq!(ep.port, 8080);
    }

    #[test]
    fn test_empty_index_has_no_groups() {
        let sgs = ServiceGroups::default();
        assert!(sgs.is_empty());
        assert!(sgs.get_by_service(&NamespacedName::new("a", "b")).is_none());
    }
}
