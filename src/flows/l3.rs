use futures::{pin_mut, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, enabled, error, Level};

use super::{FlowConfig, FlowEdge, FlowEndpoint, Fetched, L3Flow, PortRangeSet};
use crate::errors::Result;
use crate::graph::stats::merge_option;
use crate::graph::{
    combine_endpoint_processes, AggregatedPorts, AggregatedProtoPorts, GraphConnectionStats, GraphEndpointProcess,
    GraphEndpointProcesses, GraphL3Stats, GraphNodeType, GraphPacketStats, GraphProcesses, GraphTcpStats,
    NamespacedName, ServicePort, TimeRange,
};

/// Maximum number of port ranges listed per protocol before the remainder is counted in `num_other_ports`.
pub const MAX_AGGREGATED_PORT_RANGES_PER_PROTOCOL: usize = 5;

/// Maximum number of protocols listed before the remainder is counted in `num_other_protocols`.
pub const MAX_AGGREGATED_PROTOCOLS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reporter {
    Src,
    Dst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEndpoint {
    /// One of `wep`, `hep`, `net` or `ns`.
    #[serde(rename = "type")]
    pub endpoint_type: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub aggregated_name: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawService {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub port_name: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLogStats {
    pub log_count: i64,
    pub started: i64,
    pub completed: i64,
    pub flow_log_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTrafficStats {
    pub packets_in: i64,
    pub packets_out: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTcpStats {
    pub total_retransmissions: i64,
    pub lost_packets: i64,
    pub unrecovered_to: i64,
    pub min_send_congestion_window: i64,
    pub min_mss: i64,
    pub max_smooth_rtt: i64,
    pub max_min_rtt: i64,
    pub mean_send_congestion_window: f64,
    pub mean_smooth_rtt: f64,
    pub mean_min_rtt: f64,
    pub mean_mss: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProcess {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProcessStats {
    pub min_num_names_per_flow: i64,
    pub max_num_names_per_flow: i64,
    pub min_num_ids_per_flow: i64,
    pub max_num_ids_per_flow: i64,
}

/// One per-direction L3 flow record as returned by the log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawL3Flow {
    pub reporter: Reporter,
    pub action: Action,
    pub protocol: String,
    pub source: RawEndpoint,
    pub destination: RawEndpoint,
    #[serde(default)]
    pub service: Option<RawService>,
    #[serde(default)]
    pub log_stats: Option<RawLogStats>,
    #[serde(default)]
    pub traffic_stats: Option<RawTrafficStats>,
    #[serde(default)]
    pub tcp_stats: Option<RawTcpStats>,
    #[serde(default)]
    pub process: Option<RawProcess>,
    #[serde(default)]
    pub process_stats: Option<RawProcessStats>,
}

/// Maps a raw log endpoint type to the graph node type. Aggregated workloads are replica sets.
pub fn map_raw_type(raw: &str, aggregated: bool) -> Option<GraphNodeType> {
    match raw {
        "wep" if aggregated => Some(GraphNodeType::ReplicaSet),
        "wep" => Some(GraphNodeType::Workload),
        "hep" => Some(GraphNodeType::Host),
        "net" => Some(GraphNodeType::Network),
        "ns" => Some(GraphNodeType::NetworkSet),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
struct FlowStats {
    packets: Option<GraphPacketStats>,
    connections: GraphConnectionStats,
    tcp: Option<GraphTcpStats>,
    processes: GraphEndpointProcesses,
}

impl FlowStats {
    fn add(self, other: FlowStats) -> FlowStats {
        FlowStats {
            packets: add_packets(self.packets, other.packets),
            connections: self.connections.add(other.connections),
            tcp: combine_tcp(self.tcp, other.tcp),
            processes: combine_endpoint_processes(self.processes, other.processes),
        }
    }
}

fn add_packets(a: Option<GraphPacketStats>, b: Option<GraphPacketStats>) -> Option<GraphPacketStats> {
    merge_option(a, b, GraphPacketStats::add)
}

fn combine_tcp(a: Option<GraphTcpStats>, b: Option<GraphTcpStats>) -> Option<GraphTcpStats> {
    merge_option(a, b, GraphTcpStats::combine)
}

type StatsByService = BTreeMap<ServicePort, FlowStats>;

fn lookup(map: &StatsByService, svc: &ServicePort) -> FlowStats {
    map.get(svc).cloned().unwrap_or_default()
}

/// Looks up a service bucket combined with the protocol-only bucket for the same protocol.
fn lookup_with_protocol(map: &StatsByService, svc: &ServicePort) -> FlowStats {
    let protocol_only = protocol_key(&svc.protocol);
    if protocol_only == *svc {
        return lookup(map, svc);
    }
    lookup(map, &protocol_only).add(lookup(map, svc))
}

fn protocol_key(protocol: &str) -> ServicePort {
    ServicePort { protocol: protocol.to_string(), ..Default::default() }
}

/// Source and destination reported statistics for a single source/destination pair, keyed by service port.
#[derive(Debug, Default)]
struct ReconciliationData {
    source_allowed: StatsByService,
    source_denied: StatsByService,
    dest_allowed: StatsByService,
    dest_denied: StatsByService,
}

impl ReconciliationData {
    fn add(&mut self, reporter: Reporter, action: Action, svc: ServicePort, stats: FlowStats) {
        let map = match (reporter, action) {
            (Reporter::Src, Action::Allow) => &mut self.source_allowed,
            (Reporter::Src, Action::Deny) => &mut self.source_denied,
            (Reporter::Dst, Action::Allow) => &mut self.dest_allowed,
            (Reporter::Dst, Action::Deny) => &mut self.dest_denied,
        };
        let current = map.remove(&svc).unwrap_or_default();
        map.insert(svc, current.add(stats));
    }

    fn flows(&self, source: &FlowEndpoint, dest: &FlowEndpoint) -> Vec<L3Flow> {
        let source_reported = !self.source_allowed.is_empty() || !self.source_denied.is_empty();
        let dest_reported = !self.dest_allowed.is_empty() || !self.dest_denied.is_empty();

        let make_flow = |svc: &ServicePort, stats: GraphL3Stats, processes: Option<GraphProcesses>| L3Flow {
            edge: FlowEdge {
                source: source.clone(),
                dest: dest.clone(),
                service_port: svc.is_service().then(|| svc.clone()),
            },
            aggregated_proto_ports: None,
            stats,
            processes,
        };

        if source_reported != dest_reported {
            debug!("  L3 flow reported at {} only", if source_reported { "source" } else { "dest" });
            let (allowed, denied) = if source_reported {
                (&self.source_allowed, &self.source_denied)
            } else {
                (&self.dest_allowed, &self.dest_denied)
            };
            return all_services(allowed, denied)
                .into_iter()
                .map(|svc| {
                    let a = lookup(allowed, &svc);
                    let d = lookup(denied, &svc);
                    let processes = combine_endpoint_processes(a.processes, d.processes);
                    let mut stats = GraphL3Stats {
                        allowed: a.packets,
                        connections: a.connections.add(d.connections),
                        tcp: a.tcp,
                        ..Default::default()
                    };
                    let processes = if source_reported {
                        stats.denied_at_source = d.packets;
                        (!processes.is_empty()).then(|| GraphProcesses { source: processes, ..Default::default() })
                    } else {
                        stats.denied_at_dest = d.packets;
                        (!processes.is_empty()).then(|| GraphProcesses { dest: processes, ..Default::default() })
                    };
                    make_flow(&svc, stats, processes)
                })
                .collect();
        }

        // Reported at both ends: split the source allowed traffic using the proportion allowed at dest.
        debug!("  L3 flow reported at source and dest");
        all_services(&self.source_allowed, &self.source_denied)
            .into_iter()
            .map(|svc| {
                let src_allowed = lookup(&self.source_allowed, &svc);
                let src_denied = lookup(&self.source_denied, &svc);
                let dst_allowed = lookup_with_protocol(&self.dest_allowed, &svc);
                let dst_denied = lookup_with_protocol(&self.dest_denied, &svc);

                let (allowed, denied_at_dest) = match (dst_allowed.packets, dst_denied.packets) {
                    (None, _) => (None, src_allowed.packets),
                    (Some(_), None) => (src_allowed.packets, None),
                    (Some(total_allowed), Some(total_denied)) => {
                        let prop = total_allowed.prop(&total_denied);
                        match src_allowed.packets {
                            Some(packets) => {
                                let allowed = packets.multiply(&prop);
                                (Some(allowed), Some(packets.sub(allowed)))
                            }
                            None => (None, None),
                        }
                    }
                };

                let tcp = combine_tcp(
                    combine_tcp(src_allowed.tcp, src_denied.tcp),
                    combine_tcp(lookup(&self.dest_allowed, &svc).tcp, lookup(&self.dest_denied, &svc).tcp),
                );

                let source_processes = combine_endpoint_processes(src_allowed.processes, src_denied.processes);
                let dest_processes = combine_endpoint_processes(dst_allowed.processes, dst_denied.processes);
                let processes = (!source_processes.is_empty() || !dest_processes.is_empty())
                    .then(|| GraphProcesses { source: source_processes, dest: dest_processes });

                let stats = GraphL3Stats {
                    allowed,
                    denied_at_source: src_denied.packets,
                    denied_at_dest,
                    connections: src_allowed.connections.add(src_denied.connections),
                    tcp,
                };
                make_flow(&svc, stats, processes)
            })
            .collect()
    }
}

fn all_services(a: &StatsByService, b: &StatsByService) -> BTreeSet<ServicePort> {
    a.keys().chain(b.keys()).cloned().collect()
}

/// Flows from a single source into one destination group.
#[derive(Debug, Default)]
struct SourceData {
    service_destinations: BTreeMap<FlowEndpoint, ReconciliationData>,
    other: Option<ReconciliationData>,
    proto_ports: BTreeMap<String, Option<PortRangeSet>>,
}

impl SourceData {
    fn add(
        &mut self,
        reporter: Reporter,
        action: Action,
        svc: ServicePort,
        dest: &FlowEndpoint,
        stats: FlowStats,
        is_service_endpoint: bool,
    ) {
        if is_service_endpoint || self.service_destinations.contains_key(dest) {
            debug!("  endpoint is part of a service");
            let svc = if svc.is_service() { svc } else { protocol_key(&dest.protocol) };
            self.service_destinations.entry(dest.clone()).or_default().add(reporter, action, svc, stats);
            return;
        }

        debug!("  endpoint is not part of a service - aggregate port and proto info");
        let ports = self
            .proto_ports
            .entry(dest.protocol.clone())
            .or_insert_with(|| (dest.port != 0).then(PortRangeSet::new));
        if let Some(ports) = ports {
            ports.add(dest.port);
        }
        self.other.get_or_insert_with(Default::default).add(reporter, action, ServicePort::default(), stats);
    }

    fn flows(&self, source: &FlowEndpoint, dest_group: &FlowEndpoint) -> Vec<L3Flow> {
        let mut flows: Vec<L3Flow> = self
            .service_destinations
            .iter()
            .flat_map(|(dest, data)| data.flows(source, dest))
            .collect();

        if let Some(other) = &self.other {
            let dest = FlowEndpoint::new(
                dest_group.endpoint_type,
                &dest_group.namespace,
                &dest_group.name,
                &dest_group.name_aggr,
            );
            let mut aggregated = other.flows(source, &dest);
            if aggregated.len() == 1 {
                let mut flow = aggregated.remove(0);
                flow.aggregated_proto_ports = Some(self.aggregated_proto_ports());
                flows.push(flow);
            } else {
                error!("Multiple flows with aggregated ports and protocols: {:?}", aggregated);
            }
        }

        if enabled!(Level::DEBUG) {
            if flows.is_empty() {
                debug!("Collated flows discarded");
            }
            for flow in &flows {
                debug!("- {}", flow.edge);
            }
        }
        flows
    }

    fn aggregated_proto_ports(&self) -> AggregatedProtoPorts {
        let mut app = AggregatedProtoPorts::default();
        for (protocol, ports) in &self.proto_ports {
            let mut agg = AggregatedPorts { protocol: protocol.clone(), ..Default::default() };
            if let Some(ports) = ports {
                for range in ports.ranges() {
                    if agg.port_ranges.len() >= MAX_AGGREGATED_PORT_RANGES_PER_PROTOCOL {
                        agg.num_other_ports += range.num();
                    } else {
                        agg.port_ranges.push(*range);
                    }
                }
            }
            app.proto_ports.push(agg);

            if app.proto_ports.len() >= MAX_AGGREGATED_PROTOCOLS {
                app.num_other_protocols = (self.proto_ports.len() - app.proto_ports.len()) as u32;
                break;
            }
        }
        app
    }
}

/// All flows collated for a single destination group.
#[derive(Debug, Default)]
struct DestinationGroupData {
    sources: BTreeMap<FlowEndpoint, SourceData>,
    all_service_destinations: HashSet<FlowEndpoint>,
}

impl DestinationGroupData {
    fn add(
        &mut self,
        reporter: Reporter,
        action: Action,
        source: FlowEndpoint,
        svc: ServicePort,
        dest: &FlowEndpoint,
        stats: FlowStats,
    ) {
        if svc.is_service() {
            self.all_service_destinations.insert(dest.clone());
        }
        let is_service_endpoint = self.all_service_destinations.contains(dest);
        self.sources.entry(source).or_default().add(reporter, action, svc, dest, stats, is_service_endpoint);
    }

    fn flows(&self, dest_group: &FlowEndpoint) -> Vec<L3Flow> {
        debug!("Handling source/dest reconciliation");
        self.sources.iter().flat_map(|(source, data)| data.flows(source, dest_group)).collect()
    }
}

fn convert_record(flow: &RawL3Flow) -> Option<(FlowEndpoint, ServicePort, FlowEndpoint, FlowStats)> {
    let source_type = map_raw_type(&flow.source.endpoint_type, true)?;
    let dest_type = map_raw_type(&flow.destination.endpoint_type, true)?;
    let proto = flow.protocol.as_str();

    let source = FlowEndpoint::new(source_type, &flow.source.namespace, "", &flow.source.aggregated_name);
    let dest = FlowEndpoint::new(dest_type, &flow.destination.namespace, "", &flow.destination.aggregated_name)
        .with_port(proto, flow.destination.port);

    let svc = match &flow.service {
        Some(s) => ServicePort {
            service: NamespacedName::new(&s.namespace, &s.name),
            port_name: s.port_name.clone(),
            port: s.port,
            protocol: proto.to_string(),
        },
        None => ServicePort::default(),
    };

    let connections = flow
        .log_stats
        .map(|ls| GraphConnectionStats {
            total_per_sample_interval: ls.log_count,
            started: ls.started,
            completed: ls.completed,
        })
        .unwrap_or_default();

    let packets = flow
        .traffic_stats
        .map(|ts| GraphPacketStats {
            packets_in: ts.packets_in,
            packets_out: ts.packets_out,
            bytes_in: ts.bytes_in,
            bytes_out: ts.bytes_out,
        })
        .unwrap_or_default();

    // Zeroed TCP stats mean no data. Counting them would dilute the means and minimums when merged.
    let tcp = match (proto, flow.tcp_stats, flow.log_stats) {
        ("tcp", Some(t), Some(ls)) => {
            let tcp = GraphTcpStats {
                sum_total_retransmissions: t.total_retransmissions,
                sum_lost_packets: t.lost_packets,
                sum_unrecovered_to: t.unrecovered_to,
                min_send_congestion_window: t.min_send_congestion_window,
                min_send_mss: t.min_mss,
                max_smooth_rtt: t.max_smooth_rtt,
                max_min_rtt: t.max_min_rtt,
                mean_send_congestion_window: t.mean_send_congestion_window,
                mean_smooth_rtt: t.mean_smooth_rtt,
                mean_min_rtt: t.mean_min_rtt,
                mean_mss: t.mean_mss,
                count: 0,
            };
            (tcp != GraphTcpStats::default()).then(|| GraphTcpStats { count: ls.flow_log_count, ..tcp })
        }
        _ => None,
    };

    let process_name = match &flow.process {
        Some(p) if !p.name.is_empty() => p.name.clone(),
        _ => "-".to_string(),
    };
    let ps = flow.process_stats.unwrap_or_default();
    let mut processes = GraphEndpointProcesses::new();
    processes.insert(
        format!("{}:{}:{}", source.name_aggr, dest.name_aggr, process_name),
        GraphEndpointProcess {
            name: process_name,
            source: source.name_aggr.clone(),
            destination: dest.name_aggr.clone(),
            min_num_names_per_flow: ps.min_num_names_per_flow,
            max_num_names_per_flow: ps.max_num_names_per_flow,
            min_num_ids_per_flow: ps.min_num_ids_per_flow,
            max_num_ids_per_flow: ps.max_num_ids_per_flow,
        },
    );

    Some((source, svc, dest, FlowStats { packets: Some(packets), connections, tcp, processes }))
}

/// Correlates a stream of raw L3 flow pages into one flow per source and destination group.
///
/// Records must arrive grouped by destination. Source and destination reported records for the same connection are
/// reconciled so that each flow carries allowed, denied-at-source and denied-at-dest statistics. Ports on endpoints
/// that are not part of a service are folded into an aggregated port summary.
///
/// Once more than `max_records` flows have been produced the result is returned early, flagged as truncated.
pub async fn reconcile_l3_flows<S>(
    pages: S,
    time_range: &TimeRange,
    flow_config: &FlowConfig,
    max_records: usize,
) -> Result<Fetched<Vec<L3Flow>>>
where
    S: Stream<Item = Result<Vec<RawL3Flow>>>,
{
    pin_mut!(pages);

    let mut flows: Vec<L3Flow> = Vec::new();
    let mut raw = 0usize;
    let mut truncated = false;
    let mut last_dest_group: Option<FlowEndpoint> = None;
    let mut collating: Option<DestinationGroupData> = None;

    'pages: while let Some(page) = pages.next().await {
        for record in page? {
            raw += 1;
            let Some((source, svc, dest, stats)) = convert_record(&record) else {
                debug!("Skipping L3 flow with unknown endpoint type: {:?}", record);
                continue;
            };
            let dest_group = dest.service_group_key();

            let group_changed = match (&dest_group, &last_dest_group) {
                (Some(current), Some(last)) => current != last,
                _ => true,
            };
            if group_changed {
                if let (Some(data), Some(last)) = (collating.take(), &last_dest_group) {
                    flows.extend(data.flows(last));
                }
            }

            let data = collating.get_or_insert_with(|| {
                debug!("Collating flows: {} -> {:?}", source, dest_group);
                DestinationGroupData::default()
            });
            debug!("- Processing {:?} reported flow: {} -> {}", record.reporter, source, dest);
            data.add(record.reporter, record.action, source, svc, &dest, stats);

            last_dest_group = dest_group;

            if flows.len() > max_records {
                truncated = true;
                break 'pages;
            }
        }
    }

    if !truncated {
        if let (Some(data), Some(last)) = (collating.take(), &last_dest_group) {
            flows.extend(data.flows(last));
        }
    }

    // Connection totals are summed across every flush in the window. Reduce them to a per-flush value.
    // Truncated results are normalised too.
    let window = time_range.duration().to_std().unwrap_or_default();
    if !flow_config.l3_flow_flush_interval.is_zero() && !window.is_zero() {
        let flushes = window.as_secs_f64() / flow_config.l3_flow_flush_interval.as_secs_f64();
        for flow in &mut flows {
            let total = flow.stats.connections.total_per_sample_interval as f64;
            flow.stats.connections.total_per_sample_interval = (total / flushes) as i64;
        }
    }

    debug!("L3 reconciliation processed {} raw records into {} flows (truncated={})", raw, flows.len(), truncated);
    Ok(Fetched { items: flows, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use futures::stream;

    fn window() -> TimeRange {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TimeRange::absolute(from, from + Duration::minutes(5))
    }

    fn record(reporter: Reporter, action: Action, src: &str, dst: &str, port: u16, packets: i64) -> RawL3Flow {
        RawL3Flow {
            reporter,
            action,
            protocol: "tcp".to_string(),
            source: RawEndpoint {
                endpoint_type: "wep".to_string(),
                namespace: "ns1".to_string(),
                aggregated_name: src.to_string(),
                port: 0,
            },
            destination: RawEndpoint {
                endpoint_type: "wep".to_string(),
                namespace: "ns1".to_string(),
                aggregated_name: dst.to_string(),
                port,
            },
            service: None,
            log_stats: Some(RawLogStats { log_count: 4, started: 1, completed: 1, flow_log_count: 1 }),
            traffic_stats: Some(RawTrafficStats {
                packets_in: packets,
                packets_out: packets,
                bytes_in: packets * 10,
                bytes_out: packets * 10,
            }),
            tcp_stats: None,
            process: None,
            process_stats: None,
        }
    }

    fn with_service(mut r: RawL3Flow, name: &str) -> RawL3Flow {
        r.service = Some(RawService {
            name: name.to_string(),
            namespace: "ns1".to_string(),
            port_name: "http".to_string(),
            port: 80,
        });
        r
    }

    async fn reconcile(records: Vec<RawL3Flow>, max: usize) -> Fetched<Vec<L3Flow>> {
        let pages = stream::iter(vec![Ok(records)]);
        reconcile_l3_flows(pages, &window(), &FlowConfig::default(), max).await.unwrap()
    }

    #[tokio::test]
    async fn test_allowed_plus_denied_at_dest_matches_source_allowed() {
        let records = vec![
            record(Reporter::Src, Action::Allow, "a-*", "b-*", 8080, 100),
            record(Reporter::Dst, Action::Allow, "a-*", "b-*", 8080, 30),
            record(Reporter::Dst, Action::Deny, "a-*", "b-*", 8080, 10),
        ];
        let result = reconcile(records, 100).await;
        assert!(!result.truncated);
        assert_eq!(result.items.len(), 1);

        let stats = &result.items[0].stats;
        let allowed = stats.allowed.unwrap();
        let denied = stats.denied_at_dest.unwrap();
        assert_eq!(allowed.packets_in + denied.packets_in, 100);
        assert_eq!(allowed.packets_in, 75);
        assert_eq!(allowed.bytes_out + denied.bytes_out, 1000);
        assert!(stats.denied_at_source.is_none());
    }

    #[tokio::test]
    async fn test_source_only_and_dest_only() {
        let result = reconcile(
            vec![
                record(Reporter::Src, Action::Allow, "a-*", "b-*", 80, 5),
                record(Reporter::Src, Action::Deny, "a-*", "b-*", 80, 2),
            ],
            100,
        )
        .await;
        let stats = &result.items[0].stats;
        assert_eq!(stats.allowed.unwrap().packets_in, 5);
        assert_eq!(stats.denied_at_source.unwrap().packets_in, 2);
        assert!(stats.denied_at_dest.is_none());
        let processes = result.items[0].processes.as_ref().unwrap();
        assert!(processes.source.contains_key("a-*:b-*:-"));
        assert!(processes.dest.is_empty());

        let result = reconcile(vec![record(Reporter::Dst, Action::Deny, "a-*", "b-*", 80, 3)], 100).await;
        let stats = &result.items[0].stats;
        assert!(stats.allowed.is_none());
        assert_eq!(stats.denied_at_dest.unwrap().packets_in, 3);
    }

    #[tokio::test]
    async fn test_non_service_ports_aggregated() {
        let records = vec![
            record(Reporter::Src, Action::Allow, "a-*", "b-*", 81, 1),
            record(Reporter::Src, Action::Allow, "a-*", "b-*", 80, 1),
            record(Reporter::Src, Action::Allow, "a-*", "b-*", 443, 1),
        ];
        let result = reconcile(records, 100).await;
        assert_eq!(result.items.len(), 1);
        let flow = &result.items[0];
        assert_eq!(flow.edge.dest.port, 0);
        assert!(flow.edge.service_port.is_none());
        let app = flow.aggregated_proto_ports.as_ref().unwrap();
        assert_eq!(app.proto_ports.len(), 1);
        assert_eq!(app.proto_ports[0].protocol, "tcp");
        assert_eq!(app.proto_ports[0].port_ranges.len(), 2);
        assert_eq!(flow.stats.allowed.unwrap().packets_in, 3);
    }

    #[tokio::test]
    async fn test_port_and_protocol_caps() {
        let mut records = Vec::new();
        // Seven separated ports: five listed, two counted.
        for port in [10u16, 20, 30, 40, 50, 60, 70] {
            records.push(record(Reporter::Src, Action::Allow, "a-*", "b-*", port, 1));
        }
        for i in 0..12 {
            let mut r = record(Reporter::Src, Action::Allow, "a-*", "b-*", 1000, 1);
            r.protocol = format!("proto{:02}", i);
            records.push(r);
        }
        let result = reconcile(records, 100).await;
        let app = result.items[0].aggregated_proto_ports.as_ref().unwrap();
        assert_eq!(app.proto_ports.len(), MAX_AGGREGATED_PROTOCOLS);
        assert_eq!(app.num_other_protocols, 3);

        let tcp = app.proto_ports.iter().find(|p| p.protocol == "tcp");
        // Protocols are ordered by name so "tcp" falls beyond the listed ten.
        assert!(tcp.is_none());

        let mut records = Vec::new();
        for port in [10u16, 20, 30, 40, 50, 60, 70] {
            records.push(record(Reporter::Src, Action::Allow, "a-*", "b-*", port, 1));
        }
        let result = reconcile(records, 100).await;
        let app = result.items[0].aggregated_proto_ports.as_ref().unwrap();
        assert_eq!(app.proto_ports[0].port_ranges.len(), MAX_AGGREGATED_PORT_RANGES_PER_PROTOCOL);
        assert_eq!(app.proto_ports[0].num_other_ports, 2);
    }

    #[tokio::test]
    async fn test_service_flows_kept_separate() {
        let records = vec![
            with_service(record(Reporter::Src, Action::Allow, "a-*", "b-*", 8080, 10), "svc1"),
            record(Reporter::Dst, Action::Allow, "a-*", "b-*", 8080, 10),
        ];
        let result = reconcile(records, 100).await;
        assert_eq!(result.items.len(), 1);
        let flow = &result.items[0];
        assert_eq!(flow.edge.service_port.as_ref().unwrap().service.name, "svc1");
        assert_eq!(flow.edge.dest.port, 8080);
        assert!(flow.aggregated_proto_ports.is_none());
        // The dest report has no service and is matched through the protocol bucket.
        assert_eq!(flow.stats.allowed.unwrap().packets_in, 10);
        assert!(flow.stats.denied_at_dest.is_none());
    }

    #[tokio::test]
    async fn test_truncation_and_connection_normalisation() {
        let mut records = Vec::new();
        for i in 0..10 {
            records.push(record(Reporter::Src, Action::Allow, "a-*", &format!("d{}-*", i), 80, 1));
        }
        let result = reconcile(records.clone(), 3).await;
        assert!(result.truncated);
        assert_eq!(result.items.len(), 4);

        let result = reconcile(records, 100).await;
        assert!(!result.truncated);
        assert_eq!(result.items.len(), 10);
        // A five minute window equals one flush interval so totals are unchanged.
        assert_eq!(result.items[0].stats.connections.total_per_sample_interval, 4);
    }

    #[tokio::test]
    async fn test_truncated_connections_are_normalised() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ten_minutes = TimeRange::absolute(from, from + Duration::minutes(10));
        let records: Vec<_> =
            (0..10).map(|i| record(Reporter::Src, Action::Allow, "a-*", &format!("d{}-*", i), 80, 1)).collect();

        let pages = stream::iter(vec![Ok(records)]);
        let result = reconcile_l3_flows(pages, &ten_minutes, &FlowConfig::default(), 3).await.unwrap();
        assert!(result.truncated);
        // Two flush intervals in the window halve the summed total.
        assert!(result.items.iter().all(|f| f.stats.connections.total_per_sample_interval == 2));
    }

    #[tokio::test]
    async fn test_page_error_propagates() {
        let pages = stream::iter(vec![
            Ok(vec![record(Reporter::Src, Action::Allow, "a-*", "b-*", 80, 1)]),
            Err(crate::errors::ServiceGraphError::backend("page 2 failed")),
        ]);
        let err = reconcile_l3_flows(pages, &window(), &FlowConfig::default(), 100).await.unwrap_err();
        assert_eq!(err, crate::errors::ServiceGraphError::backend("page 2 failed"));
    }
}
