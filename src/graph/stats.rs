use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Merges two optional values, combining them when both are present.
pub(crate) fn merge_option<T>(a: Option<T>, b: Option<T>, combine: impl FnOnce(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(combine(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn weighted_mean(mean_a: f64, count_a: i64, mean_b: f64, count_b: i64) -> f64 {
    let total = count_a + count_b;
    if total == 0 {
        return 0.0;
    }
    (mean_a * count_a as f64 + mean_b * count_b as f64) / total as f64
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Per-interval statistics for a node or an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3: Option<GraphL3Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l7: Option<GraphL7Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<GraphDnsStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<GraphProcesses>,
}

impl GraphStats {
    pub fn combine(self, other: GraphStats) -> GraphStats {
        GraphStats {
            l3: merge_option(self.l3, other.l3, GraphL3Stats::combine),
            l7: merge_option(self.l7, other.l7, GraphL7Stats::combine),
            dns: merge_option(self.dns, other.dns, GraphDnsStats::combine),
            processes: merge_option(self.processes, other.processes, GraphProcesses::combine),
        }
    }
}

/// Combines two per-interval stats slices index by index, extending to the longer of the two.
pub fn combine_stats_slices(existing: &mut Vec<GraphStats>, other: &[GraphStats]) {
    for (idx, stats) in other.iter().enumerate() {
        if idx < existing.len() {
            let current = std::mem::take(&mut existing[idx]);
            existing[idx] = current.combine(stats.clone());
        } else {
            existing.push(stats.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPacketStats {
    #[serde(default)]
    pub packets_in: i64,
    #[serde(default)]
    pub packets_out: i64,
    #[serde(default)]
    pub bytes_in: i64,
    #[serde(default)]
    pub bytes_out: i64,
}

/// Field by field fraction of traffic considered allowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketProportion {
    pub packets_in: f64,
    pub packets_out: f64,
    pub bytes_in: f64,
    pub bytes_out: f64,
}

impl GraphPacketStats {
    pub fn add(self, other: GraphPacketStats) -> GraphPacketStats {
        GraphPacketStats {
            packets_in: self.packets_in + other.packets_in,
            packets_out: self.packets_out + other.packets_out,
            bytes_in: self.bytes_in + other.bytes_in,
            bytes_out: self.bytes_out + other.bytes_out,
        }
    }

    pub fn sub(self, other: GraphPacketStats) -> GraphPacketStats {
        GraphPacketStats {
            packets_in: self.packets_in - other.packets_in,
            packets_out: self.packets_out - other.packets_out,
            bytes_in: self.bytes_in - other.bytes_in,
            bytes_out: self.bytes_out - other.bytes_out,
        }
    }

    /// Proportion of `self` (allowed) against `denied`. A field with no traffic on either side counts as allowed.
    pub fn prop(&self, denied: &GraphPacketStats) -> PacketProportion {
        fn fraction(allowed: i64, denied: i64) -> f64 {
            let total = allowed + denied;
            if total == 0 {
                1.0
            } else {
                allowed as f64 / total as f64
            }
        }
        PacketProportion {
            packets_in: fraction(self.packets_in, denied.packets_in),
            packets_out: fraction(self.packets_out, denied.packets_out),
            bytes_in: fraction(self.bytes_in, denied.bytes_in),
            bytes_out: fraction(self.bytes_out, denied.bytes_out),
        }
    }

    pub fn multiply(&self, p: &PacketProportion) -> GraphPacketStats {
        fn scale(v: i64, f: f64) -> i64 {
            (v as f64 * f).round() as i64
        }
        GraphPacketStats {
            packets_in: scale(self.packets_in, p.packets_in),
            packets_out: scale(self.packets_out, p.packets_out),
            bytes_in: scale(self.bytes_in, p.bytes_in),
            bytes_out: scale(self.bytes_out, p.bytes_out),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConnectionStats {
    #[serde(default)]
    pub total_per_sample_interval: i64,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub completed: i64,
}

impl GraphConnectionStats {
    pub fn add(self, other: GraphConnectionStats) -> GraphConnectionStats {
        GraphConnectionStats {
            total_per_sample_interval: self.total_per_sample_interval + other.total_per_sample_interval,
            started: self.started + other.started,
            completed: self.completed + other.completed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphTcpStats {
    #[serde(default)]
    pub sum_total_retransmissions: i64,
    #[serde(default)]
    pub sum_lost_packets: i64,
    #[serde(default)]
    pub sum_unrecovered_to: i64,
    #[serde(default)]
    pub min_send_congestion_window: i64,
    #[serde(default)]
    pub min_send_mss: i64,
    #[serde(default)]
    pub max_smooth_rtt: i64,
    #[serde(default)]
    pub max_min_rtt: i64,
    #[serde(default)]
    pub mean_send_congestion_window: f64,
    #[serde(default)]
    pub mean_smooth_rtt: f64,
    #[serde(default)]
    pub mean_min_rtt: f64,
    #[serde(default)]
    pub mean_mss: f64,
    #[serde(default)]
    pub count: i64,
}

impl GraphTcpStats {
    pub fn combine(self, other: GraphTcpStats) -> GraphTcpStats {
        let (a, b) = (self, other);
        GraphTcpStats {
            sum_total_retransmissions: a.sum_total_retransmissions + b.sum_total_retransmissions,
            sum_lost_packets: a.sum_lost_packets + b.sum_lost_packets,
            sum_unrecovered_to: a.sum_unrecovered_to + b.sum_unrecovered_to,
            min_send_congestion_window: a.min_send_congestion_window.min(b.min_send_congestion_window),
            min_send_mss: a.min_send_mss.min(b.min_send_mss),
            max_smooth_rtt: a.max_smooth_rtt.max(b.max_smooth_rtt),
            max_min_rtt: a.max_min_rtt.max(b.max_min_rtt),
            mean_send_congestion_window: weighted_mean(
                a.mean_send_congestion_window,
                a.count,
                b.mean_send_congestion_window,
                b.count,
            ),
            mean_smooth_rtt: weighted_mean(a.mean_smooth_rtt, a.count, b.mean_smooth_rtt, b.count),
            mean_min_rtt: weighted_mean(a.mean_min_rtt, a.count, b.mean_min_rtt, b.count),
            mean_mss: weighted_mean(a.mean_mss, a.count, b.mean_mss, b.count),
            count: a.count + b.count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphL3Stats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<GraphPacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_at_source: Option<GraphPacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_at_dest: Option<GraphPacketStats>,
    #[serde(default)]
    pub connections: GraphConnectionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<GraphTcpStats>,
}

impl GraphL3Stats {
    pub fn combine(self, other: GraphL3Stats) -> GraphL3Stats {
        GraphL3Stats {
            allowed: merge_option(self.allowed, other.allowed, GraphPacketStats::add),
            denied_at_source: merge_option(self.denied_at_source, other.denied_at_source, GraphPacketStats::add),
            denied_at_dest: merge_option(self.denied_at_dest, other.denied_at_dest, GraphPacketStats::add),
            connections: self.connections.add(other.connections),
            tcp: merge_option(self.tcp, other.tcp, GraphTcpStats::combine),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphL7PacketStats {
    #[serde(default)]
    pub bytes_in: i64,
    #[serde(default)]
    pub bytes_out: i64,
    #[serde(default)]
    pub mean_duration: f64,
    #[serde(default)]
    pub min_duration: i64,
    #[serde(default)]
    pub max_duration: i64,
    #[serde(default)]
    pub count: i64,
}

impl GraphL7PacketStats {
    pub fn combine(self, other: GraphL7PacketStats) -> GraphL7PacketStats {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }
        GraphL7PacketStats {
            bytes_in: self.bytes_in + other.bytes_in,
            bytes_out: self.bytes_out + other.bytes_out,
            mean_duration: weighted_mean(self.mean_duration, self.count, other.mean_duration, other.count),
            min_duration: self.min_duration.min(other.min_duration),
            max_duration: self.max_duration.max(other.max_duration),
            count: self.count + other.count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphL7Stats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_response: Option<GraphL7PacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code_1xx: Option<GraphL7PacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code_2xx: Option<GraphL7PacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code_3xx: Option<GraphL7PacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code_4xx: Option<GraphL7PacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code_5xx: Option<GraphL7PacketStats>,
}

impl GraphL7Stats {
    pub fn combine(self, other: GraphL7Stats) -> GraphL7Stats {
        GraphL7Stats {
            no_response: merge_option(self.no_response, other.no_response, GraphL7PacketStats::combine),
            response_code_1xx: merge_option(self.response_code_1xx, other.response_code_1xx, GraphL7PacketStats::combine),
            response_code_2xx: merge_option(self.response_code_2xx, other.response_code_2xx, GraphL7PacketStats::combine),
            response_code_3xx: merge_option(self.response_code_3xx, other.response_code_3xx, GraphL7PacketStats::combine),
            response_code_4xx: merge_option(self.response_code_4xx, other.response_code_4xx, GraphL7PacketStats::combine),
            response_code_5xx: merge_option(self.response_code_5xx, other.response_code_5xx, GraphL7PacketStats::combine),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphLatencyStats {
    #[serde(default)]
    pub mean_request_latency: f64,
    #[serde(default)]
    pub max_request_latency: i64,
    #[serde(default)]
    pub min_request_latency: i64,
    #[serde(default)]
    pub latency_count: i64,
}

impl GraphLatencyStats {
    pub fn combine(self, other: GraphLatencyStats) -> GraphLatencyStats {
        if self.latency_count == 0 {
            return other;
        }
        if other.latency_count == 0 {
            return self;
        }
        GraphLatencyStats {
            mean_request_latency: weighted_mean(
                self.mean_request_latency,
                self.latency_count,
                other.mean_request_latency,
                other.latency_count,
            ),
            max_request_latency: self.max_request_latency.max(other.max_request_latency),
            min_request_latency: self.min_request_latency.min(other.min_request_latency),
            latency_count: self.latency_count + other.latency_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDnsResponseCode {
    pub code: String,
    #[serde(default)]
    pub count: i64,
    #[serde(flatten)]
    pub latency: GraphLatencyStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDnsStats {
    #[serde(flatten)]
    pub latency: GraphLatencyStats,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_codes: BTreeMap<String, GraphDnsResponseCode>,
}

impl GraphDnsStats {
    pub fn combine(self, other: GraphDnsStats) -> GraphDnsStats {
        let mut response_codes = self.response_codes;
        for (code, rc) in other.response_codes {
            match response_codes.remove(&code) {
                Some(existing) => {
                    response_codes.insert(
                        code,
                        GraphDnsResponseCode {
                            code: existing.code,
                            count: existing.count + rc.count,
                            latency: existing.latency.combine(rc.latency),
                        },
                    );
                }
                None => {
                    response_codes.insert(code, rc);
                }
            }
        }
        GraphDnsStats {
            latency: self.latency.combine(other.latency),
            response_codes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEndpointProcess {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub min_num_names_per_flow: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_num_names_per_flow: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub min_num_ids_per_flow: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_num_ids_per_flow: i64,
}

impl GraphEndpointProcess {
    pub fn combine(self, other: GraphEndpointProcess) -> GraphEndpointProcess {
        GraphEndpointProcess {
            name: self.name,
            source: self.source,
            destination: self.destination,
            min_num_names_per_flow: self.min_num_names_per_flow.min(other.min_num_names_per_flow),
            max_num_names_per_flow: self.max_num_names_per_flow.max(other.max_num_names_per_flow),
            min_num_ids_per_flow: self.min_num_ids_per_flow.min(other.min_num_ids_per_flow),
            max_num_ids_per_flow: self.max_num_ids_per_flow.max(other.max_num_ids_per_flow),
        }
    }
}

/// Processes keyed by `source:destination:name`.
pub type GraphEndpointProcesses = BTreeMap<String, GraphEndpointProcess>;

pub fn combine_endpoint_processes(
    mut a: GraphEndpointProcesses,
    b: GraphEndpointProcesses,
) -> GraphEndpointProcesses {
    for (key, process) in b {
        let merged = match a.remove(&key) {
            Some(existing) => existing.combine(process),
            None => process,
        };
        a.insert(key, merged);
    }
    a
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphProcesses {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source: GraphEndpointProcesses,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dest: GraphEndpointProcesses,
}

impl GraphProcesses {
    pub fn combine(self, other: GraphProcesses) -> GraphProcesses {
        GraphProcesses {
            source: combine_endpoint_processes(self.source, other.source),
            dest: combine_endpoint_processes(self.dest, other.dest),
        }
    }
}
