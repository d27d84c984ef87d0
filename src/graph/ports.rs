use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_zero(v: &u32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub min_port: u16,
    pub max_port: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { min_port: port, max_port: port }
    }

    /// Number of ports covered by the range.
    pub fn num(&self) -> u32 {
        u32::from(self.max_port) - u32::from(self.min_port) + 1
    }
}

/// Sorts and merges overlapping or touching ranges.
pub fn merge_port_ranges(mut ranges: Vec<PortRange>) -> Vec<PortRange> {
    ranges.sort();
    let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if u32::from(r.min_port) <= u32::from(last.max_port) + 1 => {
                last.max_port = last.max_port.max(r.max_port);
            }
            _ => merged.push(r),
        }
    }
    merged
}

fn count_ports(ranges: &[PortRange]) -> u32 {
    ranges.iter().map(PortRange::num).sum()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedPorts {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_ranges: Vec<PortRange>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num_other_ports: u32,
}

impl AggregatedPorts {
    fn combine(&self, other: &AggregatedPorts) -> AggregatedPorts {
        let mut all = self.port_ranges.clone();
        all.extend(other.port_ranges.iter().copied());
        let port_ranges = merge_port_ranges(all);
        let merged_count = count_ports(&port_ranges);

        // Each side's "other" count shrinks by the ports the other side now covers explicitly.
        let remaining = |ap: &AggregatedPorts| {
            let newly_covered = merged_count.saturating_sub(count_ports(&ap.port_ranges));
            ap.num_other_ports.saturating_sub(newly_covered)
        };

        AggregatedPorts {
            protocol: self.protocol.clone(),
            port_ranges,
            num_other_ports: remaining(self).max(remaining(other)),
        }
    }
}

/// Ports and protocols observed on an endpoint that are not associated with a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedProtoPorts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proto_ports: Vec<AggregatedPorts>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num_other_protocols: u32,
}

impl AggregatedProtoPorts {
    pub fn single(protocol: &str, port: u16) -> Self {
        Self {
            proto_ports: vec![AggregatedPorts {
                protocol: protocol.to_string(),
                port_ranges: vec![PortRange::single(port)],
                num_other_ports: 0,
            }],
            num_other_protocols: 0,
        }
    }

    /// Merges `other` into `self`. Protocols are unioned and sorted, port ranges merged, and the "other" counters
    /// reduced by whatever the other side now reports explicitly.
    pub fn combine(&mut self, other: &AggregatedProtoPorts) {
        let mut by_protocol: BTreeMap<String, AggregatedPorts> = BTreeMap::new();
        for ap in &self.proto_ports {
            by_protocol.insert(ap.protocol.clone(), ap.clone());
        }
        for ap in &other.proto_ports {
            let merged = match by_protocol.get(&ap.protocol) {
                Some(existing) => existing.combine(ap),
                None => ap.clone(),
            };
            by_protocol.insert(ap.protocol.clone(), merged);
        }

        let total = by_protocol.len() as u32;
        let remaining = |app: &AggregatedProtoPorts| {
            let newly_covered = total.saturating_sub(app.proto_ports.len() as u32);
            app.num_other_protocols.saturating_sub(newly_covered)
        };
        let num_other_protocols = remaining(self).max(remaining(other));

        self.proto_ports = by_protocol.into_values().collect();
        self.num_other_protocols = num_other_protocols;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(rs: &[(u16, u16)]) -> Vec<PortRange> {
        rs.iter().map(|&(min_port, max_port)| PortRange { min_port, max_port }).collect()
    }

    fn tcp(rs: &[(u16, u16)], other: u32) -> AggregatedPorts {
        AggregatedPorts { protocol: "tcp".into(), port_ranges: ranges(rs), num_other_ports: other }
    }

    #[test]
    fn test_merge_overlapping_and_disjoint_ranges() {
        let mut a = AggregatedProtoPorts { proto_ports: vec![tcp(&[(1, 20), (30, 39)], 0)], num_other_protocols: 0 };
        let b = AggregatedProtoPorts { proto_ports: vec![tcp(&[(16, 25), (50, 59)], 1000)], num_other_protocols: 0 };

        a.combine(&b);

        assert_eq!(a.proto_ports.len(), 1);
        assert_eq!(a.proto_ports[0].port_ranges, ranges(&[(1, 25), (30, 39), (50, 59)]));
        assert_eq!(a.proto_ports[0].num_other_ports, 975);
    }

    #[test]
    fn test_merge_other_protocols() {
        let proto = |p: &str| AggregatedPorts { protocol: p.into(), port_ranges: ranges(&[(1, 1)]), num_other_ports: 0 };

        let mut a = AggregatedProtoPorts { proto_ports: vec![proto("tcp")], num_other_protocols: 0 };
        a.combine(&AggregatedProtoPorts { proto_ports: vec![proto("tcp")], num_other_protocols: 1 });
        assert_eq!(a.num_other_protocols, 1);

        let mut a = AggregatedProtoPorts { proto_ports: vec![proto("tcp")], num_other_protocols: 1 };
        a.combine(&AggregatedProtoPorts { proto_ports: vec![proto("udp"), proto("sctp")], num_other_protocols: 2 });
        assert_eq!(a.num_other_protocols, 1);
        let protocols: Vec<_> = a.proto_ports.iter().map(|p| p.protocol.as_str()).collect();
        assert_eq!(protocols, vec!["sctp", "tcp", "udp"]);
    }

    #[test]
    fn test_touching_ranges_merge() {
        assert_eq!(merge_port_ranges(ranges(&[(5, 6), (1, 4), (8, 9)])), ranges(&[(1, 6), (8, 9)]));
        assert_eq!(merge_port_ranges(ranges(&[(65535, 65535), (65534, 65534)])), ranges(&[(65534, 65535)]));
    }

    #[test]
    fn test_json_omits_zero_counts() {
        let app = AggregatedProtoPorts { proto_ports: vec![tcp(&[(80, 80)], 0)], num_other_protocols: 1 };
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "proto_ports": [{"protocol": "tcp", "port_ranges": [{"min_port": 80, "max_port": 80}]}],
                "num_other_protocols": 1
            })
        );
    }
}
