use crate::graph::PortRange;

/// Sorted, non-overlapping, non-touching set of port ranges built up one port at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRangeSet {
    ranges: Vec<PortRange>,
}

impl PortRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, port: u16) {
        let p = u32::from(port);

        // First range that either contains the port or ends immediately before it.
        let idx = self.ranges.partition_point(|r| u32::from(r.max_port) + 1 < p);

        if let Some(r) = self.ranges.get_mut(idx) {
            if r.min_port <= port && port <= r.max_port {
                return;
            }
            if u32::from(r.max_port) + 1 == p {
                r.max_port = port;
                let merge_next = matches!(self.ranges.get(idx + 1), Some(next) if u32::from(next.min_port) == p + 1);
                if merge_next {
                    let next = self.ranges.remove(idx + 1);
                    self.ranges[idx].max_port = next.max_port;
                }
                return;
            }
            if p + 1 == u32::from(r.min_port) {
                r.min_port = port;
                return;
            }
        }

        self.ranges.insert(idx, PortRange::single(port));
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
