pub mod backend;
pub mod constructor;
pub mod id;
pub mod selectors;
pub mod service_groups;
pub mod snapshot;
pub mod view;

use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{PopulatedData, ServiceGraphCache};
use crate::errors::Result;
use crate::flows::{Event, FlowEdge, FlowEndpoint, LabelMap};
use crate::graph::{AggregatedProtoPorts, GraphStats, ServiceGraphRequest, ServiceGraphResponse, TimeRange};

pub use backend::{
    NameHelper, RbacFilter, RbacFilterIncludeAll, RbacFilterIncludeNone, ServiceGraphBackend, StaticNameHelper,
};
pub use constructor::get_service_graph_response;
pub use id::{get_normalized_ids, parse_graph_node_id, Direction, IdInfo};
pub use service_groups::{ServiceGroup, ServiceGroupLookup, ServiceGroups, ServiceGroupsBuilder};
pub use snapshot::SnapshotBackend;
pub use view::{parse_view, validate_view, ParsedView};

/// A filtered flow with its stats, one entry per time interval.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesFlow {
    pub edge: FlowEdge,
    pub aggregated_proto_ports: Option<AggregatedProtoPorts>,
    pub stats: Vec<GraphStats>,
}

impl fmt::Display for TimeSeriesFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flow {}", self.edge)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesDns {
    pub endpoint: FlowEndpoint,
    pub stats: Vec<GraphStats>,
}

/// Graph input data visible to one user.
pub struct ServiceGraphData {
    pub time_intervals: Vec<TimeRange>,
    pub filtered_flows: Vec<TimeSeriesFlow>,
    pub filtered_dns_client_logs: Vec<TimeSeriesDns>,
    /// Events are not filtered by endpoint. They only show up on nodes that survive filtering.
    pub events: Vec<Event>,
    pub service_groups: ServiceGroups,
    pub name_helper: Arc<dyn NameHelper>,
    pub service_labels: LabelMap,
    pub resource_labels: LabelMap,
    pub truncated: bool,
}

impl ServiceGraphData {
    /// Applies the user's permissions and host naming to cached raw data and computes the service groups from the
    /// remaining flows.
    pub fn filter(
        raw: &PopulatedData,
        time_range: TimeRange,
        rbac: &dyn RbacFilter,
        name_helper: Arc<dyn NameHelper>,
    ) -> Self {
        let mut builder = ServiceGroups::builder();
        let mut filtered_flows = Vec::new();

        for flow in raw.l3.iter().filter(|f| rbac.include_flow(&f.edge)) {
            let flow = name_helper.convert_l3_flow(flow.clone());
            if let Some(sp) = &flow.edge.service_port {
                builder.add_mapping(sp, &flow.edge.dest);
            }
            filtered_flows.push(TimeSeriesFlow {
                edge: flow.edge,
                aggregated_proto_ports: flow.aggregated_proto_ports,
                stats: vec![GraphStats { l3: Some(flow.stats), processes: flow.processes, ..Default::default() }],
            });
        }

        if rbac.include_l7_logs() {
            for flow in raw.l7.iter().filter(|f| rbac.include_flow(&f.edge)) {
                let flow = name_helper.convert_l7_flow(flow.clone());
                if let Some(sp) = &flow.edge.service_port {
                    builder.add_mapping(sp, &flow.edge.dest);
                }
                filtered_flows.push(TimeSeriesFlow {
                    edge: flow.edge,
                    aggregated_proto_ports: None,
                    stats: vec![GraphStats { l7: Some(flow.stats), ..Default::default() }],
                });
            }
        }

        let service_groups = builder.finish();

        let filtered_dns_client_logs = if rbac.include_dns_logs() {
            raw.dns
                .iter()
                .filter(|dl| rbac.include_endpoint(&dl.endpoint))
                .map(|dl| TimeSeriesDns {
                    endpoint: dl.endpoint.clone(),
                    stats: vec![GraphStats { dns: Some(dl.stats.clone()), ..Default::default() }],
                })
                .collect()
        } else {
            Vec::new()
        };

        let events = if rbac.include_alerts() {
            raw.events.iter().map(|ev| name_helper.convert_event(ev.clone())).collect()
        } else {
            Vec::new()
        };

        Self {
            time_intervals: vec![time_range],
            filtered_flows,
            filtered_dns_client_logs,
            events,
            service_groups,
            name_helper,
            service_labels: raw.service_labels.clone(),
            resource_labels: raw.resource_labels.clone(),
            truncated: raw.truncated(),
        }
    }
}

/// Serves service graph requests from the cache.
pub struct ServiceGraph {
    cache: ServiceGraphCache,
}

impl ServiceGraph {
    pub fn new(cache: ServiceGraphCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &ServiceGraphCache {
        &self.cache
    }

    /// Validates the view, then builds the graph for the requested window.
    ///
    /// Malformed views are rejected before the cache or backend are touched.
    pub async fn get_service_graph(
        &self,
        request: &ServiceGraphRequest,
        cancel: &CancellationToken,
    ) -> Result<ServiceGraphResponse> {
        let start = Instant::now();
        validate_view(&request.view)?;

        let data = self.cache.get_filtered_service_graph_data(request, cancel).await?;
        let view = parse_view(&request.view, &data.service_groups)?;
        debug!(
            "Building graph from {} flows, {} DNS logs and {} events",
            data.filtered_flows.len(),
            data.filtered_dns_client_logs.len(),
            data.events.len()
        );
        let response = get_service_graph_response(&data, &view);

        info!(
            "Service graph for {} built in {:?}: {} nodes, {} edges{}",
            request.cluster,
            start.elapsed(),
            response.nodes.len(),
            response.edges.len(),
            if response.truncated { " (truncated)" } else { "" }
        );
        Ok(response)
    }
}
