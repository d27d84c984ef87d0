pub mod cache;
pub mod config;
pub mod errors;
pub mod flows;
pub mod graph;
pub mod servicegraph;

// Re-export commonly used types
pub use cache::{CacheKey, ServiceGraphCache};
pub use config::ServerConfig;
pub use errors::{ErrorResponse, Result, ServiceGraphError};
pub use flows::{FlowConfig, FlowEdge, FlowEndpoint, PortRangeSet};
pub use graph::{
    GraphEdge, GraphNode, GraphNodeId, GraphNodeType, GraphView, ServiceGraphRequest, ServiceGraphResponse, TimeRange,
};
pub use servicegraph::{
    get_service_graph_response, parse_graph_node_id, NameHelper, RbacFilter, ServiceGraph, ServiceGraphBackend,
    SnapshotBackend,
};
