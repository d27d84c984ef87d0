use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use service_graph::config::CacheConfig;
use service_graph::graph::{HostAggregationSelector, Layer};
use service_graph::servicegraph::snapshot::Snapshot;
use service_graph::{
    GraphNode, GraphView, ServiceGraph, ServiceGraphCache, ServiceGraphError, ServiceGraphRequest,
    ServiceGraphResponse, SnapshotBackend, TimeRange,
};

fn record(src_ns: &str, src: &str, dst_ns: &str, dst: &str) -> Value {
    json!({
        "reporter": "src",
        "action": "allow",
        "protocol": "tcp",
        "source": {"type": "wep", "namespace": src_ns, "aggregated_name": src},
        "destination": {"type": "wep", "namespace": dst_ns, "aggregated_name": dst, "port": 8080},
        "log_stats": {"log_count": 1, "flow_log_count": 1},
        "traffic_stats": {"packets_in": 10, "packets_out": 10, "bytes_in": 100, "bytes_out": 100}
    })
}

fn snapshot(records: Vec<Value>) -> Result<Snapshot> {
    Ok(serde_json::from_value(json!({ "l3_pages": [records] }))?)
}

fn service_graph(snapshot: Snapshot, max_records: usize) -> ServiceGraph {
    let backend = SnapshotBackend::new(snapshot, max_records);
    let cache = ServiceGraphCache::new(Arc::new(backend), CacheConfig::default(), CancellationToken::new());
    ServiceGraph::new(cache)
}

fn request(view: GraphView) -> Result<ServiceGraphRequest> {
    Ok(ServiceGraphRequest {
        cluster: "cluster".to_string(),
        time_range: TimeRange::parse("now-15m", "now", Utc::now())?,
        view,
        timeout: Duration::from_secs(60),
        force_refresh: false,
    })
}

async fn render(graph: &ServiceGraph, view: GraphView) -> Result<ServiceGraphResponse> {
    Ok(graph.get_service_graph(&request(view)?, &CancellationToken::new()).await?)
}

fn ids(resp: &ServiceGraphResponse) -> Vec<&str> {
    resp.nodes.iter().map(|n| n.id.as_str()).collect()
}

fn edges(resp: &ServiceGraphResponse) -> Vec<(&str, &str)> {
    resp.edges.iter().map(|e| (e.id.source_node_id.as_str(), e.id.dest_node_id.as_str())).collect()
}

fn node<'r>(resp: &'r ServiceGraphResponse, id: &str) -> &'r GraphNode {
    resp.nodes.iter().find(|n| n.id.as_str() == id).unwrap()
}

fn focus(id: &str) -> GraphView {
    GraphView { focus: vec![id.into()], ..Default::default() }
}

/// n1 -> n2 -> n3 -> n4, with n5 also sending to n3.
fn chain() -> Result<Snapshot> {
    snapshot(vec![
        record("n1", "a-*", "n2", "b-*"),
        record("n2", "b-*", "n3", "c-*"),
        record("n5", "e-*", "n3", "c-*"),
        record("n3", "c-*", "n4", "d-*"),
    ])
}

#[tokio::test]
async fn test_unfocused_view_includes_everything() -> Result<()> {
    let graph = service_graph(chain()?, 1000);
    let resp = render(&graph, GraphView::default()).await?;

    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n3", "namespace/n4", "namespace/n5"]);
    assert_eq!(resp.edges.len(), 4);
    assert!(!resp.truncated);
    assert!(resp.nodes.iter().all(|n| !n.follow_ingress && !n.follow_egress));
    Ok(())
}

#[tokio::test]
async fn test_focus_keeps_direct_neighbours() -> Result<()> {
    let graph = service_graph(chain()?, 1000);
    let resp = render(&graph, focus("namespace/n2")).await?;

    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n3"]);
    assert_eq!(edges(&resp), vec![("namespace/n1", "namespace/n2"), ("namespace/n2", "namespace/n3")]);
    let n3 = node(&resp, "namespace/n3");
    assert!(n3.follow_egress);
    assert!(n3.follow_ingress);
    assert!(!node(&resp, "namespace/n1").follow_ingress);
    Ok(())
}

#[tokio::test]
async fn test_connection_direction_follows_the_chain() -> Result<()> {
    let graph = service_graph(chain()?, 1000);
    let view = GraphView { follow_connection_direction: true, ..focus("namespace/n2") };
    let resp = render(&graph, view).await?;

    // n5 only feeds into the chain, it is not downstream of the focus.
    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n3", "namespace/n4"]);
    assert_eq!(
        edges(&resp),
        vec![
            ("namespace/n1", "namespace/n2"),
            ("namespace/n2", "namespace/n3"),
            ("namespace/n3", "namespace/n4"),
        ]
    );
    assert!(node(&resp, "namespace/n3").follow_ingress);
    Ok(())
}

/// A straight line n1 -> n2 -> n3 -> n4 -> n5.
fn straight_chain() -> Result<Snapshot> {
    snapshot(vec![
        record("n1", "a-*", "n2", "b-*"),
        record("n2", "b-*", "n3", "c-*"),
        record("n3", "c-*", "n4", "d-*"),
        record("n4", "d-*", "n5", "e-*"),
    ])
}

#[tokio::test]
async fn test_middle_of_chain_keeps_neighbours_and_marks_both_ends() -> Result<()> {
    let graph = service_graph(straight_chain()?, 1000);
    let resp = render(&graph, focus("namespace/n3")).await?;

    assert_eq!(ids(&resp), vec!["namespace/n2", "namespace/n3", "namespace/n4"]);
    assert_eq!(edges(&resp), vec![("namespace/n2", "namespace/n3"), ("namespace/n3", "namespace/n4")]);

    let upstream = node(&resp, "namespace/n2");
    assert!(upstream.follow_ingress);
    assert!(!upstream.follow_egress);
    let downstream = node(&resp, "namespace/n4");
    assert!(downstream.follow_egress);
    assert!(!downstream.follow_ingress);
    let focused = node(&resp, "namespace/n3");
    assert!(!focused.follow_ingress && !focused.follow_egress);
    Ok(())
}

#[tokio::test]
async fn test_connection_direction_reaches_both_chain_ends() -> Result<()> {
    let graph = service_graph(straight_chain()?, 1000);
    let view = GraphView { follow_connection_direction: true, ..focus("namespace/n3") };
    let resp = render(&graph, view).await?;

    // Two hops upstream and two hops downstream of the focus.
    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n3", "namespace/n4", "namespace/n5"]);
    assert_eq!(
        edges(&resp),
        vec![
            ("namespace/n1", "namespace/n2"),
            ("namespace/n2", "namespace/n3"),
            ("namespace/n3", "namespace/n4"),
            ("namespace/n4", "namespace/n5"),
        ]
    );
    assert!(resp.nodes.iter().all(|n| !n.follow_ingress && !n.follow_egress));
    Ok(())
}

#[tokio::test]
async fn test_followed_egress_extends_view() -> Result<()> {
    let graph = service_graph(chain()?, 1000);
    let view = GraphView { followed_egress: vec!["namespace/n3".into()], ..focus("namespace/n2") };
    let resp = render(&graph, view).await?;

    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n3", "namespace/n4"]);
    assert_eq!(resp.edges.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_diamond() -> Result<()> {
    let diamond = snapshot(vec![
        record("n1", "a-*", "n2", "b-*"),
        record("n1", "a-*", "n3", "c-*"),
        record("n2", "b-*", "n4", "d-*"),
        record("n3", "c-*", "n4", "d-*"),
    ])?;
    let graph = service_graph(diamond, 1000);

    let view = GraphView { follow_connection_direction: true, ..focus("namespace/n4") };
    let resp = render(&graph, view).await?;
    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n3", "namespace/n4"]);
    assert_eq!(resp.edges.len(), 4);

    let resp = render(&graph, focus("namespace/n2")).await?;
    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", "namespace/n4"]);
    assert_eq!(edges(&resp), vec![("namespace/n1", "namespace/n2"), ("namespace/n2", "namespace/n4")]);
    assert!(node(&resp, "namespace/n1").follow_egress);
    assert!(node(&resp, "namespace/n4").follow_ingress);
    Ok(())
}

#[tokio::test]
async fn test_outward_diamond_needs_explicit_follows() -> Result<()> {
    // a <- b -> c -> d <- e
    let diamond = snapshot(vec![
        record("b", "b-*", "a", "a-*"),
        record("b", "b-*", "c", "c-*"),
        record("c", "c-*", "d", "d-*"),
        record("e", "e-*", "d", "d-*"),
    ])?;
    let graph = service_graph(diamond, 1000);

    let resp = render(&graph, focus("namespace/c")).await?;
    assert_eq!(ids(&resp), vec!["namespace/b", "namespace/c", "namespace/d"]);
    assert!(node(&resp, "namespace/b").follow_egress);
    assert!(node(&resp, "namespace/d").follow_ingress);

    let view = GraphView { followed_egress: vec!["namespace/b".into()], ..focus("namespace/c") };
    let resp = render(&graph, view).await?;
    assert_eq!(ids(&resp), vec!["namespace/a", "namespace/b", "namespace/c", "namespace/d"]);

    let view = GraphView {
        followed_egress: vec!["namespace/b".into()],
        followed_ingress: vec!["namespace/d".into()],
        ..focus("namespace/c")
    };
    let resp = render(&graph, view).await?;
    assert_eq!(resp.nodes.len(), 5);
    assert_eq!(resp.edges.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_services_on_one_replica_set_form_one_group() -> Result<()> {
    let mut api = record("n1", "a-*", "n2", "b-*");
    api["service"] = json!({"name": "api", "namespace": "n2", "port_name": "http", "port": 80});
    let mut web = record("n1", "a-*", "n2", "b-*");
    web["destination"]["port"] = json!(8443);
    web["service"] = json!({"name": "web", "namespace": "n2", "port_name": "https", "port": 443});
    let graph = service_graph(snapshot(vec![api, web])?, 1000);

    let view = GraphView { expanded: vec!["namespace/n2".into()], ..Default::default() };
    let resp = render(&graph, view).await?;

    let group = "svcgp;svc/n2/api;svc/n2/web";
    assert_eq!(ids(&resp), vec!["namespace/n1", "namespace/n2", group]);
    assert_eq!(node(&resp, group).parent_id.as_ref().map(|p| p.as_str()), Some("namespace/n2"));
    assert_eq!(edges(&resp), vec![("namespace/n1", group)]);
    assert_eq!(resp.edges[0].service_ports.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_layer_and_host_groups() -> Result<()> {
    let mut from_host = record("", "node-1", "n2", "b-*");
    from_host["source"]["type"] = json!("hep");
    let mut from_other_host = record("", "node-2", "n2", "b-*");
    from_other_host["source"]["type"] = json!("hep");

    let mut snap = snapshot(vec![from_host, from_other_host, record("kube-system", "dns-*", "n2", "b-*")])?;
    snap.host_labels.insert("node-1".to_string(), [("role".to_string(), "infra".to_string())].into());
    snap.host_labels.insert("node-2".to_string(), [("role".to_string(), "worker".to_string())].into());
    let graph = service_graph(snap, 1000);

    let view = GraphView {
        layers: vec![Layer { name: "platform".to_string(), nodes: vec!["namespace/kube-system".into()] }],
        host_aggregation_selectors: vec![HostAggregationSelector {
            name: "infra".to_string(),
            selector: r#"role == "infra""#.to_string(),
        }],
        ..Default::default()
    };
    let resp = render(&graph, view).await?;

    assert_eq!(ids(&resp), vec!["hosts/*", "hosts/infra", "layer/platform", "namespace/n2"]);
    assert_eq!(resp.edges.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_truncated_data_is_flagged() -> Result<()> {
    let graph = service_graph(chain()?, 1);
    let resp = render(&graph, GraphView::default()).await?;
    assert!(resp.truncated);
    assert!(!resp.nodes.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_malformed_views_are_rejected_before_querying() -> Result<()> {
    let graph = service_graph(chain()?, 1000);

    let bad_views = [
        focus("bogus/a"),
        GraphView { expanded: vec!["svcport/tcp/http;svc/n1/a".into()], ..Default::default() },
        GraphView {
            layers: vec![Layer { name: "Not A Name".to_string(), nodes: Vec::new() }],
            ..Default::default()
        },
        GraphView {
            layers: vec![
                Layer { name: "dup".to_string(), nodes: Vec::new() },
                Layer { name: "dup".to_string(), nodes: Vec::new() },
            ],
            ..Default::default()
        },
        GraphView {
            layers: vec![Layer { name: "nested".to_string(), nodes: vec!["layer/other".into()] }],
            ..Default::default()
        },
        GraphView {
            host_aggregation_selectors: vec![
                HostAggregationSelector { name: "infra".to_string(), selector: "all()".to_string() },
                HostAggregationSelector { name: "infra".to_string(), selector: "all()".to_string() },
            ],
            ..Default::default()
        },
    ];

    for view in bad_views {
        let err = graph.get_service_graph(&request(view.clone())?, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.status_code(), 400, "view {:?} gave {}", view, err);
        assert!(matches!(err, ServiceGraphError::InvalidRequest { .. }));
    }
    assert_eq!(graph.cache().cache_size(), 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_time_range_is_rejected() {
    let err = TimeRange::parse("now-15m", "2024-01-01T00:00:00Z", Utc::now()).unwrap_err();
    assert_eq!(err.status_code(), 400);
    let err = TimeRange::parse("now", "now-1h", Utc::now()).unwrap_err();
    assert_eq!(err.status_code(), 400);
}
