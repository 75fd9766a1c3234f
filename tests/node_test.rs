use std::sync::{Arc, Once};

use infomesh::{Node, NodeConfig, NodeError};
use mesh_kernel::NetMeshBaseIdentifier;
use mesh_probe::{
    model::{self, source_role},
    FetchedContent, StaticFetcher,
};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

const XRDS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xrds:XRDS xmlns:xrds="xri://$xrds" xmlns="xri://$xrd*($v*2.0)">
  <XRD>
    <Service priority="10">
      <Type>http://openid.net/signon/1.0</Type>
      <URI>https://login.example.com/openid</URI>
    </Service>
  </XRD>
</xrds:XRDS>"#;

fn fetcher() -> Arc<StaticFetcher> {
    let fetcher = Arc::new(StaticFetcher::new());
    fetcher.insert(
        NetMeshBaseIdentifier::from_external_form("http://joe.example.com/").unwrap(),
        FetchedContent::new(Some("application/xrds+xml"), XRDS),
    );
    fetcher
}

#[tokio::test]
async fn test_node_probes_and_traverses() {
    init_test_logging();
    let config = NodeConfig::from_yaml("identifier: \"mesh://node.example.com\"").unwrap();
    let node = Node::start_with_fetcher(&config, fetcher()).unwrap();

    let home = node.access("joe.example.com").await.unwrap();
    assert_eq!(home.identifier().as_str(), "http://joe.example.com/");
    assert_eq!(node.probes().len(), 1);

    let services = node
        .traverse(home.identifier(), &source_role(model::OFFERS))
        .await
        .unwrap();
    assert_eq!(services.len(), 1);
    let endpoints = node
        .traverse(services[0].identifier(), &source_role(model::PROVIDED_AT))
        .await
        .unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(
        endpoints[0]
            .property(&mesh_kernel::TypeIdentifier::new(model::URI))
            .and_then(|v| v.as_str()),
        Some("https://login.example.com/openid")
    );

    assert!(node.sweep_once().is_some());
    node.shutdown();
    assert!(node.net().is_dead());
    assert!(node.probes().is_empty());
}

#[tokio::test]
async fn test_unreachable_source_is_reported() {
    init_test_logging();
    let config = NodeConfig::from_yaml("sweeper: { interval_ms: null }").unwrap();
    let node = Node::start_with_fetcher(&config, fetcher()).unwrap();
    assert!(node.sweep_once().is_none());

    let err = node.access("nobody.example.com").await.unwrap_err();
    assert!(matches!(err, NodeError::Net(_)));
    assert!(node.probes().is_empty());
    node.shutdown();
}

#[tokio::test]
async fn test_invalid_identifier_is_rejected() {
    let config = NodeConfig {
        identifier: "gopher://old.example.com".to_string(),
        ..NodeConfig::default()
    };
    let err = Node::start_with_fetcher(&config, fetcher()).err().unwrap();
    assert!(matches!(err, NodeError::Mesh(_)));
}
