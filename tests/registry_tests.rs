//! # Registry and Discovery Integration Tests
//!
//! Concurrent use of the registry through the discovery façade, and startup
//! assembly from a configuration file.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use futures::StreamExt;
use service_gateway::discovery::RegistryEvent;
use service_gateway::storage::MemoryStore;
use service_gateway::{Discovery, Gateway, GatewayConfig, GatewayError, InstanceRegistration, ServiceRegistry, StrategyKind};

fn registry_with(service: &str, count: usize) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new());
    for n in 0..count {
        registry
            .register(
                service,
                InstanceRegistration::new(format!("{}-{}", service, n), format!("http://localhost:{}", 8200 + n)),
            )
            .unwrap();
    }
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_and_resolution() {
    let registry = Arc::new(ServiceRegistry::new());
    let discovery = Discovery::new(registry.clone());

    let writers: Vec<_> = (0..20)
        .map(|n| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.register(
                    "user-service",
                    InstanceRegistration::new(format!("u{}", n), format!("http://localhost:{}", 9000 + n)),
                )
            })
        })
        .collect();

    let readers: Vec<_> = (0..20)
        .map(|_| {
            let discovery = discovery.clone();
            tokio::spawn(async move {
                match discovery.resolve("user-service", StrategyKind::RoundRobin) {
                    Ok(instance) => assert!(instance.id.starts_with('u')),
                    Err(GatewayError::UnknownService { .. }) | Err(GatewayError::NoHealthyInstance { .. }) => {}
                    Err(other) => panic!("unexpected error: {}", other),
                }
            })
        })
        .collect();

    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }

    let ids: HashSet<String> = registry.list("user-service").into_iter().map(|i| i.id).collect();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn test_round_robin_covers_every_instance_under_load() {
    let discovery = Discovery::new(registry_with("user-service", 3));

    let mut counts = std::collections::HashMap::new();
    for _ in 0..300 {
        let instance = discovery.resolve("user-service", StrategyKind::RoundRobin).unwrap();
        *counts.entry(instance.id).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 100));
}

#[tokio::test]
async fn test_least_connections_spreads_open_leases() {
    let discovery = Discovery::new(registry_with("user-service", 3));

    let leases: Vec<_> = (0..6)
        .map(|_| discovery.checkout("user-service", StrategyKind::LeastConnections).unwrap())
        .collect();

    let in_flight: Vec<u64> = discovery
        .registry()
        .list("user-service")
        .iter()
        .map(|i| i.connections)
        .collect();
    assert_eq!(in_flight, vec![2, 2, 2]);

    drop(leases);
    assert!(discovery
        .registry()
        .list("user-service")
        .iter()
        .all(|i| i.connections == 0));
}

#[tokio::test]
async fn test_leases_released_when_task_is_cancelled() {
    let discovery = Discovery::new(registry_with("user-service", 1));

    let held = discovery.clone();
    let task = tokio::spawn(async move {
        let _lease = held.checkout("user-service", StrategyKind::FirstHealthy).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(discovery.registry().list("user-service")[0].connections, 1);

    task.abort();
    let _ = task.await;
    assert_eq!(discovery.registry().list("user-service")[0].connections, 0);
}

#[tokio::test]
async fn test_event_stream_sees_registry_changes() {
    let config = GatewayConfig::default();
    let gateway = Gateway::build(config, Arc::new(MemoryStore::new())).unwrap();
    let subscription = gateway.events().subscribe();
    let cancel = subscription.cancel_handle();
    let mut stream = Box::pin(subscription.into_stream());

    let registry = gateway.registry();
    registry
        .register("user-service", InstanceRegistration::new("u1", "http://localhost:8201"))
        .unwrap();
    registry
        .register("user-service", InstanceRegistration::new("u1", "http://localhost:8202"))
        .unwrap();

    match stream.next().await {
        Some(RegistryEvent::Registered { service, instance }) => {
            assert_eq!(service, "user-service");
            assert_eq!(instance.url, "http://localhost:8201");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match stream.next().await {
        Some(RegistryEvent::Updated { instance, .. }) => assert_eq!(instance.url, "http://localhost:8202"),
        other => panic!("unexpected event: {:?}", other),
    }

    cancel.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_gateway_seeds_registry_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(
        &path,
        r#"
routes:
  - prefix: /api/users
    service: user-service
    limit_class: api-users
discovery:
  default_strategy: least-connections
  seed:
    user-service:
      - id: user-service-1
        url: http://localhost:8201
      - id: user-service-2
        url: http://localhost:8202
        weight: 3
    auth-service:
      - id: auth-service-1
        url: http://localhost:8301
"#,
    )
    .unwrap();

    let config = GatewayConfig::load(&path).await.unwrap();
    let gateway = Gateway::build(config, Arc::new(MemoryStore::new())).unwrap();

    let stats = gateway.registry().stats();
    assert_eq!(stats.total_services, 2);
    assert_eq!(stats.total_instances, 3);
    assert_eq!(gateway.registry().list("user-service")[1].weight, 3);
    assert_eq!(
        gateway.discovery().strategy_for("user-service", None),
        StrategyKind::LeastConnections
    );
}

#[tokio::test]
async fn test_invalid_seed_fails_startup() {
    let mut config = GatewayConfig::default();
    config.discovery.seed.insert(
        "user-service".to_string(),
        vec![InstanceRegistration::new("u1", "not a url")],
    );
    assert!(Gateway::build(config, Arc::new(MemoryStore::new())).is_err());
}
