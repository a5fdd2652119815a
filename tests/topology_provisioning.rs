mod common;

use std::sync::Arc;
use std::time::Duration;

use amqp_helper::error::{ProvisionError, ResourceFailure, ResourceKind};
use amqp_helper::topology::{ProvisioningStore, TopologyProvisioner};
use amqp_helper::transport::memory::{BrokerOp, MemoryBroker, MemoryConnector};
use amqp_helper::transport::{Delivery, ExchangeKind};
use amqp_helper::{AmqpHelper, Config, ExchangeDefinition, QueueDefinition, SessionState};

use common::init_logging;

fn hello_topology() -> Vec<ExchangeDefinition> {
    vec![ExchangeDefinition::topic("hello")
        .with_queue(QueueDefinition::new("helloQ").bound_to("hello.*"))]
}

fn provisioner(broker: &Arc<MemoryBroker>) -> TopologyProvisioner {
    TopologyProvisioner::new(broker.clone(), Arc::new(ProvisioningStore::new()))
}

fn declares(broker: &MemoryBroker, name: &str) -> usize {
    broker.count_ops(|op| match op {
        BrokerOp::DeclareExchange { name: n, .. } | BrokerOp::DeclareQueue { name: n } => n == name,
        _ => false,
    })
}

#[tokio::test]
async fn hello_topology_is_declared_and_bound() {
    init_logging();
    let broker = MemoryBroker::new();
    let provisioner = provisioner(&broker);

    provisioner.provision(&hello_topology()).await.unwrap();

    assert_eq!(
        broker.operations(),
        vec![
            BrokerOp::DeclareExchange {
                name: "hello".into(),
                kind: ExchangeKind::Topic,
            },
            BrokerOp::DeclareQueue {
                name: "helloQ".into(),
            },
            BrokerOp::Bind {
                queue: "helloQ".into(),
                exchange: "hello".into(),
                key: "hello.*".into(),
            },
        ]
    );
    assert_eq!(broker.bindings("hello", "helloQ"), vec!["hello.*"]);
    assert_eq!(provisioner.store().declared_exchanges(), vec!["hello"]);
    assert_eq!(provisioner.store().declared_queues(), vec!["helloQ"]);
}

#[tokio::test]
async fn repeated_provisioning_is_a_no_op() {
    init_logging();
    let broker = MemoryBroker::new();
    let provisioner = provisioner(&broker);

    provisioner.provision(&hello_topology()).await.unwrap();
    let after_first = broker.operations().len();
    provisioner.provision(&hello_topology()).await.unwrap();

    assert_eq!(broker.operations().len(), after_first);
    assert_eq!(declares(&broker, "hello"), 1);
    assert_eq!(declares(&broker, "helloQ"), 1);
}

#[tokio::test]
async fn anonymous_queue_rejects_batch_without_transport_calls() {
    init_logging();
    let broker = MemoryBroker::new();
    let provisioner = provisioner(&broker);

    let defs = vec![
        ExchangeDefinition::topic("valid"),
        ExchangeDefinition::topic("orders").with_queue(QueueDefinition::new("")),
    ];
    let err = provisioner.provision(&defs).await.unwrap_err();

    assert_eq!(
        err,
        ProvisionError::InvalidTopology {
            kind: ResourceKind::Queue,
            exchange: Some("orders".into()),
        }
    );
    assert!(broker.operations().is_empty());
    assert!(provisioner.store().declared_exchanges().is_empty());
}

#[tokio::test]
async fn one_failing_queue_fails_its_exchange_once() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_latency(Duration::from_millis(5));
    broker.fail_queue("q2");
    let provisioner = provisioner(&broker);

    let defs = vec![
        ExchangeDefinition::topic("jobs")
            .with_queue(QueueDefinition::new("q1").bound_to("jobs.a"))
            .with_queue(QueueDefinition::new("q2").bound_to("jobs.b"))
            .with_queue(QueueDefinition::new("q3").bound_to("jobs.c")),
        ExchangeDefinition::new("other", ExchangeKind::Direct)
            .with_queue(QueueDefinition::new("q4").bound_to("x")),
    ];
    let err = provisioner.provision(&defs).await.unwrap_err();

    match err {
        ProvisionError::Topology { first, failed } => {
            assert_eq!(first.exchange, "jobs");
            assert!(matches!(
                first.cause,
                ResourceFailure::DeclareQueue { ref queue, .. } if queue == "q2"
            ));
            assert_eq!(failed, vec!["jobs".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // siblings ran to completion and stay recorded; nothing is rolled back
    let store = provisioner.store();
    assert_eq!(store.declared_queues(), vec!["q1", "q3", "q4"]);
    assert_eq!(store.declared_exchanges(), vec!["jobs", "other"]);
    assert_eq!(broker.bindings("jobs", "q1"), vec!["jobs.a"]);
    assert_eq!(broker.bindings("jobs", "q3"), vec!["jobs.c"]);
}

#[tokio::test]
async fn retry_after_fault_only_touches_what_failed() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.fail_queue("q2");
    let provisioner = provisioner(&broker);

    let defs = vec![ExchangeDefinition::topic("jobs")
        .with_queue(QueueDefinition::new("q1"))
        .with_queue(QueueDefinition::new("q2"))];

    assert!(provisioner.provision(&defs).await.is_err());
    broker.clear_faults();
    provisioner.provision(&defs).await.unwrap();

    assert_eq!(declares(&broker, "jobs"), 1);
    assert_eq!(declares(&broker, "q1"), 1);
    assert_eq!(declares(&broker, "q2"), 2);
    assert_eq!(provisioner.store().declared_queues(), vec!["q1", "q2"]);

    let settled = broker.operations().len();
    provisioner.provision(&defs).await.unwrap();
    assert_eq!(broker.operations().len(), settled);
}

#[tokio::test]
async fn overlapping_caller_waits_for_the_declaring_pass() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_latency(Duration::from_millis(50));
    let provisioner = Arc::new(provisioner(&broker));

    let first = {
        let provisioner = Arc::clone(&provisioner);
        tokio::spawn(async move { provisioner.provision(&hello_topology()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    provisioner.provision(&hello_topology()).await.unwrap();

    // the second caller only returns once the topology actually exists
    let store = provisioner.store();
    assert!(store.exchange("hello").is_some());
    assert!(store.queue("helloQ").is_some());
    assert_eq!(broker.bindings("hello", "helloQ"), vec!["hello.*"]);

    first.await.unwrap().unwrap();
    assert_eq!(declares(&broker, "hello"), 1);
    assert_eq!(declares(&broker, "helloQ"), 1);
}

#[tokio::test]
async fn overlapping_caller_shares_the_declaring_failure() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_latency(Duration::from_millis(50));
    broker.fail_queue("helloQ");
    let provisioner = Arc::new(provisioner(&broker));

    let first = {
        let provisioner = Arc::clone(&provisioner);
        tokio::spawn(async move { provisioner.provision(&hello_topology()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    match provisioner.provision(&hello_topology()).await {
        Err(ProvisionError::Topology { first: err, .. }) => assert_eq!(
            err.cause,
            ResourceFailure::Abandoned {
                kind: ResourceKind::Queue,
                name: "helloQ".into(),
            }
        ),
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(first.await.unwrap().is_err());
    assert_eq!(declares(&broker, "helloQ"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_provision_calls_declare_each_name_once() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_latency(Duration::from_millis(10));
    let provisioner = Arc::new(provisioner(&broker));

    let defs: Vec<ExchangeDefinition> = (0..4)
        .map(|i| {
            ExchangeDefinition::topic(format!("ex{i}"))
                .with_queue(QueueDefinition::new(format!("ex{i}.a")).bound_to("#"))
                .with_queue(QueueDefinition::new(format!("ex{i}.b")))
        })
        .collect();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provisioner = Arc::clone(&provisioner);
        let defs = defs.clone();
        handles.push(tokio::spawn(async move { provisioner.provision(&defs).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for i in 0..4 {
        assert_eq!(declares(&broker, &format!("ex{i}")), 1);
        assert_eq!(declares(&broker, &format!("ex{i}.a")), 1);
        assert_eq!(declares(&broker, &format!("ex{i}.b")), 1);
    }
    assert_eq!(
        broker.count_ops(|op| matches!(op, BrokerOp::Bind { .. })),
        4
    );
}

#[tokio::test]
async fn topology_failure_leaves_rpc_usable() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.fail_exchange("hello");
    let connector = MemoryConnector::new(broker.clone());
    let config = Config::from_toml_str(
        r#"
        [exchanges.hello.queues.helloQ]
        binding = "hello.*"
        "#,
    )
    .unwrap();

    let helper = AmqpHelper::connect(config, &connector).await.unwrap();
    assert_eq!(helper.state(), SessionState::Connected);

    let err = helper.provision_configured().await.unwrap_err();
    assert!(matches!(
        helper.state(),
        SessionState::Failed(amqp_helper::error::SessionError::Provision(_))
    ));
    assert!(matches!(err, ProvisionError::Topology { .. }));

    helper
        .rpc()
        .build_service(
            "ping",
            amqp_helper::ServiceHandlers::new()
                .sync_method("ping", |_| Ok(serde_json::json!("pong"))),
        )
        .await
        .unwrap();
    let client = helper.rpc().build_client("ping", ["ping"]);
    assert_eq!(
        client.call("ping", vec![]).await.unwrap(),
        serde_json::json!("pong")
    );
}

#[tokio::test]
async fn published_messages_follow_bindings() {
    init_logging();
    let connector = MemoryConnector::new(MemoryBroker::new());
    let config = Config::from_toml_str(
        r##"
        [exchanges.events.queues.created]
        binding = "*.created"
        [exchanges.events.queues.everything]
        binding = "#"
        "##,
    )
    .unwrap();
    let helper = AmqpHelper::initialize(config, &connector).await.unwrap();
    assert_eq!(helper.state(), SessionState::Ready);

    let (created_tx, mut created_rx) = tokio::sync::mpsc::unbounded_channel();
    let (all_tx, mut all_rx) = tokio::sync::mpsc::unbounded_channel();
    helper
        .consume("created", move |d: Delivery| {
            let _ = created_tx.send(d.routing_key);
        })
        .await
        .unwrap();
    helper
        .consume("everything", move |d: Delivery| {
            let _ = all_tx.send(d.routing_key);
        })
        .await
        .unwrap();

    helper.publish("events", "user.created", "u1").await.unwrap();
    helper.publish("events", "user.deleted", "u1").await.unwrap();

    assert_eq!(created_rx.try_recv().unwrap(), "user.created");
    assert!(created_rx.try_recv().is_err());
    assert_eq!(all_rx.try_recv().unwrap(), "user.created");
    assert_eq!(all_rx.try_recv().unwrap(), "user.deleted");

    assert!(helper.consume("missing", |_d: Delivery| {}).await.is_err());
}
