//! Cluster coordination and tmp-queue lifecycle over the in-memory broker

mod common;

use common::{register_collect, wait_for, CollectOutput};
use courier::effects::send;
use courier::{
    Broker, Config, ConsumersManager, CourierApp, MemoryBroker, Message, QueueSpec, Registry,
};
use std::sync::Arc;
use std::time::Duration;

fn test_registry(tag: &'static str) -> Registry {
    let mut registry = Registry::with_builtins();
    register_collect(&mut registry.outputs);
    registry.register_pipeline(
        "delivery",
        Arc::new(move |_m: &Message| vec![send(vec![Arc::new(CollectOutput::new(tag)) as _])]),
    );
    registry
}

fn test_config(generator_count: u64) -> Config {
    Config::from_str(&format!(
        r#"
events:
  example_event:
    generators:
      - name: count
        kwargs: {{count: {generator_count}}}
    output: delivery
"#
    ))
    .expect("valid test config")
}

#[tokio::test]
async fn test_idle_generation_queue_is_garbage_collected() {
    let broker = Arc::new(MemoryBroker::new());
    let mut manager = ConsumersManager::new(
        test_config(0),
        Arc::new(test_registry("gc")),
        broker.clone(),
    );
    manager.start_all().await.unwrap();

    // The generator produces nothing, so the announced tmp queue stays
    // empty and must be cancelled and deleted by the monitor
    CourierApp::send_with_broker(broker.as_ref(), "example_event", serde_json::json!({"a": 1}))
        .await
        .unwrap();

    let broker_check = broker.clone();
    wait_for(move || {
        broker_check
            .queue_names()
            .iter()
            .any(|q| q.starts_with("gen.example_event."))
    })
    .await;

    let broker_check = broker.clone();
    wait_for(move || {
        !broker_check
            .queue_names()
            .iter()
            .any(|q| q.starts_with("gen.example_event."))
    })
    .await;

    manager.stop_all().await;
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn test_bogus_cluster_action_does_not_poison_dispatch() {
    let broker = Arc::new(MemoryBroker::new());
    let mut manager = ConsumersManager::new(
        test_config(1),
        Arc::new(test_registry("bogus")),
        broker.clone(),
    );
    manager.start_all().await.unwrap();

    broker
        .publish_json("cluster", "", &serde_json::json!({"action": "bogus"}))
        .await
        .unwrap();
    broker
        .publish_json("cluster", "", &serde_json::json!({"queue_name": "gen.x.1"}))
        .await
        .unwrap();

    // A hand-announced generation queue still gets drained afterwards
    let spec = QueueSpec::generation("example_event");
    broker.declare(&spec).await.unwrap();
    broker
        .publish("", &spec.name, Message::new("m1", "example_event").to_bytes())
        .await
        .unwrap();
    broker
        .publish_json(
            "cluster",
            "",
            &serde_json::json!({"action": "start_consume", "queue_name": spec.name}),
        )
        .await
        .unwrap();

    wait_for(|| CollectOutput::delivered_count("bogus") == 1).await;

    manager.stop_all().await;
}

#[tokio::test]
async fn test_observed_output_starts_consumers_on_every_worker() {
    let broker = Arc::new(MemoryBroker::new());

    let mut worker_a = ConsumersManager::new(
        test_config(1),
        Arc::new(test_registry("everywhere")),
        broker.clone(),
    );
    let mut worker_b = ConsumersManager::new(
        test_config(1),
        Arc::new(test_registry("everywhere")),
        broker.clone(),
    );
    worker_a.start_all().await.unwrap();
    worker_b.start_all().await.unwrap();

    assert!(worker_a.running_output_consumers().await.is_empty());
    assert!(worker_b.running_output_consumers().await.is_empty());

    CourierApp::send_with_broker(broker.as_ref(), "example_event", serde_json::json!({"a": 1}))
        .await
        .unwrap();

    wait_for(|| CollectOutput::delivered_count("everywhere") >= 1).await;

    // The first routing announced the output; both workers subscribed
    for _ in 0..500 {
        if worker_a.running_output_consumers().await.len() == 1
            && worker_b.running_output_consumers().await.len() == 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        worker_a.running_output_consumers().await,
        vec![("example_event".to_string(), "collect".to_string())]
    );
    assert_eq!(
        worker_b.running_output_consumers().await,
        vec![("example_event".to_string(), "collect".to_string())]
    );

    worker_a.stop_all().await;
    worker_b.stop_all().await;
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn test_generation_queue_drained_by_any_worker() {
    let broker = Arc::new(MemoryBroker::new());

    // Worker B has no event consumer traffic of its own; it only hears
    // about the tmp queue through the cluster bus
    let mut worker_b = ConsumersManager::new(
        test_config(1),
        Arc::new(test_registry("drained")),
        broker.clone(),
    );
    worker_b.start_all().await.unwrap();

    let spec = QueueSpec::generation("example_event");
    broker.declare(&spec).await.unwrap();
    for i in 0..3 {
        let message = Message::new(format!("m{i}"), "example_event");
        broker.publish("", &spec.name, message.to_bytes()).await.unwrap();
    }
    broker
        .publish_json(
            "cluster",
            "",
            &serde_json::json!({"action": "start_consume", "queue_name": spec.name}),
        )
        .await
        .unwrap();

    wait_for(|| CollectOutput::delivered_count("drained") == 3).await;

    worker_b.stop_all().await;
    assert_eq!(broker.unacked(), 0);
}
