//! AMQP backend integration tests
//!
//! The broker is the in-memory `BrokerChannel`; the management API is a
//! local axum server standing in for the broker's HTTP endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use queue_bridge::broker::{BrokerChannel, InMemoryBroker, ManagementApi};
use queue_bridge::config::{BackendKind, ManagementConfig, QueuesConfig, RoleBackends, Settings};
use queue_bridge::error::QueueError;
use queue_bridge::queue::amqp::AmqpQueueFactory;
use queue_bridge::queue::{create_queue_factory, Envelope, Queue, QueueFactory, ReplyQueue};

type Depths = Arc<Mutex<HashMap<(String, String), u64>>>;

async fn queue_info(
    State(depths): State<Depths>,
    Path((vhost, queue)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !headers.contains_key("authorization") {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if queue == "broken" {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let depths = depths.lock().unwrap();
    match depths.get(&(vhost, queue.clone())) {
        Some(ready) => Ok(Json(json!({"name": queue, "messages_ready": ready}))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Start a management API stub; returns its config.
async fn management_stub(depths: Depths) -> ManagementConfig {
    let app = Router::new()
        .route("/api/queues/{vhost}/{queue}", get(queue_info))
        .with_state(depths);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ManagementConfig {
        host: "127.0.0.1".to_string(),
        port,
        vhost: "/".to_string(),
        username: "guest".to_string(),
        password: "guest".to_string(),
        timeout_seconds: 5,
    }
}

fn depths(entries: &[(&str, u64)]) -> Depths {
    let map = entries
        .iter()
        .map(|(queue, ready)| (("/".to_string(), queue.to_string()), *ready))
        .collect();
    Arc::new(Mutex::new(map))
}

#[tokio::test]
async fn test_message_count_reads_management_api() {
    let config = management_stub(depths(&[("jobs", 7), ("mail_wait", 3)])).await;
    let management = ManagementApi::new(&config).unwrap();
    let factory = AmqpQueueFactory::new(Arc::new(InMemoryBroker::new()), Some(management));

    let jobs = factory.create("jobs").await.unwrap();
    assert_eq!(jobs.message_count().await.unwrap(), Some(7));

    // A delayed queue reports what is still waiting
    let mail = factory.create_delayed("mail", 60).await.unwrap();
    assert_eq!(mail.message_count().await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_message_count_unknown_queue_is_none() {
    let config = management_stub(depths(&[])).await;
    let management = ManagementApi::new(&config).unwrap();

    assert_eq!(management.messages_ready("nope").await.unwrap(), None);

    let factory = AmqpQueueFactory::new(Arc::new(InMemoryBroker::new()), Some(management));
    let queue = factory.create("nope").await.unwrap();
    assert_eq!(queue.message_count().await.unwrap(), None);
}

#[tokio::test]
async fn test_management_failure_degrades_to_unknown() {
    let config = management_stub(depths(&[])).await;
    let management = ManagementApi::new(&config).unwrap();

    assert!(management.messages_ready("broken").await.is_err());

    let factory = AmqpQueueFactory::new(Arc::new(InMemoryBroker::new()), Some(management));
    let queue = factory.create("broken").await.unwrap();
    assert_eq!(queue.message_count().await.unwrap(), None);
}

#[tokio::test]
async fn test_configured_factory_routes_to_broker() {
    let settings = Settings {
        database: None,
        amqp: None,
        management: None,
        queues: QueuesConfig {
            roles: RoleBackends {
                default: Some(BackendKind::Amqp),
                ..Default::default()
            },
            ..Default::default()
        },
    };
    let broker = InMemoryBroker::new();
    let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());
    let factory = create_queue_factory(&settings, None, Some(channel)).unwrap();

    let queue = factory.create("jobs").await.unwrap();
    assert_eq!(queue.backend(), "amqp");
    queue.publish(Envelope::new(json!({"n": 1})), None).await.unwrap();
    assert_eq!(broker.depth("jobs"), 1);

    let err = factory.create_schedulable("jobs").await.err().unwrap();
    assert!(matches!(err, QueueError::UnsupportedOperation(_)));
}

#[tokio::test]
async fn test_rpc_callers_receive_only_their_replies() {
    let broker = InMemoryBroker::new();
    let factory = AmqpQueueFactory::new(Arc::new(broker.clone()), None);

    let mut alice = factory.create_rpc("work").await.unwrap();
    let mut bob = factory.create_rpc("work").await.unwrap();
    alice.publish(Envelope::new(json!({"from": "alice"}))).await.unwrap();
    bob.publish(Envelope::new(json!({"from": "bob"}))).await.unwrap();

    let alice_queue = alice.reply_queue().await.unwrap().name().to_string();
    let bob_queue = bob.reply_queue().await.unwrap().name().to_string();
    assert_ne!(alice_queue, bob_queue);

    // Responder side
    let mut subscription = broker.consume("work").await.unwrap();
    for _ in 0..2 {
        let request = futures::StreamExt::next(&mut subscription.deliveries)
            .await
            .unwrap()
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let responder = factory
            .rpc_reply(request.headers.reply_to.as_deref())
            .await
            .unwrap();
        let answer = Envelope::new(json!({"echo": payload["from"]}))
            .with_correlation_id(request.headers.correlation_id.clone());
        assert!(responder.publish(answer).await.unwrap().is_accepted());
        broker.ack(request.delivery_tag).await.unwrap();
    }
    broker.cancel(&subscription.consumer_tag).await.unwrap();

    for (rpc, who) in [(&mut alice, "alice"), (&mut bob, "bob")] {
        rpc.set_expected_response_count(Some(1));
        let mut replies: Vec<Envelope> = Vec::new();
        rpc.consume(&mut replies, Duration::from_secs(5)).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload(), &json!({"echo": who}));
    }
    assert_eq!(broker.unacked_count(), 0);
}
