// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use std::time::Duration;

use proxcast_broker_core::application::broker::Broker;
use proxcast_broker_core::domain::agent::{AgentId, Position};
use proxcast_broker_core::domain::broker_config::BrokerConfigManifest;
use proxcast_broker_core::domain::events::BrokerEvent;
use proxcast_broker_core::infrastructure::companion::DisabledCompanionRuntime;
use proxcast_broker_core::infrastructure::in_memory::InMemoryTransport;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

fn broker() -> (Broker, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new());
    let mut config = BrokerConfigManifest::default();
    config.spec.ingest.idle_poll_ms = 1;
    let broker = Broker::with_transport(
        config,
        transport.clone(),
        Arc::new(DisabledCompanionRuntime),
    );
    (broker, transport)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn envelope(sender: u32, x: f64, y: f64) -> String {
    format!(r#"{{"sender_id":{sender},"pos":{{"p":{{"x":{x},"y":{y}}}}}}}"#)
}

#[tokio::test]
async fn test_reference_scenario_through_ingest_stream() {
    let (broker, transport) = broker();
    let registry = broker.registry();

    registry.create(AgentId(1), None).await.unwrap().set_range(5.0);
    registry
        .create(AgentId(2), None)
        .await
        .unwrap()
        .set_position(Position::new(3.0, 0.0));
    registry
        .create(AgentId(3), None)
        .await
        .unwrap()
        .set_position(Position::new(10.0, 0.0));

    let (mut client, server) = tokio::io::duplex(1024);
    broker.start_with(server).unwrap();

    let message = envelope(1, 0.0, 0.0);
    client.write_all(format!("{message}\n").as_bytes()).await.unwrap();

    wait_until(|| !transport.lines("proxcast-agent-2").is_empty()).await;
    broker.shutdown().await;

    assert_eq!(transport.lines("proxcast-agent-2"), vec![message]);
    assert!(transport.lines("proxcast-agent-3").is_empty());
    assert!(transport.lines("proxcast-agent-1").is_empty());
}

#[tokio::test]
async fn test_message_split_across_writes_is_reassembled() {
    let (broker, transport) = broker();
    broker.registry().create(AgentId(1), None).await.unwrap();
    broker.registry().create(AgentId(2), None).await.unwrap();

    let (mut client, server) = tokio::io::duplex(8);
    broker.start_with(server).unwrap();

    let message = envelope(1, 1.0, 1.0);
    let (head, tail) = message.split_at(10);
    client.write_all(head.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(tail.as_bytes()).await.unwrap();
    client.write_all(b"\n").await.unwrap();

    wait_until(|| !transport.lines("proxcast-agent-2").is_empty()).await;
    assert_eq!(transport.lines("proxcast-agent-2"), vec![message]);
    assert_eq!(
        broker.registry().get(AgentId(1)).unwrap().position(),
        Position::new(1.0, 1.0)
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_garbage_does_not_stop_the_loop() {
    let (broker, transport) = broker();
    broker.registry().create(AgentId(1), None).await.unwrap();
    broker.registry().create(AgentId(2), None).await.unwrap();

    let (mut client, server) = tokio::io::duplex(1024);
    broker.start_with(server).unwrap();

    let input = [
        "Bonjour".to_string(),
        "[1,2,3]".to_string(),
        r#"{"sender_id":1}"#.to_string(),
        envelope(77, 0.0, 0.0),
        String::new(),
        envelope(1, 2.0, 0.0),
    ]
    .join("\n")
        + "\n";
    client.write_all(input.as_bytes()).await.unwrap();

    wait_until(|| !transport.lines("proxcast-agent-2").is_empty()).await;
    broker.shutdown().await;

    assert_eq!(transport.lines("proxcast-agent-2"), vec![envelope(1, 2.0, 0.0)]);
    assert!(broker.registry().get(AgentId(77)).is_none());
    assert_eq!(broker.registry().len(), 0);
}

#[tokio::test]
async fn test_inactive_receiver_gets_nothing() {
    let (broker, transport) = broker();
    let registry = broker.registry();
    registry.create(AgentId(1), None).await.unwrap();
    registry.create(AgentId(2), None).await.unwrap();
    registry.create(AgentId(3), None).await.unwrap();
    registry.set_active(AgentId(3), false);

    let outcome = broker.worker().process(&envelope(1, 0.0, 0.0)).await;

    assert!(matches!(
        outcome,
        proxcast_broker_core::FanOutOutcome::Forwarded { recipients: 1, .. }
    ));
    assert_eq!(transport.lines("proxcast-agent-2").len(), 1);
    assert!(transport.lines("proxcast-agent-3").is_empty());
    broker.shutdown().await;
}

#[tokio::test]
async fn test_position_notifications_reach_observers() {
    let (broker, _) = broker();
    broker.registry().create(AgentId(4), None).await.unwrap();
    let mut events = broker.events().subscribe_agent(AgentId(4));

    broker.worker().process(&envelope(4, 6.0, 8.0)).await;

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        BrokerEvent::AgentMoved { position, .. } if position == Position::new(6.0, 8.0)
    ));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_returns_with_reader_idle_and_creations_pending() {
    let (broker, _) = broker();
    let (_client, server) = tokio::io::duplex(64);
    broker.start_with(server).unwrap();

    let registry = Arc::clone(broker.registry());
    for id in 0..20 {
        let _ = registry.create_async(AgentId(id), None, None);
    }

    timeout(Duration::from_secs(5), broker.shutdown())
        .await
        .expect("shutdown should not deadlock");

    assert_eq!(registry.pending_creations(), 0);
    assert!(registry.is_empty());
    assert!(broker.ingest().is_stopped());
}

#[tokio::test]
async fn test_writer_closing_is_not_end_of_stream() {
    let (broker, transport) = broker();
    broker.registry().create(AgentId(1), None).await.unwrap();
    broker.registry().create(AgentId(2), None).await.unwrap();

    let (mut client, server) = tokio::io::duplex(1024);
    broker.start_with(server).unwrap();
    client.write_all(format!("{}\n", envelope(1, 0.0, 0.0)).as_bytes()).await.unwrap();
    drop(client);

    wait_until(|| !transport.lines("proxcast-agent-2").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.is_listening());

    broker.shutdown().await;
    assert!(!broker.is_listening());
}

#[tokio::test]
async fn test_partial_message_at_shutdown_is_never_dispatched() {
    let (broker, transport) = broker();
    let sender = broker.registry().create(AgentId(1), None).await.unwrap();
    broker.registry().create(AgentId(2), None).await.unwrap();
    let mut events = broker.events().subscribe();

    let (mut client, server) = tokio::io::duplex(1024);
    broker.start_with(server).unwrap();

    // A complete envelope, but its terminator never arrives.
    client
        .write_all(envelope(1, 2.0, 0.0).as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.registry().ids(), vec![AgentId(1), AgentId(2)]);

    timeout(Duration::from_secs(5), broker.shutdown())
        .await
        .expect("shutdown should not wait for the rest of the line");

    assert!(transport.lines("proxcast-agent-2").is_empty());
    assert!(transport.lines("proxcast-agent-1").is_empty());
    assert_eq!(sender.position(), Position::ORIGIN);
    assert!(events.try_recv().is_err());
}
