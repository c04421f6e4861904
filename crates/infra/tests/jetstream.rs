//! End-to-end tests against a real broker.
//!
//! Run with a JetStream-enabled server:
//!
//! ```text
//! NATS_URL=nats://127.0.0.1:4222 cargo test -p courier-infra -- --ignored
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_nats::jetstream::stream;
use tokio_util::sync::CancellationToken;

use courier_auth::{ActorId, UNKNOWN_ACTOR, with_actor};
use courier_core::Error;
use courier_events::{
    AuthRelationshipAction, AuthRelationshipPublisher, AuthRelationshipRequest,
    AuthRelationshipResponse, AuthRelationshipSubscriber, ChangeMessage, EventMessage,
    MESSAGE_ID_HEADER, Publisher, Subscriber,
};
use courier_infra::{NatsConfig, NatsConnection};

fn nats_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string())
}

/// A connection whose subjects live under a fresh prefix, plus a stream
/// capturing that prefix's changes and events.
async fn isolated(queue_group: &str) -> Result<(NatsConnection, String)> {
    courier_observability::tracing::init_for_tests();

    let prefix = format!("t{}", uuid::Uuid::now_v7().simple());
    let mut config = NatsConfig::new(nats_url(), "courier-tests")
        .with_prefixes(prefix.clone(), prefix.clone())
        .with_queue_group(queue_group);
    config.fetch_timeout = Duration::from_millis(500);
    config.fetch_backoff = Duration::from_millis(200);

    let conn = NatsConnection::connect(config).await.context("connect")?;
    conn.jetstream()
        .create_stream(stream::Config {
            name: prefix.to_uppercase(),
            subjects: vec![format!("{prefix}.changes.>"), format!("{prefix}.events.>")],
            ..Default::default()
        })
        .await
        .context("create stream")?;

    Ok((conn, prefix))
}

async fn cleanup(conn: &NatsConnection, prefix: &str) {
    let _ = conn.jetstream().delete_stream(prefix.to_uppercase()).await;
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn published_change_arrives_with_fields_intact() -> Result<()> {
    let (conn, prefix) = isolated("").await?;
    let cancel = CancellationToken::new();
    let mut sub = conn.subscribe_changes(">", cancel.clone()).await?;

    let change = ChangeMessage::new("loadbal-abc", "update")
        .with_additional_subject("tnntten-1")
        .with_field_change("port", "80", "443");
    with_actor(ActorId::new("idntusr-7"), conn.publish_change("test", change.clone())).await?;

    let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await?
        .context("subscription closed")?;
    assert_eq!(msg.topic(), format!("{prefix}.changes.update.test"));
    assert!(msg.header(MESSAGE_ID_HEADER).is_some());

    let mut expected = change;
    expected.actor_id = "idntusr-7".to_string();
    expected.source = "courier-tests".to_string();
    assert_eq!(msg.payload().context("decode")?, &expected);
    assert!(msg.trace_context().is_some());
    assert_eq!(msg.delivery_count()?, 1);
    msg.ack().await?;

    cancel.cancel();
    cleanup(&conn, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn missing_actor_is_stamped_unknown() -> Result<()> {
    let (conn, prefix) = isolated("").await?;
    let cancel = CancellationToken::new();
    let mut sub = conn.subscribe_changes(">", cancel.clone()).await?;

    conn.publish_change("test", ChangeMessage::new("loadbal-abc", "delete")).await?;

    let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await?
        .context("subscription closed")?;
    assert_eq!(msg.payload().context("decode")?.actor_id, UNKNOWN_ACTOR);
    msg.ack().await?;

    cancel.cancel();
    cleanup(&conn, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn three_changes_ack_two_nak_one() -> Result<()> {
    let (conn, prefix) = isolated("courier-it").await?;
    for i in 0..3 {
        conn.publish_change("test", ChangeMessage::new(format!("loadbal-{i}"), "create"))
            .await?;
    }

    let cancel = CancellationToken::new();
    let mut sub = conn.subscribe_changes(">", cancel.clone()).await?;

    let mut received = Vec::new();
    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await?
            .context("subscription closed")?;
        received.push(msg);
    }
    let ids: Vec<_> = received
        .iter()
        .map(|m| m.payload().map(|p| p.subject_id.clone()).unwrap_or_default())
        .collect();
    assert_eq!(ids, ["loadbal-0", "loadbal-1", "loadbal-2"]);

    received[0].ack().await?;
    received[1].ack().await?;
    received[2].nak(Duration::ZERO).await?;

    let again = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await?
        .context("subscription closed")?;
    assert_eq!(again.payload().context("decode")?.subject_id, "loadbal-2");
    assert_eq!(again.delivery_count()?, 2);
    again.ack().await?;

    cancel.cancel();
    cleanup(&conn, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn events_route_by_type_and_topic() -> Result<()> {
    let (conn, prefix) = isolated("").await?;
    let cancel = CancellationToken::new();
    let mut sub = conn.subscribe_events("*.cert", cancel.clone()).await?;

    conn.publish_event("other", EventMessage::new("certmgr-1", "rotated")).await?;
    conn.publish_event(
        "cert",
        EventMessage::new("certmgr-2", "rotated").with_data("serial", serde_json::json!(42)),
    )
    .await?;

    let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await?
        .context("subscription closed")?;
    let event = msg.payload().context("decode")?;
    assert_eq!(event.subject_id, "certmgr-2");
    assert_eq!(event.data["serial"], 42);
    msg.ack().await?;

    cancel.cancel();
    cleanup(&conn, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn auth_relationship_request_without_responders() -> Result<()> {
    let (conn, prefix) = isolated("").await?;
    let request = AuthRelationshipRequest::new(AuthRelationshipAction::Write, "loadbal-abc")
        .with_relation("owner", "tnntten-1");

    let result = conn
        .publish_auth_relationship_request("lb", request, Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(Error::NoResponders)), "got {result:?}");

    cleanup(&conn, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn auth_relationship_round_trip() -> Result<()> {
    let (conn, prefix) = isolated("permissions").await?;
    let cancel = CancellationToken::new();
    let mut requests = conn.subscribe_auth_relationship_requests(">", cancel.clone()).await?;

    let server = tokio::spawn(async move {
        let msg = requests.recv().await.context("request stream closed")?;
        let request = msg.payload().context("decode request")?;
        let response = if request.relations.iter().any(|r| r.relation == "owner") {
            AuthRelationshipResponse::success()
        } else {
            AuthRelationshipResponse::failed(["owner relation missing"])
        };
        msg.reply(response).await?;
        anyhow::Ok(())
    });

    let request = AuthRelationshipRequest::new(AuthRelationshipAction::Write, "loadbal-abc")
        .with_relation("owner", "tnntten-1");
    let reply = conn
        .publish_auth_relationship_request("lb", request, Duration::from_secs(5))
        .await?;
    assert!(reply.payload().context("decode response")?.is_success());
    assert!(matches!(reply.metadata(), Err(Error::NotStreamMessage)));

    server.await??;
    cancel.cancel();
    cleanup(&conn, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn shutdown_closes_open_subscriptions() -> Result<()> {
    let (conn, prefix) = isolated("").await?;
    let cancel = CancellationToken::new();
    let mut changes = conn.subscribe_changes(">", cancel.clone()).await?;

    conn.shutdown().await?;
    assert!(conn.is_draining());

    let next = tokio::time::timeout(Duration::from_secs(5), changes.recv()).await?;
    assert!(next.is_none(), "subscription outlived its connection");
    assert!(!cancel.is_cancelled());

    let cleaner = NatsConnection::connect(NatsConfig::new(nats_url(), "courier-tests")).await?;
    cleanup(&cleaner, &prefix).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires NATS_URL with JetStream"]
async fn shutdown_runs_close_callback() -> Result<()> {
    let closed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&closed);

    let conn = NatsConnection::connect_with_close_callback(
        NatsConfig::new(nats_url(), "courier-tests"),
        move || flag.store(true, Ordering::SeqCst),
    )
    .await?;

    let started = Instant::now();
    conn.shutdown().await?;
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert!(closed.load(Ordering::SeqCst));
    assert!(conn.is_closed());
    Ok(())
}
