// ============================================================================
// Broker End-to-End Tests
// ============================================================================
//
// Runs the full stack — tonic server, auth layer, handlers, spool — on a
// loopback listener and drives it with the generated client:
//
// - direct delivery to a connected receiver
// - queue-then-drain across a reconnect
// - refusal when the recipient is offline and queueing is off
// - cleanup counting
// - the authentication gate (tokens, API keys, Ping bypass)
//
// ============================================================================

mod test_utils;

use std::time::Duration;

use tokio::time::timeout;
use tonic::{Code, Streaming};

use courier_shared::proto::broker::v1::{Error as WireError, Message};
use courier_shared::spool::Spool;
use test_utils::{TestBroker, connect, connect_with_api_key, connect_with_token, identity, text_message};

const WAIT: Duration = Duration::from_secs(5);

async fn next_message(stream: &mut Streaming<Message>) -> Message {
    timeout(WAIT, stream.message())
        .await
        .expect("timed out waiting for message")
        .expect("stream error")
        .expect("stream ended")
}

#[tokio::test]
async fn direct_delivery_between_connected_services() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    let token_b = broker.auth.issue_token("service-b").unwrap();
    let mut client_b = connect_with_token(addr, &token_b).await;
    let mut stream = client_b
        .receive(identity("service-b"))
        .await
        .unwrap()
        .into_inner();

    let token_a = broker.auth.issue_token("service-a").unwrap();
    let mut client_a = connect_with_token(addr, &token_a).await;
    let status = client_a
        .send(text_message("service-a", "service-b", "hi", false))
        .await
        .unwrap()
        .into_inner();

    assert!(status.success);
    assert_eq!(status.message, "Message sent");

    let delivered = next_message(&mut stream).await;
    assert_eq!(delivered.data, b"hi");
    assert_eq!(delivered.from, "service-a");
    assert_eq!(delivered.to, "service-b");

    assert_eq!(broker.ctx.spool.count_prefix("").unwrap(), 0);
}

#[tokio::test]
async fn queued_message_is_drained_on_reconnect() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    // service-b is absent; the message goes to the spool.
    let token_a = broker.auth.issue_token("service-a").unwrap();
    let mut client_a = connect_with_token(addr, &token_a).await;
    let status = client_a
        .send(text_message("service-a", "service-b", "later", true))
        .await
        .unwrap()
        .into_inner();
    assert!(status.success);
    assert_eq!(status.message, "Message queued");
    assert_eq!(
        broker.ctx.spool.count_prefix(&Spool::prefix("service-b")).unwrap(),
        1
    );

    // service-b connects and the drain replays the message.
    let token_b = broker.auth.issue_token("service-b").unwrap();
    let mut client_b = connect_with_token(addr, &token_b).await;
    let mut stream = client_b
        .receive(identity("service-b"))
        .await
        .unwrap()
        .into_inner();

    let drained = next_message(&mut stream).await;
    assert_eq!(drained.data, b"later");

    timeout(WAIT, async {
        while broker.ctx.spool.count_prefix(&Spool::prefix("service-b")).unwrap() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("drained entry was not removed from the spool");
}

#[tokio::test]
async fn offline_recipient_without_queueing_is_refused() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    let token_a = broker.auth.issue_token("service-a").unwrap();
    let mut client_a = connect_with_token(addr, &token_a).await;
    let status = client_a
        .send(text_message("service-a", "service-b", "drop", false))
        .await
        .unwrap()
        .into_inner();

    assert!(!status.success);
    assert_eq!(status.message, "Recipient not found");
    assert_eq!(status.error, WireError::None as i32);
    assert_eq!(broker.ctx.spool.count_prefix("").unwrap(), 0);
}

#[tokio::test]
async fn cleanup_empties_the_callers_spool() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    let token_a = broker.auth.issue_token("service-a").unwrap();
    let mut client_a = connect_with_token(addr, &token_a).await;
    for i in 0..3 {
        client_a
            .send(text_message("service-a", "service-b", &format!("m{i}"), true))
            .await
            .unwrap();
    }

    let token_b = broker.auth.issue_token("service-b").unwrap();
    let mut client_b = connect_with_token(addr, &token_b).await;
    let status = client_b
        .cleanup(identity("service-b"))
        .await
        .unwrap()
        .into_inner();
    assert!(status.success);
    assert_eq!(status.message, "Cleanup completed (3)");

    // A fresh receive stream has nothing to drain.
    let mut stream = client_b
        .receive(identity("service-b"))
        .await
        .unwrap()
        .into_inner();
    let nothing = timeout(Duration::from_millis(1500), stream.message()).await;
    assert!(nothing.is_err(), "no spooled message should arrive");
}

#[tokio::test]
async fn unauthenticated_calls_are_rejected_before_handlers_run() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    let mut anon = connect(addr).await;
    let err = anon
        .send(text_message("service-a", "service-b", "hi", true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
    // The handler never ran: nothing was spooled.
    assert_eq!(broker.ctx.spool.count_prefix("").unwrap(), 0);

    let err = anon.receive(identity("service-b")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Ping stays open for liveness probes.
    let pong = anon.ping(identity("probe")).await.unwrap().into_inner();
    assert!(pong.success);
    assert_eq!(pong.message, "Pong");
}

#[tokio::test]
async fn garbage_token_is_rejected() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    let mut client = connect_with_token(addr, "not.a.token").await;
    let err = client
        .send(text_message("service-a", "service-b", "hi", false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn receive_identity_must_match_token() {
    let broker = TestBroker::open_authenticated();
    let addr = broker.serve().await;

    let token_a = broker.auth.issue_token("service-a").unwrap();
    let mut client = connect_with_token(addr, &token_a).await;
    let err = client.receive(identity("service-b")).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn api_key_mode_end_to_end() {
    let broker = TestBroker::with_config(|config| {
        config.auth.enabled = true;
        config.auth.method = courier_config::AuthMethod::OpaqueKey;
    });
    let key_b = broker.auth.credentials().generate_api_key("service-b");
    let key_a = broker.auth.credentials().generate_api_key("service-a");
    let addr = broker.serve().await;

    let mut client_b = connect_with_api_key(addr, &key_b).await;
    let mut stream = client_b
        .receive(identity("service-b"))
        .await
        .unwrap()
        .into_inner();

    let mut client_a = connect_with_api_key(addr, &key_a).await;
    let status = client_a
        .send(text_message("service-a", "service-b", "keyed", false))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.message, "Message sent");
    assert_eq!(next_message(&mut stream).await.data, b"keyed");

    let mut stranger = connect_with_api_key(addr, "unknown-key").await;
    let err = stranger
        .send(text_message("service-a", "service-b", "x", false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}
