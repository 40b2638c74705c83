use imrelay::protocol::{CommandName, PushedMessage, code};
use imrelay_tests::harness::{client::TestClient, relay::TestRelay};
use std::time::Duration;

#[tokio::test]
async fn message_is_pushed_to_receiver() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut bob = TestClient::connect(&relay.relay_addr()).await.unwrap();
    assert!(alice.login("tA").await.unwrap().is_ok());
    assert!(bob.login("tB").await.unwrap().is_ok());

    let ticket = alice.create_session("u1", "u2", "tA").await.unwrap();
    alice.send_msg(&ticket, "hello bob").await.unwrap();

    let push = bob.next_for(CommandName::PushMsg).await.unwrap();
    let message: PushedMessage = push.payload("message").unwrap();
    assert_eq!(
        message,
        PushedMessage {
            sender: "u1".to_string(),
            ticket: ticket.clone(),
            content: "hello bob".to_string(),
        }
    );

    // Delivered messages get no reply.
    assert!(alice.is_silent_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn create_session_reuses_conversation() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();

    let first = alice.create_session("u1", "u2", "tA").await.unwrap();
    let second = alice.create_session("u1", "u2", "tA").await.unwrap();
    assert_eq!(first, second);

    let other = alice.create_session("u1", "u3", "tA").await.unwrap();
    assert_ne!(first, other);
}

#[tokio::test]
async fn offline_receiver_yields_one_304() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();

    let ticket = alice.create_session("u1", "u4", "tA").await.unwrap();
    alice.send_msg(&ticket, "anyone?").await.unwrap();

    let resp = alice.next().await.unwrap();
    assert_eq!((resp.code, resp.command), (code::FAIL_4, CommandName::SendMsgReturn));
    assert!(alice.is_silent_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn unknown_ticket_is_303() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();

    alice.send_msg("no-such-ticket", "hi").await.unwrap();
    let resp = alice.next().await.unwrap();
    assert_eq!((resp.code, resp.command), (code::FAIL_3, CommandName::SendMsgReturn));
}

#[tokio::test]
async fn missing_message_fields_are_rejected() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();

    alice
        .send_raw(r#"{"command":"SEND_MSG","data":{"message":{"ticket":"t1"}}}"#)
        .await
        .unwrap();
    assert_eq!(alice.next().await.unwrap().code, code::FAIL_2);

    alice
        .send_raw(r#"{"command":"CREATE_SESSION","data":{"session":{"sender":"u1"}}}"#)
        .await
        .unwrap();
    let resp = alice.next().await.unwrap();
    assert_eq!((resp.code, resp.command), (code::FAIL_2, CommandName::CreateSessionReturn));
}

#[tokio::test]
async fn only_connected_receiver_keys_get_pushes() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut bob_phone = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut bob_laptop = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();
    bob_phone.login("tB").await.unwrap();
    bob_laptop.login("tB2").await.unwrap();

    // A record left behind by a connection the relay no longer holds.
    use imrelay_store::PresenceStore;
    relay.store.add_conn("stale-key", "u2", "tB-old").unwrap();

    let ticket = alice.create_session("u1", "u2", "tA").await.unwrap();
    assert_eq!(relay.store.receiver_keys_by_ticket(&ticket).unwrap().len(), 3);

    alice.send_msg(&ticket, "ping").await.unwrap();

    for bob in [&mut bob_phone, &mut bob_laptop] {
        let push = bob.next_for(CommandName::PushMsg).await.unwrap();
        assert_eq!(push.payload::<PushedMessage>("message").unwrap().content, "ping");
        assert!(bob.is_silent_for(Duration::from_millis(100)).await);
    }
    assert!(alice.is_silent_for(Duration::from_millis(200)).await);
}
