use imrelay::protocol::{CommandName, StatusNotice, code};
use imrelay_tests::harness::{client::TestClient, relay::TestRelay};
use std::time::Duration;

/// Poll until `cond` holds or the deadline passes.
async fn eventually(mut cond: impl AsyncFnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn logout_marks_offline_and_removes_key() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();
    let key = alice.key().to_string();

    alice.logout().await.unwrap();
    alice.wait_closed().await.unwrap();

    assert!(eventually(async || !relay.session_keys().await.contains(&key)).await);
    assert_eq!(relay.status("u1"), "0");
}

#[tokio::test]
async fn disconnect_quits_like_logout() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();
    drop(alice);

    assert!(eventually(async || relay.session_keys().await.is_empty()).await);
    assert_eq!(relay.status("u1"), "0");
}

#[tokio::test]
async fn user_stays_online_while_another_connection_remains() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut first = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut second = TestClient::connect(&relay.relay_addr()).await.unwrap();
    first.login("tA").await.unwrap();
    second.login("tA2").await.unwrap();

    first.logout().await.unwrap();
    first.wait_closed().await.unwrap();

    let remaining = second.key().to_string();
    assert!(eventually(async || relay.session_keys().await == vec![remaining.clone()]).await);
    assert_eq!(relay.status("u1"), "1");

    // The remaining connection is still served.
    assert_eq!(second.buddy_list("tA2").await.unwrap().len(), 1);
}

// Connection records are keyed by token: a second login with the same token
// takes the record over from the first connection.
#[tokio::test]
async fn shared_token_record_follows_the_latest_login() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut first = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut second = TestClient::connect(&relay.relay_addr()).await.unwrap();
    first.login("tA").await.unwrap();
    second.login("tA").await.unwrap();

    use imrelay_store::PresenceStore;
    let record = relay.store.conn_by_token("tA").unwrap().unwrap();
    assert_eq!(record.key, second.key());
    assert_eq!(relay.store.count_conns_by_user("u1").unwrap(), 1);

    second.logout().await.unwrap();
    second.wait_closed().await.unwrap();

    let remaining = first.key().to_string();
    assert!(eventually(async || relay.session_keys().await == vec![remaining.clone()]).await);
    assert_eq!(relay.status("u1"), "0");
    // The first connection is still bound and served.
    assert_eq!(first.buddy_list("tA").await.unwrap().len(), 1);
}

#[tokio::test]
async fn shared_token_older_connection_leaving_keeps_user_online() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut first = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut second = TestClient::connect(&relay.relay_addr()).await.unwrap();
    first.login("tA").await.unwrap();
    second.login("tA").await.unwrap();

    first.logout().await.unwrap();
    first.wait_closed().await.unwrap();

    let remaining = second.key().to_string();
    assert!(eventually(async || relay.session_keys().await == vec![remaining.clone()]).await);
    assert_eq!(relay.status("u1"), "1");
}

#[tokio::test]
async fn status_change_is_pushed_to_connected_buddies() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut bob = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut carol = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut dave = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();
    bob.login("tB").await.unwrap();
    carol.login("tC").await.unwrap();
    dave.login("tD").await.unwrap();

    // Alice is online ("1") after login; only that value is accepted.
    alice.set_status("tA", "1").await.unwrap();

    for buddy in [&mut bob, &mut carol] {
        let push = buddy.next_for(CommandName::PushStatusChange).await.unwrap();
        let notice: StatusNotice = push.payload("user").unwrap();
        assert_eq!(notice.id, "u1");
        assert_eq!(notice.state, "1");
    }
    assert!(dave.is_silent_for(Duration::from_millis(200)).await);
    assert!(alice.is_silent_for(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn status_change_failures_are_501() {
    let relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();

    alice.set_status("tA", "0").await.unwrap();
    let resp = alice.next().await.unwrap();
    assert_eq!(
        (resp.code, resp.command),
        (code::STATUS_CHANGE_FAILED, CommandName::SendStatusChange)
    );
    assert_eq!(relay.status("u1"), "1");

    alice.set_status("bogus", "1").await.unwrap();
    assert_eq!(alice.next().await.unwrap().code, code::STATUS_CHANGE_FAILED);

    alice
        .send_raw(r#"{"command":"SEND_STATUS_CHANGE","data":{"user":{"token":"tA"}}}"#)
        .await
        .unwrap();
    assert_eq!(alice.next().await.unwrap().code, code::STATUS_CHANGE_FAILED);
}

#[tokio::test]
async fn shutdown_drains_every_session() {
    let mut relay = TestRelay::spawn().await.unwrap();
    let mut alice = TestClient::connect(&relay.relay_addr()).await.unwrap();
    let mut bob = TestClient::connect(&relay.relay_addr()).await.unwrap();
    alice.login("tA").await.unwrap();
    bob.login("tB").await.unwrap();

    assert_eq!(relay.shutdown().await.unwrap(), 2);

    alice.wait_closed().await.unwrap();
    bob.wait_closed().await.unwrap();
    assert_eq!(relay.status("u1"), "0");
    assert_eq!(relay.status("u2"), "0");
}
