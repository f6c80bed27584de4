//! E2E tests for the hub: subscription handshakes, fan-out delivery,
//! denial, lease expiry and unsubscription.

mod common;

use common::{TestServer, TestSubscriber, next_state_change, sample_feed};
use hmac::{Hmac, Mac};
use salmonrun::feed::Feed;
use sha1::Sha1;
use std::time::Duration;

async fn subscribe(
    server: &TestServer,
    subscriber: &TestSubscriber,
    topic: &str,
    secret: &str,
    lease_seconds: &str,
) -> reqwest::Response {
    server
        .client
        .post(server.url("/hub"))
        .form(&[
            ("hub.mode", "subscribe"),
            ("hub.callback", subscriber.callback_url.as_str()),
            ("hub.topic", topic),
            ("hub.secret", secret),
            ("hub.lease_seconds", lease_seconds),
        ])
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_subscribe_and_publish_roundtrip() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let mut subscriber = TestSubscriber::start(true).await;
    let topic = server.url("/feeds/alice.atom");

    let response = subscribe(&server, &subscriber, &topic, "s3cret", "300").await;
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    // The verification GET carries mode, topic, lease and challenge, and
    // keeps the callback's own query parameters.
    let verification = subscriber.wait_for_mode("subscribe").await;
    assert_eq!(verification.get("hub.topic").map(String::as_str), Some(topic.as_str()));
    assert_eq!(verification.get("hub.lease_seconds").map(String::as_str), Some("300"));
    assert!(verification.contains_key("hub.challenge"));
    assert_eq!(verification.get("tag").map(String::as_str), Some("prior"));

    let change = next_state_change(&mut changes).await;
    assert_eq!(change.topic, topic);
    assert_eq!(change.secret, "s3cret");
    assert!(change.lease_end.is_some());

    // Publish an update and receive it back, signed.
    let feed = sample_feed(&topic, &server.url("/hub"));
    assert!(server.backend.publish(feed.clone()).await);

    let push = subscriber.next_push().await;
    assert_eq!(push.content_type, "application/atom+xml");

    let mut mac = Hmac::<Sha1>::new_from_slice(b"s3cret").unwrap();
    mac.update(&push.body);
    let expected = format!("sha1={}", hex::encode(mac.finalize().into_bytes()));
    assert_eq!(push.signature.as_deref(), Some(expected.as_str()));

    let received = Feed::from_xml(std::str::from_utf8(&push.body).unwrap()).unwrap();
    assert_eq!(received, feed);
}

#[tokio::test]
async fn test_subscription_without_secret_is_unsigned() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let mut subscriber = TestSubscriber::start(true).await;
    let topic = server.url("/feeds/bob.atom");

    subscribe(&server, &subscriber, &topic, "", "300").await;
    next_state_change(&mut changes).await;

    assert!(server.backend.publish(sample_feed(&topic, &server.url("/hub"))).await);
    let push = subscriber.next_push().await;
    assert_eq!(push.signature, None);
}

#[tokio::test]
async fn test_denied_subscription_notifies_the_callback() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let subscriber = TestSubscriber::start(true).await;
    let topic = server.url("/feeds/alice.atom");

    server.backend.deny(topic.clone(), "rate-limited").await;
    subscribe(&server, &subscriber, &topic, "", "300").await;

    let denial = subscriber.wait_for_mode("denied").await;
    assert_eq!(denial.get("hub.reason").map(String::as_str), Some("rate-limited"));
    assert_eq!(denial.get("hub.topic").map(String::as_str), Some(topic.as_str()));

    // Nothing was installed and no backend subscription is live.
    assert!(!server.backend.is_subscribed(&topic).await);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), changes.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_challenge_mismatch_aborts_the_subscription() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let mut subscriber = TestSubscriber::start(false).await;
    let topic = server.url("/feeds/alice.atom");

    subscribe(&server, &subscriber, &topic, "", "300").await;
    subscriber.wait_for_mode("subscribe").await;

    // No commit: the state hook stays silent and notifications go nowhere.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), changes.recv())
            .await
            .is_err()
    );
    server.backend.publish(sample_feed(&topic, &server.url("/hub"))).await;
    assert!(subscriber.no_push(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_lease_expiry_unregisters_the_callback() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let topic = server.url("/feeds/alice.atom");
    let callback = "http://127.0.0.1:1/webhook";

    let lease_end = chrono::Utc::now() + chrono::Duration::milliseconds(150);
    server
        .state
        .publisher
        .register(&topic, callback, "s3cret", lease_end)
        .await
        .unwrap();

    // Register commits without verification and reports the lease end.
    let installed = next_state_change(&mut changes).await;
    assert_eq!(installed.callback, callback);
    assert!(installed.lease_end.is_some());
    assert!(server.backend.is_subscribed(&topic).await);

    // Expiry reports a zero lease end exactly once and tears the topic down.
    let expired = next_state_change(&mut changes).await;
    assert_eq!(expired.callback, callback);
    assert_eq!(expired.lease_end, None);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), changes.recv())
            .await
            .is_err()
    );

    assert!(!server.backend.is_subscribed(&topic).await);
    assert!(!server.backend.publish(sample_feed(&topic, &server.url("/hub"))).await);
}

#[tokio::test]
async fn test_expired_register_is_a_no_op() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let topic = server.url("/feeds/alice.atom");

    let lease_end = chrono::Utc::now() - chrono::Duration::seconds(10);
    server
        .state
        .publisher
        .register(&topic, "http://127.0.0.1:1/webhook", "", lease_end)
        .await
        .unwrap();

    assert!(!server.backend.is_subscribed(&topic).await);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), changes.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unsubscribe_round_trip() {
    let (server, mut changes) = TestServer::with_state_hook().await;
    let subscriber = TestSubscriber::start(true).await;
    let topic = server.url("/feeds/alice.atom");

    subscribe(&server, &subscriber, &topic, "", "300").await;
    next_state_change(&mut changes).await;
    assert!(server.backend.is_subscribed(&topic).await);

    let response = server
        .client
        .post(server.url("/hub"))
        .form(&[
            ("hub.mode", "unsubscribe"),
            ("hub.callback", subscriber.callback_url.as_str()),
            ("hub.topic", topic.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let verification = subscriber.wait_for_mode("unsubscribe").await;
    assert!(verification.contains_key("hub.challenge"));

    let removed = next_state_change(&mut changes).await;
    assert_eq!(removed.lease_end, None);
    assert!(!server.backend.is_subscribed(&topic).await);
}

#[tokio::test]
async fn test_hub_rejects_malformed_requests() {
    let server = TestServer::new().await;

    // Invalid mode.
    let response = server
        .client
        .post(server.url("/hub"))
        .form(&[
            ("hub.mode", "publish"),
            ("hub.callback", "http://127.0.0.1:1/webhook"),
            ("hub.topic", "http://example.com/t"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Over-long secret.
    let response = server
        .client
        .post(server.url("/hub"))
        .form(&[
            ("hub.mode", "subscribe"),
            ("hub.callback", "http://127.0.0.1:1/webhook"),
            ("hub.topic", "http://example.com/t"),
            ("hub.secret", "x".repeat(201).as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Wrong method.
    let response = server.client.get(server.url("/hub")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}
