//! The publisher: per-topic subscription state, callback verification,
//! fan-out delivery and lease expiry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Form;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header;
use serde::Deserialize;
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use super::{Backend, Error, Event, challenge};
use crate::error::AppError;
use crate::AppState;

/// Maximum accepted length of a subscriber-provided secret, in bytes.
pub const MAX_SECRET_LEN: usize = 200;

/// Capacity of the per-topic notification channel between the backend and
/// the fan-out worker.
const NOTIFY_BUFFER: usize = 16;

/// Observer for committed subscription state changes, called with
/// `(topic, callback, secret, lease_end)`. A `None` lease end means the
/// subscription ended. External persistence hangs off this hook.
pub type SubscriptionStateFn = Arc<dyn Fn(&str, &str, &str, Option<DateTime<Utc>>) + Send + Sync>;

/// A publisher distributes content notifications to verified callbacks.
///
/// Cloning is cheap and clones share all state.
pub struct Publisher<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Publisher<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    client: reqwest::Client,
    topics: Mutex<HashMap<String, TopicEntry<B::Event>>>,
    subscription_state: Option<SubscriptionStateFn>,
}

struct TopicEntry<E> {
    subscription: Arc<Subscription>,
    /// The sender handed to the backend on subscribe. Dropping the entry
    /// releases the publisher's clone; once the backend drops its own on
    /// unsubscribe, the channel closes and the fan-out worker exits.
    notifies: mpsc::Sender<E>,
}

struct Subscription {
    callbacks: Mutex<HashMap<String, Callback>>,
}

struct Callback {
    secret: String,
    timer: JoinHandle<()>,
}

impl<B: Backend> Publisher<B> {
    pub fn new(backend: Arc<B>, client: reqwest::Client) -> Self {
        Self::build(backend, client, None)
    }

    /// Creates a publisher whose committed state changes are reported to
    /// `hook`.
    pub fn with_subscription_state(
        backend: Arc<B>,
        client: reqwest::Client,
        hook: SubscriptionStateFn,
    ) -> Self {
        Self::build(backend, client, Some(hook))
    }

    fn build(
        backend: Arc<B>,
        client: reqwest::Client,
        subscription_state: Option<SubscriptionStateFn>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                client,
                topics: Mutex::new(HashMap::new()),
                subscription_state,
            }),
        }
    }

    /// Processes a subscribe request: verify the callback with a challenge
    /// round-trip, then commit it with a fresh lease.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: &str,
        secret: &str,
        lease: Duration,
    ) -> Result<(), Error> {
        let callback_url = Url::parse(callback)?;

        let subscription = match self.subscribe_if_not_exist(topic).await {
            Ok(subscription) => subscription,
            Err(Error::Denied(reason)) => {
                return self.denied(&callback_url, topic, &reason).await;
            }
            Err(error) => return Err(error),
        };

        self.verify(
            &callback_url,
            &[
                ("hub.mode", "subscribe"),
                ("hub.topic", topic),
                ("hub.lease_seconds", &lease.as_secs().to_string()),
            ],
        )
        .await?;

        self.install(&subscription, topic, callback, secret, lease).await;
        self.notify_state(topic, callback, secret, Some(lease_end(lease)));
        Ok(())
    }

    /// Processes an unsubscribe request: verify intent with a challenge
    /// round-trip, then unregister the callback.
    pub async fn unsubscribe(&self, topic: &str, callback: &str) -> Result<(), Error> {
        let callback_url = Url::parse(callback)?;

        let registered = {
            let topics = self.inner.topics.lock().await;
            match topics.get(topic) {
                Some(entry) => entry.subscription.callbacks.lock().await.contains_key(callback),
                None => false,
            }
        };
        if !registered {
            return Ok(());
        }

        self.verify(
            &callback_url,
            &[("hub.mode", "unsubscribe"), ("hub.topic", topic)],
        )
        .await?;

        self.unregister(topic, callback).await
    }

    /// Restores a subscription without verification, typically while
    /// replaying persisted state at startup. Leases that already ended are
    /// ignored.
    pub async fn register(
        &self,
        topic: &str,
        callback: &str,
        secret: &str,
        lease_end: DateTime<Utc>,
    ) -> Result<(), Error> {
        let lease = match (lease_end - Utc::now()).to_std() {
            Ok(lease) if !lease.is_zero() => lease,
            _ => return Ok(()),
        };

        let subscription = self.subscribe_if_not_exist(topic).await?;
        self.install(&subscription, topic, callback, secret, lease).await;
        self.notify_state(topic, callback, secret, Some(lease_end));
        Ok(())
    }

    /// Looks up the topic's subscription, creating it (and subscribing the
    /// backend, and starting the fan-out worker) on first use.
    ///
    /// The topic map lock is held across the backend call so that no topic
    /// ever has more than one live backend subscription. Backends must not
    /// call back into the publisher from `subscribe`/`unsubscribe`.
    async fn subscribe_if_not_exist(&self, topic: &str) -> Result<Arc<Subscription>, Error> {
        let mut topics = self.inner.topics.lock().await;
        if let Some(entry) = topics.get(topic) {
            return Ok(entry.subscription.clone());
        }

        let (notifies, receiver) = mpsc::channel(NOTIFY_BUFFER);
        let subscription = Arc::new(Subscription {
            callbacks: Mutex::new(HashMap::new()),
        });

        self.inner.backend.subscribe(topic, notifies.clone()).await?;

        topics.insert(
            topic.to_string(),
            TopicEntry {
                subscription: subscription.clone(),
                notifies,
            },
        );
        tokio::spawn(deliver_loop(
            receiver,
            subscription.clone(),
            self.inner.client.clone(),
        ));
        Ok(subscription)
    }

    /// Removes a callback, tearing the topic down when it was the last one.
    /// Idempotent: a missing topic or callback is not an error, so a racing
    /// manual unsubscribe and lease expiry cannot trip over each other.
    async fn unregister(&self, topic: &str, callback: &str) -> Result<(), Error> {
        let secret = {
            let mut topics = self.inner.topics.lock().await;
            let subscription = match topics.get(topic) {
                Some(entry) => entry.subscription.clone(),
                None => return Ok(()),
            };
            let mut callbacks = subscription.callbacks.lock().await;
            let Some(removed) = callbacks.remove(callback) else {
                return Ok(());
            };
            removed.timer.abort();

            if callbacks.is_empty() {
                if let Some(entry) = topics.remove(topic) {
                    self.inner.backend.unsubscribe(&entry.notifies).await?;
                }
            }
            removed.secret
        };

        self.notify_state(topic, callback, &secret, None);
        Ok(())
    }

    /// Commits a callback under the subscription lock, replacing any
    /// previous registration and cancelling its lease timer.
    async fn install(
        &self,
        subscription: &Subscription,
        topic: &str,
        callback: &str,
        secret: &str,
        lease: Duration,
    ) {
        let timer = self.spawn_lease_timer(topic, callback, lease);
        let mut callbacks = subscription.callbacks.lock().await;
        if let Some(previous) = callbacks.insert(
            callback.to_string(),
            Callback {
                secret: secret.to_string(),
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    fn spawn_lease_timer(&self, topic: &str, callback: &str, lease: Duration) -> JoinHandle<()> {
        let publisher = self.clone();
        let topic = topic.to_string();
        let callback = callback.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(lease).await;
            // Detached so that an abort of this timer (its own unregister
            // included) cannot interrupt a removal in progress.
            tokio::spawn(async move {
                if let Err(error) = publisher.unregister(&topic, &callback).await {
                    tracing::warn!(%error, %topic, %callback, "lease expiry failed");
                }
            });
        })
    }

    /// Challenge round-trip: GET the callback with the mode parameters plus
    /// a fresh challenge, and require a 2xx response echoing the challenge
    /// in its first bytes. The callback's own query parameters are kept.
    async fn verify(&self, callback_url: &Url, params: &[(&str, &str)]) -> Result<(), Error> {
        let challenge = challenge::generate()?;

        let mut url = callback_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in params {
                pairs.append_pair(name, value);
            }
            pairs.append_pair("hub.challenge", &challenge);
        }

        let response = self.inner.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status));
        }

        let body = response.bytes().await?;
        if body.len() < challenge.len() || &body[..challenge.len()] != challenge.as_bytes() {
            return Err(Error::ChallengeMismatch);
        }
        Ok(())
    }

    /// Relays a backend denial to the subscriber. The response is ignored.
    async fn denied(&self, callback_url: &Url, topic: &str, reason: &str) -> Result<(), Error> {
        let mut url = callback_url.clone();
        url.query_pairs_mut()
            .append_pair("hub.mode", "denied")
            .append_pair("hub.topic", topic)
            .append_pair("hub.reason", reason);

        self.inner.client.get(url).send().await?;
        Ok(())
    }

    fn notify_state(
        &self,
        topic: &str,
        callback: &str,
        secret: &str,
        lease_end: Option<DateTime<Utc>>,
    ) {
        if let Some(hook) = &self.inner.subscription_state {
            hook(topic, callback, secret, lease_end);
        }
    }
}

fn lease_end(lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| Utc::now().checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One worker per topic: serializes each event once, snapshots the callback
/// set under the subscription lock, and dispatches the POSTs on their own
/// tasks so the lock is never held across network I/O. Exits when the
/// channel closes.
async fn deliver_loop<E: Event>(
    mut notifies: mpsc::Receiver<E>,
    subscription: Arc<Subscription>,
    client: reqwest::Client,
) {
    while let Some(event) = notifies.recv().await {
        let media_type = event.media_type();
        let mut buffer = Vec::new();
        if let Err(error) = event.write_to(&mut buffer) {
            tracing::error!(%error, topic = %event.topic(), "failed to serialize notification");
            continue;
        }
        let body = Bytes::from(buffer);

        let callbacks: Vec<(String, String)> = {
            let callbacks = subscription.callbacks.lock().await;
            callbacks
                .iter()
                .map(|(url, callback)| (url.clone(), callback.secret.clone()))
                .collect()
        };

        for (callback, secret) in callbacks {
            let client = client.clone();
            let media_type = media_type.clone();
            let body = body.clone();
            tokio::spawn(async move {
                push_notification(client, callback, media_type, body, secret).await;
            });
        }
    }
}

// TODO: retry failed deliveries with backoff instead of dropping them.
async fn push_notification(
    client: reqwest::Client,
    callback: String,
    media_type: String,
    body: Bytes,
    secret: String,
) {
    let mut request = client
        .post(&callback)
        .header(header::CONTENT_TYPE, media_type)
        .body(body.clone());

    if !secret.is_empty() {
        request = request.header("X-Hub-Signature", signature_header(&secret, &body));
    }

    match request.send().await {
        Ok(response) if !response.status().is_success() => {
            tracing::warn!(
                status = %response.status(),
                %callback,
                "push notification rejected"
            );
        }
        Ok(_) => {}
        Err(error) => {
            tracing::warn!(%error, %callback, "failed to push notification");
        }
    }
}

/// `X-Hub-Signature` value: lowercase hex HMAC-SHA1 of the body under the
/// subscriber's secret.
pub(crate) fn signature_header(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Form fields of a hub subscription request.
#[derive(Debug, Deserialize)]
pub struct SubscriptionForm {
    #[serde(rename = "hub.mode", default)]
    mode: String,
    #[serde(rename = "hub.callback", default)]
    callback: String,
    #[serde(rename = "hub.topic", default)]
    topic: String,
    #[serde(rename = "hub.secret", default)]
    secret: String,
    #[serde(rename = "hub.lease_seconds", default)]
    lease_seconds: Option<String>,
}

/// POST /hub
///
/// Validates the request, answers 202 immediately and runs the verification
/// round-trip on a background task; failures there are logged and dropped.
pub async fn handle<B: crate::Backend>(
    State(state): State<AppState<B>>,
    Form(form): Form<SubscriptionForm>,
) -> Result<StatusCode, AppError> {
    if form.mode != "subscribe" && form.mode != "unsubscribe" {
        return Err(AppError::Validation("invalid hub.mode".to_string()));
    }
    if form.secret.len() > MAX_SECRET_LEN {
        return Err(AppError::Validation("hub.secret too long".to_string()));
    }

    let lease = form
        .lease_seconds
        .as_deref()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(state.config.hub.default_lease_seconds));

    let publisher = state.publisher.clone();
    tokio::spawn(async move {
        let result = match form.mode.as_str() {
            "subscribe" => {
                publisher
                    .subscribe(&form.topic, &form.callback, &form.secret, lease)
                    .await
            }
            _ => publisher.unsubscribe(&form.topic, &form.callback).await,
        };
        if let Err(error) = result {
            tracing::warn!(
                %error,
                mode = %form.mode,
                topic = %form.topic,
                callback = %form.callback,
                "hub request failed"
            );
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_header_is_hex_hmac_sha1() {
        // RFC 2202 test case 2: key "Jefe", data "what do ya want for nothing?".
        assert_eq!(
            signature_header("Jefe", b"what do ya want for nothing?"),
            "sha1=effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[test]
    fn empty_body_still_signs() {
        let header = signature_header("secret", b"");
        assert!(header.starts_with("sha1="));
        assert_eq!(header.len(), "sha1=".len() + 40);
    }
}
