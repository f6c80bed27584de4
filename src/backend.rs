//! In-memory backend: the whole server interface against in-process state.
//!
//! Suitable for single-instance deployments that keep their feeds in memory,
//! and used throughout the integration tests as the scripted peer.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};

use crate::codec::PublicKey;
use crate::feed::{Entry, Feed};
use crate::hub::{self, Event as _};
use crate::xrd::{self, Resource, webfinger};
use crate::{Backend, pki};

/// An in-memory [`Backend`] implementation.
#[derive(Default)]
pub struct InMemory {
    topics: Mutex<HashMap<String, mpsc::Sender<Feed>>>,
    feeds: Mutex<HashMap<String, Feed>>,
    resources: Mutex<HashMap<String, Resource>>,
    keys: Mutex<HashMap<String, PublicKey>>,
    denials: Mutex<HashMap<String, String>>,
    notified: Mutex<Vec<Entry>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `feed` at the given topic (the feed endpoint key).
    pub async fn insert_feed(&self, topic: impl Into<String>, feed: Feed) {
        self.feeds.lock().await.insert(topic.into(), feed);
    }

    /// Serves a descriptor for `uri` over WebFinger.
    pub async fn insert_resource(&self, uri: impl Into<String>, resource: Resource) {
        self.resources.lock().await.insert(uri.into(), resource);
    }

    /// Registers the public key for an account URI.
    pub async fn insert_public_key(&self, account_uri: impl Into<String>, key: PublicKey) {
        self.keys.lock().await.insert(account_uri.into(), key);
    }

    /// Makes future subscriptions to `topic` fail with a denial.
    pub async fn deny(&self, topic: impl Into<String>, reason: impl Into<String>) {
        self.denials.lock().await.insert(topic.into(), reason.into());
    }

    /// Pushes an update onto the feed's topic channel. Returns false when
    /// nothing is subscribed to the topic (or the channel already closed).
    pub async fn publish(&self, feed: Feed) -> bool {
        let topic = feed.topic();
        let sender = { self.topics.lock().await.get(&topic).cloned() };
        match sender {
            Some(sender) => sender.send(feed).await.is_ok(),
            None => false,
        }
    }

    /// Whether a hub subscription is live for `topic`.
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().await.contains_key(topic)
    }

    /// Entries delivered through the salmon endpoint so far.
    pub async fn notified(&self) -> Vec<Entry> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl hub::Backend for InMemory {
    type Event = Feed;

    async fn subscribe(
        &self,
        topic: &str,
        notifies: mpsc::Sender<Feed>,
    ) -> Result<(), hub::Error> {
        if let Some(reason) = self.denials.lock().await.get(topic) {
            return Err(hub::Error::Denied(reason.clone()));
        }
        self.topics.lock().await.insert(topic.to_string(), notifies);
        Ok(())
    }

    async fn unsubscribe(&self, notifies: &mpsc::Sender<Feed>) -> Result<(), hub::Error> {
        self.topics
            .lock()
            .await
            .retain(|_, sender| !sender.same_channel(notifies));
        Ok(())
    }
}

#[async_trait]
impl crate::salmon::Backend for InMemory {
    async fn public_key(&self, account_uri: &str) -> Result<PublicKey, pki::Error> {
        self.keys
            .lock()
            .await
            .get(account_uri)
            .cloned()
            .ok_or(pki::Error::MissingKeyLink)
    }

    async fn notify(&self, entry: &Entry) -> Result<(), anyhow::Error> {
        self.notified.lock().await.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl webfinger::Backend for InMemory {
    async fn resource(&self, uri: &str, _rels: &[String]) -> Result<Resource, xrd::Error> {
        self.resources
            .lock()
            .await
            .get(uri)
            .cloned()
            .ok_or(xrd::Error::NoSuchResource)
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn feed(&self, topic: &str) -> Result<Feed, anyhow::Error> {
        self.feeds
            .lock()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no feed for topic {topic}"))
    }
}
