//! PubSubHubbub publisher: the broker between a notification backend and
//! remote webhook subscribers.
//!
//! The backend produces events onto per-topic channels; the publisher
//! verifies subscriber callbacks with a challenge round-trip, fans events
//! out as signed HTTP POSTs and expires callbacks when their lease runs out.

pub mod challenge;
mod publisher;

pub use publisher::{MAX_SECRET_LEN, Publisher, SubscriptionForm, SubscriptionStateFn, handle};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::sync::mpsc;

/// The hub link relation.
pub const REL_HUB: &str = "hub";

/// The updates-from link relation.
pub const REL_UPDATES_FROM: &str = "http://schemas.google.com/g/2010#updates-from";

/// Errors produced by the publisher and its backends.
#[derive(Debug, Error)]
pub enum Error {
    /// The backend declined the subscription; the reason is relayed to the
    /// subscriber on the denial callback.
    #[error("subscription denied: {0}")]
    Denied(String),

    /// The verification response did not echo the challenge.
    #[error("challenge verification failed")]
    ChallengeMismatch,

    /// A callback request completed with a non-2xx status.
    #[error("callback request failed with status {0}")]
    Status(http::StatusCode),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid callback URL: {0}")]
    Callback(#[from] url::ParseError),

    #[error("challenge generation failed: {0}")]
    Rng(#[from] rand::Error),

    #[error("event serialization failed: {0}")]
    Event(#[from] io::Error),

    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

/// A content notification produced by the backend.
///
/// The publisher never inspects the body: it records the media type,
/// serializes the event once per fan-out and posts the bytes verbatim.
pub trait Event: Send + 'static {
    /// Media type of the serialized body.
    fn media_type(&self) -> String;

    /// The topic URL this event belongs to.
    fn topic(&self) -> String;

    /// Writes the notification body.
    fn write_to(&self, writer: &mut dyn io::Write) -> io::Result<()>;
}

/// The notification source behind a publisher.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Event: Event;

    /// Starts producing events for `topic` onto `notifies`. Returning
    /// [`Error::Denied`] declines the subscription.
    async fn subscribe(
        &self,
        topic: &str,
        notifies: mpsc::Sender<Self::Event>,
    ) -> Result<(), Error>;

    /// Stops producing events onto `notifies` and drops every clone of the
    /// sender, which closes the channel and lets the fan-out worker exit.
    /// The sender was previously handed to [`Backend::subscribe`]; implementations
    /// match it with [`mpsc::Sender::same_channel`].
    async fn unsubscribe(&self, notifies: &mpsc::Sender<Self::Event>) -> Result<(), Error>;
}
