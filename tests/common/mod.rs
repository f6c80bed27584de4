#![allow(dead_code)]
//! Common test utilities for end-to-end tests: an in-process server and a
//! scripted subscriber that speaks the verification/notification contract.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};

use salmonrun::backend::InMemory;
use salmonrun::config::{AppConfig, HubConfig, LoggingConfig, ServerConfig};
use salmonrun::hub::{Publisher, SubscriptionStateFn};
use salmonrun::{AppState, build_router};

pub const WAIT: Duration = Duration::from_secs(5);

/// A committed subscription state change observed through the hook.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub topic: String,
    pub callback: String,
    pub secret: String,
    pub lease_end: Option<DateTime<Utc>>,
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub backend: Arc<InMemory>,
    pub state: AppState<InMemory>,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::start(None).await
    }

    /// Create a test server whose publisher reports state changes onto the
    /// returned channel.
    pub async fn with_state_hook() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let hook: SubscriptionStateFn = Arc::new(move |topic, callback, secret, lease_end| {
            let _ = sender.send(StateChange {
                topic: topic.to_string(),
                callback: callback.to_string(),
                secret: secret.to_string(),
                lease_end,
            });
        });
        (Self::start(Some(hook)).await, receiver)
    }

    async fn start(hook: Option<SubscriptionStateFn>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let config = AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: local_addr.port(),
                domain: local_addr.to_string(),
                protocol: "http".to_string(),
            },
            hub: HubConfig {
                default_lease_seconds: 300,
                http_timeout_seconds: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let backend = Arc::new(InMemory::new());
        let client = reqwest::Client::new();
        let publisher = match hook {
            Some(hook) => {
                Publisher::with_subscription_state(backend.clone(), client.clone(), hook)
            }
            None => Publisher::new(backend.clone(), client.clone()),
        };
        let state = AppState {
            config: Arc::new(config),
            backend: backend.clone(),
            publisher,
            http_client: client.clone(),
        };

        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{local_addr}"),
            backend,
            state,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}

/// A notification delivered to the subscriber.
#[derive(Debug, Clone)]
pub struct Push {
    pub content_type: String,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct SubscriberState {
    echo: bool,
    pushes: mpsc::Sender<Push>,
    requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

/// A scripted remote subscriber: answers verification GETs (echoing the
/// challenge, or not) and records notification POSTs.
pub struct TestSubscriber {
    pub callback_url: String,
    pushes: mpsc::Receiver<Push>,
    requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl TestSubscriber {
    /// Starts a subscriber. When `echo` is false the verification response
    /// body is deliberately wrong.
    pub async fn start(echo: bool) -> Self {
        let (pushes_tx, pushes_rx) = mpsc::channel(16);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let state = SubscriberState {
            echo,
            pushes: pushes_tx,
            requests: requests.clone(),
        };
        let app = Router::new()
            .route("/webhook", get(verification).post(notification))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            callback_url: format!("http://{addr}/webhook?tag=prior"),
            pushes: pushes_rx,
            requests,
        }
    }

    /// Waits for the next notification POST.
    pub async fn next_push(&mut self) -> Push {
        tokio::time::timeout(WAIT, self.pushes.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("subscriber channel closed")
    }

    pub async fn no_push(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.pushes.recv()).await.is_err()
    }

    /// All verification/denial GETs seen so far, as query maps.
    pub async fn requests(&self) -> Vec<HashMap<String, String>> {
        self.requests.lock().await.clone()
    }

    /// Polls until a GET with the given `hub.mode` arrives.
    pub async fn wait_for_mode(&self, mode: &str) -> HashMap<String, String> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(request) = self
                .requests()
                .await
                .into_iter()
                .find(|request| request.get("hub.mode").map(String::as_str) == Some(mode))
            {
                return request;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for a hub.mode={mode} request");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn verification(
    State(state): State<SubscriberState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.requests.lock().await.push(params.clone());
    if state.echo {
        params
            .get("hub.challenge")
            .cloned()
            .unwrap_or_default()
            .into_response()
    } else {
        "wrong".into_response()
    }
}

async fn notification(
    State(state): State<SubscriberState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let push = Push {
        content_type: headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string(),
        signature: headers
            .get("x-hub-signature")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    };
    let _ = state.pushes.send(push).await;
    StatusCode::OK
}

/// Waits for the next state change from the hook.
pub async fn next_state_change(
    receiver: &mut mpsc::UnboundedReceiver<StateChange>,
) -> StateChange {
    tokio::time::timeout(WAIT, receiver.recv())
        .await
        .expect("timed out waiting for a subscription state change")
        .expect("state hook channel closed")
}

/// A feed published at `topic`, in the shape the reference subscriber
/// expects back.
pub fn sample_feed(topic: &str, hub: &str) -> salmonrun::feed::Feed {
    use salmonrun::feed::{Entry, Feed, Link, Person, Text};

    Feed {
        id: topic.to_string(),
        title: "Test notification".to_string(),
        subtitle: Some("This is just a little test.".to_string()),
        updated: Some("2017-04-23T12:00:00+00:00".to_string()),
        logo: None,
        author: Some(Person {
            id: Some(topic.to_string()),
            uri: None,
            name: "Test subject #42".to_string(),
            email: None,
            object_type: Some("http://activitystrea.ms/schema/1.0/person".to_string()),
        }),
        links: vec![
            Link {
                rel: "self".to_string(),
                media_type: Some("application/atom+xml".to_string()),
                href: topic.to_string(),
            },
            Link {
                rel: "hub".to_string(),
                media_type: None,
                href: hub.to_string(),
            },
        ],
        entries: vec![Entry {
            id: "tag:localhost,2017-04-23:objectId=3865264:objectType=Status".to_string(),
            title: "My first post ever".to_string(),
            links: Vec::new(),
            published: Some("2017-04-23T12:00:00+00:00".to_string()),
            updated: Some("2017-04-23T12:00:00+00:00".to_string()),
            author: None,
            summary: None,
            content: Some(Text {
                media_type: Some("text/html".to_string()),
                body: "Hello World!".to_string(),
            }),
            object_type: Some("http://activitystrea.ms/schema/1.0/note".to_string()),
            verb: Some("http://activitystrea.ms/schema/1.0/post".to_string()),
            in_reply_to: None,
        }],
    }
}
