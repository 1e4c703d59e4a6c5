#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test file exercises every helper"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replay_stream_client::auth::{ExposeSecret as _, SecretString, TokenProvider};
use replay_stream_client::hooks::{HookChain, MessageHook};
use replay_stream_client::message::{MetaMessage, TopicEvent, meta};
use replay_stream_client::transport::Transport;
use replay_stream_client::{Config, ReconnectConfig, Result};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};
use url::Url;

const BROADCAST_CAPACITY: usize = 256;

pub const ENDPOINT: &str = "https://stream.example.com/cometd/43.0";

/// How one scripted meta exchange should play out.
#[derive(Debug, Clone)]
pub enum Step {
    /// Acknowledge successfully.
    Succeed,
    /// Reject with the given server error.
    Reject(String),
    /// Never answer (the caller's timeout fires first).
    Hang,
}

impl Step {
    pub fn reject(error: &str) -> Self {
        Self::Reject(error.to_owned())
    }
}

/// In-process scriptable transport.
///
/// Drives the hook chain exactly as the [`Transport`] contract requires:
/// inbound events and meta messages pass through the hooks before being
/// broadcast, outbound handshakes pass through `on_send_meta`. Handshake
/// and subscribe exchanges follow their scripts, defaulting to success.
pub struct MockTransport {
    hooks: HookChain,
    started: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub handshake_calls: AtomicUsize,
    start_script: Mutex<VecDeque<Step>>,
    handshake_script: Mutex<VecDeque<Step>>,
    subscribe_script: Mutex<VecDeque<Step>>,
    subscribes: Mutex<Vec<(String, i64)>>,
    unsubscribes: Mutex<Vec<String>>,
    tokens: Mutex<Vec<String>>,
    events_tx: broadcast::Sender<TopicEvent>,
    meta_tx: broadcast::Sender<MetaMessage>,
}

impl MockTransport {
    pub fn arc() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (meta_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Arc::new(Self {
            hooks: HookChain::new(),
            started: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            handshake_calls: AtomicUsize::new(0),
            start_script: Mutex::new(VecDeque::new()),
            handshake_script: Mutex::new(VecDeque::new()),
            subscribe_script: Mutex::new(VecDeque::new()),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            events_tx,
            meta_tx,
        })
    }

    pub fn script_starts<I: IntoIterator<Item = Step>>(&self, steps: I) {
        self.start_script.lock().unwrap().extend(steps);
    }

    pub fn script_handshakes<I: IntoIterator<Item = Step>>(&self, steps: I) {
        self.handshake_script.lock().unwrap().extend(steps);
    }

    pub fn script_subscribes<I: IntoIterator<Item = Step>>(&self, steps: I) {
        self.subscribe_script.lock().unwrap().extend(steps);
    }

    /// Deliver an application event, hooks first, exactly as a live
    /// transport would.
    pub fn emit_event(&self, event: TopicEvent) {
        self.hooks.receive(&event);
        drop(self.events_tx.send(event));
    }

    pub fn emit_replay_event(&self, topic: &str, replay_id: i64) {
        self.emit_event(
            TopicEvent::builder()
                .channel(topic)
                .replay_id(replay_id)
                .payload(json!({"seq": replay_id}))
                .build(),
        );
    }

    /// Deliver a meta message, hooks first.
    pub fn emit_meta(&self, message: MetaMessage) {
        self.hooks.receive_meta(&message);
        drop(self.meta_tx.send(message));
    }

    /// The server dropped the long-poll session.
    pub fn fail_connection(&self) {
        self.emit_meta(MetaMessage::failure(
            meta::CONNECT,
            "Connection to the server was lost",
        ));
    }

    /// The server invalidated the session's credentials.
    pub fn expire_session(&self) {
        self.emit_meta(MetaMessage::failure(
            meta::CONNECT,
            "401::Authentication invalid",
        ));
    }

    /// Topics and replay positions of every subscribe issued so far.
    pub fn subscribe_log(&self) -> Vec<(String, i64)> {
        self.subscribes.lock().unwrap().clone()
    }

    pub fn unsubscribe_log(&self) -> Vec<String> {
        self.unsubscribes.lock().unwrap().clone()
    }

    pub fn bearer_tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn handshakes(&self) -> usize {
        self.handshake_calls.load(Ordering::SeqCst)
    }

    fn next_step(script: &Mutex<VecDeque<Step>>) -> Step {
        script.lock().unwrap().pop_front().unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        match Self::next_step(&self.start_script) {
            Step::Succeed => {
                self.started.store(true, Ordering::SeqCst);
                Ok(())
            }
            Step::Reject(error) => Err(replay_stream_client::Error::with_source(
                replay_stream_client::error::Kind::Internal,
                std::io::Error::other(error),
            )),
            Step::Hang => {
                sleep(Duration::from_secs(3600)).await;
                unreachable!("hung start should be cancelled by a timeout")
            }
        }
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
    }

    async fn handshake(&self) -> Result<MetaMessage> {
        self.handshake_calls.fetch_add(1, Ordering::SeqCst);

        let mut outgoing = MetaMessage::success(meta::HANDSHAKE);
        self.hooks.send_meta(&mut outgoing);

        let reply = match Self::next_step(&self.handshake_script) {
            Step::Succeed => {
                let mut reply = MetaMessage::success(meta::HANDSHAKE);
                reply
                    .ext_object()
                    .insert("replay".to_owned(), json!(outgoing.replay_supported()));
                reply
            }
            Step::Reject(error) => MetaMessage::failure(meta::HANDSHAKE, error),
            Step::Hang => {
                sleep(Duration::from_secs(3600)).await;
                unreachable!("hung handshake should be cancelled by a timeout")
            }
        };

        self.emit_meta(reply.clone());
        Ok(reply)
    }

    async fn subscribe(&self, topic: &str, replay_from: i64) -> Result<MetaMessage> {
        self.subscribes
            .lock()
            .unwrap()
            .push((topic.to_owned(), replay_from));

        let reply = match Self::next_step(&self.subscribe_script) {
            Step::Succeed => MetaMessage::success(meta::SUBSCRIBE),
            Step::Reject(error) => MetaMessage::failure(meta::SUBSCRIBE, error),
            Step::Hang => {
                sleep(Duration::from_secs(3600)).await;
                unreachable!("hung subscribe should be cancelled by a timeout")
            }
        };

        self.emit_meta(reply.clone());
        Ok(reply)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<MetaMessage> {
        self.unsubscribes.lock().unwrap().push(topic.to_owned());
        let reply = MetaMessage::success(meta::UNSUBSCRIBE);
        self.emit_meta(reply.clone());
        Ok(reply)
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn set_bearer_token(&self, token: SecretString) {
        self.tokens
            .lock()
            .unwrap()
            .push(token.expose_secret().to_owned());
    }

    fn add_hook(&self, hook: Arc<dyn MessageHook>) {
        self.hooks.add(hook);
    }

    fn events(&self) -> broadcast::Receiver<TopicEvent> {
        self.events_tx.subscribe()
    }

    fn meta_events(&self) -> broadcast::Receiver<MetaMessage> {
        self.meta_tx.subscribe()
    }
}

/// Token provider that counts plain and forced fetches.
#[derive(Default)]
pub struct CountingTokens {
    pub fetches: AtomicUsize,
    pub forced: AtomicUsize,
}

impl CountingTokens {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn fetch(&self, force_refresh: bool) -> Result<SecretString> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SecretString::from(format!("session-token-{n}")))
    }
}

/// Config with test-sized timings: tight timeouts, near-instant backoff.
pub fn test_config() -> Config {
    let mut reconnect = ReconnectConfig::default();
    reconnect.max_attempts = 3;
    reconnect.connect_timeout = Duration::from_millis(250);
    reconnect.resubscribe_timeout = Duration::from_millis(250);
    reconnect.initial_backoff = Duration::from_millis(10);
    reconnect.max_backoff = Duration::from_millis(40);

    Config::builder()
        .endpoint(Url::parse(ENDPOINT).unwrap())
        .reconnect(reconnect)
        .build()
}

/// Poll `condition` until it holds or `wait` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
