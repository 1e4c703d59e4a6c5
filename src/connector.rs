//! The connection/subscription lifecycle manager.
//!
//! One [`Connector`] owns one long-poll session at a time. It drives the
//! state machine `Stopped -> Connecting -> Connected`, keeps the
//! subscription registry and replay cursors consistent across reconnects,
//! and recovers from transport failures and session expiry within a
//! bounded attempt budget.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use crate::auth::{AuthClassifier, AuthState, RecoverySignal, TokenProvider};
use crate::config::Config;
use crate::error::{
    AlreadySubscribed, CannotSubscribe, ConnectFailure, Error, Kind, NotRunning,
    ReconnectExhausted,
};
use crate::hooks::ReplayHook;
use crate::keepalive::KeepAlive;
use crate::message::{MetaMessage, TopicEvent, meta};
use crate::replay::{REPLAY_FROM_EARLIEST, REPLAY_FROM_TIP, ReplayStore, normalize_topic};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transport::Transport;
use crate::{Result, auth};

/// Lifecycle state of a [`Connector`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectorState {
    /// No transport session exists.
    Stopped,
    /// A connect or reconnect sequence is in flight.
    Connecting,
    /// A handshaken long-poll session is live.
    Connected,
}

impl ConnectorState {
    /// Check if a session is currently live.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Observer for meta-channel traffic, registered through
/// [`Connector::add_listener`].
///
/// This is the diagnostics seam: failure observers, protocol loggers, and
/// similar forwarders plug in here and stay out of the connector core.
/// Implementations must not block; they run on the dispatch task.
pub trait MetaListener: Send + Sync + 'static {
    fn on_message(&self, message: &MetaMessage);
}

/// Client session manager for a replayable pub/sub event stream.
///
/// Cheap to clone; all clones share the same session, registry, and replay
/// cursors.
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use replay_stream_client::auth::StaticToken;
/// use replay_stream_client::{Config, Connector};
/// use url::Url;
///
/// # async fn example(transport: Arc<dyn replay_stream_client::transport::Transport>) -> anyhow::Result<()> {
/// let config = Config::builder()
///     .endpoint(Url::parse("https://stream.example.com/cometd/43.0")?)
///     .build();
/// let connector = Connector::new(config, transport, Arc::new(StaticToken::new("00Dx...")));
///
/// connector.start().await?;
/// let subscription = connector
///     .subscribe_earliest("/topic/orders", |event| println!("{event:?}"))
///     .await?;
///
/// connector.cancel(&subscription).await;
/// connector.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    config: Config,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    registry: SubscriptionRegistry,
    replay: Arc<ReplayStore>,
    auth: Arc<AuthState>,
    /// Run flag: the start/stop idempotence guard. Exactly one
    /// connect/reconnect sequence holds `true` at a time.
    running: AtomicBool,
    state_tx: watch::Sender<ConnectorState>,
    /// Connect-cycle generation. Bumped by every connect; stale keep-alive
    /// timers and superseded reconnect loops observe the mismatch and
    /// retire.
    generation: Arc<AtomicU64>,
    hooks_installed: AtomicBool,
    keepalive: Mutex<Option<KeepAlive>>,
    listeners: RwLock<Vec<(String, Arc<dyn MetaListener>)>>,
    signal_tx: mpsc::UnboundedSender<RecoverySignal>,
}

impl Connector {
    /// Create a connector over the given transport and token provider.
    ///
    /// Must be called within a tokio runtime: the connector spawns its
    /// dispatch tasks here.
    #[must_use]
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectorState::Stopped);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConnectorInner {
            config,
            transport,
            tokens,
            registry: SubscriptionRegistry::new(),
            replay: Arc::new(ReplayStore::new()),
            auth: Arc::new(AuthState::new()),
            running: AtomicBool::new(false),
            state_tx,
            generation: Arc::new(AtomicU64::new(0)),
            hooks_installed: AtomicBool::new(false),
            keepalive: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            signal_tx,
        });

        Self::spawn_event_dispatch(&inner);
        Self::spawn_meta_dispatch(&inner);
        Self::spawn_signal_handler(&inner, signal_rx);

        Self { inner }
    }

    /// Create a connector that authenticates with a fixed bearer token.
    #[must_use]
    pub fn with_bearer_token<S: Into<String>>(
        config: Config,
        transport: Arc<dyn Transport>,
        token: S,
    ) -> Self {
        Self::new(config, transport, Arc::new(auth::StaticToken::new(token)))
    }

    /// Start the connector.
    ///
    /// Idempotent: if already running, returns `Ok(true)` immediately and
    /// performs no transport action. Otherwise initializes the transport,
    /// performs a handshake, arms the keep-alive timer, and resubscribes
    /// any registrations that survived a previous `stop`.
    ///
    /// # Errors
    ///
    /// [`Kind::TransportStart`] if the transport cannot be initialized,
    /// [`Kind::Connect`] if the handshake is rejected. Either way the run
    /// flag is reset so a later `start` may retry.
    pub async fn start(&self) -> Result<bool> {
        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(true);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %inner.config.endpoint, "starting connector");

        // A fresh lifetime forgets observed replay positions; surviving
        // registrations restart from their originally requested ones.
        inner.reset_cursors();
        inner.set_state(ConnectorState::Connecting);

        if let Err(e) = inner.connect_session().await {
            inner.running.store(false, Ordering::Release);
            inner.cancel_keepalive();
            inner.transport.stop().await;
            inner.set_state(ConnectorState::Stopped);
            return Err(e);
        }

        if let Err(e) = inner.resubscribe_all().await {
            inner.stop_session().await;
            return Err(e);
        }

        Ok(true)
    }

    /// Stop the connector.
    ///
    /// Idempotent. Cancels keep-alive, disconnects and releases the
    /// transport, and transitions to `Stopped`. Subscription registrations
    /// are kept so a later `start` resumes them.
    pub async fn stop(&self) {
        self.inner.stop_session().await;
    }

    /// Subscribe to a topic, receiving events after the `replay_from`
    /// position.
    ///
    /// The consumer runs on the connector's dispatch task for every event
    /// delivered on the topic; it must not block.
    ///
    /// # Errors
    ///
    /// [`Kind::NotRunning`] before `start`; [`Kind::AlreadySubscribed`] if
    /// the normalized topic already has a subscription;
    /// [`Kind::Subscribe`] when the server rejects or never acknowledges
    /// the request, carrying endpoint, topic, requested position, and the
    /// server error.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        replay_from: i64,
        consumer: F,
    ) -> Result<Arc<Subscription>>
    where
        F: Fn(TopicEvent) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return Err(NotRunning {
                endpoint: inner.config.endpoint.clone(),
            }
            .into());
        }

        let topic = topic.trim_end_matches('/');
        let key = normalize_topic(topic);
        if !inner.replay.insert_if_absent(&key, replay_from) {
            return Err(AlreadySubscribed {
                topic: topic.to_owned(),
                endpoint: inner.config.endpoint.clone(),
            }
            .into());
        }

        let subscription = Arc::new(Subscription::new(
            topic.to_owned(),
            key.clone(),
            replay_from,
            Arc::new(consumer),
            Arc::clone(&inner.replay),
        ));
        inner.registry.insert(Arc::clone(&subscription));

        let reject = |error: String| -> Error {
            inner.replay.remove(&key);
            inner.registry.remove(&key);
            CannotSubscribe {
                endpoint: inner.config.endpoint.clone(),
                topic: topic.to_owned(),
                replay_from,
                error,
            }
            .into()
        };

        let ack = match timeout(
            inner.config.max_network_delay,
            inner
                .transport
                .subscribe(subscription.topic(), subscription.replay_from()),
        )
        .await
        {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => return Err(reject(e.to_string())),
            Err(_elapsed) => return Err(reject("subscribe acknowledgment timed out".to_owned())),
        };

        if ack.successful {
            #[cfg(feature = "tracing")]
            tracing::debug!(topic, replay_from, "subscribed");
            Ok(subscription)
        } else {
            Err(reject(ack.server_error()))
        }
    }

    /// Subscribe from the earliest event position retained for the topic.
    pub async fn subscribe_earliest<F>(&self, topic: &str, consumer: F) -> Result<Arc<Subscription>>
    where
        F: Fn(TopicEvent) + Send + Sync + 'static,
    {
        self.subscribe(topic, REPLAY_FROM_EARLIEST, consumer).await
    }

    /// Subscribe to new events only.
    pub async fn subscribe_tip<F>(&self, topic: &str, consumer: F) -> Result<Arc<Subscription>>
    where
        F: Fn(TopicEvent) + Send + Sync + 'static,
    {
        self.subscribe(topic, REPLAY_FROM_TIP, consumer).await
    }

    /// Cancel a subscription.
    ///
    /// Idempotent. The replay cursor and registration are removed
    /// immediately; the protocol-level unsubscribe is issued best-effort
    /// only while connected — a cancel racing a reconnect simply drops it.
    pub async fn cancel(&self, subscription: &Subscription) {
        let inner = &self.inner;
        if !subscription.mark_cancelled() {
            return;
        }

        inner.replay.remove(subscription.key());
        inner.registry.remove(subscription.key());

        if inner.state().is_connected() {
            match inner.transport.unsubscribe(subscription.topic()).await {
                Ok(ack) if !ack.successful => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        topic = subscription.topic(),
                        error = %ack.server_error(),
                        "unsubscribe rejected"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &ack;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(topic = subscription.topic(), error = %e, "unsubscribe failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
                Ok(_) => {}
            }
        }
    }

    /// Register a meta-channel observer.
    ///
    /// `channel_pattern` is an exact meta channel (`/meta/handshake`) or a
    /// wildcard (`/meta/*`).
    pub fn add_listener<S: Into<String>>(&self, channel_pattern: S, listener: Arc<dyn MetaListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel_pattern.into(), listener));
    }

    /// The last replay position observed for a topic, if it is subscribed.
    #[must_use]
    pub fn last_replay_id(&self, topic: &str) -> Option<i64> {
        self.inner.replay.get(&normalize_topic(topic))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state().is_connected()
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectorState {
        self.inner.state()
    }

    /// Subscribe to lifecycle state changes.
    ///
    /// Useful for observing background reconnects — attempt exhaustion is
    /// not delivered to any prior call, only to this channel, logs, and
    /// [`is_running`](Connector::is_running).
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state_tx.subscribe()
    }

    fn spawn_event_dispatch(inner: &Arc<ConnectorInner>) {
        let mut events = inner.transport.events();
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.dispatch_event(event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(missed, "event dispatch lagged");
                        #[cfg(not(feature = "tracing"))]
                        let _ = missed;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_meta_dispatch(inner: &Arc<ConnectorInner>) {
        let mut meta_events = inner.transport.meta_events();
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            loop {
                match meta_events.recv().await {
                    Ok(message) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.notify_listeners(&message);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(missed, "meta dispatch lagged");
                        #[cfg(not(feature = "tracing"))]
                        let _ = missed;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_signal_handler(
        inner: &Arc<ConnectorInner>,
        mut signals: mpsc::UnboundedReceiver<RecoverySignal>,
    ) {
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match signal {
                    RecoverySignal::AuthExpired => {
                        // Only a live session can expire; failures during a
                        // connect sequence are handled by that sequence.
                        if inner.state() != ConnectorState::Connected {
                            continue;
                        }
                        #[cfg(feature = "tracing")]
                        tracing::warn!("session expired; reconnecting with a fresh token");
                        inner.stop_session().await;
                        if inner
                            .running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            inner.set_state(ConnectorState::Connecting);
                            tokio::spawn(Arc::clone(&inner).run_reconnect());
                        }
                    }
                    RecoverySignal::TransportFailure => {
                        if inner.transition(ConnectorState::Connected, ConnectorState::Connecting) {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("transport failure; reconnecting");
                            inner.cancel_keepalive();
                            tokio::spawn(Arc::clone(&inner).run_reconnect());
                        }
                    }
                }
            }
        });
    }
}

impl ConnectorInner {
    fn state(&self) -> ConnectorState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectorState) {
        _ = self.state_tx.send_replace(state);
    }

    /// Compare-and-set on the lifecycle state.
    fn transition(&self, from: ConnectorState, to: ConnectorState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// One full connect: token, transport start, hooks, handshake,
    /// keep-alive. Does not touch the run flag — callers own that.
    async fn connect_session(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let force = self.auth.take_reauthentication();
        #[cfg(feature = "tracing")]
        tracing::debug!(force_refresh = force, "acquiring bearer token");
        let token = self.tokens.fetch(force).await?;
        self.transport.set_bearer_token(token);

        self.transport
            .start()
            .await
            .map_err(|e| Error::with_source(Kind::TransportStart, e))?;

        self.install_hooks();

        let reply = timeout(
            self.config.reconnect.connect_timeout,
            self.transport.handshake(),
        )
        .await?
        .map_err(|e| {
            Error::from(ConnectFailure {
                endpoint: self.config.endpoint.clone(),
                error: e.to_string(),
            })
        })?;

        if !reply.successful {
            return Err(ConnectFailure {
                endpoint: self.config.endpoint.clone(),
                error: reply.server_error(),
            }
            .into());
        }

        self.set_state(ConnectorState::Connected);
        self.arm_keepalive(generation);

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.config.endpoint, generation, "connected");

        Ok(())
    }

    async fn resubscribe_all(&self) -> Result<()> {
        self.registry
            .resubscribe_all(
                &*self.transport,
                &self.config.endpoint,
                self.config.reconnect.resubscribe_timeout,
            )
            .await
    }

    /// Bounded reconnect: up to `max_attempts` tries of
    /// [`connect_session`](Self::connect_session), backing off between
    /// failures. Success resubscribes everything; a resubscribe failure or
    /// an exhausted budget stops the connector for good.
    async fn run_reconnect(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();
        let mut backoff: ExponentialBackoff = policy.clone().into();
        let mut expected = self.generation.load(Ordering::Acquire);

        for attempt in 1..=policy.max_attempts {
            if !self.running.load(Ordering::Acquire) {
                return; // stopped while this loop was waiting
            }
            if self.generation.load(Ordering::Acquire) != expected {
                return; // a newer connect cycle superseded this loop
            }

            #[cfg(feature = "tracing")]
            tracing::info!(attempt, max_attempts = policy.max_attempts, "reconnecting");

            match timeout(policy.connect_timeout, self.connect_session()).await {
                Ok(Ok(())) => {
                    if let Err(e) = self.resubscribe_all().await {
                        #[cfg(feature = "tracing")]
                        tracing::error!(error = %e, "resubscribe failed after reconnect; stopping");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                        self.stop_session().await;
                    }
                    return;
                }
                Ok(Err(e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
                Err(_elapsed) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, "reconnect attempt timed out");
                }
            }

            // Resync with our own generation bump before the next try and
            // release whatever the failed attempt left half-open.
            expected = self.generation.load(Ordering::Acquire);
            self.transport.stop().await;

            if attempt < policy.max_attempts
                && let Some(delay) = backoff.next_backoff()
            {
                sleep(delay).await;
            }
        }

        let exhausted = ReconnectExhausted {
            endpoint: self.config.endpoint.clone(),
            attempts: policy.max_attempts,
        };
        #[cfg(feature = "tracing")]
        tracing::error!(%exhausted, "stopping connector");
        #[cfg(not(feature = "tracing"))]
        let _ = &exhausted;
        self.stop_session().await;
    }

    async fn stop_session(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.config.endpoint, "stopping connector");

        self.cancel_keepalive();
        self.transport.disconnect().await;
        self.transport.stop().await;
        self.set_state(ConnectorState::Stopped);
    }

    fn install_hooks(&self) {
        if self
            .hooks_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.transport
                .add_hook(Arc::new(ReplayHook::new(Arc::clone(&self.replay))));
            self.transport.add_hook(Arc::new(AuthClassifier::new(
                Arc::clone(&self.auth),
                self.signal_tx.clone(),
            )));
        }
    }

    fn arm_keepalive(&self, generation: u64) {
        let keepalive = KeepAlive::arm(
            Arc::clone(&self.transport),
            self.config.keep_alive_interval,
            generation,
            Arc::clone(&self.generation),
        );
        // Dropping the previous timer cancels it.
        *self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(keepalive);
    }

    fn cancel_keepalive(&self) {
        if let Some(keepalive) = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            keepalive.cancel();
        }
    }

    fn reset_cursors(&self) {
        self.replay.clear();
        for subscription in self.registry.active() {
            self.replay
                .put(subscription.key(), subscription.requested_replay());
        }
    }

    fn dispatch_event(&self, event: TopicEvent) {
        let key = normalize_topic(&event.channel);
        if let Some(subscription) = self.registry.get(&key)
            && !subscription.is_cancelled()
        {
            subscription.consume(event);
        }
    }

    fn notify_listeners(&self, message: &MetaMessage) {
        let matching: Vec<Arc<dyn MetaListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(pattern, _)| meta::matches(pattern, &message.channel))
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in matching {
            listener.on_message(message);
        }
    }
}
