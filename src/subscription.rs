#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

//! Subscriptions and the registry that owns them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;
use url::Url;

use crate::Result;
use crate::error::CannotSubscribe;
use crate::message::TopicEvent;
use crate::replay::ReplayStore;
use crate::transport::Transport;

/// Caller-supplied callback invoked with every event delivered on a
/// subscribed topic.
///
/// Consumers run on the connector's dispatch task and must not block;
/// hand heavier work to a separate task.
pub type EventConsumer = Arc<dyn Fn(TopicEvent) + Send + Sync>;

/// A live subscription to a topic.
///
/// Returned by the connector's subscribe operations; pass it back to
/// `cancel` to end delivery. The handle stays valid across reconnects —
/// the registry re-issues the subscribe from the current replay cursor.
pub struct Subscription {
    topic: String,
    key: String,
    requested_replay: i64,
    consumer: EventConsumer,
    cancelled: AtomicBool,
    replay: Arc<ReplayStore>,
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        key: String,
        requested_replay: i64,
        consumer: EventConsumer,
        replay: Arc<ReplayStore>,
    ) -> Self {
        Self {
            topic,
            key,
            requested_replay,
            consumer,
            cancelled: AtomicBool::new(false),
            replay,
        }
    }

    /// The raw topic, query string intact.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The normalized key this subscription is registered under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The replay position originally requested at subscribe time.
    #[must_use]
    pub fn requested_replay(&self) -> i64 {
        self.requested_replay
    }

    /// The position a (re)subscribe would use right now: the current cursor
    /// when one exists, otherwise the originally requested position.
    #[must_use]
    pub fn replay_from(&self) -> i64 {
        self.replay.get(&self.key).unwrap_or(self.requested_replay)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Flip the cancelled flag. Returns `false` if it was already set, which
    /// is what makes cancellation idempotent.
    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn consume(&self, event: TopicEvent) {
        (self.consumer)(event);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("replay_from", &self.replay_from())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscription [{}:{}]", self.topic, self.replay_from())
    }
}

/// Tracks active subscriptions by normalized topic key.
///
/// Registrations survive `stop` so a later `start` resumes them; only
/// `cancel` removes an entry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: Arc<Subscription>) {
        self.subscriptions
            .insert(subscription.key().to_owned(), subscription);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.remove(key).map(|(_, sub)| sub)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All registered, non-cancelled subscriptions.
    #[must_use]
    pub fn active(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .filter(|entry| !entry.value().is_cancelled())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Re-issue the protocol-level subscribe for every active registration,
    /// each from its *current* replay cursor — not the originally requested
    /// sentinel — so delivery resumes exactly where it left off.
    ///
    /// Fail-fast: the first rejection or timeout aborts the pass, and the
    /// caller treats that as fatal for the whole reconnect. No
    /// partial-subscription state is tolerated.
    pub async fn resubscribe_all(
        &self,
        transport: &dyn Transport,
        endpoint: &Url,
        per_topic_timeout: Duration,
    ) -> Result<()> {
        for subscription in self.active() {
            let replay_from = subscription.replay_from();
            #[cfg(feature = "tracing")]
            tracing::debug!(topic = subscription.topic(), replay_from, "resubscribing");

            let reject = |error: String| CannotSubscribe {
                endpoint: endpoint.clone(),
                topic: subscription.topic().to_owned(),
                replay_from,
                error,
            };

            let ack = timeout(
                per_topic_timeout,
                transport.subscribe(subscription.topic(), replay_from),
            )
            .await
            .map_err(|_elapsed| reject("resubscribe timed out".to_owned()))?
            .map_err(|e| reject(e.to_string()))?;

            if !ack.successful {
                return Err(reject(ack.server_error()).into());
            }
        }
        Ok(())
    }
}
