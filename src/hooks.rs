//! Message hooks.
//!
//! A [`MessageHook`] is a small capability interface a transport drives for
//! every message it moves: inbound events, inbound meta replies, and
//! outbound meta requests. Independent hooks compose in an ordered
//! [`HookChain`] rather than through an inheritance-style adapter; each
//! callback returns whether processing should continue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::json;

use crate::message::{MetaMessage, TopicEvent, meta};
use crate::replay::{ReplayStore, normalize_topic};

/// Hook points a transport drives while moving messages.
///
/// All callbacks default to pass-through so implementations override only
/// the points they care about.
pub trait MessageHook: Send + Sync + 'static {
    /// An application event arrived. Runs before the event is forwarded to
    /// any consumer.
    fn on_receive(&self, event: &TopicEvent) -> bool {
        let _ = event;
        true
    }

    /// A meta reply arrived (handshake, connect poll, subscribe ack, ...).
    fn on_receive_meta(&self, message: &MetaMessage) -> bool {
        let _ = message;
        true
    }

    /// A meta request is about to go out. May mutate the message, e.g. to
    /// attach extension fields.
    fn on_send_meta(&self, message: &mut MetaMessage) -> bool {
        let _ = message;
        true
    }
}

/// An ordered list of hooks, invoked in registration order.
///
/// Transports hold one of these and feed every message through it; a hook
/// returning `false` stops the chain and vetoes further processing of that
/// message.
#[derive(Default)]
pub struct HookChain {
    hooks: RwLock<Vec<Arc<dyn MessageHook>>>,
}

impl HookChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn MessageHook>) {
        // Recoverable: Vec push has no inconsistent intermediate state.
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    fn snapshot(&self) -> Vec<Arc<dyn MessageHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn receive(&self, event: &TopicEvent) -> bool {
        self.snapshot().iter().all(|hook| hook.on_receive(event))
    }

    pub fn receive_meta(&self, message: &MetaMessage) -> bool {
        self.snapshot()
            .iter()
            .all(|hook| hook.on_receive_meta(message))
    }

    pub fn send_meta(&self, message: &mut MetaMessage) -> bool {
        for hook in self.snapshot() {
            if !hook.on_send_meta(message) {
                return false;
            }
        }
        true
    }
}

const REPLAY_EXTENSION: &str = "replay";

/// Replay-position tracking hook.
///
/// Advertises replay support in the outgoing handshake, records whether the
/// server supports it, and keeps the [`ReplayStore`] cursor for a topic in
/// sync with the replay position of every delivered event. The cursor write
/// happens before the event reaches the consumer, so a resubscribe decision
/// always sees a position at least as fresh as the last delivered event.
pub struct ReplayHook {
    store: Arc<ReplayStore>,
    supported: AtomicBool,
}

impl ReplayHook {
    #[must_use]
    pub fn new(store: Arc<ReplayStore>) -> Self {
        Self {
            store,
            supported: AtomicBool::new(false),
        }
    }

    /// Whether the server advertised replay support on the last handshake.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }
}

impl MessageHook for ReplayHook {
    fn on_receive(&self, event: &TopicEvent) -> bool {
        if self.is_supported()
            && let Some(position) = event.replay_id
        {
            self.store.put(&normalize_topic(&event.channel), position);
        }
        true
    }

    fn on_receive_meta(&self, message: &MetaMessage) -> bool {
        if message.channel == meta::HANDSHAKE {
            self.supported
                .store(message.replay_supported(), Ordering::Release);
        }
        true
    }

    fn on_send_meta(&self, message: &mut MetaMessage) -> bool {
        if message.channel == meta::HANDSHAKE {
            message
                .ext_object()
                .insert(REPLAY_EXTENSION.to_owned(), json!(true));
        }
        true
    }
}
