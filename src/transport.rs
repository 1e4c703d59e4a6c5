//! The transport collaborator contract.
//!
//! The connector treats the wire protocol as an opaque collaborator: an
//! HTTP long-polling engine that can be started and stopped, performs
//! handshakes, and subscribes/unsubscribes channels. Implementations own
//! connection pooling, chunked responses, TLS, and proxying; the connector
//! owns nothing below this trait.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::broadcast;

use crate::Result;
use crate::hooks::MessageHook;
use crate::message::{MetaMessage, TopicEvent};

/// An HTTP long-polling pub/sub transport.
///
/// # Contract
///
/// Implementations must drive the installed [`MessageHook`]s (in
/// installation order, see [`crate::hooks::HookChain`]):
///
/// - every inbound event passes through `on_receive` **before** it is
///   broadcast on [`events`](Transport::events);
/// - every inbound meta reply — handshake results, connect polls, subscribe
///   acks — passes through `on_receive_meta` before it is returned or
///   broadcast on [`meta_events`](Transport::meta_events);
/// - every outbound meta request passes through `on_send_meta`, which may
///   attach extension fields.
///
/// A failed `/meta/connect` exchange must be surfaced on
/// [`meta_events`](Transport::meta_events); that is how the connector
/// learns the long-poll session is gone.
///
/// The token set via [`set_bearer_token`](Transport::set_bearer_token) is
/// attached as the `Authorization` header of every subsequent request.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Initialize transport resources. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Release transport resources. Idempotent; safe to call when never
    /// started.
    async fn stop(&self);

    /// Perform a handshake exchange and return the server's reply.
    ///
    /// Errors are transport-level only (the request never completed); a
    /// server-side rejection comes back as a reply with
    /// `successful == false`.
    async fn handshake(&self) -> Result<MetaMessage>;

    /// Subscribe a channel, requesting delivery from `replay_from`, and
    /// return the server's acknowledgment.
    ///
    /// `topic` is the raw channel path (query string intact); `replay_from`
    /// is a position or one of the sentinels in [`crate::replay`].
    async fn subscribe(&self, topic: &str, replay_from: i64) -> Result<MetaMessage>;

    /// Unsubscribe a channel and return the server's acknowledgment.
    async fn unsubscribe(&self, topic: &str) -> Result<MetaMessage>;

    /// Perform a protocol-level disconnect of the current session, if any.
    async fn disconnect(&self);

    /// Set the bearer token attached to every subsequent request.
    fn set_bearer_token(&self, token: SecretString);

    /// Install a message hook. Hooks run in installation order.
    fn add_hook(&self, hook: Arc<dyn MessageHook>);

    /// Subscribe to inbound application events (post-hook).
    fn events(&self) -> broadcast::Receiver<TopicEvent>;

    /// Subscribe to inbound meta messages (post-hook).
    fn meta_events(&self) -> broadcast::Receiver<MetaMessage>;
}
