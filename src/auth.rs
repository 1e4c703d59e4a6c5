//! Authentication: bearer token acquisition and session-expiry detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use crate::Result;
use crate::hooks::MessageHook;
use crate::message::{MetaMessage, meta};

/// Supplies the bearer token attached to every outbound transport request.
///
/// `force_refresh` is `true` when the previous session was invalidated by
/// the server; the provider is then expected to re-authenticate rather than
/// hand back a cached token. A provider error fails the connect attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn fetch(&self, force_refresh: bool) -> Result<SecretString>;
}

/// A fixed bearer token. `force_refresh` is ignored — when the session
/// behind a static token expires, reconnects will keep presenting the same
/// credential until the attempt budget runs out.
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn fetch(&self, _force_refresh: bool) -> Result<SecretString> {
        Ok(self.token.clone())
    }
}

/// Whether the next token fetch must bypass any cached credential.
///
/// Set by the [`AuthClassifier`] when the server reports a session expiry;
/// consumed (and cleared) by the next connect.
#[derive(Debug, Default)]
pub struct AuthState {
    force_reauthenticate: AtomicBool,
}

impl AuthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_reauthentication(&self) {
        self.force_reauthenticate.store(true, Ordering::Release);
    }

    /// Read and clear the flag in one step.
    pub fn take_reauthentication(&self) -> bool {
        self.force_reauthenticate.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_reauthentication_required(&self) -> bool {
        self.force_reauthenticate.load(Ordering::Acquire)
    }
}

/// Why the connector should attempt recovery.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySignal {
    /// The server invalidated the session; the next connect must present a
    /// freshly acquired token.
    AuthExpired,
    /// The transport reported a failure without an auth component.
    TransportFailure,
}

const AUTH_ERROR_PREFIXES: [&str; 2] = ["401", "403"];

/// Classifies failed handshake/connect exchanges.
///
/// An error code or nested failure reason prefixed `401`/`403` marks the
/// session as expired: the classifier flags [`AuthState`] for forced
/// reauthentication and signals the connector to run its
/// stop-then-reconnect sequence. Any other failed connect exchange is
/// routed to the standard reconnect path with no forced token refresh.
pub struct AuthClassifier {
    state: Arc<AuthState>,
    signals: mpsc::UnboundedSender<RecoverySignal>,
}

impl AuthClassifier {
    #[must_use]
    pub fn new(state: Arc<AuthState>, signals: mpsc::UnboundedSender<RecoverySignal>) -> Self {
        Self { state, signals }
    }

    fn is_auth_failure(message: &MetaMessage) -> bool {
        let error_matches = message.error.as_deref().is_some_and(|error| {
            AUTH_ERROR_PREFIXES
                .iter()
                .any(|prefix| error.starts_with(prefix))
        });
        let reason_matches = message.failure_reason().is_some_and(|reason| {
            AUTH_ERROR_PREFIXES
                .iter()
                .any(|prefix| reason.starts_with(prefix))
        });
        error_matches || reason_matches
    }
}

impl MessageHook for AuthClassifier {
    fn on_receive_meta(&self, message: &MetaMessage) -> bool {
        if message.successful
            || (message.channel != meta::CONNECT && message.channel != meta::HANDSHAKE)
        {
            return true;
        }

        let signal = if Self::is_auth_failure(message) {
            self.state.require_reauthentication();
            RecoverySignal::AuthExpired
        } else {
            RecoverySignal::TransportFailure
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(channel = %message.channel, ?signal, "meta exchange failed");

        // The receiver disappears when the connector is dropped.
        drop(self.signals.send(signal));
        true
    }
}
