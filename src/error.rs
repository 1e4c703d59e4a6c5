use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use url::Url;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Operation attempted before the connector was started
    NotRunning,
    /// A subscription already exists for the normalized topic
    AlreadySubscribed,
    /// The server rejected a subscribe request
    Subscribe,
    /// The handshake with the streaming endpoint was rejected
    Connect,
    /// The reconnect attempt budget was exhausted
    ReconnectExhausted,
    /// The transport layer failed to initialize
    TransportStart,
    /// A bounded wait elapsed before the operation completed
    Timeout,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// The connector has not been started, so topic operations cannot be issued.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct NotRunning {
    pub endpoint: Url,
}

impl fmt::Display for NotRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector [{}] has not been started", self.endpoint)
    }
}

impl StdError for NotRunning {}

/// A subscription for the normalized form of this topic is already registered.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct AlreadySubscribed {
    pub topic: String,
    pub endpoint: Url,
}

impl fmt::Display for AlreadySubscribed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "already subscribed to {} [{}]", self.topic, self.endpoint)
    }
}

impl StdError for AlreadySubscribed {}

/// The server rejected (or never acknowledged) a subscribe request.
///
/// Carries everything needed to diagnose the rejection: the endpoint, the
/// raw topic, the replay position that was requested, and the error the
/// server reported.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CannotSubscribe {
    pub endpoint: Url,
    pub topic: String,
    pub replay_from: i64,
    pub error: String,
}

impl fmt::Display for CannotSubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to subscribe to [{}:{}] [{}] : {}",
            self.topic, self.replay_from, self.endpoint, self.error
        )
    }
}

impl StdError for CannotSubscribe {}

/// The handshake with the streaming endpoint was rejected.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectFailure {
    pub endpoint: Url,
    pub error: String,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot connect [{}] : {}", self.endpoint, self.error)
    }
}

impl StdError for ConnectFailure {}

/// Every reconnect attempt in the configured budget failed.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectExhausted {
    pub endpoint: Url,
    pub attempts: u32,
}

impl fmt::Display for ReconnectExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up reconnecting to [{}] after {} attempts",
            self.endpoint, self.attempts
        )
    }
}

impl StdError for ReconnectExhausted {}

impl From<NotRunning> for Error {
    fn from(err: NotRunning) -> Self {
        Error::with_source(Kind::NotRunning, err)
    }
}

impl From<AlreadySubscribed> for Error {
    fn from(err: AlreadySubscribed) -> Self {
        Error::with_source(Kind::AlreadySubscribed, err)
    }
}

impl From<CannotSubscribe> for Error {
    fn from(err: CannotSubscribe) -> Self {
        Error::with_source(Kind::Subscribe, err)
    }
}

impl From<ConnectFailure> for Error {
    fn from(err: ConnectFailure) -> Self {
        Error::with_source(Kind::Connect, err)
    }
}

impl From<ReconnectExhausted> for Error {
    fn from(err: ReconnectExhausted) -> Self {
        Error::with_source(Kind::ReconnectExhausted, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::with_source(Kind::Timeout, e)
    }
}
