#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use url::Url;

const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_NETWORK_DELAY: Duration = Duration::from_millis(15_000);
const DEFAULT_MAX_BUFFER_SIZE: usize = 1_048_576;
const DEFAULT_PROTOCOL_VERSION: &str = "43.0";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RESUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the connector.
///
/// Only `endpoint` is required; everything else carries the defaults a
/// long-polling session expects. The long-poll knobs (`max_network_delay`,
/// `max_buffer_size`, `proxies`) are consumed by the transport
/// implementation; the connector itself uses `max_network_delay` to bound
/// subscribe acknowledgments.
///
/// ```rust
/// use replay_stream_client::Config;
/// use url::Url;
///
/// let config = Config::builder()
///     .endpoint(Url::parse("https://stream.example.com/cometd/43.0")?)
///     .build();
/// # Ok::<(), url::ParseError>(())
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// The streaming endpoint the transport connects to.
    pub endpoint: Url,
    /// Interval between no-op handshakes that keep the long-poll session
    /// alive on the server side. The default is sixty (60) minutes.
    #[builder(default = DEFAULT_KEEP_ALIVE_INTERVAL)]
    pub keep_alive_interval: Duration,
    /// Maximum time to wait before considering a request to the server
    /// failed. Also bounds subscribe acknowledgments.
    #[builder(default = DEFAULT_MAX_NETWORK_DELAY)]
    pub max_network_delay: Duration,
    /// Maximum number of bytes of a long-poll HTTP response, which may
    /// contain many protocol messages.
    #[builder(default = DEFAULT_MAX_BUFFER_SIZE)]
    pub max_buffer_size: usize,
    /// Outbound proxies for the transport to route through.
    #[builder(default)]
    pub proxies: Vec<Url>,
    /// Protocol version advertised to the server.
    #[builder(default = DEFAULT_PROTOCOL_VERSION.to_owned(), into)]
    pub version: String,
    /// Reconnection strategy configuration.
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// Exhausting the budget stops the connector.
    pub max_attempts: u32,
    /// Bound on a single connect attempt (token fetch through handshake).
    pub connect_timeout: Duration,
    /// Bound on each individual resubscribe after a reconnect. Exceeding it
    /// fails the whole reconnect.
    pub resubscribe_timeout: Duration,
    /// Initial backoff duration for the first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resubscribe_timeout: DEFAULT_RESUBSCRIBE_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
