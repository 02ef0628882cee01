//! Configuration for the transport
//!
//! One flat configuration struct covers the connection URL, reconnect
//! behavior, send buffering, request timeouts, keep-alive probing, and
//! resubscription. Construct with [`TransportConfig::new`] and adjust via
//! the builder-style setters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::connection::CloseEvent;
use crate::error::{Error, Result};

/// Default maximum reconnect attempts before permanent termination
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keep-alive probe interval
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default timeout applied to a keep-alive probe
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────
// Reconnect Policy
// ─────────────────────────────────────────────────────────────────

/// Predicate consulted before each reconnect attempt. Returning `false`
/// terminates the connection permanently with a stopped-by-caller reason.
pub type ReconnectPredicate = Arc<dyn Fn(&CloseEvent) -> bool + Send + Sync>;

/// Delay between reconnect attempts
#[derive(Clone)]
pub enum ReconnectDelay {
    /// The same delay for every attempt
    Fixed(Duration),

    /// Exponentially growing delay, capped at `max`
    Exponential { initial: Duration, max: Duration },

    /// Caller-supplied function of the attempt number (1-based)
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for ReconnectDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            ReconnectDelay::Exponential { initial, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .finish(),
            ReconnectDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        ReconnectDelay::Exponential {
            initial: Duration::from_millis(150),
            max: Duration::from_secs(10),
        }
    }
}

/// Reconnection settings
#[derive(Clone)]
pub struct ReconnectConfig {
    /// Maximum reconnect attempts after a transient close before the
    /// connection terminates permanently
    pub max_attempts: u32,

    /// Delay policy between attempts
    pub delay: ReconnectDelay,

    /// Optional predicate deciding whether a given close warrants a
    /// reconnect at all (`None` always reconnects)
    pub should_reconnect: Option<ReconnectPredicate>,
}

impl fmt::Debug for ReconnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectConfig")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field(
                "should_reconnect",
                &self.should_reconnect.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: ReconnectDelay::default(),
            should_reconnect: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Buffering & Keep-Alive
// ─────────────────────────────────────────────────────────────────

/// Policy for buffering outbound messages while disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Queue without limit until the connection opens
    Unbounded,

    /// Queue up to this many messages; further sends fail with
    /// [`Error::BufferFull`]
    Bounded(usize),
}

impl Default for BufferPolicy {
    fn default() -> Self {
        BufferPolicy::Unbounded
    }
}

/// Keep-alive probe settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Idle time after which a liveness probe is sent
    pub interval: Duration,

    /// Timeout applied to the probe itself (`None` waits indefinitely)
    pub timeout: Option<Duration>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            timeout: Some(DEFAULT_KEEP_ALIVE_TIMEOUT),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for [`WsTransport`](crate::transport::WsTransport)
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the remote service
    pub url: String,

    /// Reconnection settings
    pub reconnect: ReconnectConfig,

    /// Connect timeout; `None` waits indefinitely
    pub connect_timeout: Option<Duration>,

    /// Outbound buffering while disconnected
    pub buffer: BufferPolicy,

    /// Default timeout for post/subscribe/unsubscribe operations;
    /// `None` disables
    pub request_timeout: Option<Duration>,

    /// Keep-alive probing; `None` disables
    pub keep_alive: Option<KeepAliveConfig>,

    /// Re-issue tracked subscriptions automatically after a reconnect
    pub auto_resubscribe: bool,
}

impl TransportConfig {
    /// Create a configuration for the given WebSocket URL with defaults
    /// for everything else
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            buffer: BufferPolicy::default(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            keep_alive: Some(KeepAliveConfig::default()),
            auto_resubscribe: true,
        }
    }

    /// Set the maximum reconnect attempts
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    /// Set the reconnect delay policy
    pub fn reconnect_delay(mut self, delay: ReconnectDelay) -> Self {
        self.reconnect.delay = delay;
        self
    }

    /// Set the reconnect predicate
    pub fn reconnect_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CloseEvent) -> bool + Send + Sync + 'static,
    {
        self.reconnect.should_reconnect = Some(Arc::new(predicate));
        self
    }

    /// Set the connect timeout (`None` waits indefinitely)
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the outbound buffer policy
    pub fn buffer_policy(mut self, policy: BufferPolicy) -> Self {
        self.buffer = policy;
        self
    }

    /// Set the default request timeout (`None` disables)
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the keep-alive settings (`None` disables probing)
    pub fn keep_alive(mut self, keep_alive: Option<KeepAliveConfig>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Enable or disable automatic resubscription after reconnect
    pub fn auto_resubscribe(mut self, enabled: bool) -> Self {
        self.auto_resubscribe = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| Error::invalid_url(&self.url, e))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::invalid_url(
                    &self.url,
                    format!("unsupported scheme '{}'", other),
                ));
            }
        }

        if let BufferPolicy::Bounded(0) = self.buffer {
            return Err(Error::Config(
                "bounded buffer capacity must be non-zero".to_string(),
            ));
        }

        if let Some(ka) = &self.keep_alive {
            if ka.interval.is_zero() {
                return Err(Error::Config(
                    "keep-alive interval must be non-zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
