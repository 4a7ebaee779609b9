//! Client configuration with builder pattern.
//!
//! One [`ClientConfig`] describes one remote service: identity, transport
//! descriptor, call timeouts, retry and reconnect schedules, and the
//! optional fallback cache. Configuration is immutable after `build()`.

use std::time::Duration;

use tonic::transport::ClientTlsConfig;

use crate::{
    cache::{MAX_CACHE_SIZE, MAX_CACHE_TTL, MIN_CACHE_SIZE, MIN_CACHE_TTL},
    error::{ConfigSnafu, Result},
};
use snafu::ensure;

/// Default per-attempt call timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries after the initial attempt.
const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default base delay between retries.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default first reconnect delay.
const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default reconnect delay cap.
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Default HTTP/2 keepalive ping interval.
const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Default HTTP/2 keepalive ping timeout.
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum message size in either direction (5 MiB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

/// Default fallback-cache TTL.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default fallback-cache capacity.
const DEFAULT_MAX_CACHE_SIZE: usize = 100;

/// TLS mode for the transport descriptor.
///
/// The engine never loads credentials itself; callers hand over a ready
/// [`ClientTlsConfig`] or opt into plaintext.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Plaintext HTTP/2 (`http://` endpoints).
    #[default]
    Plaintext,
    /// TLS with caller-provided configuration.
    Tls(ClientTlsConfig),
}

/// Configuration for one resilient service client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Human-readable service name, used in logs, events and the
    /// unavailable-error sentinel.
    pub(crate) service_name: String,

    /// Endpoint URL, e.g. `http://users.internal:50051`.
    pub(crate) grpc_url: String,

    /// gRPC route prefix `{package}.{Service}` for dynamic dispatch.
    pub(crate) service_path: String,

    /// TLS mode, passed through to the transport factory.
    pub(crate) tls: TlsMode,

    /// Per-attempt call timeout; also bounds connection readiness.
    pub(crate) timeout: Duration,

    /// Retries after the initial attempt.
    pub(crate) retry_count: u32,

    /// Base delay between retries (doubled per attempt, uncapped).
    pub(crate) retry_delay: Duration,

    /// First reconnect delay.
    pub(crate) initial_reconnect_delay: Duration,

    /// Reconnect delay cap.
    pub(crate) max_reconnect_delay: Duration,

    /// Reconnect attempt bound; `None` retries forever.
    pub(crate) max_reconnect_attempts: Option<u32>,

    /// HTTP/2 keepalive ping interval.
    pub(crate) keepalive_time: Duration,

    /// HTTP/2 keepalive ping timeout.
    pub(crate) keepalive_timeout: Duration,

    /// Largest outgoing message accepted by the codec.
    pub(crate) max_send_message_size: usize,

    /// Largest incoming message accepted by the codec.
    pub(crate) max_recv_message_size: usize,

    /// Whether stale-while-unavailable caching is active.
    pub(crate) enable_fallback_cache: bool,

    /// Default TTL for cached responses.
    pub(crate) fallback_cache_ttl: Duration,

    /// Fallback-cache capacity.
    pub(crate) max_cache_size: usize,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Returns the service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the endpoint URL.
    #[must_use]
    pub fn grpc_url(&self) -> &str {
        &self.grpc_url
    }

    /// Returns the `{package}.{Service}` route prefix.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Returns the TLS mode.
    #[must_use]
    pub fn tls(&self) -> &TlsMode {
        &self.tls
    }

    /// Returns the per-attempt call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the retry count.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns the base retry delay.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Returns the first reconnect delay.
    #[must_use]
    pub fn initial_reconnect_delay(&self) -> Duration {
        self.initial_reconnect_delay
    }

    /// Returns the reconnect delay cap.
    #[must_use]
    pub fn max_reconnect_delay(&self) -> Duration {
        self.max_reconnect_delay
    }

    /// Returns the reconnect attempt bound, if any.
    #[must_use]
    pub fn max_reconnect_attempts(&self) -> Option<u32> {
        self.max_reconnect_attempts
    }

    /// Returns whether the fallback cache is enabled.
    #[must_use]
    pub fn fallback_cache_enabled(&self) -> bool {
        self.enable_fallback_cache
    }

    /// Returns the fallback-cache TTL.
    #[must_use]
    pub fn fallback_cache_ttl(&self) -> Duration {
        self.fallback_cache_ttl
    }

    /// Returns the fallback-cache capacity.
    #[must_use]
    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    service_name: Option<String>,
    grpc_url: Option<String>,
    service_path: Option<String>,
    tls: TlsMode,
    timeout: Option<Duration>,
    retry_count: Option<u32>,
    retry_delay: Option<Duration>,
    initial_reconnect_delay: Option<Duration>,
    max_reconnect_delay: Option<Duration>,
    max_reconnect_attempts: Option<u32>,
    keepalive_time: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    max_send_message_size: Option<usize>,
    max_recv_message_size: Option<usize>,
    enable_fallback_cache: bool,
    fallback_cache_ttl: Option<Duration>,
    max_cache_size: Option<usize>,
}

impl ClientConfigBuilder {
    /// Sets the service name used in logs, events and error messages.
    #[must_use]
    pub fn with_service_name<S: Into<String>>(mut self, name: S) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Sets the endpoint URL (`http://` or `https://`).
    #[must_use]
    pub fn with_grpc_url<S: Into<String>>(mut self, url: S) -> Self {
        self.grpc_url = Some(url.into());
        self
    }

    /// Sets the `{package}.{Service}` route prefix used to form
    /// `/{package}.{Service}/{Method}` paths.
    #[must_use]
    pub fn with_service_path<S: Into<String>>(mut self, path: S) -> Self {
        self.service_path = Some(path.into());
        self
    }

    /// Sets the TLS mode. Default: plaintext.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the per-attempt call timeout. Default: 5 seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the number of retries after the initial attempt. Default: 3.
    #[must_use]
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Sets the base retry delay. Default: 1 second.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the first reconnect delay. Default: 1 second.
    #[must_use]
    pub fn with_initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.initial_reconnect_delay = Some(delay);
        self
    }

    /// Sets the reconnect delay cap. Default: 30 seconds.
    #[must_use]
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = Some(delay);
        self
    }

    /// Bounds reconnect attempts. Default: unbounded.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Sets the HTTP/2 keepalive ping interval. Default: 30 seconds.
    #[must_use]
    pub fn with_keepalive_time(mut self, time: Duration) -> Self {
        self.keepalive_time = Some(time);
        self
    }

    /// Sets the HTTP/2 keepalive ping timeout. Default: 10 seconds.
    #[must_use]
    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = Some(timeout);
        self
    }

    /// Sets the maximum outgoing message size. Default: 5 MiB.
    #[must_use]
    pub fn with_max_send_message_size(mut self, bytes: usize) -> Self {
        self.max_send_message_size = Some(bytes);
        self
    }

    /// Sets the maximum incoming message size. Default: 5 MiB.
    #[must_use]
    pub fn with_max_recv_message_size(mut self, bytes: usize) -> Self {
        self.max_recv_message_size = Some(bytes);
        self
    }

    /// Enables the stale-while-unavailable fallback cache. Default: disabled.
    #[must_use]
    pub fn with_fallback_cache(mut self, enabled: bool) -> Self {
        self.enable_fallback_cache = enabled;
        self
    }

    /// Sets the fallback-cache TTL. Default: 60 seconds.
    #[must_use]
    pub fn with_fallback_cache_ttl(mut self, ttl: Duration) -> Self {
        self.fallback_cache_ttl = Some(ttl);
        self
    }

    /// Sets the fallback-cache capacity. Default: 100 entries.
    #[must_use]
    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = Some(size);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the service name, URL or service path is missing
    /// or malformed, a timeout or delay is zero, the reconnect cap is below
    /// the initial delay, or the cache bounds are violated.
    pub fn build(self) -> Result<ClientConfig> {
        let service_name = self.service_name.unwrap_or_default();
        ensure!(
            !service_name.trim().is_empty(),
            ConfigSnafu { message: "service_name is required" }
        );

        let grpc_url = self.grpc_url.unwrap_or_default();
        validate_url(&grpc_url)?;

        let service_path = self.service_path.unwrap_or_default();
        ensure!(
            !service_path.trim().is_empty(),
            ConfigSnafu { message: "service_path is required" }
        );

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        ensure!(!timeout.is_zero(), ConfigSnafu { message: "timeout cannot be zero" });

        let retry_delay = self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
        ensure!(!retry_delay.is_zero(), ConfigSnafu { message: "retry_delay cannot be zero" });

        let initial_reconnect_delay =
            self.initial_reconnect_delay.unwrap_or(DEFAULT_INITIAL_RECONNECT_DELAY);
        ensure!(
            !initial_reconnect_delay.is_zero(),
            ConfigSnafu { message: "initial_reconnect_delay cannot be zero" }
        );

        let max_reconnect_delay = self.max_reconnect_delay.unwrap_or(DEFAULT_MAX_RECONNECT_DELAY);
        ensure!(
            max_reconnect_delay >= initial_reconnect_delay,
            ConfigSnafu {
                message: "max_reconnect_delay cannot be below initial_reconnect_delay"
            }
        );

        let max_cache_size = self.max_cache_size.unwrap_or(DEFAULT_MAX_CACHE_SIZE);
        ensure!(
            (MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&max_cache_size),
            ConfigSnafu {
                message: format!(
                    "max_cache_size {max_cache_size} outside [{MIN_CACHE_SIZE}, {MAX_CACHE_SIZE}]"
                )
            }
        );

        let fallback_cache_ttl = self.fallback_cache_ttl.unwrap_or(DEFAULT_CACHE_TTL);
        ensure!(
            (MIN_CACHE_TTL..=MAX_CACHE_TTL).contains(&fallback_cache_ttl),
            ConfigSnafu {
                message: format!(
                    "fallback_cache_ttl {}ms outside [{}ms, {}ms]",
                    fallback_cache_ttl.as_millis(),
                    MIN_CACHE_TTL.as_millis(),
                    MAX_CACHE_TTL.as_millis()
                )
            }
        );

        Ok(ClientConfig {
            service_name,
            grpc_url,
            service_path,
            tls: self.tls,
            timeout,
            retry_count: self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            retry_delay,
            initial_reconnect_delay,
            max_reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            keepalive_time: self.keepalive_time.unwrap_or(DEFAULT_KEEPALIVE_TIME),
            keepalive_timeout: self.keepalive_timeout.unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT),
            max_send_message_size: self
                .max_send_message_size
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            max_recv_message_size: self
                .max_recv_message_size
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            enable_fallback_cache: self.enable_fallback_cache,
            fallback_cache_ttl,
            max_cache_size,
        })
    }
}

/// Validates that a URL is well-formed HTTP(S).
fn validate_url(url: &str) -> Result<()> {
    ensure!(
        url.starts_with("http://") || url.starts_with("https://"),
        ConfigSnafu { message: format!("grpc_url '{url}' must start with http:// or https://") }
    );

    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or("");
    ensure!(
        !rest.is_empty(),
        ConfigSnafu { message: format!("grpc_url '{url}' must have a host") }
    );
    ensure!(
        !rest.contains(char::is_whitespace),
        ConfigSnafu { message: format!("grpc_url '{url}' cannot contain whitespace") }
    );

    Ok(())
}
