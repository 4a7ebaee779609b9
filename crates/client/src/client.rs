//! The resilient service client: facade and call orchestration.
//!
//! One [`BulwarkClient`] wraps one remote service. `call` routes a request
//! through the connection manager, retries transient failures with
//! exponential backoff, records metrics, and falls back to the stale cache
//! when the service stays unreachable.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 BulwarkClient (public facade)               │
//! │  .call() │ .ensure_connected() │ .health() │ .subscribe()  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Call orchestrator                       │
//! │   Retry loop │ Metrics │ Cache read/write │ Deadlines      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    ConnectionManager                        │
//! │   State machine │ Monitor loop │ Reconnect scheduler       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Transport (tonic / mock)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    backoff::retry_delay,
    cache::{FallbackCache, validate_key},
    cache_key::cache_key,
    config::ClientConfig,
    connection::{ConnectionManager, ConnectionState},
    error::{Result, UnavailableSnafu},
    events::ClientEvent,
    metrics::{MetricsSnapshot, MetricsTracker},
    transport::{GrpcTransportFactory, TransportFactory},
};

/// Per-call options.
///
/// All fields default to "off"; construct with struct update syntax:
///
/// ```
/// use bulwark_client::CallOptions;
/// use std::time::Duration;
///
/// let options = CallOptions {
///     timeout: Some(Duration::from_secs(2)),
///     locale: Some("de-DE".to_owned()),
///     ..CallOptions::default()
/// };
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Per-attempt deadline override; defaults to the configured timeout.
    pub timeout: Option<Duration>,
    /// Injected as `accept-language` metadata.
    pub locale: Option<String>,
    /// Injected as `x-client-url` metadata.
    pub client_url: Option<String>,
    /// Limits the call to a single attempt.
    pub skip_retry: bool,
    /// Overrides the derived cache key.
    pub cache_key: Option<String>,
    /// Bypasses the fallback cache for this call.
    pub skip_cache: bool,
    /// Additional metadata pairs passed through to the wire.
    pub metadata: Vec<(String, String)>,
}

/// Point-in-time health of the client.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Connection state.
    pub state: ConnectionState,
    /// True iff the state is `Connected`.
    pub healthy: bool,
    /// Latency of the most recent successful call, in milliseconds.
    pub latency_ms: u64,
    /// When the client last reached `Connected`.
    pub last_connected_at: Option<SystemTime>,
    /// When the last connection error occurred.
    pub last_error_at: Option<SystemTime>,
    /// Description of the last connection error.
    pub last_error: Option<String>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Embedded metrics snapshot.
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    connection: ConnectionManager,
    cache: Option<FallbackCache>,
    metrics: MetricsTracker,
    last_latency_ms: AtomicU64,
}

/// Resilient client for one remote gRPC service.
///
/// Cheap to clone; all clones share the connection, cache and metrics.
#[derive(Debug, Clone)]
pub struct BulwarkClient {
    inner: Arc<ClientInner>,
}

impl BulwarkClient {
    /// Creates a client over the production gRPC transport.
    ///
    /// No connection is established until the first call or an explicit
    /// [`ensure_connected`](Self::ensure_connected).
    ///
    /// # Errors
    ///
    /// Returns an error when the fallback cache cannot be constructed from
    /// the configured bounds.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let factory = Arc::new(GrpcTransportFactory::new(&config));
        Self::from_parts(config, factory)
    }

    /// Creates a client over a caller-provided transport factory.
    ///
    /// This is the seam tests use to substitute the
    /// [`mock`](crate::mock) transport.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_factory<F>(config: ClientConfig, factory: F) -> Result<Self>
    where
        F: TransportFactory + 'static,
    {
        Self::from_parts(config, Arc::new(factory))
    }

    fn from_parts(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let cache = if config.enable_fallback_cache {
            Some(FallbackCache::new(
                &config.service_name,
                config.max_cache_size,
                config.fallback_cache_ttl,
            )?)
        } else {
            None
        };
        let connection = ConnectionManager::new(config.clone(), factory);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                cache,
                metrics: MetricsTracker::new(),
                last_latency_ms: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Ensures a live connection, returning whether the client is connected.
    pub async fn ensure_connected(&self) -> bool {
        self.inner.connection.ensure_connected().await
    }

    /// Returns whether the client currently holds a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Registers a subscriber for lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.connection.subscribe()
    }

    /// Invokes a unary method with retries, metrics and cache fallback.
    ///
    /// The attempt budget is `retry_count + 1` (or 1 with
    /// `skip_retry`); retryable wire errors back off exponentially between
    /// attempts, and `UNAVAILABLE` additionally tears down the connection
    /// so the manager can rebuild it. When every attempt fails and the
    /// fallback cache holds a value under this call's key, the stale value
    /// is returned instead of the error.
    ///
    /// # Errors
    ///
    /// The last attempt's error when no cached value is available, or an
    /// unavailable-sentinel error when no connection could be established.
    pub async fn call(&self, method: &str, request: Value, options: CallOptions) -> Result<Value> {
        let effective_key = match &options.cache_key {
            Some(key) => key.clone(),
            None => cache_key(method, &request),
        };
        let cache = self.inner.cache.as_ref().filter(|_| !options.skip_cache);
        if cache.is_some() && options.cache_key.is_some() {
            validate_key(&effective_key)?;
        }

        let max_attempts = if options.skip_retry { 1 } else { self.inner.config.retry_count + 1 };
        let timeout = options.timeout.unwrap_or(self.inner.config.timeout);
        let metadata = build_metadata(&options);

        self.inner.metrics.record_call_start();

        let mut last_error = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.inner.metrics.record_retry();
            }

            if !self.inner.connection.ensure_connected().await {
                return self.serve_unavailable(method, &effective_key, cache);
            }
            let Some(transport) = self.inner.connection.transport() else {
                return self.serve_unavailable(method, &effective_key, cache);
            };

            let start = Instant::now();
            match transport.invoke(method, request.clone(), &metadata, timeout).await {
                Ok(response) => {
                    let latency = start.elapsed();
                    self.inner.metrics.record_success(latency);
                    self.inner
                        .last_latency_ms
                        .store(latency.as_millis() as u64, Ordering::Relaxed);
                    if let Some(cache) = cache {
                        if let Err(err) = cache.set(&effective_key, response.clone(), None) {
                            warn!(method, error = %err, "failed to cache response");
                        }
                    }
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        service = %self.inner.config.service_name,
                        method,
                        attempt,
                        error = %err,
                        "call attempt failed"
                    );
                    let retryable = err.is_retryable();
                    let connection_lost = err.is_connection_error();
                    last_error = Some(err);

                    if !retryable || attempt + 1 == max_attempts {
                        break;
                    }
                    if connection_lost {
                        self.inner.connection.handle_connection_lost().await;
                    }
                    tokio::time::sleep(retry_delay(self.inner.config.retry_delay, attempt)).await;
                }
            }
        }

        self.inner.metrics.record_failure();
        let error = last_error.unwrap_or_else(|| {
            UnavailableSnafu { service: self.inner.config.service_name.clone() }.build()
        });

        if let Some(cache) = cache {
            if let Ok(Some(stale)) = cache.get(&effective_key) {
                self.inner.metrics.record_cache_hit();
                warn!(
                    service = %self.inner.config.service_name,
                    method,
                    error = %error,
                    "all attempts failed, serving stale cached response"
                );
                return Ok(stale);
            }
        }
        self.inner.metrics.record_cache_miss();
        Err(error)
    }

    /// Terminal path when no connection could be established: serve from
    /// cache if possible, otherwise raise the unavailable sentinel.
    fn serve_unavailable(
        &self,
        method: &str,
        key: &str,
        cache: Option<&FallbackCache>,
    ) -> Result<Value> {
        self.inner.metrics.record_failure();
        if let Some(cache) = cache {
            if let Ok(Some(cached)) = cache.get(key) {
                self.inner.metrics.record_cache_hit();
                info!(
                    service = %self.inner.config.service_name,
                    method,
                    "service unavailable, serving cached response"
                );
                return Ok(cached);
            }
        }
        self.inner.metrics.record_cache_miss();
        UnavailableSnafu { service: self.inner.config.service_name.clone() }.fail()
    }

    /// Returns the current health report.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let state = self.inner.connection.state();
        HealthReport {
            state,
            healthy: state == ConnectionState::Connected,
            latency_ms: self.inner.last_latency_ms.load(Ordering::Relaxed),
            last_connected_at: self.inner.connection.last_connected_at(),
            last_error_at: self.inner.connection.last_error_at(),
            last_error: self.inner.connection.last_error(),
            reconnect_attempts: self.inner.connection.reconnect_attempts(),
            metrics: (*self.inner.metrics.snapshot()).clone(),
        }
    }

    /// Returns the current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsSnapshot> {
        self.inner.metrics.snapshot()
    }

    /// Percentage of started calls that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> u32 {
        self.inner.metrics.success_rate()
    }

    /// Percentage of cache lookups that hit.
    #[must_use]
    pub fn cache_hit_rate(&self) -> u32 {
        self.inner.metrics.cache_hit_rate()
    }

    /// Zeroes all metrics counters.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Drops all fallback-cache entries.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    /// Records a circuit-breaker trip decided by the embedding application
    /// and emits the corresponding event.
    ///
    /// The engine itself never short-circuits calls; wrappers that layer a
    /// breaker on top report trips through this hook.
    pub fn record_circuit_breaker_trip(&self) {
        self.inner.metrics.record_circuit_breaker_trip();
        self.inner.connection.emit(ClientEvent::CircuitBreakerTrip {
            service: self.inner.config.service_name.clone(),
        });
    }

    /// Shuts the client down: stops reconnecting, releases the transport,
    /// clears the cache and detaches event listeners. In-flight calls are
    /// not cancelled; they terminate with transport errors.
    pub async fn close(&self) {
        self.inner.connection.close().await;
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }
}

/// Assembles wire metadata from the call options.
fn build_metadata(options: &CallOptions) -> Vec<(String, String)> {
    let mut metadata = Vec::with_capacity(options.metadata.len() + 2);
    if let Some(locale) = &options.locale {
        metadata.push(("accept-language".to_owned(), locale.clone()));
    }
    if let Some(client_url) = &options.client_url {
        metadata.push(("x-client-url".to_owned(), client_url.clone()));
    }
    metadata.extend(options.metadata.iter().cloned());
    metadata
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;
    use tonic::Code;

    use super::*;
    use crate::error::ClientError;
    use crate::mock::MockTransportFactory;

    fn test_config() -> ClientConfig {
        ClientConfig::builder()
            .with_service_name("user-service")
            .with_grpc_url("http://localhost:50051")
            .with_service_path("users.v1.UserService")
            .with_retry_delay(Duration::from_millis(10))
            .build()
            .expect("valid test config")
    }

    fn cached_config() -> ClientConfig {
        ClientConfig::builder()
            .with_service_name("user-service")
            .with_grpc_url("http://localhost:50051")
            .with_service_path("users.v1.UserService")
            .with_retry_delay(Duration::from_millis(10))
            .with_fallback_cache(true)
            .build()
            .expect("valid cached test config")
    }

    fn test_client(config: ClientConfig) -> (BulwarkClient, MockTransportFactory) {
        let factory = MockTransportFactory::new();
        let client = BulwarkClient::with_factory(config, factory.clone()).expect("client");
        (client, factory)
    }

    #[tokio::test]
    async fn call_returns_scripted_response() {
        let (client, factory) = test_client(test_config());
        factory.respond_with("GetUser", json!({"id": 1, "name": "ada"}));

        let response =
            client.call("GetUser", json!({"id": 1}), CallOptions::default()).await.unwrap();
        assert_eq!(response, json!({"id": 1, "name": "ada"}));

        let metrics = client.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 0);

        client.close().await;
    }

    #[tokio::test]
    async fn call_injects_metadata() {
        let (client, factory) = test_client(test_config());
        let options = CallOptions {
            locale: Some("de-DE".to_owned()),
            client_url: Some("https://app.example.com/users".to_owned()),
            metadata: vec![("x-request-id".to_owned(), "abc-123".to_owned())],
            ..CallOptions::default()
        };

        client.call("GetUser", json!({"id": 1}), options).await.unwrap();

        let metadata = factory.last_metadata();
        assert!(metadata.contains(&("accept-language".to_owned(), "de-DE".to_owned())));
        assert!(metadata
            .contains(&("x-client-url".to_owned(), "https://app.example.com/users".to_owned())));
        assert!(metadata.contains(&("x-request-id".to_owned(), "abc-123".to_owned())));

        client.close().await;
    }

    #[tokio::test]
    async fn skip_retry_limits_to_one_attempt() {
        let (client, factory) = test_client(test_config());
        factory.inject_unavailable(1);

        let options = CallOptions { skip_retry: true, ..CallOptions::default() };
        let err = client.call("GetUser", json!({"id": 1}), options).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
        assert_eq!(factory.invoke_calls(), 1);
        assert_eq!(client.metrics().total_retries, 0);

        client.close().await;
    }

    #[tokio::test]
    async fn custom_cache_key_is_honored() {
        let (client, factory) = test_client(cached_config());
        factory.respond_with("GetUser", json!({"name": "ada"}));

        let options =
            CallOptions { cache_key: Some("custom:1".to_owned()), ..CallOptions::default() };
        client.call("GetUser", json!({"id": 1}), options.clone()).await.unwrap();

        // Exhaust all attempts; the stale value under the custom key serves.
        factory.inject_unavailable(16);
        let stale = client.call("GetUser", json!({"id": 1}), options).await.unwrap();
        assert_eq!(stale, json!({"name": "ada"}));
        assert_eq!(client.metrics().cache_hits, 1);

        client.close().await;
    }

    #[tokio::test]
    async fn invalid_custom_cache_key_is_rejected() {
        let (client, _factory) = test_client(cached_config());

        let options = CallOptions { cache_key: Some("   ".to_owned()), ..CallOptions::default() };
        let err = client.call("GetUser", json!({"id": 1}), options).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidCacheKey { .. }));

        // Nothing was recorded for the rejected call.
        assert_eq!(client.metrics().total_calls, 0);

        client.close().await;
    }

    #[tokio::test]
    async fn skip_cache_bypasses_fallback() {
        let (client, factory) = test_client(cached_config());
        factory.respond_with("GetUser", json!({"name": "ada"}));

        // Populate the cache, then fail with skip_cache: no stale serve.
        client.call("GetUser", json!({"id": 1}), CallOptions::default()).await.unwrap();
        factory.inject_unavailable(16);

        let options = CallOptions { skip_cache: true, ..CallOptions::default() };
        let err = client.call("GetUser", json!({"id": 1}), options).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));

        client.close().await;
    }

    #[tokio::test]
    async fn health_reflects_connection_and_metrics() {
        let (client, factory) = test_client(test_config());
        factory.respond_with("Ping", json!("pong"));

        let before = client.health();
        assert_eq!(before.state, ConnectionState::Disconnected);
        assert!(!before.healthy);
        assert_eq!(before.latency_ms, 0);

        client.call("Ping", Value::Null, CallOptions::default()).await.unwrap();

        let after = client.health();
        assert_eq!(after.state, ConnectionState::Connected);
        assert!(after.healthy);
        assert!(after.last_connected_at.is_some());
        assert_eq!(after.metrics.successful_calls, 1);

        client.close().await;
    }

    #[tokio::test]
    async fn circuit_breaker_trip_counts_and_emits() {
        let (client, _factory) = test_client(test_config());
        let mut events = client.subscribe();

        client.record_circuit_breaker_trip();
        assert_eq!(client.metrics().circuit_breaker_trips, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::CircuitBreakerTrip { service: "user-service".to_owned() }
        );

        client.close().await;
    }

    #[tokio::test]
    async fn reset_metrics_zeroes_counters() {
        let (client, factory) = test_client(test_config());
        factory.respond_with("Ping", json!("pong"));
        client.call("Ping", Value::Null, CallOptions::default()).await.unwrap();

        client.reset_metrics();
        let metrics = client.metrics();
        assert_eq!(metrics.total_calls, 0);
        assert_eq!(metrics.successful_calls, 0);

        client.close().await;
    }

    #[tokio::test]
    async fn closed_client_raises_unavailable() {
        let (client, _factory) = test_client(cached_config());
        client.call("GetUser", json!({"id": 1}), CallOptions::default()).await.unwrap();
        client.close().await;

        // The cache was cleared on close, so not even a stale serve.
        let err =
            client.call("GetUser", json!({"id": 1}), CallOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "user-service is not available");
    }

    #[tokio::test]
    async fn clear_cache_drops_stale_values() {
        let (client, factory) = test_client(cached_config());
        factory.respond_with("GetUser", json!({"name": "ada"}));
        client.call("GetUser", json!({"id": 1}), CallOptions::default()).await.unwrap();

        client.clear_cache();
        factory.inject_unavailable(16);
        let err =
            client.call("GetUser", json!({"id": 1}), CallOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
        assert_eq!(client.metrics().cache_misses, 1);

        client.close().await;
    }

    #[tokio::test]
    async fn success_and_cache_hit_rates() {
        let (client, factory) = test_client(cached_config());
        factory.respond_with("Ping", json!("pong"));

        assert_eq!(client.success_rate(), 100);
        client.call("Ping", Value::Null, CallOptions::default()).await.unwrap();
        assert_eq!(client.success_rate(), 100);
        assert_eq!(client.cache_hit_rate(), 0);

        client.close().await;
    }
}
