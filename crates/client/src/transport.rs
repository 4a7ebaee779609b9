//! Transport abstraction consumed by the engine.
//!
//! The connection manager and call orchestrator never touch tonic directly;
//! they work through the [`Transport`] trait so that tests can substitute a
//! controllable in-process implementation. [`GrpcTransport`] is the
//! production implementation over a lazily-connected tonic [`Channel`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::Poll,
    time::Duration,
};

use async_trait::async_trait;
use http::uri::PathAndQuery;
use serde_json::Value;
use snafu::ResultExt;
use tonic::{
    Code,
    client::Grpc,
    metadata::{MetadataKey, MetadataValue},
    transport::{Channel, Endpoint},
};
use tower::Service;
use tracing::warn;

use crate::{
    codec::JsonCodec,
    config::{ClientConfig, TlsMode},
    error::{ClientError, ConfigSnafu, ConnectionSnafu, Result, TransportSnafu},
};

/// Request type the tonic channel implements [`tower::Service`] for.
type HttpRequest = http::Request<tonic::body::BoxBody>;

/// Low-level connectivity of a transport handle, as observed by the
/// connection manager's monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is established and can carry calls.
    Ready,
    /// Channel is attempting to connect.
    Connecting,
    /// Channel is idle and will connect on demand.
    Idle,
    /// Channel has failed and will back off before reconnecting.
    TransientFailure,
    /// Channel has been shut down and will not recover.
    Shutdown,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Connecting => write!(f, "connecting"),
            Self::Idle => write!(f, "idle"),
            Self::TransientFailure => write!(f, "transient-failure"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A live transport handle bound to one remote endpoint.
///
/// Handles are owned exclusively by the connection manager and replaced
/// wholesale on reconnect. All methods are safe to call concurrently.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Completes when the underlying channel is ready to carry calls, or
    /// fails when `timeout` elapses or the channel errors.
    async fn wait_for_ready(&self, timeout: Duration) -> Result<()>;

    /// Reports current connectivity without blocking.
    async fn channel_state(&self) -> ChannelState;

    /// Invokes a unary method with the given metadata and per-attempt
    /// deadline. A deadline overrun surfaces as `DEADLINE_EXCEEDED`.
    async fn invoke(
        &self,
        method: &str,
        request: Value,
        metadata: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value>;

    /// Releases transport resources. Idempotent.
    async fn close(&self);
}

/// Constructs transport handles for the connection manager.
///
/// `create` is synchronous: handle construction must not perform I/O.
/// Readiness is driven afterwards through [`Transport::wait_for_ready`].
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Builds a fresh handle from the configured descriptor.
    fn create(&self) -> Result<Arc<dyn Transport>>;
}

/// Production transport over a tonic [`Channel`].
#[derive(Debug)]
pub struct GrpcTransport {
    channel: Channel,
    service_path: String,
    max_send_message_size: usize,
    max_recv_message_size: usize,
    /// Whether readiness has ever been driven. The channel is lazy, so
    /// until then it sits idle with no connection attempt in progress.
    started: AtomicBool,
    closed: AtomicBool,
}

impl GrpcTransport {
    /// Single non-blocking readiness poll of a channel clone.
    async fn poll_channel(&self) -> ChannelState {
        let mut channel = self.channel.clone();
        std::future::poll_fn(|cx| {
            let state = match Service::<HttpRequest>::poll_ready(&mut channel, cx) {
                Poll::Ready(Ok(())) => ChannelState::Ready,
                Poll::Ready(Err(_)) => ChannelState::TransientFailure,
                Poll::Pending => ChannelState::Connecting,
            };
            Poll::Ready(state)
        })
        .await
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Shutdown);
        }
        self.started.store(true, Ordering::Release);

        let mut channel = self.channel.clone();
        let ready =
            std::future::poll_fn(|cx| Service::<HttpRequest>::poll_ready(&mut channel, cx));
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(source.into()),
            Err(_) => ConnectionSnafu {
                message: format!("channel not ready within {}ms", timeout.as_millis()),
            }
            .fail(),
        }
    }

    async fn channel_state(&self) -> ChannelState {
        if self.closed.load(Ordering::Acquire) {
            return ChannelState::Shutdown;
        }
        if !self.started.load(Ordering::Acquire) {
            return ChannelState::Idle;
        }
        self.poll_channel().await
    }

    async fn invoke(
        &self,
        method: &str,
        request: Value,
        metadata: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Rpc {
                code: Code::Unavailable,
                message: "transport handle closed".to_owned(),
            });
        }
        self.started.store(true, Ordering::Release);

        let path: PathAndQuery =
            format!("/{}/{method}", self.service_path).parse().map_err(|_| {
                ConfigSnafu { message: format!("invalid method name '{method}'") }.build()
            })?;

        let mut grpc = Grpc::new(self.channel.clone())
            .max_encoding_message_size(self.max_send_message_size)
            .max_decoding_message_size(self.max_recv_message_size);
        grpc.ready().await.map_err(ClientError::from)?;

        let mut req = tonic::Request::new(request);
        req.set_timeout(timeout);
        for (key, value) in metadata {
            match (MetadataKey::from_bytes(key.as_bytes()), MetadataValue::try_from(value.as_str()))
            {
                (Ok(key), Ok(value)) => {
                    req.metadata_mut().insert(key, value);
                }
                _ => warn!(key = %key, "skipping invalid metadata pair"),
            }
        }

        match tokio::time::timeout(timeout, grpc.unary(req, path, JsonCodec)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(status.into()),
            Err(_) => Err(ClientError::Rpc {
                code: Code::DeadlineExceeded,
                message: format!("deadline exceeded after {}ms", timeout.as_millis()),
            }),
        }
    }

    async fn close(&self) {
        // Dropping the last channel clone releases the connection; the flag
        // fences off late callers holding this handle.
        self.closed.store(true, Ordering::Release);
    }
}

/// Factory producing [`GrpcTransport`] handles from the client
/// configuration's transport descriptor.
#[derive(Debug, Clone)]
pub struct GrpcTransportFactory {
    grpc_url: String,
    service_path: String,
    tls: TlsMode,
    connect_timeout: Duration,
    keepalive_time: Duration,
    keepalive_timeout: Duration,
    max_send_message_size: usize,
    max_recv_message_size: usize,
}

impl GrpcTransportFactory {
    /// Captures the transport descriptor fields from the configuration.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            grpc_url: config.grpc_url.clone(),
            service_path: config.service_path.clone(),
            tls: config.tls.clone(),
            connect_timeout: config.timeout,
            keepalive_time: config.keepalive_time,
            keepalive_timeout: config.keepalive_timeout,
            max_send_message_size: config.max_send_message_size,
            max_recv_message_size: config.max_recv_message_size,
        }
    }
}

impl TransportFactory for GrpcTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>> {
        let mut endpoint = Endpoint::from_shared(self.grpc_url.clone())
            .context(TransportSnafu)?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .http2_keep_alive_interval(self.keepalive_time)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(true);

        if let TlsMode::Tls(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone()).context(TransportSnafu)?;
        }

        // Lazy: the channel connects when readiness is first driven.
        let channel = endpoint.connect_lazy();
        Ok(Arc::new(GrpcTransport {
            channel,
            service_path: self.service_path.clone(),
            max_send_message_size: self.max_send_message_size,
            max_recv_message_size: self.max_recv_message_size,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}
