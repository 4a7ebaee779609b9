//! Client error types with retry classification.
//!
//! Provides a single error surface for the engine:
//! - **Transport errors**: Connection establishment, HTTP/2, TLS
//! - **Wire errors**: gRPC status codes from the remote service
//! - **Local errors**: Misconfiguration, closed client, invalid cache keys
//!
//! Errors carry retryability and connection-lost classification used by the
//! call orchestrator and the connection manager.

use snafu::{Location, Snafu};
use tonic::Code;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error surface for the resilient client engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    /// The channel could not be established or did not become ready.
    #[snafu(display("could not establish connection ({location}): {message}"))]
    Connection {
        /// What went wrong while connecting.
        message: String,
        /// Where the failure was observed.
        #[snafu(implicit)]
        location: Location,
    },

    /// Failure inside the HTTP/2 or TLS layer.
    #[snafu(display("transport failure ({location}): {source}"))]
    Transport {
        /// Underlying transport error.
        source: tonic::transport::Error,
        /// Where the failure was observed.
        #[snafu(implicit)]
        location: Location,
    },

    /// The remote service answered with a non-OK status.
    #[snafu(display("remote call failed with {code:?}: {message}"))]
    Rpc {
        /// gRPC status code.
        code: Code,
        /// Status details when the server set them, otherwise the status message.
        message: String,
    },

    /// The service could not be reached and no cached response was available.
    #[snafu(display("{service} is not available"))]
    Unavailable {
        /// Name of the remote service.
        service: String,
    },

    /// The client configuration failed validation.
    #[snafu(display("invalid configuration: {message}"))]
    Config {
        /// Which setting was rejected and why.
        message: String,
    },

    /// A cache key failed validation.
    #[snafu(display("invalid cache key: {message}"))]
    InvalidCacheKey {
        /// Why the key was rejected.
        message: String,
    },

    /// The client has been closed and accepts no new work.
    #[snafu(display("client is shutting down"))]
    Shutdown,
}

impl ClientError {
    /// Returns true if the error is transient and the attempt should be retried.
    ///
    /// Retryable wire codes:
    /// - `UNAVAILABLE`: Server temporarily unreachable
    /// - `DEADLINE_EXCEEDED`: Attempt timed out
    /// - `RESOURCE_EXHAUSTED`: Rate limited
    /// - `ABORTED`: Conflict (retry may succeed)
    ///
    /// Connection and transport failures are retryable; everything local
    /// (configuration, shutdown, invalid keys) is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Connection { .. } => true,
            Self::Rpc { code, .. } => matches!(
                code,
                Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
            ),
            Self::Unavailable { .. } => false,
            Self::Config { .. } => false,
            Self::InvalidCacheKey { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Returns true if the error signals that the underlying connection was
    /// lost and the connection manager should drop and rebuild the handle.
    ///
    /// Only `UNAVAILABLE` carries this meaning; other retryable codes leave
    /// the channel intact.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Rpc { code: Code::Unavailable, .. })
    }

    /// Returns the gRPC status code if this is a wire error.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns the numeric wire status if this is a wire error.
    #[must_use]
    pub fn status_code(&self) -> Option<i32> {
        self.code().map(|code| code as i32)
    }

    /// Alias for [`status_code`](Self::status_code), preserved for callers
    /// ported from clients that exposed the status under this name.
    #[must_use]
    pub fn grpc_code(&self) -> Option<i32> {
        self.status_code()
    }
}

impl From<tonic::transport::Error> for ClientError {
    fn from(source: tonic::transport::Error) -> Self {
        Self::Transport {
            source,
            location: Location::default(),
        }
    }
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc {
            code: status.code(),
            message: status.message().to_owned(),
        }
    }
}
