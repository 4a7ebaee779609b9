//! Controllable in-process transport for testing.
//!
//! [`MockTransportFactory`] stands in for the gRPC transport so resilience
//! behavior can be exercised without a real server:
//!
//! - **Scripted responses**: fixed reply per method name
//! - **Failure injection**: `UNAVAILABLE` bursts, arbitrary status scripts,
//!   connect failures
//! - **Timing control**: artificial readiness and invocation delays
//! - **Observability**: factory/ready/invoke/close counters and the last
//!   metadata seen
//!
//! # Example
//!
//! ```no_run
//! use bulwark_client::mock::MockTransportFactory;
//! use bulwark_client::{BulwarkClient, CallOptions, ClientConfig};
//! use serde_json::json;
//!
//! # async fn example() -> bulwark_client::Result<()> {
//! let config = ClientConfig::builder()
//!     .with_service_name("user-service")
//!     .with_grpc_url("http://localhost:50051")
//!     .with_service_path("users.v1.UserService")
//!     .build()?;
//!
//! let factory = MockTransportFactory::new();
//! factory.respond_with("GetUser", json!({"id": 1, "name": "ada"}));
//! factory.inject_unavailable(2); // first two attempts fail
//!
//! let client = BulwarkClient::with_factory(config, factory.clone())?;
//! let user = client.call("GetUser", json!({"id": 1}), CallOptions::default()).await?;
//! assert_eq!(user["name"], "ada");
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tonic::Code;

use crate::{
    error::{ClientError, ConnectionSnafu, Result},
    transport::{ChannelState, Transport, TransportFactory},
};

/// State shared between a factory and every transport it has produced.
#[derive(Debug)]
struct MockShared {
    /// Scripted reply per method name; unscripted methods return `null`.
    responses: RwLock<HashMap<String, Value>>,

    /// Statuses injected ahead of any scripted response, oldest first.
    status_script: Mutex<VecDeque<(Code, String)>>,

    /// Number of `UNAVAILABLE` errors still to inject.
    unavailable_burst: AtomicUsize,

    /// Number of readiness waits still to fail.
    connect_failures: AtomicUsize,

    /// Number of factory `create` calls still to fail.
    create_failures: AtomicUsize,

    /// Artificial delay before readiness completes.
    ready_delay: RwLock<Option<Duration>>,

    /// Artificial delay before each invocation resolves.
    invoke_delay: RwLock<Option<Duration>>,

    /// Connectivity reported to the monitor loop.
    channel_state: RwLock<ChannelState>,

    created: AtomicUsize,
    ready_calls: AtomicUsize,
    invoke_calls: AtomicUsize,
    close_calls: AtomicUsize,

    /// Metadata of the most recent invocation.
    last_metadata: Mutex<Vec<(String, String)>>,
}

impl MockShared {
    fn new() -> Self {
        Self {
            responses: RwLock::new(HashMap::new()),
            status_script: Mutex::new(VecDeque::new()),
            unavailable_burst: AtomicUsize::new(0),
            connect_failures: AtomicUsize::new(0),
            create_failures: AtomicUsize::new(0),
            ready_delay: RwLock::new(None),
            invoke_delay: RwLock::new(None),
            channel_state: RwLock::new(ChannelState::Ready),
            created: AtomicUsize::new(0),
            ready_calls: AtomicUsize::new(0),
            invoke_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            last_metadata: Mutex::new(Vec::new()),
        }
    }
}

/// Decrements `counter` if it is positive, returning whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| current.checked_sub(1))
        .is_ok()
}

/// Factory producing mock transports that share one scripted state.
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    shared: Arc<MockShared>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    /// Creates a factory with no scripted failures and a `Ready` channel.
    #[must_use]
    pub fn new() -> Self {
        Self { shared: Arc::new(MockShared::new()) }
    }

    /// Scripts a fixed reply for `method`.
    pub fn respond_with(&self, method: &str, response: Value) {
        self.shared.responses.write().insert(method.to_owned(), response);
    }

    /// Injects `count` consecutive `UNAVAILABLE` failures before any
    /// scripted response is served.
    pub fn inject_unavailable(&self, count: usize) {
        self.shared.unavailable_burst.store(count, Ordering::SeqCst);
    }

    /// Queues a status to fail the next invocation with.
    pub fn push_status(&self, code: Code, message: &str) {
        self.shared.status_script.lock().push_back((code, message.to_owned()));
    }

    /// Fails the next `count` readiness waits.
    pub fn fail_connects(&self, count: usize) {
        self.shared.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` factory `create` calls.
    pub fn fail_creates(&self, count: usize) {
        self.shared.create_failures.store(count, Ordering::SeqCst);
    }

    /// Delays readiness completion by `delay`.
    pub fn set_ready_delay(&self, delay: Duration) {
        *self.shared.ready_delay.write() = Some(delay);
    }

    /// Delays every invocation by `delay`.
    pub fn set_invoke_delay(&self, delay: Duration) {
        *self.shared.invoke_delay.write() = Some(delay);
    }

    /// Sets the connectivity reported to the monitor loop.
    pub fn set_channel_state(&self, state: ChannelState) {
        *self.shared.channel_state.write() = state;
    }

    /// Number of transports created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Number of readiness waits so far.
    #[must_use]
    pub fn ready_calls(&self) -> usize {
        self.shared.ready_calls.load(Ordering::SeqCst)
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn invoke_calls(&self) -> usize {
        self.shared.invoke_calls.load(Ordering::SeqCst)
    }

    /// Number of transport closes so far.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    /// Metadata attached to the most recent invocation.
    #[must_use]
    pub fn last_metadata(&self) -> Vec<(String, String)> {
        self.shared.last_metadata.lock().clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>> {
        if take_one(&self.shared.create_failures) {
            return ConnectionSnafu { message: "injected factory failure" }.fail();
        }
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport { shared: Arc::clone(&self.shared) }))
    }
}

/// Transport handle produced by [`MockTransportFactory`].
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn wait_for_ready(&self, _timeout: Duration) -> Result<()> {
        self.shared.ready_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.ready_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.shared.connect_failures) {
            return ConnectionSnafu { message: "injected connect failure" }.fail();
        }
        Ok(())
    }

    async fn channel_state(&self) -> ChannelState {
        *self.shared.channel_state.read()
    }

    async fn invoke(
        &self,
        method: &str,
        _request: Value,
        metadata: &[(String, String)],
        _timeout: Duration,
    ) -> Result<Value> {
        self.shared.invoke_calls.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_metadata.lock() = metadata.to_vec();

        let delay = *self.shared.invoke_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.shared.unavailable_burst) {
            return Err(ClientError::Rpc {
                code: Code::Unavailable,
                message: "injected unavailable".to_owned(),
            });
        }

        if let Some((code, message)) = self.shared.status_script.lock().pop_front() {
            return Err(ClientError::Rpc { code, message });
        }

        let responses = self.shared.responses.read();
        Ok(responses.get(method).cloned().unwrap_or(Value::Null))
    }

    async fn close(&self) {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}
