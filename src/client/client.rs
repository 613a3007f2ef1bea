//! The client facade.
//!
//! [`TcpClient`] owns one engine and serializes all engine work on a single
//! [`Worker`]. It adds what the engines do not do themselves: single-flight
//! connect with retry and backoff, admission control for requests, pacing,
//! and background reconnect after a transport failure.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout_at};

use super::config::ClientConfig;
use super::worker::Worker;
use crate::core::{ClientError, ClientResult};
use crate::engine::{self, Engine};
use crate::events::EventDispatcher;
use crate::transport::{ConnectionState, MetricsSnapshot, RequestPacer, Response, StateInfo};

type ConnectFlight = Shared<BoxFuture<'static, ClientResult<()>>>;

/// Framed request/response client.
///
/// Cloning is cheap; clones share the connection.
///
/// # Example
///
/// ```no_run
/// use isosocket::prelude::*;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::builder("switch.example.com", 5000)
///     .framer(LengthPrefixedFramer::default())
///     .build()?;
/// let client = TcpClient::new(config)?;
/// client.connect().await?;
/// let response = client.send_and_receive(b"0800...").await?;
/// println!("{} bytes in {:?}", response.payload().len(), response.rtt());
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ClientConfig>,
    events: Arc<EventDispatcher>,
    engine: Arc<dyn Engine>,
    worker: Worker,
    queue: Arc<Semaphore>,
    in_flight: Arc<Semaphore>,
    pacer: RequestPacer,
    flight: Mutex<Option<ConnectFlight>>,
    connecting: AtomicBool,
    closed: AtomicBool,
    last_connect: Mutex<Option<SystemTime>>,
    last_disconnect: Mutex<Option<SystemTime>>,
}

/// Clears the connecting flag when a connect flight ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TcpClient {
    /// Create a client. Does not connect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;
        config.validate()?;
        let config = Arc::new(config);
        let events = Arc::new(EventDispatcher::new(
            config.label.clone(),
            config.listener.clone(),
            Arc::clone(&config.dispatch),
        ));
        let engine = engine::create(Arc::clone(&config), Arc::clone(&events))?;
        Ok(Self::with_engine(config, events, engine))
    }

    pub(crate) fn with_engine(
        config: Arc<ClientConfig>,
        events: Arc<EventDispatcher>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let limits = config.limits;
        let inner = ClientInner {
            worker: Worker::spawn(&config.label),
            queue: Arc::new(Semaphore::new(limits.queue_capacity)),
            in_flight: Arc::new(Semaphore::new(limits.max_in_flight)),
            pacer: RequestPacer::new(limits.min_inter_request_delay),
            flight: Mutex::new(None),
            connecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_connect: Mutex::new(None),
            last_disconnect: Mutex::new(None),
            config,
            events,
            engine,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Connect, retrying per the configured policy.
    ///
    /// Concurrent callers share one attempt and see the same outcome.
    /// Returns immediately when already ready.
    pub async fn connect(&self) -> ClientResult<()> {
        self.inner.connect().await
    }

    /// Send one request with the configured request timeout.
    pub async fn send_and_receive(&self, payload: &[u8]) -> ClientResult<Response> {
        self.send_and_receive_with_timeout(payload, self.inner.config.timeouts.request)
            .await
    }

    /// Send one request and wait for its response frame.
    ///
    /// `timeout` covers queueing and the exchange. Waiting for a queue slot
    /// past it fails with [`ClientError::QueueTimeout`]; running out of time
    /// afterwards fails with [`ClientError::RequestTimeout`].
    pub async fn send_and_receive_with_timeout(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> ClientResult<Response> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if !inner.engine.is_ready() {
            return Err(ClientError::NotReady);
        }

        let deadline = Instant::now() + timeout;
        let slot = timeout_at(deadline, Arc::clone(&inner.queue).acquire_owned())
            .await
            .map_err(|_| ClientError::QueueTimeout(timeout))?
            .map_err(|_| ClientError::ClientClosed)?;

        let job = {
            let inner = Arc::clone(inner);
            let payload = payload.to_vec();
            async move {
                let _slot = slot;
                let _permit = Arc::clone(&inner.in_flight)
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::ClientClosed)?;
                inner.ensure_open()?;
                inner.pacer.pace().await;

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ClientError::RequestTimeout(timeout));
                }
                let result = inner.engine.send_and_receive(&payload, remaining).await;
                match &result {
                    Ok(response) => inner.events.metrics().record_rtt(response.rtt()),
                    Err(error) => inner.after_request_failure(error),
                }
                result
            }
        };

        let done = inner.worker.submit(job)?;
        match timeout_at(deadline, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ClientClosed),
            Err(_) => Err(ClientError::RequestTimeout(timeout)),
        }
    }

    /// Send one request with the configured timeout, then close the client
    /// whatever the outcome.
    pub async fn send_and_receive_then_close(&self, payload: &[u8]) -> ClientResult<Response> {
        let result = self.send_and_receive(payload).await;
        let closed = self.close().await;
        let response = result?;
        closed?;
        Ok(response)
    }

    /// Same as [`close`](Self::close).
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.close().await
    }

    /// Close the client. Idempotent; the client cannot be reconnected.
    pub async fn close(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        inner.queue.close();
        inner.in_flight.close();
        inner.worker.abort();
        *inner.last_disconnect.lock() = Some(SystemTime::now());
        tracing::debug!(client = %inner.config.label, "closing");
        inner.engine.close().await
    }

    /// Whether a connect attempt (including backoff) is under way.
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    /// Whether the transport is established.
    pub fn is_connected(&self) -> bool {
        self.inner.engine.is_connected()
    }

    /// Whether requests can be sent.
    pub fn is_ready(&self) -> bool {
        self.inner.is_open() && self.inner.engine.is_ready()
    }

    /// Whether [`close`](Self::close) has not been called.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    /// Open but not ready.
    pub fn is_disconnected(&self) -> bool {
        self.inner.is_open() && !self.inner.engine.is_ready()
    }

    /// Most recently reported lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else {
            self.inner.events.state()
        }
    }

    /// Time of the last successful connect.
    pub fn last_connect_time(&self) -> Option<SystemTime> {
        *self.inner.last_connect.lock()
    }

    /// Time of the last observed disconnect or close.
    pub fn last_disconnect_time(&self) -> Option<SystemTime> {
        *self.inner.last_disconnect.lock()
    }

    /// Traffic counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.events.metrics().snapshot()
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("label", &self.inner.config.label)
            .field("engine", &self.inner.engine)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::ClientClosed)
        }
    }

    async fn connect(self: &Arc<Self>) -> ClientResult<()> {
        self.ensure_open()?;
        if self.engine.is_ready() {
            return Ok(());
        }
        let flight = {
            let mut slot = self.flight.lock();
            match slot.as_ref() {
                Some(flight) if self.connecting.load(Ordering::SeqCst) => flight.clone(),
                _ => {
                    self.connecting.store(true, Ordering::SeqCst);
                    let flight = spawn_shared(Arc::clone(self).connect_with_retry());
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    async fn connect_with_retry(self: Arc<Self>) -> ClientResult<()> {
        let _guard = FlightGuard(&self.connecting);
        let policy = &self.config.retry;
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;

        loop {
            self.ensure_open()?;
            attempt += 1;
            let error = match self.connect_once().await {
                Ok(()) => {
                    *self.last_connect.lock() = Some(SystemTime::now());
                    return Ok(());
                }
                Err(error) => error,
            };
            if matches!(error, ClientError::ClientClosed) {
                return Err(error);
            }

            let kind = error.connect_kind();
            if !policy.is_retryable(kind) {
                tracing::debug!(client = %self.config.label, ?kind, %error, "connect failed, not retrying");
                return Err(error);
            }
            if attempt >= policy.max_attempts {
                self.events.retry_exhausted(&error);
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = backoff.next_delay();
            self.events.state_changed(
                ConnectionState::BackingOff,
                StateInfo::backoff(attempt, delay),
            );
            self.events.retry_scheduled(attempt, delay, &error);
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(&self) -> ClientResult<()> {
        let engine = Arc::clone(&self.engine);
        let done = self.worker.submit(async move { engine.connect().await })?;
        done.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Runs on the worker right after a failed exchange.
    fn after_request_failure(self: &Arc<Self>, error: &ClientError) {
        if matches!(error, ClientError::NotReady | ClientError::ClientClosed)
            || self.engine.is_connected()
            || !self.is_open()
        {
            return;
        }
        *self.last_disconnect.lock() = Some(SystemTime::now());
        tracing::warn!(client = %self.config.label, %error, "connection lost");
        self.events
            .state_changed(ConnectionState::Disconnected, StateInfo::default());

        if self.config.auto_reconnect {
            self.events
                .state_changed(ConnectionState::Reconnecting, StateInfo::default());
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = inner.connect().await {
                    tracing::warn!(client = %inner.config.label, %error, "background reconnect failed");
                }
            });
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Run `future` as its own task so it completes even if every waiter
/// goes away, and share its outcome.
fn spawn_shared<F>(future: F) -> ConnectFlight
where
    F: Future<Output = ClientResult<()>> + Send + 'static,
{
    let task = tokio::spawn(future);
    async move {
        task.await
            .unwrap_or_else(|e| Err(ClientError::Io(Arc::new(io::Error::other(e)))))
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfigBuilder, Limits, RetryPolicy};
    use crate::core::ConnectErrorKind;
    use crate::events::{Event, InlineDispatch};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct MockEngine {
        connects: AtomicUsize,
        failures_left: AtomicUsize,
        connect_delay: Duration,
        reply_delay: Duration,
        ready: AtomicBool,
        drop_next_send: AtomicBool,
    }

    impl MockEngine {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Engine for MockEngine {
        async fn connect(&self) -> ClientResult<()> {
            if self.ready.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(self.connect_delay).await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
                return Err(engine::connect_error(
                    addr,
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                ));
            }
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn send_and_receive(
            &self,
            payload: &[u8],
            timeout: Duration,
        ) -> ClientResult<Response> {
            if !self.ready.load(Ordering::SeqCst) {
                return Err(ClientError::NotReady);
            }
            if self.drop_next_send.swap(false, Ordering::SeqCst) {
                self.ready.store(false, Ordering::SeqCst);
                return Err(ClientError::ConnectionClosed);
            }
            tokio::time::timeout(timeout, tokio::time::sleep(self.reply_delay))
                .await
                .map_err(|_| ClientError::RequestTimeout(timeout))?;
            let now = SystemTime::now();
            Ok(Response::new(payload.to_vec(), self.reply_delay, None, now, now))
        }

        async fn close(&self) -> ClientResult<()> {
            self.ready.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    type EventLog = Arc<parking_lot::Mutex<Vec<Event>>>;

    fn client_with(
        engine: Arc<MockEngine>,
        tune: impl FnOnce(ClientConfigBuilder) -> ClientConfigBuilder,
    ) -> (TcpClient, EventLog) {
        let log: EventLog = Arc::default();
        let sink = Arc::clone(&log);
        let builder = ClientConfig::builder("127.0.0.1", 9)
            .dispatch(InlineDispatch)
            .listener(move |event: &Event| sink.lock().push(event.clone()));
        let config = Arc::new(tune(builder).build().unwrap());
        let events = Arc::new(EventDispatcher::new(
            config.label.clone(),
            config.listener.clone(),
            Arc::clone(&config.dispatch),
        ));
        (TcpClient::with_engine(config, events, engine), log)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        }
    }

    fn count(log: &EventLog, pred: impl Fn(&Event) -> bool) -> usize {
        log.lock().iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn test_new_requires_runtime() {
        let config = ClientConfig::builder("127.0.0.1", 9)
            .dispatch(InlineDispatch)
            .build()
            .unwrap();
        assert!(matches!(
            TcpClient::new(config),
            Err(ClientError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let engine = Arc::new(MockEngine {
            connect_delay: Duration::from_millis(50),
            ..MockEngine::default()
        });
        let (client, _) = client_with(Arc::clone(&engine), |b| b);

        let (a, b) = tokio::join!(client.connect(), client.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
        assert!(client.is_ready());
        assert!(!client.is_connecting());
        assert!(client.last_connect_time().is_some());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_ready() {
        let (client, _) = client_with(Arc::new(MockEngine::default()), |b| b);
        let err = client.send_and_receive(b"ping").await.unwrap_err();
        assert!(matches!(err, ClientError::NotReady));
        assert!(client.is_disconnected());
    }

    #[tokio::test]
    async fn test_exchange_records_rtt() {
        let engine = Arc::new(MockEngine {
            reply_delay: Duration::from_millis(5),
            ..MockEngine::default()
        });
        let (client, _) = client_with(engine, |b| b);
        client.connect().await.unwrap();

        let response = client.send_and_receive(b"ping").await.unwrap();
        assert_eq!(response.payload(), b"ping");
        let metrics = client.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.last_rtt, Some(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_saturated_queue_times_out() {
        let engine = Arc::new(MockEngine {
            reply_delay: Duration::from_millis(300),
            ..MockEngine::default()
        });
        let (client, _) = client_with(engine, |b| {
            b.limits(Limits {
                queue_capacity: 1,
                ..Limits::default()
            })
        });
        client.connect().await.unwrap();

        let busy = client.clone();
        let first = tokio::spawn(async move {
            busy.send_and_receive_with_timeout(b"first", Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client
            .send_and_receive_with_timeout(b"second", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::QueueTimeout(_)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_slow_response_is_request_timeout() {
        let engine = Arc::new(MockEngine {
            reply_delay: Duration::from_millis(300),
            ..MockEngine::default()
        });
        let (client, _) = client_with(engine, |b| b);
        client.connect().await.unwrap();

        let err = client
            .send_and_receive_with_timeout(b"ping", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout(_)));
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_max_attempts() {
        let engine = Arc::new(MockEngine::failing(usize::MAX));
        let (client, log) = client_with(Arc::clone(&engine), |b| b.retry(fast_retry(3)));

        let err = client.connect().await.unwrap_err();
        match err {
            ClientError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.connect_kind(), ConnectErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.connects.load(Ordering::SeqCst), 3);
        assert_eq!(
            count(&log, |e| matches!(e, Event::RetryScheduled { .. })),
            2
        );
        assert_eq!(
            count(&log, |e| matches!(e, Event::RetryExhausted { .. })),
            1
        );
        assert!(!client.is_connecting());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let engine = Arc::new(MockEngine::failing(2));
        let (client, log) = client_with(Arc::clone(&engine), |b| b.retry(fast_retry(3)));

        client.connect().await.unwrap();
        assert_eq!(engine.connects.load(Ordering::SeqCst), 3);
        assert_eq!(
            count(&log, |e| matches!(
                e,
                Event::StateChanged {
                    state: ConnectionState::BackingOff,
                    ..
                }
            )),
            2
        );
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_fails_fast() {
        let engine = Arc::new(MockEngine::failing(usize::MAX));
        let policy = RetryPolicy {
            retry_on: HashSet::from([ConnectErrorKind::Timeout]),
            ..fast_retry(3)
        };
        let (client, log) = client_with(Arc::clone(&engine), |b| b.retry(policy));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            count(&log, |e| matches!(e, Event::RetryExhausted { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_transport_failure_triggers_reconnect() {
        let engine = Arc::new(MockEngine::default());
        let (client, log) = client_with(Arc::clone(&engine), |b| b.auto_reconnect(true));
        client.connect().await.unwrap();

        engine.drop_next_send.store(true, Ordering::SeqCst);
        let err = client.send_and_receive(b"ping").await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(client.last_disconnect_time().is_some());

        for _ in 0..100 {
            if client.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_ready());
        assert_eq!(engine.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            count(&log, |e| matches!(
                e,
                Event::StateChanged {
                    state: ConnectionState::Reconnecting,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_transport_failure_without_reconnect_stays_down() {
        let engine = Arc::new(MockEngine::default());
        let (client, log) = client_with(Arc::clone(&engine), |b| b.auto_reconnect(false));
        client.connect().await.unwrap();

        engine.drop_next_send.store(true, Ordering::SeqCst);
        client.send_and_receive(b"ping").await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(client.is_disconnected());
        assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            count(&log, |e| matches!(
                e,
                Event::StateChanged {
                    state: ConnectionState::Disconnected,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (client, _) = client_with(Arc::new(MockEngine::default()), |b| b);
        client.connect().await.unwrap();

        client.close().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(client.is_closed());
        assert!(!client.is_open());
        assert!(!client.is_ready());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.connect().await,
            Err(ClientError::ClientClosed)
        ));
        assert!(matches!(
            client.send_and_receive(b"ping").await,
            Err(ClientError::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_then_close() {
        let (client, _) = client_with(Arc::new(MockEngine::default()), |b| b);
        client.connect().await.unwrap();

        let response = client.send_and_receive_then_close(b"bye").await.unwrap();
        assert_eq!(response.payload(), b"bye");
        assert!(client.is_closed());
    }
}
