//! Lazy connection state machine

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, Shared};
use lazyql_core::{
    BoxRowStream, CloseSignal, Connection, Factory, LazyqlError, QueryResult, Result, RowStream,
    Value,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::stream::LazyQueryStream;
use crate::config::LazyConfig;

/// Connection attempt shared by every operation waiting on it
type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<dyn Connection>>>>;

/// Outcome of an attempt as seen by `close()`
///
/// Shared between the task running the factory and the lazy connection, so
/// that a connection established after `close()` is closed right away.
#[derive(Default)]
struct Settled {
    cancelled: bool,
    connection: Option<Arc<dyn Connection>>,
}

struct Attempt {
    id: u64,
    future: ConnectFuture,
    abort: AbortHandle,
    settled: Arc<Mutex<Settled>>,
}

struct IdleTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    attempt: Option<Attempt>,
    pending: usize,
    idle_timer: Option<IdleTimer>,
    /// Connection being quit after an idle timeout, with its attempt id
    disconnecting: Option<(u64, Arc<dyn Connection>)>,
    closed: bool,
}

struct Inner {
    factory: Arc<dyn Factory>,
    uri: String,
    idle_period: Option<Duration>,
    state: Mutex<State>,
    signal: CloseSignal,
    next_id: AtomicU64,
}

/// A connection that connects on demand and disconnects when idle
///
/// Operations may be issued at any time: the first one starts a connection
/// attempt, concurrent ones share it, and once the last pending operation
/// settles an idle timer is armed. When it fires the physical connection is
/// quit (or force-closed if quitting fails) and the next operation connects
/// again. A failed attempt is never cached.
///
/// Closing is terminal: every later operation fails with
/// [`LazyqlError::Closed`]. Dropping the handle closes it.
///
/// Operations spawn Tokio tasks and must run inside a Tokio runtime.
pub struct LazyConnection {
    inner: Arc<Inner>,
}

impl LazyConnection {
    /// Create a lazy connection for `uri` without connecting.
    ///
    /// The `idle` parameter of the URI overrides the default idle period; the
    /// URI itself is handed to the factory unchanged.
    pub fn new<F: Factory>(factory: F, uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        let config = LazyConfig::from_uri(&uri)?;
        Ok(Self::with_config(factory, uri, config))
    }

    /// Create a lazy connection with an explicit configuration
    pub fn with_config<F: Factory>(factory: F, uri: impl Into<String>, config: LazyConfig) -> Self {
        let uri = uri.into();
        tracing::debug!(idle_period = ?config.idle_period(), "creating lazy connection");

        Self {
            inner: Arc::new(Inner {
                factory: Arc::new(factory),
                uri,
                idle_period: config.idle_period(),
                state: Mutex::new(State::default()),
                signal: CloseSignal::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Stream the rows of a query.
    ///
    /// The returned stream exists immediately and starts producing rows once
    /// the connection is ready; a failed connection attempt is reported as
    /// its only item. The operation stays pending until the stream closes.
    ///
    /// Fails right away if this connection is closed.
    pub fn query_stream(&self, sql: &str, params: &[Value]) -> Result<LazyQueryStream> {
        self.inner.ensure_open()?;

        // Busy before the physical stream exists, so the idle timer cannot
        // retire the connection in between.
        let busy = self.inner.busy();
        let connecting = self.inner.connecting();
        let (delivery, stream) = LazyQueryStream::channel();
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::spawn(async move {
            let physical = match connecting.await.and_then(|conn| conn.query_stream(&sql, &params)) {
                Ok(physical) => physical,
                Err(error) => {
                    drop(busy);
                    delivery.deliver(Err(error));
                    return;
                }
            };

            let closed = physical.closed();
            if let Some(mut physical) = delivery.deliver(Ok(physical)) {
                // Caller dropped the stream before it was ready
                physical.close();
            }
            closed.await;
            drop(busy);
        });

        Ok(stream)
    }

    /// URI handed to the factory
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Idle period before disconnecting, if enabled
    pub fn idle_period(&self) -> Option<Duration> {
        self.inner.idle_period
    }

    /// Number of operations currently delegated to the physical connection
    pub fn pending_operations(&self) -> usize {
        self.inner.state.lock().pending
    }

    /// Whether an idle timeout is currently armed
    pub fn has_idle_timer(&self) -> bool {
        self.inner.state.lock().idle_timer.is_some()
    }

    /// Whether a connection attempt is cached, whether still in flight or
    /// already established
    pub fn has_connection_attempt(&self) -> bool {
        self.inner.state.lock().attempt.is_some()
    }
}

#[async_trait]
impl Connection for LazyConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.inner.ensure_open()?;
        let _busy = self.inner.busy();

        let connection = self.inner.connecting().await?;
        connection.query(sql, params).await
    }

    fn query_stream(&self, sql: &str, params: &[Value]) -> Result<BoxRowStream> {
        let stream = LazyConnection::query_stream(self, sql, params)?;
        Ok(Box::new(stream))
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let _busy = self.inner.busy();

        let connection = self.inner.connecting().await?;
        connection.ping().await
    }

    async fn quit(&self) -> Result<()> {
        let idle = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(LazyqlError::Closed);
            }
            state.attempt.is_none()
        };

        // Never connected: nothing to flush
        if idle {
            self.inner.close();
            return Ok(());
        }

        let _busy = self.inner.busy();
        let connection = self.inner.connecting().await?;
        let result = connection.quit().await;
        self.inner.close();
        result
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.inner.signal.closed()
    }
}

impl Drop for LazyConnection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Pending-operation marker: counts as busy until dropped
struct Busy {
    inner: Arc<Inner>,
}

impl Drop for Busy {
    fn drop(&mut self) {
        self.inner.idle();
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            Err(LazyqlError::Closed)
        } else {
            Ok(())
        }
    }

    /// Mark an operation as pending until the returned guard is dropped
    fn busy(self: &Arc<Self>) -> Busy {
        self.awake();
        Busy {
            inner: Arc::clone(self),
        }
    }

    fn awake(&self) {
        let timer = {
            let mut state = self.state.lock();
            state.pending += 1;
            state.idle_timer.take()
        };

        if let Some(timer) = timer {
            tracing::debug!(timer = timer.id, "operation started, cancelling idle timer");
            timer.handle.abort();
        }
    }

    fn idle(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);

        if state.pending > 0 || state.closed || state.attempt.is_none() {
            return;
        }
        let Some(period) = self.idle_period else {
            return;
        };
        // Dropped outside a runtime (e.g. during shutdown): nothing left to disconnect with
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let id = self.next_id();
        tracing::debug!(timer = id, ?period, "no pending operations, arming idle timer");
        let handle = runtime.spawn(idle_timeout(Arc::downgrade(self), period, id));
        if let Some(previous) = state.idle_timer.replace(IdleTimer { id, handle }) {
            previous.handle.abort();
        }
    }

    /// The current connection attempt, starting one if none is outstanding
    fn connecting(self: &Arc<Self>) -> ConnectFuture {
        let previous = {
            let mut state = self.state.lock();
            if let Some(attempt) = &state.attempt {
                return attempt.future.clone();
            }
            state.disconnecting.take()
        };

        // Never let two physical connections coexist
        if let Some((id, connection)) = previous {
            tracing::debug!(attempt = id, "force-closing connection still shutting down");
            connection.close();
        }

        let mut state = self.state.lock();
        if state.closed {
            return futures::future::ready(Err(LazyqlError::Closed))
                .boxed()
                .shared();
        }
        if let Some(attempt) = &state.attempt {
            return attempt.future.clone();
        }

        let attempt = self.start_attempt();
        let future = attempt.future.clone();
        state.attempt = Some(attempt);
        future
    }

    fn start_attempt(self: &Arc<Self>) -> Attempt {
        let id = self.next_id();
        let settled = Arc::new(Mutex::new(Settled::default()));
        let (abort, registration) = AbortHandle::new_pair();
        tracing::debug!(attempt = id, "starting connection attempt");

        let task = tokio::spawn(connect(
            Arc::downgrade(self),
            Arc::clone(&self.factory),
            self.uri.clone(),
            id,
            Arc::clone(&settled),
        ));

        let future = Abortable::new(task, registration)
            .map(|outcome| match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(LazyqlError::Connection(format!(
                    "connection task failed: {}",
                    join_error
                ))),
                Err(Aborted) => Err(LazyqlError::Cancelled),
            })
            .boxed()
            .shared();

        Attempt {
            id,
            future,
            abort,
            settled,
        }
    }

    /// Drop a failed attempt so the next operation retries
    fn discard_attempt(&self, id: u64) {
        let mut state = self.state.lock();
        if state.attempt.as_ref().is_some_and(|attempt| attempt.id == id) {
            state.attempt = None;
        }
    }

    /// Forget an established connection that reported closed
    fn forget_connection(&self, id: u64) {
        let timer = {
            let mut state = self.state.lock();
            if !state.attempt.as_ref().is_some_and(|attempt| attempt.id == id) {
                return;
            }
            state.attempt = None;
            state.idle_timer.take()
        };

        tracing::debug!(attempt = id, "connection closed, will reconnect on demand");
        if let Some(timer) = timer {
            timer.handle.abort();
        }
    }

    /// Quit the connection after the idle timer `timer_id` fired
    async fn disconnect_idle(&self, timer_id: u64) {
        let attempt = {
            let mut state = self.state.lock();
            if !state.idle_timer.as_ref().is_some_and(|timer| timer.id == timer_id) {
                return;
            }
            state.idle_timer = None;
            // Forget the attempt right away: operations issued while quitting
            // start a fresh connection instead of reusing this one.
            state.attempt.take()
        };
        let Some(attempt) = attempt else {
            return;
        };

        let Ok(connection) = attempt.future.await else {
            return;
        };

        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                connection.close();
                return;
            }
            state.disconnecting = Some((attempt.id, Arc::clone(&connection)));
        }

        tracing::info!(attempt = attempt.id, "idle period elapsed, disconnecting");
        if let Err(error) = connection.quit().await {
            tracing::warn!(attempt = attempt.id, %error, "graceful disconnect failed, closing connection");
            connection.close();
        }

        let mut state = self.state.lock();
        if state
            .disconnecting
            .as_ref()
            .is_some_and(|(id, _)| *id == attempt.id)
        {
            state.disconnecting = None;
        }
    }

    fn close(&self) {
        let (disconnecting, attempt, timer) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.disconnecting.take(),
                state.attempt.take(),
                state.idle_timer.take(),
            )
        };

        if let Some((_, connection)) = disconnecting {
            connection.close();
        }

        if let Some(attempt) = attempt {
            let established = {
                let mut settled = attempt.settled.lock();
                settled.cancelled = true;
                settled.connection.take()
            };
            if let Some(connection) = established {
                connection.close();
            }
            attempt.abort.abort();
        }

        if let Some(timer) = timer {
            timer.handle.abort();
        }

        tracing::debug!("lazy connection closed");
        self.signal.notify();
    }
}

/// Run the factory for attempt `id`
async fn connect(
    inner: Weak<Inner>,
    factory: Arc<dyn Factory>,
    uri: String,
    id: u64,
    settled: Arc<Mutex<Settled>>,
) -> Result<Arc<dyn Connection>> {
    let result = factory.create_connection(&uri).await;

    match &result {
        Ok(connection) => {
            let cancelled = {
                let mut settled = settled.lock();
                if !settled.cancelled {
                    settled.connection = Some(Arc::clone(connection));
                }
                settled.cancelled
            };

            if cancelled {
                tracing::debug!(attempt = id, "connected after close, closing connection");
                connection.close();
            } else {
                tracing::info!(attempt = id, "connection established");
                tokio::spawn(watch_close(inner, connection.closed(), id));
            }
        }
        Err(error) => {
            tracing::warn!(attempt = id, %error, "connection attempt failed");
            if let Some(inner) = inner.upgrade() {
                inner.discard_attempt(id);
            }
        }
    }

    result
}

async fn watch_close(inner: Weak<Inner>, closed: BoxFuture<'static, ()>, id: u64) {
    closed.await;
    if let Some(inner) = inner.upgrade() {
        inner.forget_connection(id);
    }
}

async fn idle_timeout(inner: Weak<Inner>, period: Duration, id: u64) {
    tokio::time::sleep(period).await;
    if let Some(inner) = inner.upgrade() {
        inner.disconnect_idle(id).await;
    }
}
