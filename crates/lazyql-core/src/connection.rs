//! Connection, factory and flow-control traits

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{BoxRowStream, QueryResult, Result, Value};

/// A database connection
///
/// Physical connections implement this on top of a protocol session; the lazy
/// connection implements it on top of a [`Factory`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement and buffer its whole result
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Execute a statement and stream its rows as they are decoded
    ///
    /// Fails synchronously when the connection is already closed.
    fn query_stream(&self, sql: &str, params: &[Value]) -> Result<BoxRowStream>;

    /// Check that the server is still responsive
    async fn ping(&self) -> Result<()>;

    /// Gracefully close the connection once queued commands completed
    async fn quit(&self) -> Result<()>;

    /// Immediately close the connection. Calling this more than once has no effect.
    fn close(&self);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Future resolving once the connection reported closed, for any reason
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Read-side flow control of a physical connection
///
/// Pausing stops reading from the socket, so the server eventually stops
/// sending. Shared by every command running on the connection.
pub trait FlowControl: Send + Sync {
    fn pause(&self);

    fn resume(&self);
}

/// Factory trait for creating physical connections
#[async_trait]
pub trait Factory: Send + Sync + 'static {
    /// Create a ready-to-use connection for the given URI
    async fn create_connection(&self, uri: &str) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
impl<T: Factory> Factory for Arc<T> {
    async fn create_connection(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        (**self).create_connection(uri).await
    }
}
