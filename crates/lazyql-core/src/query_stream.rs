//! Streaming relay between a query command and its connection's flow control
//!
//! A physical connection runs many commands one after another, so a slow
//! consumer of one streaming query must not stall it forever. Pausing a
//! [`QueryStream`] pauses the connection only while that query is actually
//! producing rows, and closing the stream always leaves the connection resumed.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{Sink, Stream};

use crate::command::FlowGate;
use crate::{
    CloseSignal, Command, CommandEvent, FlowControl, LazyqlError, Result, Row, RowStream,
};

#[cfg(test)]
mod tests;

/// Rows of one streaming query
///
/// Yields each row as `Ok(row)`. A failed query yields one `Err` and then
/// ends; a completed one simply ends. The stream closes itself in both cases,
/// and closes when dropped.
pub struct QueryStream {
    command: Option<Command>,
    gate: FlowGate,
    closed: bool,
    signal: CloseSignal,
}

impl QueryStream {
    /// Relay the rows of `command`, applying backpressure to `connection`
    pub fn new(command: Command, connection: Arc<dyn FlowControl>) -> Self {
        let gate = command.gate();
        gate.attach(connection);

        Self {
            command: Some(command),
            gate,
            closed: false,
            signal: CloseSignal::new(),
        }
    }

    /// Pause the connection while this query is producing rows.
    ///
    /// Before the first row arrives the request is only recorded; the
    /// connection is paused as soon as the producer emits that row.
    pub fn pause(&mut self) {
        self.gate.pause();
    }

    pub fn resume(&mut self) {
        self.gate.resume();
    }

    /// Stop relaying rows. Calling this more than once has no effect.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        self.gate.close();
        if let Some(mut command) = self.command.take() {
            command.detach();
        }
        self.signal.notify();
        tracing::debug!("query stream closed");
    }

    pub fn is_readable(&self) -> bool {
        !self.closed
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Future resolving once the stream closed
    pub fn closed(&self) -> BoxFuture<'static, ()> {
        self.signal.closed()
    }

    /// Forward every row into `sink`, see [`crate::pipe`]
    pub async fn pipe<S>(self, sink: S) -> Result<()>
    where
        S: Sink<Row> + Unpin,
        S::Error: Display,
    {
        crate::pipe(self, sink).await
    }
}

impl Stream for QueryStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(command) = this.command.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(command.poll_event(cx)) {
            Some(CommandEvent::Result(row)) => Poll::Ready(Some(Ok(row))),
            Some(CommandEvent::End) | Some(CommandEvent::Success) => {
                this.close();
                Poll::Ready(None)
            }
            Some(CommandEvent::Error(error)) => {
                this.close();
                Poll::Ready(Some(Err(error)))
            }
            None => {
                this.close();
                Poll::Ready(Some(Err(LazyqlError::Query(
                    "query command ended without completing".into(),
                ))))
            }
        }
    }
}

impl FusedStream for QueryStream {
    fn is_terminated(&self) -> bool {
        self.closed
    }
}

impl RowStream for QueryStream {
    fn pause(&mut self) {
        QueryStream::pause(self)
    }

    fn resume(&mut self) {
        QueryStream::resume(self)
    }

    fn close(&mut self) {
        QueryStream::close(self)
    }

    fn is_readable(&self) -> bool {
        QueryStream::is_readable(self)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        QueryStream::closed(self)
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.close();
    }
}
