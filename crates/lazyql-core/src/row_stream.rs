//! Row streams with consumer-driven backpressure

use std::fmt::Display;
use std::task::Poll;

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::{LazyqlError, Result, Row};

/// A stream of rows whose producer can be paused by the consumer
///
/// The stream yields `Ok(row)` for every row, at most one `Err` (after which it
/// is closed) and ends with `None` once the result set is complete.
pub trait RowStream: Stream<Item = Result<Row>> + Send + Unpin {
    /// Ask the producer to stop sending rows
    fn pause(&mut self);

    /// Let the producer continue
    fn resume(&mut self);

    /// Stop the stream. Calling this more than once has no effect.
    fn close(&mut self);

    /// Whether the stream may still produce rows
    fn is_readable(&self) -> bool;

    /// Future resolving once the stream closed
    fn closed(&self) -> BoxFuture<'static, ()>;
}

pub type BoxRowStream = Box<dyn RowStream>;

impl<S: RowStream + ?Sized> RowStream for Box<S> {
    fn pause(&mut self) {
        (**self).pause()
    }

    fn resume(&mut self) {
        (**self).resume()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_readable(&self) -> bool {
        (**self).is_readable()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        (**self).closed()
    }
}

/// Forward every row of `stream` into `sink`.
///
/// While the sink is not ready for another row the stream is paused, and it
/// is resumed as soon as the sink drains. The sink is closed once the stream
/// ends; on a stream error or a sink failure the stream is closed and the
/// error returned.
pub async fn pipe<R, S>(mut stream: R, mut sink: S) -> Result<()>
where
    R: RowStream,
    S: Sink<Row> + Unpin,
    S::Error: Display,
{
    while let Some(item) = stream.next().await {
        let row = match item {
            Ok(row) => row,
            Err(error) => {
                stream.close();
                return Err(error);
            }
        };

        let ready = match future::poll_fn(|cx| Poll::Ready(sink.poll_ready_unpin(cx))).await {
            Poll::Ready(ready) => ready,
            Poll::Pending => {
                tracing::trace!("downstream full, pausing row stream");
                stream.pause();
                let ready = future::poll_fn(|cx| sink.poll_ready_unpin(cx)).await;
                stream.resume();
                ready
            }
        };

        if let Err(error) = ready.and_then(|()| sink.start_send_unpin(row)) {
            stream.close();
            return Err(LazyqlError::Stream(error.to_string()));
        }
    }

    sink.close()
        .await
        .map_err(|error| LazyqlError::Stream(error.to_string()))
}
