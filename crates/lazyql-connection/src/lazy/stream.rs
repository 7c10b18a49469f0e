//! Row stream handed out before the connection exists

use std::fmt::Display;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{Sink, Stream, StreamExt};
use lazyql_core::{BoxRowStream, CloseSignal, LazyqlError, Result, Row, RowStream};
use parking_lot::Mutex;

enum Source {
    /// Waiting for the connection to start the query
    Pending,
    Streaming(BoxRowStream),
    Failed(LazyqlError),
    Done,
}

struct Slot {
    source: Source,
    paused: bool,
    waker: Option<Waker>,
}

/// Task side of a [`LazyQueryStream`]: hands over the physical stream
///
/// Dropped without delivering, it fails the stream with
/// [`LazyqlError::Cancelled`].
pub(super) struct Delivery {
    slot: Arc<Mutex<Slot>>,
    delivered: bool,
}

impl Delivery {
    /// Hand over the physical stream or the reason there is none.
    ///
    /// A pause requested in the meantime is applied before the stream becomes
    /// visible. If the lazy stream is already closed the physical stream is
    /// given back so the caller can close it.
    pub(super) fn deliver(mut self, result: Result<BoxRowStream>) -> Option<BoxRowStream> {
        self.delivered = true;
        self.complete(result)
    }

    fn complete(&self, result: Result<BoxRowStream>) -> Option<BoxRowStream> {
        let waker = {
            let mut slot = self.slot.lock();
            if !matches!(slot.source, Source::Pending) {
                return result.ok();
            }

            let paused = slot.paused;
            slot.source = match result {
                Ok(mut stream) => {
                    if paused {
                        stream.pause();
                    }
                    Source::Streaming(stream)
                }
                Err(error) => Source::Failed(error),
            };
            slot.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        None
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.delivered {
            self.complete(Err(LazyqlError::Cancelled));
        }
    }
}

/// Rows of a query issued on a [`LazyConnection`](super::LazyConnection)
///
/// Pause and resume requests made before the connection is ready are
/// remembered and applied to the physical stream the moment it exists. A
/// failed connection attempt is yielded as the only item.
pub struct LazyQueryStream {
    slot: Arc<Mutex<Slot>>,
    closed: bool,
    signal: CloseSignal,
}

impl LazyQueryStream {
    pub(super) fn channel() -> (Delivery, Self) {
        let slot = Arc::new(Mutex::new(Slot {
            source: Source::Pending,
            paused: false,
            waker: None,
        }));

        let delivery = Delivery {
            slot: slot.clone(),
            delivered: false,
        };
        let stream = Self {
            slot,
            closed: false,
            signal: CloseSignal::new(),
        };
        (delivery, stream)
    }

    pub fn pause(&mut self) {
        let mut slot = self.slot.lock();
        slot.paused = true;
        if let Source::Streaming(stream) = &mut slot.source {
            stream.pause();
        }
    }

    pub fn resume(&mut self) {
        let mut slot = self.slot.lock();
        slot.paused = false;
        if let Source::Streaming(stream) = &mut slot.source {
            stream.resume();
        }
    }

    /// Stop the stream, closing the physical one if it was already started
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let source = mem::replace(&mut self.slot.lock().source, Source::Done);
        if let Source::Streaming(mut stream) = source {
            stream.close();
        }
        self.signal.notify();
        tracing::debug!("lazy query stream closed");
    }

    pub fn is_readable(&self) -> bool {
        !self.closed
    }

    pub fn is_paused(&self) -> bool {
        self.slot.lock().paused
    }

    /// Future resolving once the stream closed
    pub fn closed(&self) -> BoxFuture<'static, ()> {
        self.signal.closed()
    }

    /// Forward every row into `sink`, see [`lazyql_core::pipe`]
    pub async fn pipe<S>(self, sink: S) -> Result<()>
    where
        S: Sink<Row> + Unpin,
        S::Error: Display,
    {
        lazyql_core::pipe(self, sink).await
    }
}

impl Stream for LazyQueryStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let polled = {
            let mut guard = this.slot.lock();
            let slot = &mut *guard;
            match &mut slot.source {
                Source::Pending => {
                    slot.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                Source::Done => return Poll::Ready(None),
                Source::Failed(error) => Poll::Ready(Some(Err(error.clone()))),
                Source::Streaming(stream) => stream.poll_next_unpin(cx),
            }
        };

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(row))) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(Some(Err(error))) => {
                this.close();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
        }
    }
}

impl FusedStream for LazyQueryStream {
    fn is_terminated(&self) -> bool {
        self.closed
    }
}

impl RowStream for LazyQueryStream {
    fn pause(&mut self) {
        LazyQueryStream::pause(self)
    }

    fn resume(&mut self) {
        LazyQueryStream::resume(self)
    }

    fn close(&mut self) {
        LazyQueryStream::close(self)
    }

    fn is_readable(&self) -> bool {
        LazyQueryStream::is_readable(self)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        LazyQueryStream::closed(self)
    }
}

impl Drop for LazyQueryStream {
    fn drop(&mut self) {
        self.close();
    }
}
