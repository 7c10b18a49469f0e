//! Tests for the query stream relay

use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;

use crate::{CommandHandle, Value};

/// Flow control that records what the stream asked for
#[derive(Default)]
struct MockFlow {
    paused: AtomicBool,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl MockFlow {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl FlowControl for MockFlow {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

fn row(id: i64) -> Row {
    Row::new(vec!["id".to_string()], vec![Value::Int64(id)])
}

fn stream() -> (CommandHandle, QueryStream, Arc<MockFlow>) {
    let (handle, command) = Command::channel();
    let flow = Arc::new(MockFlow::default());
    let stream = QueryStream::new(command, flow.clone());
    (handle, stream, flow)
}

mod relay_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_rows_then_end() {
        let (handle, mut stream, _flow) = stream();
        handle.result(row(1));
        handle.result(row(2));
        handle.end();

        assert_eq!(stream.next().await.unwrap().unwrap(), row(1));
        assert_eq!(stream.next().await.unwrap().unwrap(), row(2));
        assert!(stream.next().await.is_none());
        assert!(!stream.is_readable());
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn test_status_only_success_ends_stream() {
        let (handle, mut stream, _flow) = stream();
        handle.success();

        assert!(stream.next().await.is_none());
        assert!(!stream.is_readable());
    }

    #[tokio::test]
    async fn test_error_is_emitted_then_closed() {
        let (handle, mut stream, _flow) = stream();
        handle.result(row(1));
        handle.error(LazyqlError::Query("Table 'test.missing' doesn't exist".into()));

        assert!(stream.next().await.unwrap().is_ok());
        match stream.next().await {
            Some(Err(LazyqlError::Query(message))) => assert!(message.contains("missing")),
            other => panic!("expected query error, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert!(!stream.is_readable());
    }

    #[tokio::test]
    async fn test_close_notification_fires() {
        let (handle, mut stream, _flow) = stream();
        let closed = stream.closed();
        handle.end();

        assert!(stream.next().await.is_none());
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .expect("close notification should fire");
    }

    #[tokio::test]
    async fn test_dropped_command_reports_error() {
        let (handle, mut stream, _flow) = stream();
        drop(handle);

        assert!(matches!(
            stream.next().await,
            Some(Err(LazyqlError::Query(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_events_after_close_are_rejected() {
        let (handle, mut stream, _flow) = stream();
        assert!(handle.is_attached());

        stream.close();

        assert!(!handle.result(row(1)));
        assert!(!handle.is_attached());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_drop_closes_stream() {
        let (handle, stream, _flow) = stream();
        let signal = stream.signal.clone();

        drop(stream);

        assert!(signal.is_closed());
        assert!(!handle.end());
    }
}

mod backpressure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_pause_before_first_row_pauses_on_arrival() {
        let (handle, mut stream, flow) = stream();
        stream.pause();
        assert_eq!(flow.pauses(), 0, "nothing to pause before the query started");

        handle.result(row(1));
        assert!(flow.is_paused(), "first row stops the wire before it is read");

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, row(1));
        assert_eq!(flow.pauses(), 1);

        stream.close();
        assert!(!flow.is_paused());
        assert_eq!(flow.resumes(), 1);
    }

    #[tokio::test]
    async fn test_paused_consumer_that_never_polls_stops_the_wire() {
        let (handle, mut stream, flow) = stream();
        stream.pause();

        for id in 0..1000 {
            handle.result(row(id));
        }
        tokio::task::yield_now().await;

        assert!(flow.is_paused());
        assert_eq!(flow.pauses(), 1, "only the first row pauses the connection");

        stream.resume();
        assert!(!flow.is_paused());
        assert_eq!(stream.next().await.unwrap().unwrap(), row(0));
    }

    #[tokio::test]
    async fn test_rows_after_close_do_not_pause() {
        let (handle, mut stream, flow) = stream();
        stream.pause();
        stream.close();

        assert!(!handle.result(row(1)));
        assert_eq!(flow.pauses(), 0);
        assert_eq!(flow.resumes(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume_after_start() {
        let (handle, mut stream, flow) = stream();
        handle.result(row(1));
        stream.next().await.unwrap().unwrap();

        stream.pause();
        assert!(flow.is_paused());
        assert!(stream.is_paused());

        stream.resume();
        assert!(!flow.is_paused());
        assert!(!stream.is_paused());
        assert_eq!(flow.pauses(), 1);
        assert_eq!(flow.resumes(), 1);
    }

    #[tokio::test]
    async fn test_close_without_pause_leaves_flow_untouched() {
        let (handle, mut stream, flow) = stream();
        handle.result(row(1));
        stream.next().await.unwrap().unwrap();

        stream.close();
        stream.close();

        assert_eq!(flow.pauses(), 0);
        assert_eq!(flow.resumes(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_while_paused() {
        let (handle, mut stream, flow) = stream();
        handle.result(row(1));
        stream.next().await.unwrap().unwrap();
        stream.pause();

        stream.close();
        stream.close();

        assert_eq!(flow.resumes(), 1);
        assert!(!flow.is_paused());
    }

    #[tokio::test]
    async fn test_error_while_paused_resumes_connection() {
        let (handle, mut stream, flow) = stream();
        handle.result(row(1));
        stream.next().await.unwrap().unwrap();
        stream.pause();

        handle.error(LazyqlError::Query("Lost connection".into()));
        assert!(stream.next().await.unwrap().is_err());

        assert!(!flow.is_paused());
    }

    #[test]
    fn test_pause_after_close_does_nothing() {
        let (_handle, mut stream, flow) = stream();
        stream.close();

        stream.pause();
        stream.resume();

        assert_eq!(flow.pauses(), 0);
        assert_eq!(flow.resumes(), 0);
    }
}

mod pipe_tests {
    use super::*;
    use futures::channel::mpsc;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_pipe_forwards_rows_and_closes_sink() {
        let (handle, stream, _flow) = stream();
        let (tx, rx) = mpsc::unbounded();
        handle.result(row(1));
        handle.result(row(2));
        handle.end();

        stream.pipe(tx).await.unwrap();

        let rows: Vec<Row> = rx.collect().await;
        assert_eq!(rows, vec![row(1), row(2)]);
    }

    #[tokio::test]
    async fn test_pipe_propagates_query_error() {
        let (handle, stream, _flow) = stream();
        let (tx, _rx) = mpsc::unbounded();
        handle.error(LazyqlError::Query("Deadlock found".into()));

        let result = stream.pipe(tx).await;
        assert!(matches!(result, Err(LazyqlError::Query(_))));
    }

    #[tokio::test]
    async fn test_pipe_pauses_while_downstream_is_full() {
        let (handle, stream, flow) = stream();
        let (tx, mut rx) = mpsc::channel::<Row>(0);
        let piping = tokio::spawn(stream.pipe(tx));

        for id in 1..=3 {
            handle.result(row(id));
        }
        handle.end();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(flow.is_paused(), "full sink should pause the connection");

        let mut received = Vec::new();
        while let Some(row) = rx.next().await {
            received.push(row);
        }

        assert_eq!(received, vec![row(1), row(2), row(3)]);
        piping.await.unwrap().unwrap();
        assert!(flow.pauses() >= 1);
        assert!(!flow.is_paused());
    }

    #[tokio::test]
    async fn test_pipe_closes_stream_when_sink_goes_away() {
        let (handle, stream, _flow) = stream();
        let (tx, rx) = mpsc::unbounded::<Row>();
        drop(rx);
        handle.result(row(1));

        let result = stream.pipe(tx).await;

        assert!(matches!(result, Err(LazyqlError::Stream(_))));
        assert!(!handle.is_attached());
    }
}
