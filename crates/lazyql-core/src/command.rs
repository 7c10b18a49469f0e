//! Row-producing command of a streaming query
//!
//! The protocol layer decodes a result set and pushes events through a
//! [`CommandHandle`]; the matching [`Command`] is consumed by a
//! [`QueryStream`](crate::QueryStream). A command emits zero or more rows
//! followed by exactly one terminal event.
//!
//! Both sides share the query's backpressure state, so a pause requested
//! before the first row takes effect when the producer emits that row, even
//! if nobody is polling the stream.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{FlowControl, LazyqlError, Row};

/// Event emitted by a running command
#[derive(Debug, Clone)]
pub enum CommandEvent {
    /// One decoded row of the result set
    Result(Row),
    /// End of the result set
    End,
    /// The statement completed without producing a result set
    Success,
    /// The statement failed
    Error(LazyqlError),
}

impl CommandEvent {
    /// Whether no further events follow this one
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandEvent::Result(_))
    }
}

#[derive(Default)]
struct FlowState {
    flow: Option<Arc<dyn FlowControl>>,
    started: bool,
    paused: bool,
    closed: bool,
}

/// Pause state of one query, shared by its producer and consumer
///
/// The connection's flow control is invoked with the state locked, so it
/// must not call back into the command.
#[derive(Clone, Default)]
pub(crate) struct FlowGate {
    state: Arc<Mutex<FlowState>>,
}

impl FlowGate {
    pub(crate) fn attach(&self, flow: Arc<dyn FlowControl>) {
        let mut state = self.state.lock();
        if !state.closed {
            state.flow = Some(flow);
        }
    }

    /// First row of the result set: stop the wire if a pause is already pending
    fn row_arrived(&self) {
        let mut state = self.state.lock();
        if state.started || state.closed {
            return;
        }
        state.started = true;

        if state.paused {
            if let Some(flow) = &state.flow {
                tracing::trace!("first row arrived while paused, pausing connection");
                flow.pause();
            }
        }
    }

    pub(crate) fn pause(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        if state.started && !state.closed {
            if let Some(flow) = &state.flow {
                tracing::trace!("pausing connection for streaming query");
                flow.pause();
            }
        }
    }

    pub(crate) fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        if state.started && !state.closed {
            if let Some(flow) = &state.flow {
                tracing::trace!("resuming connection for streaming query");
                flow.resume();
            }
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Release the connection, resuming it if this query left it paused
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        // Later commands on the same connection must not inherit our pause.
        if let Some(flow) = state.flow.take() {
            if state.started && state.paused {
                flow.resume();
            }
        }
    }
}

impl fmt::Debug for FlowGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FlowGate")
            .field("started", &state.started)
            .field("paused", &state.paused)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Producer side of a command, held by the protocol layer
///
/// Every method returns `false` once the consuming stream has been closed,
/// which tells the producer it may stop decoding.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    tx: mpsc::UnboundedSender<CommandEvent>,
    gate: FlowGate,
}

impl CommandHandle {
    /// Emit a decoded row
    pub fn result(&self, row: Row) -> bool {
        self.gate.row_arrived();
        self.emit(CommandEvent::Result(row))
    }

    /// Signal the end of the result set
    pub fn end(&self) -> bool {
        self.emit(CommandEvent::End)
    }

    /// Signal a status-only completion
    pub fn success(&self) -> bool {
        self.emit(CommandEvent::Success)
    }

    /// Signal a failure
    pub fn error(&self, error: LazyqlError) -> bool {
        self.emit(CommandEvent::Error(error))
    }

    /// Whether a stream is still listening
    pub fn is_attached(&self) -> bool {
        !self.tx.is_closed()
    }

    fn emit(&self, event: CommandEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer side of a command
#[derive(Debug)]
pub struct Command {
    rx: mpsc::UnboundedReceiver<CommandEvent>,
    gate: FlowGate,
}

impl Command {
    /// Create a connected handle/command pair
    pub fn channel() -> (CommandHandle, Command) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = FlowGate::default();
        (
            CommandHandle {
                tx,
                gate: gate.clone(),
            },
            Command { rx, gate },
        )
    }

    pub(crate) fn gate(&self) -> FlowGate {
        self.gate.clone()
    }

    pub(crate) fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<CommandEvent>> {
        self.rx.poll_recv(cx)
    }

    /// Stop listening; further events are rejected and buffered ones dropped
    pub(crate) fn detach(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
