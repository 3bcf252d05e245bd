//! The connection state machine shared by clients and server sessions.
//!
//! A [`Connection`] is owned by exactly one task on its instance's event
//! loop. Callers never touch it directly; they talk to it through a
//! [`Command`] channel and watch its [`ConnectionState`] through a `watch`
//! receiver.
//!
//! ```text
//! Idle -> Resolving -> ConnectingEndpoint(0..n) -> Connected -> Closed
//! ```
//!
//! Sessions are handed an accepted stream and go straight to `Connected`.
//! `Closed` is terminal: a closed connection is never reopened.

use std::{fmt, io, net::SocketAddr};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{mpsc, watch},
};

use crate::{
    diagnostics::{DiagnosticEvent, ErrorDetail, Reporter},
    error::TcpError,
    framer::MessageFramer,
    registry::{CallbackRegistry, Registration},
    resolver::resolve_or_empty,
    sequencer::{CandidateList, connect_first},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Created, no connect requested yet.
    #[default]
    Idle,
    Resolving,
    /// A connect is in flight to the candidate at this index.
    ConnectingEndpoint(usize),
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Resolving => write!(f, "resolving"),
            ConnectionState::ConnectingEndpoint(index) => write!(f, "connecting to candidate {index}"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Requests delivered to the task that owns a connection.
pub(crate) enum Command {
    Connect { host: String, port: u16 },
    ConnectTo(Vec<SocketAddr>),
    Send(String),
    Register(Registration),
    SetTerminator(u8),
    Disconnect,
}

/// Publishes state changes and refuses to leave `Closed`.
pub(crate) struct StateCell(watch::Sender<ConnectionState>);

impl StateCell {
    pub(crate) fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Idle);
        (Self(tx), rx)
    }

    #[cfg(test)]
    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    /// Returns whether the state changed.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.0.send_if_modified(|state| {
            if state.is_closed() || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }
}

enum Target {
    Resolve { host: String, port: u16 },
    Endpoints(CandidateList),
}

pub(crate) struct Connection {
    state: StateCell,
    reporter: Reporter,
    framer: MessageFramer,
    registry: CallbackRegistry,
}

impl Connection {
    pub(crate) fn new(
        framer: MessageFramer,
        registry: CallbackRegistry,
        reporter: Reporter,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = StateCell::new();
        let connection = Self {
            state,
            reporter,
            framer,
            registry,
        };
        (connection, state_rx)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub(crate) fn register(&mut self, registration: Registration) {
        self.registry.register(registration);
    }

    /// Waits in `Idle` for a connect request, then resolves and walks the
    /// candidates. Commands keep being served while a connect is in flight.
    ///
    /// Returns the connected stream, or `None` once the connection has
    /// closed (disconnect requested, resolution empty, or every candidate
    /// failed).
    pub(crate) async fn dial(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<TcpStream> {
        let target = loop {
            match commands.recv().await {
                Some(Command::Connect { host, port }) => break Target::Resolve { host, port },
                Some(Command::ConnectTo(endpoints)) => {
                    break Target::Endpoints(CandidateList::new(endpoints));
                }
                Some(command) => {
                    if !configure(&mut self.framer, &mut self.registry, command) {
                        self.close();
                        return None;
                    }
                }
                None => {
                    self.close();
                    return None;
                }
            }
        };

        let outcome = {
            let Self {
                state,
                reporter,
                framer,
                registry,
            } = &mut *self;
            let attempt = establish(state, reporter, target);
            tokio::pin!(attempt);

            loop {
                select! {
                    outcome = &mut attempt => break outcome,
                    command = commands.recv() => match command {
                        Some(command) => {
                            if !configure(framer, registry, command) {
                                break None;
                            }
                        }
                        None => break None,
                    }
                }
            }
        };

        if outcome.is_none() {
            self.close();
        }
        outcome
    }

    /// Runs the read loop until the stream fails, the peer closes, or a
    /// disconnect is requested. Always ends `Closed`.
    ///
    /// Writes go through a separate writer task so a write blocked on a slow
    /// peer never stops reads. Messages queued before a disconnect are still
    /// flushed; after a stream error the writer is abandoned.
    pub(crate) async fn serve(
        &mut self,
        stream: TcpStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) {
        if !self.state.advance(ConnectionState::Connected) {
            return;
        }
        let (mut reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (written_tx, mut written) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_queue(writer, outbox_rx, written_tx));

        let flush = loop {
            select! {
                received = self.framer.read_message(&mut reader) => match received {
                    Ok(Some(message)) => self.registry.notify_receive(&message),
                    Ok(None) => {
                        self.reporter.emit(DiagnosticEvent::PeerClosed);
                        break false;
                    }
                    Err(err) => {
                        let err = TcpError::StreamError(err);
                        self.reporter.emit(DiagnosticEvent::ReadFailed {
                            error: ErrorDetail::from(&err),
                        });
                        break false;
                    }
                },
                Some(outcome) = written.recv() => match outcome {
                    Ok(message) => self.registry.notify_send(&message),
                    Err(err) => {
                        let err = TcpError::StreamError(err);
                        self.reporter.emit(DiagnosticEvent::WriteFailed {
                            error: ErrorDetail::from(&err),
                        });
                        break false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        let _ = outbox.send(message);
                    }
                    Some(command) => {
                        if !configure(&mut self.framer, &mut self.registry, command) {
                            break true;
                        }
                    }
                    None => break true,
                }
            }
        };

        // Closing the outbox lets the writer drain what is queued and shut
        // down the write side.
        drop(outbox);
        if !flush {
            writer.abort();
        }
        self.close();
    }

    pub(crate) fn close(&self) {
        if self.state.advance(ConnectionState::Closed) {
            self.reporter.emit(DiagnosticEvent::Disconnected);
        }
    }
}

/// Applies a command that needs no socket. Returns `false` when the
/// connection should close.
///
/// Sends that reach this point arrived while not connected and are dropped;
/// connect requests after the first are ignored.
fn configure(
    framer: &mut MessageFramer,
    registry: &mut CallbackRegistry,
    command: Command,
) -> bool {
    match command {
        Command::Register(registration) => registry.register(registration),
        Command::SetTerminator(terminator) => framer.set_terminator(terminator),
        Command::Send(_) | Command::Connect { .. } | Command::ConnectTo(_) => {}
        Command::Disconnect => return false,
    }
    true
}

/// Writes queued messages in order and reports each outcome back to the
/// owning task. Stops after the first failure.
async fn write_queue(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<String>,
    written: mpsc::UnboundedSender<io::Result<String>>,
) {
    while let Some(message) = outbox.recv().await {
        let result = writer.write_all(message.as_bytes()).await;
        let failed = result.is_err();
        let _ = written.send(result.map(|()| message));
        if failed {
            break;
        }
    }
}

async fn establish(state: &StateCell, reporter: &Reporter, target: Target) -> Option<TcpStream> {
    let candidates = match target {
        Target::Resolve { host, port } => {
            state.advance(ConnectionState::Resolving);
            resolve_or_empty(&host, port, reporter).await
        }
        Target::Endpoints(candidates) => candidates,
    };

    connect_first(candidates, reporter, |index| {
        state.advance(ConnectionState::ConnectingEndpoint(index));
    })
    .await
    .ok()
    .map(|(stream, _)| stream)
}
