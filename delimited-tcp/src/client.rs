//! Outbound connections.
//!
//! A [`Client`] owns its own [`EventLoop`] and a single connection task on
//! it. Every method only queues a command for that task and returns
//! immediately; the outcome shows up in the connection state, the
//! observers, and the diagnostic stream.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::ClientConfig,
    connection::{Command, Connection, ConnectionState},
    diagnostics::{Origin, Reporter},
    error::TcpError,
    event_loop::EventLoop,
    framer::MessageFramer,
    registry::{CallbackRegistry, Registration},
};

pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    terminator: u8,
    task: Option<JoinHandle<()>>,
    // Dropped last; stopping it joins the worker.
    event_loop: EventLoop,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, TcpError> {
        let event_loop = EventLoop::start("tcp-client")?;
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        let reporter = Reporter::new(Origin::Client, config.sink);
        let (mut connection, state) = Connection::new(
            MessageFramer::new(config.terminator, config.framing),
            CallbackRegistry::default(),
            reporter,
        );

        let task = event_loop.spawn(async move {
            if let Some(stream) = connection.dial(&mut commands_rx).await {
                connection.serve(stream, &mut commands_rx).await;
            }
        });

        Ok(Self {
            commands,
            state,
            terminator: config.terminator,
            task: Some(task),
            event_loop,
        })
    }

    /// Resolves `host:port` and connects to the first endpoint that accepts.
    /// Only the first connect request of a client has any effect.
    pub fn connect(&self, host: impl Into<String>, port: u16) {
        self.queue(Command::Connect {
            host: host.into(),
            port,
        });
    }

    /// Skips resolution and tries `endpoints` in order.
    pub fn connect_to(&self, endpoints: Vec<SocketAddr>) {
        self.queue(Command::ConnectTo(endpoints));
    }

    pub fn disconnect(&self) {
        self.queue(Command::Disconnect);
    }

    /// Writes `message` as-is; append the terminator yourself if the peer
    /// needs it to find the end of the message. Ignored unless connected.
    pub fn send(&self, message: impl Into<String>) {
        if !self.state().is_connected() {
            return;
        }
        self.queue(Command::Send(message.into()));
    }

    pub fn terminator(&self) -> u8 {
        self.terminator
    }

    pub fn set_terminator(&mut self, terminator: u8) {
        self.terminator = terminator;
        self.queue(Command::SetTerminator(terminator));
    }

    pub fn add_on_receive<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.queue(Command::Register(Registration::Receive(Arc::new(observer))));
    }

    pub fn add_on_send<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.queue(Command::Register(Registration::Send(Arc::new(observer))));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the state satisfies `predicate`. If the connection task
    /// is gone first, returns the last state it published.
    pub async fn wait_for_state<P>(&self, predicate: P) -> ConnectionState
    where
        P: FnMut(&ConnectionState) -> bool,
    {
        let mut state = self.state.clone();
        let reached = state.wait_for(predicate).await.map(|state| *state);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }

    fn queue(&self, command: Command) {
        // The task only goes away once the connection is closed, at which
        // point every command is a no-op anyway.
        let _ = self.commands.send(command);
    }
}

impl Drop for Client {
    /// Disconnects and waits for the connection to report `Closed` before
    /// the worker is joined.
    fn drop(&mut self) {
        self.queue(Command::Disconnect);
        if let Some(task) = self.task.take() {
            self.event_loop.stop_after(task);
        }
    }
}
