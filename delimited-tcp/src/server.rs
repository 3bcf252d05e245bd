//! Inbound connections.
//!
//! A [`Server`] binds its listener up front, then runs a pool task on its
//! own [`EventLoop`]. The pool always keeps exactly one pending session with
//! an accept in flight while it is accepting; each accepted session runs its
//! own connection task, and the pool is the only owner of the handles used
//! to reach them. Callers and observers refer to sessions by [`SessionId`].

use std::{collections::BTreeMap, fmt, io, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config::ServerConfig,
    connection::{Command, Connection, ConnectionState},
    diagnostics::{DiagnosticEvent, ErrorDetail, Origin, Reporter},
    error::TcpError,
    event_loop::EventLoop,
    framer::{Framing, MessageFramer},
    registry::{CallbackRegistry, Registration},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the pool does after an accept fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptErrorPolicy {
    /// Stop accepting until `start` is called again.
    #[default]
    Stall,
    /// Provision a fresh pending session and keep accepting.
    Rearm,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PoolState {
    /// Bound but not started.
    #[default]
    Idle,
    Accepting,
    Stalled(ErrorDetail),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    /// `None` for the pending session that has not been accepted yet.
    pub peer: Option<SocketAddr>,
    pub state: ConnectionState,
}

/// Called with the id of the session a message belongs to.
type SessionObserver = Arc<dyn Fn(SessionId, &str) + Send + Sync + 'static>;

/// A server-wide observer. Every session gets its own bound copy.
#[derive(Clone)]
enum PoolObserver {
    Plain(Registration),
    Receive(SessionObserver),
    Send(SessionObserver),
}

impl PoolObserver {
    fn bind(&self, id: SessionId) -> Registration {
        match self {
            PoolObserver::Plain(registration) => registration.clone(),
            PoolObserver::Receive(observer) => {
                let observer = Arc::clone(observer);
                Registration::Receive(Arc::new(move |message: &str| observer(id, message)))
            }
            PoolObserver::Send(observer) => {
                let observer = Arc::clone(observer);
                Registration::Send(Arc::new(move |message: &str| observer(id, message)))
            }
        }
    }
}

enum PoolCommand {
    Start,
    Register(PoolObserver),
    Send { session: SessionId, message: String },
    Broadcast(String),
    Close(SessionId),
    Sessions(oneshot::Sender<Vec<SessionInfo>>),
    Shutdown,
}

/// Cloneable way to reach a running server, e.g. from inside an observer.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl ServerHandle {
    /// Writes `message` as-is to one session. Ignored unless that session is
    /// connected.
    pub fn send(&self, session: SessionId, message: impl Into<String>) {
        self.queue(PoolCommand::Send {
            session,
            message: message.into(),
        });
    }

    /// Writes `message` to every connected session.
    pub fn broadcast(&self, message: impl Into<String>) {
        self.queue(PoolCommand::Broadcast(message.into()));
    }

    /// Disconnects a session; it leaves the pool once its task has closed.
    pub fn close_session(&self, session: SessionId) {
        self.queue(PoolCommand::Close(session));
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let (respond_to, response) = oneshot::channel();
        self.queue(PoolCommand::Sessions(respond_to));
        response.await.unwrap_or_default()
    }

    fn queue(&self, command: PoolCommand) {
        let _ = self.commands.send(command);
    }
}

pub struct Server {
    handle: ServerHandle,
    pool_state: watch::Receiver<PoolState>,
    local_addr: SocketAddr,
    pool_task: Option<JoinHandle<()>>,
    event_loop: EventLoop,
}

impl Server {
    /// Binds the listener and starts the worker. No connection is accepted
    /// until [`Server::start`].
    pub fn bind(config: ServerConfig) -> Result<Self, TcpError> {
        let event_loop = EventLoop::start("tcp-server")?;
        let address = SocketAddr::new(config.bind_address, config.port);
        let listener = {
            let _runtime = event_loop.enter();
            listen(address, &config).map_err(|source| TcpError::Bind { address, source })?
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| TcpError::Bind { address, source })?;

        let reporter = Reporter::new(Origin::Server, Arc::clone(&config.sink));
        reporter.emit(DiagnosticEvent::Listening { local: local_addr });

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (exits, exits_rx) = mpsc::unbounded_channel();
        let (pool_state_tx, pool_state) = watch::channel(PoolState::Idle);
        let pool = SessionPool::new(&config, reporter, pool_state_tx, exits);
        let pool_task = event_loop.spawn(run_pool(pool, listener, commands_rx, exits_rx));

        Ok(Self {
            handle: ServerHandle { commands },
            pool_state,
            local_addr,
            pool_task: Some(pool_task),
            event_loop,
        })
    }

    /// Provisions the pending session and starts accepting. Also restarts a
    /// stalled pool.
    pub fn start(&self) {
        self.handle.queue(PoolCommand::Start);
    }

    /// Registers a receive observer for current and future sessions.
    pub fn add_on_receive<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.handle.queue(PoolCommand::Register(PoolObserver::Plain(
            Registration::Receive(Arc::new(observer)),
        )));
    }

    /// Registers a send observer for current and future sessions.
    pub fn add_on_send<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.handle.queue(PoolCommand::Register(PoolObserver::Plain(
            Registration::Send(Arc::new(observer)),
        )));
    }

    /// Like [`Server::add_on_receive`], but the observer also learns which
    /// session the message came from, e.g. to reply with [`Server::send`].
    pub fn add_on_session_receive<F>(&self, observer: F)
    where
        F: Fn(SessionId, &str) + Send + Sync + 'static,
    {
        self.handle
            .queue(PoolCommand::Register(PoolObserver::Receive(Arc::new(observer))));
    }

    pub fn add_on_session_send<F>(&self, observer: F)
    where
        F: Fn(SessionId, &str) + Send + Sync + 'static,
    {
        self.handle
            .queue(PoolCommand::Register(PoolObserver::Send(Arc::new(observer))));
    }

    pub fn send(&self, session: SessionId, message: impl Into<String>) {
        self.handle.send(session, message);
    }

    pub fn broadcast(&self, message: impl Into<String>) {
        self.handle.broadcast(message);
    }

    pub fn close_session(&self, session: SessionId) {
        self.handle.close_session(session);
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.handle.sessions().await
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool_state.borrow().clone()
    }

    pub async fn wait_for_pool_state<P>(&self, predicate: P) -> PoolState
    where
        P: FnMut(&PoolState) -> bool,
    {
        let mut state = self.pool_state.clone();
        let reached = state.wait_for(predicate).await.map(|state| state.clone());
        reached.unwrap_or_else(|_| state.borrow().clone())
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }
}

impl Drop for Server {
    /// Disconnects every session and waits for them to close before the
    /// worker is joined.
    fn drop(&mut self) {
        self.handle.queue(PoolCommand::Shutdown);
        if let Some(task) = self.pool_task.take() {
            self.event_loop.stop_after(task);
        }
    }
}

fn listen(address: SocketAddr, config: &ServerConfig) -> io::Result<TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(config.reuse_address)?;
    socket.bind(address)?;
    socket.listen(config.backlog)
}

async fn run_pool(
    mut pool: SessionPool,
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    mut exits: mpsc::UnboundedReceiver<SessionId>,
) {
    loop {
        select! {
            Some(command) = commands.recv() => pool.handle(command),
            accepted = listener.accept(), if pool.is_accepting() => pool.on_accept(accepted),
            Some(session) = exits.recv() => pool.reap(session),
        }
        if pool.is_finished() {
            break;
        }
    }
}

/// The session created ahead of time for the next accept.
struct PendingSession {
    id: SessionId,
    connection: Connection,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    state: watch::Receiver<ConnectionState>,
}

struct ActiveSession {
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

struct SessionPool {
    /// Bound into every session created from now on, in registration order.
    observers: Vec<PoolObserver>,
    shutting_down: bool,
    pending: Option<PendingSession>,
    active: BTreeMap<SessionId, ActiveSession>,
    next_id: u64,
    terminator: u8,
    framing: Framing,
    policy: AcceptErrorPolicy,
    state: watch::Sender<PoolState>,
    reporter: Reporter,
    exits: mpsc::UnboundedSender<SessionId>,
}

impl SessionPool {
    fn new(
        config: &ServerConfig,
        reporter: Reporter,
        state: watch::Sender<PoolState>,
        exits: mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        Self {
            observers: Vec::new(),
            shutting_down: false,
            pending: None,
            active: BTreeMap::new(),
            next_id: 1,
            terminator: config.terminator,
            framing: config.framing,
            policy: config.accept_error_policy,
            state,
            reporter,
            exits,
        }
    }

    fn is_accepting(&self) -> bool {
        self.pending.is_some()
    }

    /// Shut down and every session has been reaped.
    fn is_finished(&self) -> bool {
        self.shutting_down && self.active.is_empty()
    }

    fn handle(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Start => self.start(),
            PoolCommand::Register(registration) => self.register(registration),
            PoolCommand::Send { session, message } => self.send(session, message),
            PoolCommand::Broadcast(message) => self.broadcast(message),
            PoolCommand::Close(session) => self.close(session),
            PoolCommand::Sessions(respond_to) => {
                let _ = respond_to.send(self.sessions());
            }
            PoolCommand::Shutdown => self.shut_down(),
        }
    }

    fn start(&mut self) {
        if self.pending.is_none() && !self.shutting_down {
            self.provision();
        }
    }

    fn provision(&mut self) {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let reporter = self.reporter.for_origin(Origin::Session(id));
        let mut registry = CallbackRegistry::default();
        for observer in &self.observers {
            registry.register(observer.bind(id));
        }
        let (connection, state) = Connection::new(
            MessageFramer::new(self.terminator, self.framing),
            registry,
            reporter.clone(),
        );
        let (commands, commands_rx) = mpsc::unbounded_channel();
        reporter.emit(DiagnosticEvent::SessionProvisioned);

        self.pending = Some(PendingSession {
            id,
            connection,
            commands,
            commands_rx,
            state,
        });
        self.state.send_replace(PoolState::Accepting);
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let reporter = self.reporter.for_origin(Origin::Session(pending.id));

        match accepted {
            Ok((stream, peer)) => {
                reporter.emit(DiagnosticEvent::Accepted { peer });
                let PendingSession {
                    id,
                    mut connection,
                    commands,
                    mut commands_rx,
                    state,
                } = pending;

                let exits = self.exits.clone();
                tokio::spawn(async move {
                    connection.serve(stream, &mut commands_rx).await;
                    let _ = exits.send(id);
                });

                self.active.insert(
                    id,
                    ActiveSession {
                        peer,
                        commands,
                        state,
                    },
                );
                self.provision();
            }
            Err(source) => {
                let error = ErrorDetail::from(&TcpError::AcceptError(source));
                reporter.emit(DiagnosticEvent::AcceptFailed {
                    error: error.clone(),
                });
                // The pending session is dropped without ever starting.
                reporter.emit(DiagnosticEvent::SessionRemoved);

                match self.policy {
                    AcceptErrorPolicy::Stall => {
                        self.state.send_replace(PoolState::Stalled(error));
                        self.reporter.emit(DiagnosticEvent::AcceptStalled);
                    }
                    AcceptErrorPolicy::Rearm => self.provision(),
                }
            }
        }
    }

    /// Adds to the server-wide lists and to every session already in the
    /// pool. Sessions keep their own copies from then on.
    fn register(&mut self, observer: PoolObserver) {
        if let Some(pending) = &mut self.pending {
            pending.connection.register(observer.bind(pending.id));
        }
        for (id, session) in &self.active {
            let _ = session.commands.send(Command::Register(observer.bind(*id)));
        }
        self.observers.push(observer);
    }

    fn send(&self, id: SessionId, message: String) {
        if let Some(session) = self.active.get(&id) {
            if !session.state.borrow().is_closed() {
                let _ = session.commands.send(Command::Send(message));
            }
        }
    }

    fn broadcast(&self, message: String) {
        for session in self.active.values() {
            if !session.state.borrow().is_closed() {
                let _ = session.commands.send(Command::Send(message.clone()));
            }
        }
    }

    fn close(&self, id: SessionId) {
        if let Some(session) = self.active.get(&id) {
            let _ = session.commands.send(Command::Disconnect);
        }
    }

    /// Stops accepting and disconnects every active session. The pool task
    /// ends once they have all been reaped.
    fn shut_down(&mut self) {
        self.shutting_down = true;
        if let Some(pending) = self.pending.take() {
            pending.connection.close();
            self.reporter
                .for_origin(Origin::Session(pending.id))
                .emit(DiagnosticEvent::SessionRemoved);
        }
        for session in self.active.values() {
            let _ = session.commands.send(Command::Disconnect);
        }
        self.state.send_replace(PoolState::Idle);
    }

    /// Drops a session whose task has finished.
    fn reap(&mut self, id: SessionId) {
        if self.active.remove(&id).is_some() {
            self.reporter
                .for_origin(Origin::Session(id))
                .emit(DiagnosticEvent::SessionRemoved);
        }
    }

    /// Active sessions in id order, then the pending one.
    fn sessions(&self) -> Vec<SessionInfo> {
        let active = self.active.iter().map(|(id, session)| SessionInfo {
            id: *id,
            peer: Some(session.peer),
            state: *session.state.borrow(),
        });
        let pending = self.pending.iter().map(|pending| SessionInfo {
            id: pending.id,
            peer: None,
            state: *pending.state.borrow(),
        });
        active.chain(pending).collect()
    }
}
