//! Structured diagnostic events.
//!
//! Connections and the session pool never format log lines themselves.
//! Every state transition is described by a [`Diagnostic`] value and handed
//! to a [`DiagnosticSink`]; [`TracingSink`] is the default and forwards each
//! event to `tracing` with structured fields.

use std::{error::Error as _, fmt, io, net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use crate::{error::TcpError, server::SessionId};

/// Which part of an instance produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Client,
    Server,
    Session(SessionId),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client => write!(f, "client"),
            Origin::Server => write!(f, "server"),
            Origin::Session(id) => write!(f, "session {id}"),
        }
    }
}

/// Error data carried by an event: the kind plus the rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl From<&io::Error> for ErrorDetail {
    fn from(error: &io::Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<&TcpError> for ErrorDetail {
    fn from(error: &TcpError) -> Self {
        let message = match error.source() {
            Some(source) => format!("{error}: {source}"),
            None => error.to_string(),
        };
        Self {
            kind: error.io_kind().unwrap_or(io::ErrorKind::Other),
            message,
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// The host/port pair produced no candidates.
    ResolutionFailed {
        host: String,
        port: u16,
        error: ErrorDetail,
    },
    /// A connect is being issued to the candidate at `index`.
    EndpointAttempt { endpoint: SocketAddr, index: usize },
    /// One candidate refused or failed; the sequencer moves on.
    EndpointFailed {
        endpoint: SocketAddr,
        error: ErrorDetail,
    },
    Connected { endpoint: SocketAddr },
    /// Every candidate failed.
    EndpointsExhausted { attempted: usize },
    Listening { local: SocketAddr },
    /// A pending session was created and an accept issued against it.
    SessionProvisioned,
    Accepted { peer: SocketAddr },
    AcceptFailed { error: ErrorDetail },
    /// The pool stopped accepting after an accept error.
    AcceptStalled,
    ReadFailed { error: ErrorDetail },
    WriteFailed { error: ErrorDetail },
    /// The peer shut down its write side.
    PeerClosed,
    Disconnected,
    SessionRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub origin: Origin,
    pub event: DiagnosticEvent,
}

/// Receives diagnostic events. Called on the owning instance's worker
/// thread, so implementations should not block.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: &Diagnostic);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&Diagnostic) + Send + Sync,
{
    fn record(&self, diagnostic: &Diagnostic) {
        self(diagnostic)
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, diagnostic: &Diagnostic) {
        let origin = diagnostic.origin;
        match &diagnostic.event {
            DiagnosticEvent::ResolutionFailed { host, port, error } => {
                warn!(%origin, %host, port, error_kind = ?error.kind, %error, "resolution failed")
            }
            DiagnosticEvent::EndpointAttempt { endpoint, index } => {
                debug!(%origin, %endpoint, index, "trying endpoint")
            }
            DiagnosticEvent::EndpointFailed { endpoint, error } => {
                warn!(%origin, %endpoint, error_kind = ?error.kind, %error, "endpoint failed")
            }
            DiagnosticEvent::Connected { endpoint } => info!(%origin, %endpoint, "connected"),
            DiagnosticEvent::EndpointsExhausted { attempted } => {
                warn!(%origin, attempted, "no more endpoints to try")
            }
            DiagnosticEvent::Listening { local } => debug!(%origin, %local, "listener bound"),
            DiagnosticEvent::SessionProvisioned => debug!(%origin, "session provisioned"),
            DiagnosticEvent::Accepted { peer } => info!(%origin, %peer, "connection accepted"),
            DiagnosticEvent::AcceptFailed { error } => {
                warn!(%origin, error_kind = ?error.kind, %error, "accept failed")
            }
            DiagnosticEvent::AcceptStalled => warn!(%origin, "accept loop stalled"),
            DiagnosticEvent::ReadFailed { error } => {
                warn!(%origin, error_kind = ?error.kind, %error, "read failed")
            }
            DiagnosticEvent::WriteFailed { error } => {
                warn!(%origin, error_kind = ?error.kind, %error, "write failed")
            }
            DiagnosticEvent::PeerClosed => debug!(%origin, "peer closed the stream"),
            DiagnosticEvent::Disconnected => info!(%origin, "disconnected"),
            DiagnosticEvent::SessionRemoved => debug!(%origin, "session removed from pool"),
        }
    }
}

/// An origin bound to a sink.
#[derive(Clone)]
pub(crate) struct Reporter {
    origin: Origin,
    sink: Arc<dyn DiagnosticSink>,
}

impl Reporter {
    pub(crate) fn new(origin: Origin, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { origin, sink }
    }

    pub(crate) fn for_origin(&self, origin: Origin) -> Self {
        Self {
            origin,
            sink: Arc::clone(&self.sink),
        }
    }

    pub(crate) fn emit(&self, event: DiagnosticEvent) {
        self.sink.record(&Diagnostic {
            origin: self.origin,
            event,
        });
    }
}
