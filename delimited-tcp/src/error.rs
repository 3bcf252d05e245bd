use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failure taxonomy for connections, sessions, and listener setup.
///
/// Only setup (`Client::new`, `Server::bind`) hands these back to the
/// caller. Everything that goes wrong on a live connection is reported
/// through the diagnostic stream and the `Closed` transition instead.
#[derive(Debug, Error)]
pub enum TcpError {
    #[error("failed to resolve {host}:{port}")]
    ResolutionFailure {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("endpoint {endpoint} unreachable")]
    EndpointUnreachable {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("all {attempted} candidate endpoints failed")]
    AllEndpointsExhausted { attempted: usize },

    #[error("stream error")]
    StreamError(#[source] io::Error),

    #[error("accept failed")]
    AcceptError(#[source] io::Error),

    #[error("failed to bind listener on {address}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to start event loop worker")]
    EventLoop(#[source] io::Error),
}

impl TcpError {
    /// The I/O error kind behind this failure, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TcpError::ResolutionFailure { source, .. }
            | TcpError::EndpointUnreachable { source, .. }
            | TcpError::Bind { source, .. } => Some(source.kind()),
            TcpError::StreamError(source)
            | TcpError::AcceptError(source)
            | TcpError::EventLoop(source) => Some(source.kind()),
            TcpError::AllEndpointsExhausted { .. } => None,
        }
    }
}
