//! Walks resolved endpoints one at a time until one accepts.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::{
    diagnostics::{DiagnosticEvent, ErrorDetail, Reporter},
    error::TcpError,
};

/// The endpoints still to be tried, consumed strictly left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateList {
    endpoints: Vec<SocketAddr>,
    cursor: usize,
}

impl CandidateList {
    pub fn new(endpoints: Vec<SocketAddr>) -> Self {
        Self {
            endpoints,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoints not yet handed out.
    pub fn remaining(&self) -> &[SocketAddr] {
        &self.endpoints[self.cursor..]
    }
}

impl Iterator for CandidateList {
    /// Position in the original sequence plus the endpoint.
    type Item = (usize, SocketAddr);

    fn next(&mut self) -> Option<Self::Item> {
        let endpoint = *self.endpoints.get(self.cursor)?;
        let index = self.cursor;
        self.cursor += 1;
        Some((index, endpoint))
    }
}

impl From<Vec<SocketAddr>> for CandidateList {
    fn from(endpoints: Vec<SocketAddr>) -> Self {
        Self::new(endpoints)
    }
}

/// Connects to the first candidate that accepts.
///
/// `on_attempt` runs with the candidate's index before each connect is
/// issued. A failed attempt drops its socket and the next candidate is
/// tried; running out of candidates yields `AllEndpointsExhausted`.
pub(crate) async fn connect_first<F>(
    candidates: CandidateList,
    reporter: &Reporter,
    mut on_attempt: F,
) -> Result<(TcpStream, SocketAddr), TcpError>
where
    F: FnMut(usize),
{
    let mut attempted = 0;
    for (index, endpoint) in candidates {
        attempted += 1;
        on_attempt(index);
        reporter.emit(DiagnosticEvent::EndpointAttempt { endpoint, index });

        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                reporter.emit(DiagnosticEvent::Connected { endpoint });
                return Ok((stream, endpoint));
            }
            Err(source) => {
                let err = TcpError::EndpointUnreachable { endpoint, source };
                reporter.emit(DiagnosticEvent::EndpointFailed {
                    endpoint,
                    error: ErrorDetail::from(&err),
                });
            }
        }
    }

    reporter.emit(DiagnosticEvent::EndpointsExhausted { attempted });
    Err(TcpError::AllEndpointsExhausted { attempted })
}
