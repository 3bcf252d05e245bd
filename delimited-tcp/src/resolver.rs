use tokio::net::lookup_host;

use crate::{
    diagnostics::{DiagnosticEvent, ErrorDetail, Reporter},
    error::TcpError,
    sequencer::CandidateList,
};

/// Resolves `host:port` to its endpoints, in the order the system resolver
/// returns them.
pub async fn resolve(host: &str, port: u16) -> Result<CandidateList, TcpError> {
    let endpoints = lookup_host((host, port))
        .await
        .map_err(|source| TcpError::ResolutionFailure {
            host: host.to_string(),
            port,
            source,
        })?;
    Ok(CandidateList::new(endpoints.collect()))
}

/// Like [`resolve`], but a failure is reported and turned into an empty
/// candidate list, which the sequencer treats as exhausted.
pub(crate) async fn resolve_or_empty(host: &str, port: u16, reporter: &Reporter) -> CandidateList {
    match resolve(host, port).await {
        Ok(candidates) => candidates,
        Err(err) => {
            reporter.emit(DiagnosticEvent::ResolutionFailed {
                host: host.to_string(),
                port,
                error: ErrorDetail::from(&err),
            });
            CandidateList::default()
        }
    }
}
