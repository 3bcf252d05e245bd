use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use crate::{
    diagnostics::{DiagnosticSink, TracingSink},
    framer::{DEFAULT_TERMINATOR, Framing},
    server::AcceptErrorPolicy,
};

#[derive(Clone)]
pub struct ClientConfig {
    pub terminator: u8,
    pub framing: Framing,
    pub sink: Arc<dyn DiagnosticSink>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            terminator: DEFAULT_TERMINATOR,
            framing: Framing::default(),
            sink: Arc::new(TracingSink),
        }
    }
}

impl ClientConfig {
    pub fn terminator(mut self, terminator: u8) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("terminator", &self.terminator)
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    /// Address the listener binds to; all IPv4 interfaces by default.
    pub bind_address: IpAddr,
    /// 0 picks an ephemeral port; see `Server::local_addr`.
    pub port: u16,
    pub reuse_address: bool,
    pub backlog: u32,
    pub terminator: u8,
    pub framing: Framing,
    pub accept_error_policy: AcceptErrorPolicy,
    pub sink: Arc<dyn DiagnosticSink>,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            reuse_address: true,
            backlog: 1024,
            terminator: DEFAULT_TERMINATOR,
            framing: Framing::default(),
            accept_error_policy: AcceptErrorPolicy::default(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn terminator(mut self, terminator: u8) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn accept_error_policy(mut self, policy: AcceptErrorPolicy) -> Self {
        self.accept_error_policy = policy;
        self
    }

    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("reuse_address", &self.reuse_address)
            .field("backlog", &self.backlog)
            .field("terminator", &self.terminator)
            .field("framing", &self.framing)
            .field("accept_error_policy", &self.accept_error_policy)
            .finish_non_exhaustive()
    }
}
