//! Terminator-delimited message exchange over TCP.
//!
//! Each [`Client`] and [`Server`] owns one worker thread running its own
//! event loop; every socket operation, state transition, and observer call
//! of that instance happens on that worker. Handles only queue commands.
//!
//! - [`event_loop`] runs the per-instance worker.
//! - [`resolver`] and [`sequencer`] turn a host/port into candidate
//!   endpoints and try them in order.
//! - [`framer`] cuts the inbound byte stream into messages.
//! - [`registry`] keeps receive and send observers in registration order.
//! - [`connection`] is the state machine shared by clients and sessions.
//! - [`client`] dials out; [`server`] accepts into a pool of sessions.
//! - [`diagnostics`] describes every transition as data for a logger.
//! - [`cli`] parses the demo binary's arguments.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod event_loop;
pub mod framer;
pub mod registry;
pub mod resolver;
pub mod sequencer;
pub mod server;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use connection::ConnectionState;
pub use diagnostics::{Diagnostic, DiagnosticEvent, DiagnosticSink, Origin, TracingSink};
pub use error::TcpError;
pub use framer::{DEFAULT_TERMINATOR, Framing};
pub use server::{AcceptErrorPolicy, PoolState, Server, ServerHandle, SessionId, SessionInfo};
