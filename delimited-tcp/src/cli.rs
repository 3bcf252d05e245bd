use std::net::IpAddr;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::framer::Framing;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and print every message received.
    Server(ServerArgs),
    /// Connect to a server, send stdin lines, and print replies.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Interface address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Send every received message back to the client that sent it.
    #[arg(long)]
    pub echo: bool,

    #[command(flatten)]
    pub wire: WireArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    #[command(flatten)]
    pub wire: WireArgs,
}

#[derive(Args, Debug, Clone)]
pub struct WireArgs {
    /// Message terminator: `lf`, `nul`, a single ASCII character, or a
    /// decimal byte value below 128.
    #[arg(long, default_value = "lf", value_parser = parse_terminator)]
    pub terminator: u8,

    #[arg(long, value_enum, default_value_t = FramingArg::Terminator)]
    pub framing: FramingArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingArg {
    /// Cut messages at the terminator.
    Terminator,
    /// Wait for the terminator, cut at the first line feed.
    LineFeed,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Terminator => Framing::Terminator,
            FramingArg::LineFeed => Framing::LineFeed,
        }
    }
}

pub fn parse_terminator(raw: &str) -> Result<u8, String> {
    let byte = match raw {
        "lf" | "\\n" => b'\n',
        "cr" | "\\r" => b'\r',
        "nul" | "\\0" => 0,
        _ if raw.len() == 1 => raw.as_bytes()[0],
        _ => raw
            .parse::<u8>()
            .map_err(|_| format!("invalid terminator '{raw}'"))?,
    };
    if !byte.is_ascii() {
        return Err(format!("terminator must be ASCII, got {byte}"));
    }
    Ok(byte)
}
