use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
};
use tracing::{info, warn};

use delimited_tcp::{
    Client, ClientConfig, ConnectionState, Server, ServerConfig,
    cli::{Cli, ClientArgs, Command, ServerArgs},
    framer::MessageFramer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => run_client(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let terminator = args.wire.terminator;
    let config = ServerConfig::new(args.port)
        .bind_address(args.bind)
        .terminator(terminator)
        .framing(args.wire.framing.into());
    let server = Server::bind(config).context("failed to start server")?;
    info!("server listening on {}", server.local_addr());

    server.add_on_receive(|message| println!("<<< {message}"));
    if args.echo {
        let handle = server.handle();
        let framer = MessageFramer::new(terminator, args.wire.framing.into());
        server.add_on_session_receive(move |session, message| {
            handle.send(session, framer.frame(message))
        });
    }
    server.start();

    if let Err(err) = signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    info!("server shutting down");
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let framer = MessageFramer::new(args.wire.terminator, args.wire.framing.into());
    let config = ClientConfig::default()
        .terminator(args.wire.terminator)
        .framing(args.wire.framing.into());
    let client = Client::new(config).context("failed to start client")?;
    client.add_on_receive(|message| println!("{message}"));

    client.connect(args.host.as_str(), args.port);
    let state = client
        .wait_for_state(|state| state.is_connected() || state.is_closed())
        .await;
    if state.is_closed() {
        bail!("could not connect to {}:{}", args.host, args.port);
    }
    println!("*** connected to {}:{}", args.host, args.port);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => client.send(framer.frame(line.trim_end())),
                None => break,
            },
            _ = client.wait_for_state(ConnectionState::is_closed) => {
                println!("*** connection closed");
                return Ok(());
            }
        }
    }

    client.disconnect();
    client.wait_for_state(ConnectionState::is_closed).await;
    Ok(())
}
