use std::{net::Ipv4Addr, time::Duration};

use anyhow::{Context, Result};
use delimited_tcp::{
    Client, ClientConfig, ConnectionState, Diagnostic, DiagnosticEvent, Origin, PoolState,
    Server, ServerConfig, SessionInfo,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(3);

fn local_server(terminator: u8) -> Result<Server> {
    let config = ServerConfig::new(0)
        .bind_address(Ipv4Addr::LOCALHOST.into())
        .terminator(terminator);
    Ok(Server::bind(config)?)
}

fn observer(
    tag: &'static str,
    tx: &mpsc::UnboundedSender<String>,
) -> impl Fn(&str) + Send + Sync + 'static {
    let tx = tx.clone();
    move |message: &str| {
        let _ = tx.send(format!("{tag}:{message}"));
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Result<String> {
    timeout(WAIT, rx.recv())
        .await
        .context("timed out waiting for observer")?
        .context("observer channel closed")
}

/// Polls until `count` accepted sessions are connected.
async fn connected_sessions(server: &Server, count: usize) -> Result<Vec<SessionInfo>> {
    timeout(WAIT, async {
        loop {
            let active: Vec<SessionInfo> = server
                .sessions()
                .await
                .into_iter()
                .filter(|session| session.peer.is_some() && session.state.is_connected())
                .collect();
            if active.len() == count {
                return active;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("expected {count} connected sessions"))
}

async fn connected_client(server: &Server, terminator: u8) -> Result<Client> {
    let client = Client::new(ClientConfig::default().terminator(terminator))?;
    client.connect_to(vec![server.local_addr()]);
    let state = timeout(
        WAIT,
        client.wait_for_state(|state| state.is_connected() || state.is_closed()),
    )
    .await?;
    assert_eq!(state, ConnectionState::Connected);
    Ok(client)
}

#[tokio::test]
async fn pool_is_idle_until_started() -> Result<()> {
    let server = local_server(b'\n')?;
    assert_eq!(server.pool_state(), PoolState::Idle);
    assert!(server.sessions().await.is_empty());

    server.start();
    timeout(WAIT, server.wait_for_pool_state(|state| *state == PoolState::Accepting)).await?;

    let sessions = server.sessions().await;
    assert_eq!(sessions.len(), 1, "exactly one pending session");
    assert_eq!(sessions[0].peer, None);
    assert_eq!(sessions[0].state, ConnectionState::Idle);

    Ok(())
}

#[tokio::test]
async fn ping_pong_between_client_and_session() -> Result<()> {
    let server = local_server(b'\n')?;
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    server.add_on_receive(observer("server", &server_tx));
    server.start();

    let client = connected_client(&server, b'\n').await?;
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    client.add_on_receive(observer("client", &client_tx));

    client.send("ping\n");
    assert_eq!(next(&mut server_rx).await?, "server:ping");

    let session = connected_sessions(&server, 1).await?[0].id;
    server.send(session, "pong\n");
    assert_eq!(next(&mut client_rx).await?, "client:pong");

    Ok(())
}

#[tokio::test]
async fn sessions_are_independent() -> Result<()> {
    let server = local_server(b'\n')?;
    let (tx, mut received) = mpsc::unbounded_channel();
    server.add_on_receive(observer("server", &tx));
    server.start();

    let first = connected_client(&server, b'\n').await?;
    let second = connected_client(&server, b'\n').await?;
    let sessions = connected_sessions(&server, 2).await?;
    assert_ne!(sessions[0].id, sessions[1].id);

    first.send("one\n");
    assert_eq!(next(&mut received).await?, "server:one");
    second.send("two\n");
    assert_eq!(next(&mut received).await?, "server:two");

    first.disconnect();
    timeout(WAIT, first.wait_for_state(ConnectionState::is_closed)).await?;
    let remaining = connected_sessions(&server, 1).await?;
    assert!(sessions.iter().any(|session| session.id == remaining[0].id));

    second.send("still here\n");
    assert_eq!(next(&mut received).await?, "server:still here");

    Ok(())
}

#[tokio::test]
async fn closing_a_session_disconnects_only_its_peer() -> Result<()> {
    let server = local_server(b'\n')?;
    server.start();

    let mut first = TcpStream::connect(server.local_addr()).await?;
    let second = connected_client(&server, b'\n').await?;
    let sessions = connected_sessions(&server, 2).await?;
    let first_id = sessions
        .iter()
        .find(|session| session.peer == first.local_addr().ok())
        .map(|session| session.id)
        .context("first peer has a session")?;

    server.close_session(first_id);
    let mut rest = Vec::new();
    let read = timeout(WAIT, first.read_to_end(&mut rest)).await??;
    assert_eq!(read, 0, "closed session sends EOF");

    let remaining = connected_sessions(&server, 1).await?;
    assert_ne!(remaining[0].id, first_id);
    assert!(second.state().is_connected());

    Ok(())
}

#[tokio::test]
async fn late_observers_reach_live_sessions() -> Result<()> {
    let server = local_server(0)?;
    server.start();

    let mut peer = TcpStream::connect(server.local_addr()).await?;
    connected_sessions(&server, 1).await?;

    let (tx, mut received) = mpsc::unbounded_channel();
    server.add_on_receive(observer("late", &tx));
    // The pool answers in command order, so the registration has been
    // forwarded once this returns.
    server.sessions().await;
    sleep(Duration::from_millis(50)).await;

    peer.write_all(b"after\0").await?;
    assert_eq!(next(&mut received).await?, "late:after");

    Ok(())
}

#[tokio::test]
async fn broadcast_and_send_observers() -> Result<()> {
    let server = local_server(b'\n')?;
    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    server.add_on_send(observer("sent", &sent_tx));
    server.start();

    let (tx, mut received) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for tag in ["a", "b", "c"] {
        let client = connected_client(&server, b'\n').await?;
        client.add_on_receive(observer(tag, &tx));
        clients.push(client);
    }
    connected_sessions(&server, 3).await?;

    server.broadcast("all\n");
    let mut heard = Vec::new();
    for _ in 0..3 {
        heard.push(next(&mut received).await?);
    }
    heard.sort();
    assert_eq!(heard, vec!["a:all", "b:all", "c:all"]);
    for _ in 0..3 {
        assert_eq!(next(&mut sent).await?, "sent:all\n");
    }

    Ok(())
}

#[tokio::test]
async fn session_observers_reply_to_the_sender_only() -> Result<()> {
    let server = local_server(b'\n')?;
    let handle = server.handle();
    server.add_on_session_receive(move |session, message| {
        handle.send(session, format!("ack:{message}\n"));
    });
    server.start();

    let first = connected_client(&server, b'\n').await?;
    let second = connected_client(&server, b'\n').await?;
    let (tx, mut received) = mpsc::unbounded_channel();
    first.add_on_receive(observer("first", &tx));
    second.add_on_receive(observer("second", &tx));
    connected_sessions(&server, 2).await?;

    first.send("one\n");
    assert_eq!(next(&mut received).await?, "first:ack:one");
    second.send("two\n");
    assert_eq!(next(&mut received).await?, "second:ack:two");

    sleep(Duration::from_millis(50)).await;
    assert!(received.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn large_echoes_do_not_stall_either_side() -> Result<()> {
    const SIZE: usize = 8 * 1024 * 1024;

    let server = local_server(b'\n')?;
    let handle = server.handle();
    server.add_on_session_receive(move |session, message| {
        handle.send(session, format!("{message}\n"));
    });
    server.start();

    let client = connected_client(&server, b'\n').await?;
    let (tx, mut echoed) = mpsc::unbounded_channel();
    client.add_on_receive(move |message: &str| {
        let _ = tx.send(message.len());
    });
    connected_sessions(&server, 1).await?;

    // Both sides are writing more than the socket buffers hold while the
    // other side is also writing.
    for fill in ["a", "b"] {
        let mut message = fill.repeat(SIZE);
        message.push('\n');
        client.send(message);
    }

    for index in 0..2 {
        let length = timeout(Duration::from_secs(15), echoed.recv())
            .await
            .with_context(|| format!("echo {index} never arrived"))?
            .context("echo channel closed")?;
        assert_eq!(length, SIZE);
    }
    Ok(())
}

#[tokio::test]
async fn dropping_the_server_closes_its_sessions() -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let config = ServerConfig::new(0)
        .bind_address(Ipv4Addr::LOCALHOST.into())
        .terminator(b'\n')
        .sink(move |diagnostic: &Diagnostic| {
            let _ = events_tx.send(diagnostic.clone());
        });
    let server = Server::bind(config)?;
    server.start();

    let client = connected_client(&server, b'\n').await?;
    let session = connected_sessions(&server, 1).await?[0].id;

    drop(server);
    let state = timeout(WAIT, client.wait_for_state(ConnectionState::is_closed)).await?;
    assert_eq!(state, ConnectionState::Closed);

    let mut disconnected = false;
    while let Ok(diagnostic) = events.try_recv() {
        if diagnostic.origin == Origin::Session(session)
            && diagnostic.event == DiagnosticEvent::Disconnected
        {
            disconnected = true;
        }
    }
    assert!(disconnected, "session reported its disconnect before the drop returned");
    Ok(())
}
