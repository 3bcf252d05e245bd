use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_echo_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("delimited-tcp");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;
    let port = addr
        .rsplit(':')
        .next()
        .context("server address missing port")?
        .to_string();

    // The server prints every message it receives; keep its pipe drained.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut first = spawn_client(&binary, &port).await?;
    let mut second = spawn_client(&binary, &port).await?;

    first.send_line("hello").await.context("first send line")?;
    let first_echo = read_line_expect(&mut first.stdout, "waiting for first echo").await?;
    assert_eq!(first_echo, "hello");

    second
        .send_line("hi there  ")
        .await
        .context("second send line")?;
    let second_echo = read_line_expect(&mut second.stdout, "waiting for second echo").await?;
    assert_eq!(second_echo, "hi there");

    // Closing stdin disconnects the client cleanly.
    drop(first.stdin);
    let first_rest = read_line(&mut first.stdout).await?;
    assert_eq!(first_rest, None, "echoes go only to the sender");
    ensure_success(&mut first.child, "first client").await?;

    // The server outlives its clients; stopping it closes the second one.
    // Its next line being the close notice shows it never saw "hello".
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let closed = read_line_expect(&mut second.stdout, "waiting for close notice").await?;
    assert_eq!(closed, "*** connection closed");
    ensure_success(&mut second.child, "second client").await?;
    let _ = server_log_task.await;

    Ok(())
}

#[tokio::test]
async fn client_reports_unreachable_server() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("delimited-tcp");

    // Bind and drop to find a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let status = timeout(
        READ_TIMEOUT,
        Command::new(binary)
            .arg("client")
            .arg("--port")
            .arg(port.to_string())
            .env("RUST_LOG", "off")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .context("client did not exit")??;
    assert!(!status.success());

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--bind")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--echo")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("server did not emit listening address")?;
        if !line.contains("server listening on") {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected server banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("server banner missing socket: {line}"));
        }
        return Ok(addr.to_string());
    }
}

async fn spawn_client(binary: &Path, port: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for connect banner").await?;
    if banner != format!("*** connected to 127.0.0.1:{port}") {
        return Err(anyhow!("unexpected connect banner '{banner}'"));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes_io = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes_io? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| bytes > 0)
        .unwrap_or(false)
    {
        buffer.clear();
    }
}

async fn ensure_success(child: &mut Child, label: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{label} did not exit"))??;
    if !status.success() {
        return Err(anyhow!("{label} exited with {status}"));
    }
    Ok(())
}
