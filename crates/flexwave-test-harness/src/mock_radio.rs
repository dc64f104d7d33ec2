//! A mock radio control channel for protocol-level testing.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A mock radio: accepts one control connection, performs the handshake,
/// records received lines, and injects lines on demand.
///
/// The handshake consists of the version line and the session handle line,
/// sent as soon as the client connects -- the same order a real radio uses.
pub struct MockRadio {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
    inject: mpsc::UnboundedSender<String>,
}

impl MockRadio {
    /// Start a mock radio with the standard handshake
    /// (`V1.2.3.4` / `H0000ABCD`).
    pub async fn start() -> MockRadio {
        Self::start_with_handshake("V1.2.3.4", "H0000ABCD").await
    }

    /// Start a mock radio with specific version and handle lines.
    pub async fn start_with_handshake(version_line: &str, handle_line: &str) -> MockRadio {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("binding a loopback listener cannot fail");
        let addr = listener.local_addr().unwrap();

        let (received_tx, received) = mpsc::unbounded_channel();
        let (inject, inject_rx) = mpsc::unbounded_channel();

        let version_line = version_line.to_string();
        let handle_line = handle_line.to_string();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            serve(stream, version_line, handle_line, received_tx, inject_rx).await;
        });

        MockRadio {
            addr,
            received,
            inject,
        }
    }

    /// The address the mock radio is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The next line received from the client, or `None` on timeout.
    pub async fn next_line(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drain received lines until one contains `needle`, returning it.
    /// Panics after `timeout` so tests fail with a useful message.
    pub async fn expect_line_containing(&mut self, needle: &str, timeout: Duration) -> String {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_line(remaining).await {
                Some(line) if line.contains(needle) => return line,
                Some(_) => continue,
                None => panic!("no line containing {needle:?} within {timeout:?}"),
            }
        }
    }

    /// Send one line to the client. The newline is appended here.
    pub fn inject(&self, line: &str) {
        let _ = self.inject.send(line.to_string());
    }

    /// Extract the sequence number from a recorded `C<seq>|...` line.
    pub fn sequence_of(line: &str) -> u32 {
        let body = line.strip_prefix('C').expect("not a command line");
        let (seq, _) = body.split_once('|').expect("command line has no pipe");
        seq.parse().expect("command sequence is not a number")
    }

    /// Reply to a recorded command line with a final response frame.
    pub fn respond(&self, command_line: &str, code: u32, message: &str) {
        let seq = Self::sequence_of(command_line);
        self.inject(&format!("R{seq}|{code:08X}|{message}"));
    }
}

async fn serve(
    mut stream: TcpStream,
    version_line: String,
    handle_line: String,
    received_tx: mpsc::UnboundedSender<String>,
    mut inject_rx: mpsc::UnboundedReceiver<String>,
) {
    let handshake = format!("{version_line}\n{handle_line}\n");
    if stream.write_all(handshake.as_bytes()).await.is_err() {
        return;
    }
    let _ = stream.flush().await;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let read_task = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                    if received_tx.send(trimmed).is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(line) = inject_rx.recv().await {
        let framed = format!("{line}\n");
        if write_half.write_all(framed.as_bytes()).await.is_err() {
            break;
        }
        let _ = write_half.flush().await;
    }

    read_task.abort();
}
