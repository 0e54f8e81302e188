//! Newline-delimited JSON over a subordinate process's standard streams.
//!
//! The client side spawns the server and owns the child; the server side speaks the same
//! framing over its own stdin/stdout (logs must therefore go to stderr).

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    channel::{ChannelConnection, Frame},
    decode_frame, encode_frame, Connection, CHANNEL_CAPACITY,
};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Wires a line-framed reader/writer pair into a connection.
pub fn line_connection<R, W>(reader: R, writer: W) -> ChannelConnection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(read_lines(reader, inbound_tx, shutdown.clone()));
    tokio::spawn(write_lines(writer, outbound_rx, shutdown.clone()));

    ChannelConnection::new(outbound_tx, inbound_rx, shutdown)
}

/// The server's own stdin/stdout as a connection.
pub fn stdio_connection() -> ChannelConnection {
    line_connection(tokio::io::stdin(), tokio::io::stdout())
}

async fn read_lines<R>(reader: R, inbound: mpsc::Sender<Frame>, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        let frame = match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                trace!(line = %line, "received line");
                decode_frame(line.trim())
            }
            Ok(None) => {
                debug!("pipe reached end of stream");
                break;
            }
            Err(err) => Err(TransportError::from(err)),
        };

        let failed = frame.is_err() && !matches!(frame, Err(TransportError::MalformedFrame(_)));
        if inbound.send(frame).await.is_err() || failed {
            break;
        }
    }
}

async fn write_lines<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else { break };

        let mut line = match encode_frame(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "dropping unencodable message");
                continue;
            }
        };

        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(err) = written.await {
            warn!(error = %err, "pipe write failed");
            shutdown.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Client end of the pipe binding: owns the subordinate process.
pub struct PipeConnection {
    channel: ChannelConnection,
    child: Mutex<Option<Child>>,
}

impl PipeConnection {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, TransportError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Connect(format!("failed to spawn `{command}`: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("subordinate stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("subordinate stdout unavailable".to_string()))?;

        debug!(command, pid = ?child.id(), "spawned subordinate server");

        Ok(Self {
            channel: line_connection(stdout, stdin),
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl Connection for PipeConnection {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.channel.send(message).await
    }

    async fn receive(&self) -> Result<Option<Message>, TransportError> {
        self.channel.receive().await
    }

    async fn close(&self) {
        self.channel.close().await;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        // stdin is closed by the writer pump on shutdown; give the server a moment to exit.
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "subordinate server exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for subordinate server"),
            Err(_) => {
                warn!("subordinate server did not exit in time, killing it");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill subordinate server");
                }
            }
        }
    }
}
