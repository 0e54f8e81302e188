//! WebSocket binding: one persistent connection, one text frame per JSON-RPC message each way.

use std::fmt::Display;

use axum::extract::ws::{Message as AxumFrame, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    channel::{ChannelConnection, Frame},
    decode_frame, encode_frame, CHANNEL_CAPACITY,
};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub const SOCKET_PATH: &str = "/mcp";

enum Incoming {
    Frame(Frame),
    Closed,
    Ignored,
}

/// Client side: performs the WebSocket handshake against `url` (`ws://` or `wss://`).
pub async fn connect(url: &str) -> Result<ChannelConnection, TransportError> {
    let (socket, response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| {
            TransportError::Connect(format!("websocket handshake with {url} failed: {err}"))
        })?;
    debug!(url, status = %response.status(), "websocket connected");

    let (sink, stream) = socket.split();
    Ok(spawn_pumps(
        stream,
        sink,
        classify_client_frame,
        |text| WsFrame::Text(text.into()),
        WsFrame::Close(None),
    ))
}

/// Server side: wraps an upgraded axum socket.
pub fn accept(socket: WebSocket) -> ChannelConnection {
    let (sink, stream) = socket.split();
    spawn_pumps(
        stream,
        sink,
        classify_server_frame,
        |text| AxumFrame::Text(text.into()),
        AxumFrame::Close(None),
    )
}

fn classify_client_frame(frame: WsFrame) -> Incoming {
    match frame {
        WsFrame::Text(text) => Incoming::Frame(decode_frame(text.as_str())),
        WsFrame::Binary(bytes) => Incoming::Frame(decode_binary(&bytes)),
        WsFrame::Close(_) => Incoming::Closed,
        _ => Incoming::Ignored,
    }
}

fn classify_server_frame(frame: AxumFrame) -> Incoming {
    match frame {
        AxumFrame::Text(text) => Incoming::Frame(decode_frame(text.as_str())),
        AxumFrame::Binary(bytes) => Incoming::Frame(decode_binary(&bytes)),
        AxumFrame::Close(_) => Incoming::Closed,
        _ => Incoming::Ignored,
    }
}

fn decode_binary(bytes: &[u8]) -> Frame {
    std::str::from_utf8(bytes)
        .map_err(|err| TransportError::MalformedFrame(err.to_string()))
        .and_then(decode_frame)
}

fn spawn_pumps<S, K, F, E>(
    stream: S,
    sink: K,
    classify: fn(F) -> Incoming,
    text_frame: fn(String) -> F,
    close_frame: F,
) -> ChannelConnection
where
    S: Stream<Item = Result<F, E>> + Unpin + Send + 'static,
    K: Sink<F> + Unpin + Send + 'static,
    K::Error: Display,
    F: Send + 'static,
    E: Display + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(read_frames(stream, classify, inbound_tx, shutdown.clone()));
    tokio::spawn(write_frames(
        sink,
        text_frame,
        close_frame,
        outbound_rx,
        shutdown.clone(),
    ));

    ChannelConnection::new(outbound_tx, inbound_rx, shutdown)
}

async fn read_frames<S, F, E>(
    mut stream: S,
    classify: fn(F) -> Incoming,
    inbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<F, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => match classify(frame) {
                Incoming::Frame(frame) => frame,
                Incoming::Closed => {
                    debug!("websocket closed by peer");
                    break;
                }
                Incoming::Ignored => continue,
            },
            Some(Err(err)) => {
                warn!(error = %err, "websocket read failed");
                let _ = inbound.send(Err(TransportError::Io(err.to_string()))).await;
                break;
            }
            None => {
                debug!("websocket stream ended");
                break;
            }
        };

        trace!(ok = frame.is_ok(), "received websocket frame");
        if inbound.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames<K, F>(
    mut sink: K,
    text_frame: fn(String) -> F,
    close_frame: F,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) where
    K: Sink<F> + Unpin,
    K::Error: Display,
{
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else { break };

        let text = match encode_frame(&message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "dropping unencodable message");
                continue;
            }
        };

        if let Err(err) = sink.send(text_frame(text)).await {
            warn!(error = %err, "websocket write failed");
            shutdown.cancel();
            return;
        }
    }

    let _ = sink.send(close_frame).await;
    let _ = sink.close().await;
}
