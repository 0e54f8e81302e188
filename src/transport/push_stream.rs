//! Server-sent events carrying server messages, paired with a POST endpoint for client messages.
//!
//! `GET /sse` opens the stream. Its first event is `endpoint`, whose data is the path the client
//! posts to (`/messages?session_id=<id>`). Every later event is `message` with one JSON-RPC
//! message as data. Dropping the stream ends the server session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::{stream, Stream, StreamExt};
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::{
    channel::{ChannelConnection, Frame},
    decode_frame, CHANNEL_CAPACITY,
};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub const STREAM_PATH: &str = "/sse";
pub const MESSAGES_PATH: &str = "/messages";

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the event stream at `url` and waits for the server to announce its message endpoint.
pub async fn connect(url: &str) -> Result<ChannelConnection, TransportError> {
    let stream_url = Url::parse(url)
        .map_err(|err| TransportError::Connect(format!("invalid url `{url}`: {err}")))?;
    let client = reqwest::Client::new();
    let mut events = EventSource::new(client.get(stream_url.clone()))
        .map_err(|err| TransportError::Connect(err.to_string()))?;

    let announced =
        tokio::time::timeout(ENDPOINT_TIMEOUT, wait_for_endpoint(&mut events)).await;
    let endpoint = match announced {
        Ok(Ok(path)) => stream_url
            .join(&path)
            .map_err(|err| TransportError::Connect(format!("invalid endpoint `{path}`: {err}"))),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(TransportError::Connect(
            "server did not announce a message endpoint".to_string(),
        )),
    };
    let endpoint = match endpoint {
        Ok(endpoint) => endpoint,
        Err(err) => {
            events.close();
            return Err(err);
        }
    };
    debug!(stream = %stream_url, endpoint = %endpoint, "event stream connected");

    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(read_events(events, inbound_tx, shutdown.clone()));
    tokio::spawn(post_messages(client, endpoint, outbound_rx, shutdown.clone()));

    Ok(ChannelConnection::new(outbound_tx, inbound_rx, shutdown))
}

async fn wait_for_endpoint(events: &mut EventSource) -> Result<String, TransportError> {
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Open) => trace!("event stream opened"),
            Ok(Event::Message(event)) if event.event == ENDPOINT_EVENT => {
                return Ok(event.data.trim().to_string());
            }
            Ok(Event::Message(event)) => {
                debug!(event = %event.event, "ignoring event received before the endpoint")
            }
            Err(err) => return Err(TransportError::Connect(err.to_string())),
        }
    }

    Err(TransportError::Connect(
        "event stream ended before the endpoint was announced".to_string(),
    ))
}

async fn read_events(
    mut events: EventSource,
    inbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };

        let frame = match event {
            Some(Ok(Event::Message(event))) if event.event == MESSAGE_EVENT => {
                decode_frame(&event.data)
            }
            Some(Ok(_)) => continue,
            Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                debug!("event stream ended");
                break;
            }
            // Reconnecting would open a fresh server session, so any stream error is final.
            Some(Err(err)) => {
                warn!(error = %err, "event stream failed");
                let _ = inbound.send(Err(TransportError::Io(err.to_string()))).await;
                break;
            }
        };

        if inbound.send(frame).await.is_err() {
            break;
        }
    }

    events.close();
}

async fn post_messages(
    client: reqwest::Client,
    endpoint: Url,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else { break };

        let posted = client
            .post(endpoint.clone())
            .json(&message)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(err) = posted {
            warn!(error = %err, endpoint = %endpoint, "failed to post message");
            shutdown.cancel();
            break;
        }
    }
}

/// Open push-stream sessions on the server, keyed by session id.
#[derive(Clone, Default)]
pub struct StreamSessions {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<Frame>>>>,
}

impl StreamSessions {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hands a posted message to the session's server loop.
    pub async fn deliver(&self, session_id: &str, message: Message) -> Result<(), TransportError> {
        let sender = self
            .lock()
            .get(session_id)
            .cloned()
            .ok_or(TransportError::Closed)?;
        sender
            .send(Ok(message))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn insert(&self, session_id: String, sender: mpsc::Sender<Frame>) {
        self.lock().insert(session_id, sender);
    }

    fn remove(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Frame>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters a session once its event stream is dropped.
struct SessionGuard {
    session_id: String,
    sessions: StreamSessions,
    shutdown: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(session_id = %self.session_id, "event stream dropped");
        self.shutdown.cancel();
        self.sessions.remove(&self.session_id);
    }
}

/// Registers a new session and returns its server-side connection together with the SSE response.
pub fn accept(
    sessions: &StreamSessions,
    session_id: String,
) -> (
    ChannelConnection,
    Sse<impl Stream<Item = Result<SseEvent, axum::Error>> + Send + 'static>,
) {
    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
    sessions.insert(session_id.clone(), inbound_tx);

    let endpoint = SseEvent::default()
        .event(ENDPOINT_EVENT)
        .data(format!("{MESSAGES_PATH}?session_id={session_id}"));
    let guard = SessionGuard {
        session_id,
        sessions: sessions.clone(),
        shutdown: shutdown.clone(),
    };

    let messages = ReceiverStream::new(outbound_rx)
        .take_until(shutdown.clone().cancelled_owned())
        .map(move |message| {
            let _session = &guard;
            SseEvent::default().event(MESSAGE_EVENT).json_data(&message)
        });
    let events = stream::once(async move { Ok::<_, axum::Error>(endpoint) }).chain(messages);

    (
        ChannelConnection::new(outbound_tx, inbound_rx, shutdown),
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}
