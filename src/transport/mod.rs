//! Transport bindings
//!
//! A [`Connection`] is an ordered duplex channel of [`Message`]s. Three bindings exist:
//! a pipe to a subordinate process, a server-sent-events stream paired with a POST
//! endpoint, and a WebSocket carrying both directions. All of them are built on the
//! same [`ChannelConnection`] core, with background pumps translating frames.

pub mod bidirectional;
pub mod channel;
pub mod pipe;
pub mod push_stream;

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;

use crate::config::ConfigError;
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub use channel::{memory_pair, ChannelConnection};
pub use pipe::PipeConnection;

pub(crate) const CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Queues a message for delivery; messages from one sender arrive in order.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Waits for the next inbound message. `Ok(None)` once the channel is closed.
    async fn receive(&self) -> Result<Option<Message>, TransportError>;

    /// Releases the underlying resource. Safe to call more than once.
    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Pipe,
    PushStream,
    BidirectionalStream,
}

impl TransportKind {
    pub fn is_network(self) -> bool {
        !matches!(self, Self::Pipe)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::PushStream => "push-stream",
            Self::BidirectionalStream => "bidirectional-stream",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pipe" | "stdio" => Ok(Self::Pipe),
            "push-stream" | "sse" => Ok(Self::PushStream),
            "bidirectional-stream" | "http" | "ws" => Ok(Self::BidirectionalStream),
            other => Err(ConfigError::InvalidTransport(other.to_string())),
        }
    }
}

/// Client-side description of how to reach a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTransport {
    Pipe { command: String, args: Vec<String> },
    PushStream { url: String },
    BidirectionalStream { url: String },
}

impl ClientTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Pipe { .. } => TransportKind::Pipe,
            Self::PushStream { .. } => TransportKind::PushStream,
            Self::BidirectionalStream { .. } => TransportKind::BidirectionalStream,
        }
    }

    pub async fn open(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let connection: Arc<dyn Connection> = match self {
            Self::Pipe { command, args } => Arc::new(PipeConnection::spawn(command, args)?),
            Self::PushStream { url } => Arc::new(push_stream::connect(url).await?),
            Self::BidirectionalStream { url } => Arc::new(bidirectional::connect(url).await?),
        };
        Ok(connection)
    }
}

/// Decodes one text frame into a message.
pub(crate) fn decode_frame(text: &str) -> Result<Message, TransportError> {
    serde_json::from_str(text).map_err(|err| TransportError::MalformedFrame(err.to_string()))
}

pub(crate) fn encode_frame(message: &Message) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|err| TransportError::MalformedFrame(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transport_names_and_aliases() {
        assert_eq!("pipe".parse::<TransportKind>().ok(), Some(TransportKind::Pipe));
        assert_eq!("stdio".parse::<TransportKind>().ok(), Some(TransportKind::Pipe));
        assert_eq!(" SSE ".parse::<TransportKind>().ok(), Some(TransportKind::PushStream));
        assert_eq!(
            "bidirectional-stream".parse::<TransportKind>().ok(),
            Some(TransportKind::BidirectionalStream)
        );
        assert_eq!("http".parse::<TransportKind>().ok(), Some(TransportKind::BidirectionalStream));
        assert!(matches!(
            "carrier-pigeon".parse::<TransportKind>(),
            Err(ConfigError::InvalidTransport(name)) if name == "carrier-pigeon"
        ));
    }

    #[test]
    fn malformed_frames_are_reported() {
        assert!(matches!(
            decode_frame("{not json"),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(decode_frame(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).is_ok());
    }
}
