//! Channel-backed connection shared by every binding.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Connection, CHANNEL_CAPACITY};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub type Frame = Result<Message, TransportError>;

/// Outbound messages go to a pump that writes them; inbound frames come from a pump that
/// reads them.
///
/// Cancelling the shutdown token unblocks `receive` and tells the pumps to stop.
pub struct ChannelConnection {
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<mpsc::Receiver<Frame>>,
    shutdown: CancellationToken,
}

impl ChannelConnection {
    pub fn new(
        outbound: mpsc::Sender<Message>,
        inbound: mpsc::Receiver<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(inbound),
            shutdown,
        }
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<Message>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            frame = inbound.recv() => frame.transpose(),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Two connections wired to each other inside one process.
///
/// Closing either side ends the other side's inbound stream.
pub fn memory_pair() -> (ChannelConnection, ChannelConnection) {
    let left_shutdown = CancellationToken::new();
    let right_shutdown = CancellationToken::new();
    let (left_out, left_out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (right_out, right_out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (left_in_tx, left_in) = mpsc::channel(CHANNEL_CAPACITY);
    let (right_in_tx, right_in) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(forward(left_out_rx, right_in_tx, left_shutdown.clone()));
    tokio::spawn(forward(right_out_rx, left_in_tx, right_shutdown.clone()));

    (
        ChannelConnection::new(left_out, left_in, left_shutdown),
        ChannelConnection::new(right_out, right_in, right_shutdown),
    )
}

async fn forward(
    mut from: mpsc::Receiver<Message>,
    to: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = from.recv() => message,
        };
        let Some(message) = message else { break };
        if to.send(Ok(message)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mcp::rpc::Notification;

    fn ping(n: u64) -> Message {
        Message::Notification(Notification::new(
            "ping",
            Some(serde_json::json!({ "n": n })),
        ))
    }

    #[tokio::test]
    async fn delivers_messages_in_order() {
        let (left, right) = memory_pair();
        for n in 0..10 {
            left.send(ping(n)).await.expect("send");
        }
        for n in 0..10 {
            let message = right.receive().await.expect("receive").expect("open");
            assert_eq!(message, ping(n));
        }
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_other() {
        let (left, right) = memory_pair();
        left.close().await;
        left.close().await;

        let received = tokio::time::timeout(Duration::from_secs(1), right.receive())
            .await
            .expect("receive must not hang");
        assert_eq!(received, Ok(None));
        assert_eq!(left.send(ping(1)).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_receive() {
        let (left, _right) = memory_pair();
        let left = std::sync::Arc::new(left);
        let waiter = {
            let left = std::sync::Arc::clone(&left);
            tokio::spawn(async move { left.receive().await })
        };

        tokio::task::yield_now().await;
        left.close().await;
        let received = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receive must be released")
            .expect("task joins");
        assert_eq!(received, Ok(None));
    }
}
