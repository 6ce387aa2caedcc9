pub mod client;
pub mod packet;

pub use client::{ SocketClient, SocketConfig };

use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::Result;
use crate::models::websocket::{
    ChatChunkEvent,
    ChatDoneEvent,
    ChatErrorEvent,
    SendMessagePayload,
    SocketEvent,
};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Fan-out of inbound chat events. One ordered channel backs all three
/// per-kind views, so chunk/done ordering survives for any subscriber of
/// `subscribe`.
#[derive(Clone, Debug)]
pub struct SocketEvents {
    tx: broadcast::Sender<SocketEvent>,
}

impl SocketEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that will see the event.
    pub fn publish(&self, event: SocketEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.tx.subscribe()
    }

    pub fn chunks(&self) -> impl Stream<Item = ChatChunkEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(SocketEvent::Chunk(chunk)) => Some(chunk),
                _ => None,
            }
        })
    }

    pub fn completions(&self) -> impl Stream<Item = ChatDoneEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(SocketEvent::Done(done)) => Some(done),
                _ => None,
            }
        })
    }

    pub fn errors(&self) -> impl Stream<Item = ChatErrorEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(SocketEvent::Error(error)) => Some(error),
                _ => None,
            }
        })
    }
}

impl Default for SocketEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Persistent chat channel. Sends are fire-and-forget; replies arrive on
/// `events()`.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// No-op when already connected.
    async fn connect(&self) -> Result<()>;

    /// Connects first if needed.
    async fn send_message(&self, payload: SendMessagePayload) -> Result<()>;

    /// Safe to call when already disconnected.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn events(&self) -> &SocketEvents;
}
