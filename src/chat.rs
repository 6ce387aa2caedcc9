//! Conversation state: the message list of the active conversation and the
//! streaming turn machine fed by the chat socket.
//!
//! A turn moves `idle -> sent -> streaming -> done | error`. Only the message
//! named by the streaming pointer receives socket events. The pointer is
//! cleared exactly once per turn, so stray events after a turn are no-ops.

use log::{ debug, error, info, warn };
use std::sync::{ Arc, Weak };
use tokio::sync::broadcast::{ self, error::RecvError };
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::VoucherApi;
use crate::attachment::Attachment;
use crate::error::{ ClientError, Result };
use crate::models::chat::{ parse_timestamp, ChatMessage, ChatResponse, Role };
use crate::models::voucher::Voucher;
use crate::models::websocket::{
    ChatChunkEvent,
    ChatDoneEvent,
    ChatErrorEvent,
    SendMessagePayload,
    SocketEvent,
};
use crate::socket::ChatTransport;

const CHANGE_BUFFER: usize = 256;

/// Prefix of the inline text that replaces a failed reply.
pub const ERROR_MARKER: &str = "❌";

pub fn error_text(message: &str) -> String {
    format!("{} {}", ERROR_MARKER, message)
}

/// Mutation notice for views observing the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatChange {
    /// List cleared because the active conversation switched.
    Reset {
        conversation_id: String,
    },
    HistoryLoaded {
        conversation_id: String,
        count: usize,
    },
    Appended {
        id: String,
    },
    Chunk {
        id: String,
        chunk: String,
    },
    Finalized {
        id: String,
    },
    Failed {
        id: String,
        message: String,
    },
    Busy(bool),
}

#[derive(Default)]
struct ChatInner {
    messages: Vec<ChatMessage>,
    conversation_id: Option<String>,
    streaming_id: Option<String>,
    sending: bool,
    disposed: bool,
}

impl ChatInner {
    fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

pub struct ChatState {
    api: Arc<dyn VoucherApi>,
    transport: Arc<dyn ChatTransport>,
    inner: Mutex<ChatInner>,
    changes: broadcast::Sender<ChatChange>,
    analyzed: broadcast::Sender<Voucher>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChatState {
    /// Bare state with no socket listener. `start` is the usual entry point.
    pub fn new(api: Arc<dyn VoucherApi>, transport: Arc<dyn ChatTransport>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (analyzed, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            api,
            transport,
            inner: Mutex::new(ChatInner::default()),
            changes,
            analyzed,
            listener: Mutex::new(None),
        }
    }

    /// Subscribes to the transport, then connects. A failed first connect is
    /// not fatal: the next send reconnects.
    pub async fn start(api: Arc<dyn VoucherApi>, transport: Arc<dyn ChatTransport>) -> Arc<Self> {
        let state = Arc::new(Self::new(api, Arc::clone(&transport)));
        let events = transport.events().subscribe();
        let handle = tokio::spawn(listen(Arc::downgrade(&state), events));
        *state.listener.lock().await = Some(handle);

        if let Err(e) = transport.connect().await {
            warn!("Chat socket not available yet: {}", e);
        }
        state
    }

    /// Stops event processing and closes the socket. Later events and sends
    /// are refused.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.inner.lock().await.disposed = true;
        self.transport.disconnect().await;
        info!("Chat state shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatChange> {
        self.changes.subscribe()
    }

    /// Vouchers produced by completed turns.
    pub fn subscribe_analyzed(&self) -> broadcast::Receiver<Voucher> {
        self.analyzed.subscribe()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.inner.lock().await.conversation_id.clone()
    }

    pub async fn streaming_id(&self) -> Option<String> {
        self.inner.lock().await.streaming_id.clone()
    }

    pub async fn is_sending(&self) -> bool {
        self.inner.lock().await.sending
    }

    fn notify(&self, change: ChatChange) {
        let _ = self.changes.send(change);
    }

    /// Switches to `conversation_id` and loads its history. Same id is a no-op.
    pub async fn load_conversation(&self, conversation_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            if inner.conversation_id.as_deref() == Some(conversation_id) {
                return;
            }
            inner.conversation_id = Some(conversation_id.to_string());
            inner.messages.clear();
        }
        self.notify(ChatChange::Reset { conversation_id: conversation_id.to_string() });

        let history = self.api.get_conversation(conversation_id).await;

        let mut inner = self.inner.lock().await;
        if inner.conversation_id.as_deref() != Some(conversation_id) {
            debug!("Discarding stale history for {}", conversation_id);
            return;
        }
        match history {
            Ok(raw) => {
                inner.messages = raw.into_iter().map(ChatMessage::from).collect();
                let count = inner.messages.len();
                drop(inner);
                info!("Loaded {} messages for conversation {}", count, conversation_id);
                self.notify(ChatChange::HistoryLoaded {
                    conversation_id: conversation_id.to_string(),
                    count,
                });
            }
            Err(e) => {
                warn!("Failed to load conversation {}: {}", conversation_id, e);
            }
        }
    }

    /// Starts a turn: appends the user message and a loading placeholder,
    /// then emits one `chat.message`. Rejected while another turn streams.
    pub async fn send_message(
        &self,
        content: &str,
        file: Option<Attachment>,
        conversation_id: Option<String>
    ) -> Result<()> {
        let (user_id, placeholder_id, active_conversation) = {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return Err(ClientError::Disposed);
            }
            if inner.streaming_id.is_some() {
                return Err(ClientError::TurnInFlight);
            }
            if let Some(id) = conversation_id {
                if inner.conversation_id.as_ref() != Some(&id) {
                    inner.conversation_id = Some(id);
                }
            }

            let user = ChatMessage::user(content);
            let placeholder = ChatMessage::placeholder();
            let user_id = user.id.clone();
            let placeholder_id = placeholder.id.clone();

            inner.messages.push(user);
            inner.messages.push(placeholder);
            inner.streaming_id = Some(placeholder_id.clone());
            inner.sending = true;
            (user_id, placeholder_id, inner.conversation_id.clone())
        };
        self.notify(ChatChange::Appended { id: user_id });
        self.notify(ChatChange::Appended { id: placeholder_id.clone() });
        self.notify(ChatChange::Busy(true));

        let mut payload = SendMessagePayload {
            message: content.to_string(),
            conversation_id: active_conversation,
            ..Default::default()
        };

        if let Some(file) = file {
            match file.encode().await {
                Ok(encoded) => {
                    payload.file_base64 = Some(encoded);
                    payload.file_mime = Some(file.mime);
                    payload.file_name = Some(file.file_name);
                }
                Err(e) => {
                    error!("Could not encode attachment: {}", e);
                    self.fail_turn(&placeholder_id, &e.to_string()).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.transport.send_message(payload).await {
            error!("Failed to send chat message: {}", e);
            self.fail_turn(&placeholder_id, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Appends a finished assistant reply from the HTTP confirm flow.
    pub async fn add_assistant_message(&self, response: ChatResponse) {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: response.reply,
            timestamp: parse_timestamp(&response.timestamp),
            is_loading: false,
            voucher_analyzed: response.voucher_analyzed,
        };
        let id = message.id.clone();

        {
            let mut inner = self.inner.lock().await;
            inner.messages.push(message);
            if let Some(conversation_id) = response.conversation_id.filter(|c| !c.is_empty()) {
                inner.conversation_id = Some(conversation_id);
            }
        }
        self.notify(ChatChange::Appended { id });
    }

    /// Applies one socket event to the streaming turn.
    pub async fn handle_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Chunk(chunk) => self.on_chunk(chunk).await,
            SocketEvent::Done(done) => self.on_done(done).await,
            SocketEvent::Error(err) => self.on_error(err).await,
        }
    }

    async fn on_chunk(&self, event: ChatChunkEvent) {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return;
        }
        let Some(id) = inner.streaming_id.clone() else {
            debug!("Chunk with no active turn dropped");
            return;
        };
        if let Some(message) = inner.message_mut(&id) {
            message.content.push_str(&event.chunk);
            message.is_loading = false;
        }
        drop(inner);
        self.notify(ChatChange::Chunk { id, chunk: event.chunk });
    }

    async fn on_done(&self, event: ChatDoneEvent) {
        let (id, voucher) = {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return;
            }
            let Some(id) = inner.streaming_id.take() else {
                debug!("Completion with no active turn dropped");
                return;
            };
            inner.conversation_id = Some(event.conversation_id.clone());
            if let Some(message) = inner.message_mut(&id) {
                message.is_loading = false;
                message.timestamp = parse_timestamp(&event.timestamp);
                message.voucher_analyzed = event.voucher_analyzed.clone();
            }
            inner.sending = false;
            (id, event.voucher_analyzed)
        };
        self.notify(ChatChange::Finalized { id });
        self.notify(ChatChange::Busy(false));

        if let Some(voucher) = voucher {
            info!("Turn produced voucher {}", voucher.id);
            let _ = self.analyzed.send(voucher);
        }
    }

    async fn on_error(&self, event: ChatErrorEvent) {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return;
        }
        let Some(id) = inner.streaming_id.take() else {
            debug!("Error with no active turn dropped: {}", event.message);
            return;
        };
        warn!("Turn failed: {}", event.message);
        if let Some(message) = inner.message_mut(&id) {
            message.content = error_text(&event.message);
            message.is_loading = false;
        }
        inner.sending = false;
        drop(inner);
        self.notify(ChatChange::Failed { id, message: event.message });
        self.notify(ChatChange::Busy(false));
    }

    /// Fails the turn in flight after the listener skipped events; its end may be among them.
    async fn on_lagged(&self, skipped: u64) {
        let streaming = self.inner.lock().await.streaming_id.clone();
        if let Some(id) = streaming {
            self.fail_turn(&id, &format!("reply lost ({} socket events skipped)", skipped)).await;
        }
    }

    /// Error path for local failures, applied only if `id` still owns the turn.
    async fn fail_turn(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        if inner.streaming_id.as_deref() != Some(id) {
            return;
        }
        inner.streaming_id = None;
        inner.sending = false;
        if let Some(msg) = inner.message_mut(id) {
            msg.content = error_text(message);
            msg.is_loading = false;
        }
        drop(inner);
        self.notify(ChatChange::Failed { id: id.to_string(), message: message.to_string() });
        self.notify(ChatChange::Busy(false));
    }
}

async fn listen(state: Weak<ChatState>, mut events: broadcast::Receiver<SocketEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(state) = state.upgrade() else {
                    break;
                };
                state.handle_event(event).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Chat listener lagged, {} socket events skipped", skipped);
                let Some(state) = state.upgrade() else {
                    break;
                };
                state.on_lagged(skipped).await;
            }
            Err(RecvError::Closed) => {
                break;
            }
        }
    }
    debug!("Chat listener stopped");
}
