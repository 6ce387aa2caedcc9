use async_trait::async_trait;
use futures::stream::{ SplitSink, SplitStream };
use futures::{ SinkExt, StreamExt };
use log::{ debug, info, warn };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{ mpsc, Mutex };
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{ connect_async, MaybeTlsStream, WebSocketStream };
use url::Url;

use super::packet::{ EnginePacket, PacketKind, SocketPacket };
use super::{ ChatTransport, SocketEvents, DEFAULT_EVENT_BUFFER };
use crate::error::{ ClientError, Result };
use crate::models::websocket::{ SendMessagePayload, SocketEvent, EVENT_MESSAGE };

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Server origin, e.g. `http://localhost:3000`.
    pub base_url: Url,
    pub path: String,
    pub namespace: String,
    pub connect_timeout: Duration,
    pub event_buffer: usize,
}

impl SocketConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            path: "/socket.io".to_string(),
            namespace: "/chat".to_string(),
            connect_timeout: Duration::from_secs(10),
            event_buffer: DEFAULT_EVENT_BUFFER,
        })
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = if namespace.starts_with('/') {
            namespace.to_string()
        } else {
            format!("/{}", namespace)
        };
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// WebSocket URL of the Engine.IO endpoint.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::Protocol(format!("unsupported URL scheme '{}'", other)));
            }
        };
        url
            .set_scheme(scheme)
            .map_err(|_| ClientError::Protocol(format!("cannot use scheme '{}'", scheme)))?;
        url.set_path(&format!("{}/", self.path.trim_end_matches('/')));
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }
}

struct Connection {
    sid: String,
    outbound: mpsc::Sender<Message>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn spawn(sid: String, sink: WsSink, source: WsSource, namespace: String, events: SocketEvents) -> Self {
        let (outbound, rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(sink, rx));
        let reader = tokio::spawn(
            read_loop(source, outbound.clone(), namespace, events, Arc::clone(&alive))
        );

        Self { sid, outbound, alive, reader }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(self, namespace: &str) {
        if self.is_alive() {
            let leave = EnginePacket::Message(SocketPacket::disconnect(namespace).encode()).encode();
            let _ = self.outbound.try_send(Message::Text(leave));
            let _ = self.outbound.try_send(Message::Close(None));
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Socket.IO client for the chat namespace.
pub struct SocketClient {
    config: SocketConfig,
    events: SocketEvents,
    connection: Mutex<Option<Connection>>,
}

impl SocketClient {
    pub fn new(config: SocketConfig) -> Self {
        let events = SocketEvents::new(config.event_buffer);
        Self {
            config,
            events,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Engine.IO session id of the live connection.
    pub async fn sid(&self) -> Option<String> {
        let slot = self.connection.lock().await;
        slot.as_ref()
            .filter(|c| c.is_alive())
            .map(|c| c.sid.clone())
    }

    async fn open(&self) -> Result<Connection> {
        let endpoint = self.config.endpoint()?;
        info!("[SocketClient] Connecting to {}", endpoint);

        let (ws, _) = timeout(self.config.connect_timeout, connect_async(endpoint.as_str())).await
            .map_err(|_| ClientError::Timeout("opening the socket"))??;
        let (mut sink, mut source) = ws.split();

        let sid = timeout(
            self.config.connect_timeout,
            handshake(&mut sink, &mut source, &self.config.namespace)
        ).await
            .map_err(|_| ClientError::Timeout("joining the chat namespace"))??;

        info!("[SocketClient] Connected: {}", sid);
        Ok(Connection::spawn(sid, sink, source, self.config.namespace.clone(), self.events.clone()))
    }
}

#[async_trait]
impl ChatTransport for SocketClient {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().map_or(false, Connection::is_alive) {
            return Ok(());
        }
        // A dead handle from an earlier session is released before reconnecting.
        if let Some(stale) = slot.take() {
            stale.close(&self.config.namespace);
        }
        *slot = Some(self.open().await?);
        Ok(())
    }

    async fn send_message(&self, payload: SendMessagePayload) -> Result<()> {
        self.connect().await?;

        let packet = SocketPacket::event(
            &self.config.namespace,
            EVENT_MESSAGE,
            serde_json::to_value(&payload)?
        );
        let frame = EnginePacket::Message(packet.encode()).encode();

        let outbound = {
            let slot = self.connection.lock().await;
            slot.as_ref()
                .filter(|c| c.is_alive())
                .map(|c| c.outbound.clone())
                .ok_or(ClientError::NotConnected)?
        };
        outbound.send(Message::Text(frame)).await.map_err(|_| ClientError::NotConnected)?;
        debug!(
            "-> {} ({} chars, file: {})",
            EVENT_MESSAGE,
            payload.message.len(),
            payload.file_name.as_deref().unwrap_or("none")
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.take() {
            connection.close(&self.config.namespace);
            info!("[SocketClient] Disconnected");
        }
    }

    /// False while a connect is still in progress.
    fn is_connected(&self) -> bool {
        self.connection
            .try_lock()
            .map(|slot| slot.as_ref().map_or(false, Connection::is_alive))
            .unwrap_or(false)
    }

    fn events(&self) -> &SocketEvents {
        &self.events
    }
}

async fn handshake(sink: &mut WsSink, source: &mut WsSource, namespace: &str) -> Result<String> {
    let mut engine_sid: Option<String> = None;

    while let Some(frame) = source.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => {
                break;
            }
            _ => {
                continue;
            }
        };

        match EnginePacket::decode(&text)? {
            EnginePacket::Open(info) => {
                debug!(
                    "Engine.IO open: sid={}, pingInterval={}ms, pingTimeout={}ms",
                    info.sid,
                    info.ping_interval,
                    info.ping_timeout
                );
                engine_sid = Some(info.sid);
                let join = EnginePacket::Message(SocketPacket::connect(namespace).encode());
                sink.send(Message::Text(join.encode())).await?;
            }
            EnginePacket::Ping(payload) => {
                sink.send(Message::Text(EnginePacket::Pong(payload).encode())).await?;
            }
            EnginePacket::Message(body) => {
                let packet = SocketPacket::decode(&body)?;
                if packet.namespace != namespace {
                    continue;
                }
                match packet.kind {
                    PacketKind::Connect => {
                        let sid = packet.data
                            .as_ref()
                            .and_then(|d| d.get("sid"))
                            .and_then(|s| s.as_str())
                            .map(str::to_string)
                            .or_else(|| engine_sid.clone())
                            .unwrap_or_default();
                        return Ok(sid);
                    }
                    PacketKind::ConnectError => {
                        return Err(ClientError::ConnectRefused {
                            namespace: namespace.to_string(),
                            message: packet.error_message(),
                        });
                    }
                    _ => {}
                }
            }
            EnginePacket::Close => {
                break;
            }
            _ => {}
        }
    }

    Err(ClientError::Protocol("socket closed during handshake".into()))
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!("[SocketClient] Write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: WsSource,
    outbound: mpsc::Sender<Message>,
    namespace: String,
    events: SocketEvents,
    alive: Arc<AtomicBool>
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) =>
                match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Ping(payload)) => {
                        let pong = EnginePacket::Pong(payload).encode();
                        if outbound.send(Message::Text(pong)).await.is_err() {
                            break;
                        }
                    }
                    Ok(EnginePacket::Message(body)) => {
                        if !dispatch(&body, &namespace, &events) {
                            break;
                        }
                    }
                    Ok(EnginePacket::Close) => {
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[SocketClient] Dropping malformed frame: {}", e),
                }
            Ok(Message::Ping(data)) => {
                let _ = outbound.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                debug!("[SocketClient] Close frame received");
                break;
            }
            Ok(Message::Binary(_)) => warn!("[SocketClient] Ignoring binary frame"),
            Ok(_) => {}
            Err(e) => {
                warn!("[SocketClient] Read failed: {}", e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    info!("[SocketClient] Disconnected");
}

/// Routes one Socket.IO packet. Returns false once the namespace is closed.
fn dispatch(body: &str, namespace: &str, events: &SocketEvents) -> bool {
    let packet = match SocketPacket::decode(body) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("[SocketClient] Dropping packet: {}", e);
            return true;
        }
    };
    if packet.namespace != namespace {
        debug!("Ignoring packet for namespace {}", packet.namespace);
        return true;
    }

    match packet.kind {
        PacketKind::Event => {
            if let Some((name, payload)) = packet.event_parts() {
                match SocketEvent::from_named(name, payload) {
                    Ok(Some(event)) => {
                        debug!("<- {}", name);
                        events.publish(event);
                    }
                    Ok(None) => debug!("Ignoring event '{}'", name),
                    Err(e) => warn!("[SocketClient] Malformed '{}' payload: {}", name, e),
                }
            }
            true
        }
        PacketKind::Disconnect => {
            info!("[SocketClient] Server closed namespace {}", namespace);
            false
        }
        _ => true,
    }
}
