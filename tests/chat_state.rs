mod common;

use common::{ eventually, raw_message, voucher, FakeApi, FakeTransport };
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use voucher_vault::attachment::Attachment;
use voucher_vault::chat::{ ChatChange, ChatState, ERROR_MARKER };
use voucher_vault::error::ClientError;
use voucher_vault::models::chat::{ ChatResponse, Role };
use voucher_vault::models::websocket::{
    ChatChunkEvent,
    ChatDoneEvent,
    ChatErrorEvent,
    SocketEvent,
};
use voucher_vault::socket::ChatTransport;

fn setup() -> (Arc<FakeApi>, Arc<FakeTransport>, ChatState) {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(FakeTransport::new());
    let chat = ChatState::new(api.clone(), transport.clone());
    (api, transport, chat)
}

fn chunk(text: &str) -> SocketEvent {
    SocketEvent::Chunk(ChatChunkEvent { chunk: text.to_string(), conversation_id: "c1".to_string() })
}

fn done(conversation_id: &str, timestamp: &str) -> SocketEvent {
    SocketEvent::Done(ChatDoneEvent {
        conversation_id: conversation_id.to_string(),
        role: Role::Assistant,
        timestamp: timestamp.to_string(),
        voucher_analyzed: None,
        insights: None,
    })
}

fn failed(message: &str) -> SocketEvent {
    SocketEvent::Error(ChatErrorEvent { message: message.to_string() })
}

#[tokio::test]
async fn send_appends_user_message_and_placeholder() {
    let (_api, transport, chat) = setup();

    chat.send_message("Hola", None, None).await.unwrap();

    let messages = chat.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hola");
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(messages[1].is_loading);
    assert_eq!(messages[1].content, "");
    assert_eq!(chat.streaming_id().await.as_deref(), Some(messages[1].id.as_str()));
    assert!(chat.is_sending().await);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message, "Hola");
    assert_eq!(sent[0].conversation_id, None);
    assert_eq!(sent[0].file_base64, None);
}

#[tokio::test]
async fn streamed_turn_concatenates_chunks_and_finalizes() {
    let (_api, _transport, chat) = setup();
    chat.send_message("Hola", None, None).await.unwrap();

    chat.handle_event(chunk("Hi")).await;
    let placeholder = chat.messages().await[1].clone();
    assert_eq!(placeholder.content, "Hi");
    assert!(!placeholder.is_loading);
    assert!(chat.is_sending().await);

    chat.handle_event(chunk(" there")).await;
    chat.handle_event(done("c1", "2024-05-10T12:30:00Z")).await;

    let reply = chat.messages().await[1].clone();
    assert_eq!(reply.content, "Hi there");
    assert!(!reply.is_loading);
    assert_eq!(reply.timestamp.to_rfc3339(), "2024-05-10T12:30:00+00:00");
    assert_eq!(chat.streaming_id().await, None);
    assert!(!chat.is_sending().await);
    assert_eq!(chat.conversation_id().await.as_deref(), Some("c1"));
}

#[tokio::test]
async fn events_without_an_active_turn_are_ignored() {
    let (_api, _transport, chat) = setup();

    chat.handle_event(chunk("stray")).await;
    chat.handle_event(failed("stray")).await;
    chat.handle_event(done("c9", "2024-05-10T12:30:00Z")).await;
    assert!(chat.messages().await.is_empty());
    assert_eq!(chat.conversation_id().await, None);

    chat.send_message("Hola", None, None).await.unwrap();
    chat.handle_event(chunk("Hi")).await;
    chat.handle_event(done("c1", "2024-05-10T12:30:00Z")).await;

    chat.handle_event(chunk(" late")).await;
    chat.handle_event(failed("late")).await;
    let messages = chat.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hi");
}

#[tokio::test]
async fn error_event_replaces_placeholder_with_marker() {
    let (_api, _transport, chat) = setup();
    let mut changes = chat.subscribe();
    chat.send_message("Hola", None, None).await.unwrap();

    chat.handle_event(chunk("partial")).await;
    chat.handle_event(failed("boom")).await;

    let reply = chat.messages().await[1].clone();
    assert!(reply.content.starts_with(ERROR_MARKER));
    assert!(reply.content.contains("boom"));
    assert!(!reply.content.contains("partial"));
    assert!(!reply.is_loading);
    assert!(!chat.is_sending().await);
    assert_eq!(chat.streaming_id().await, None);

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(change);
    }
    assert!(seen.contains(&(ChatChange::Failed { id: reply.id.clone(), message: "boom".to_string() })));
    assert_eq!(seen.last(), Some(&ChatChange::Busy(false)));
}

#[tokio::test]
async fn second_send_is_rejected_while_streaming() {
    let (_api, transport, chat) = setup();
    chat.send_message("one", None, None).await.unwrap();

    let err = chat.send_message("two", None, None).await.unwrap_err();
    assert!(matches!(err, ClientError::TurnInFlight));
    assert_eq!(chat.messages().await.len(), 2);
    assert_eq!(transport.sent().len(), 1);

    chat.handle_event(done("c1", "2024-05-10T12:30:00Z")).await;
    chat.send_message("two", None, None).await.unwrap();
    assert_eq!(chat.messages().await.len(), 4);
    assert_eq!(transport.sent()[1].conversation_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn send_failure_ends_the_turn_with_an_error() {
    let (_api, transport, chat) = setup();
    transport.fail_sends.store(true, Ordering::SeqCst);

    let err = chat.send_message("Hola", None, None).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));

    let messages = chat.messages().await;
    assert_eq!(messages.len(), 2);
    assert!(messages[1].content.starts_with(ERROR_MARKER));
    assert!(!messages[1].is_loading);
    assert!(!chat.is_sending().await);
    assert_eq!(chat.streaming_id().await, None);

    transport.fail_sends.store(false, Ordering::SeqCst);
    chat.send_message("again", None, None).await.unwrap();
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn explicit_conversation_id_is_adopted_and_sent() {
    let (_api, transport, chat) = setup();

    chat.send_message("Hola", None, Some("c7".to_string())).await.unwrap();

    assert_eq!(chat.conversation_id().await.as_deref(), Some("c7"));
    assert_eq!(transport.sent()[0].conversation_id.as_deref(), Some("c7"));
}

#[tokio::test]
async fn attachment_is_sent_as_base64() {
    let (_api, transport, chat) = setup();
    let file = Attachment::new("recibo.png", "image/png", b"png-bytes".to_vec());

    chat.send_message("Analiza", Some(file), None).await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent[0].file_base64.as_deref(), Some("cG5nLWJ5dGVz"));
    assert_eq!(sent[0].file_mime.as_deref(), Some("image/png"));
    assert_eq!(sent[0].file_name.as_deref(), Some("recibo.png"));
}

#[tokio::test]
async fn completion_broadcasts_the_analyzed_voucher() {
    let (_api, _transport, chat) = setup();
    let mut analyzed = chat.subscribe_analyzed();
    chat.send_message("Analiza", None, None).await.unwrap();

    let v = voucher("v1", "Ana", "CFE");
    chat.handle_event(
        SocketEvent::Done(ChatDoneEvent {
            conversation_id: "c1".to_string(),
            role: Role::Assistant,
            timestamp: "2024-05-10T12:30:00Z".to_string(),
            voucher_analyzed: Some(v.clone()),
            insights: None,
        })
    ).await;

    assert_eq!(analyzed.try_recv().unwrap(), v);
    assert_eq!(chat.messages().await[1].voucher_analyzed, Some(v));
}

#[tokio::test]
async fn loading_a_conversation_maps_history() {
    let (api, _transport, chat) = setup();
    api.conversations
        .lock()
        .unwrap()
        .insert(
            "c1".to_string(),
            vec![
                raw_message("m1", "USER", "Hola"),
                raw_message("m2", "ASSISTANT", "Hi"),
                raw_message("m3", "user", "legacy")
            ]
        );

    chat.load_conversation("c1").await;
    chat.load_conversation("c1").await;

    assert_eq!(api.conversation_calls(), 1);
    let messages = chat.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[2].role, Role::Other("user".to_string()));
    assert!(messages.iter().all(|m| !m.is_loading));
    assert_eq!(messages[0].timestamp.to_rfc3339(), "2024-05-10T12:00:00+00:00");
}

#[tokio::test]
async fn failed_history_load_leaves_an_empty_list() {
    let (api, _transport, chat) = setup();
    chat.send_message("Hola", None, None).await.unwrap();
    chat.handle_event(done("c1", "2024-05-10T12:30:00Z")).await;

    chat.load_conversation("missing").await;

    assert_eq!(api.conversation_calls(), 1);
    assert!(chat.messages().await.is_empty());
    assert_eq!(chat.conversation_id().await.as_deref(), Some("missing"));
}

#[tokio::test]
async fn stale_history_is_discarded() {
    let api = Arc::new(FakeApi::default());
    {
        let mut conversations = api.conversations.lock().unwrap();
        conversations.insert("slow".to_string(), vec![raw_message("s1", "USER", "old")]);
        conversations.insert("fast".to_string(), vec![raw_message("f1", "USER", "new")]);
    }
    api.history_delays.lock().unwrap().insert("slow".to_string(), Duration::from_millis(100));
    let transport = Arc::new(FakeTransport::new());
    let chat = Arc::new(ChatState::new(api.clone(), transport));

    let slow = {
        let chat = Arc::clone(&chat);
        tokio::spawn(async move { chat.load_conversation("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    chat.load_conversation("fast").await;
    slow.await.unwrap();

    let messages = chat.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "new");
    assert_eq!(chat.conversation_id().await.as_deref(), Some("fast"));
}

#[tokio::test]
async fn assistant_message_from_confirm_is_appended() {
    let (_api, _transport, chat) = setup();

    chat.add_assistant_message(ChatResponse {
        conversation_id: Some("c5".to_string()),
        role: Role::Assistant,
        reply: "Comprobante guardado".to_string(),
        timestamp: "2024-05-10T12:30:00Z".to_string(),
        voucher_analyzed: Some(voucher("v1", "Ana", "CFE")),
        insights: None,
    }).await;

    let messages = chat.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Comprobante guardado");
    assert!(!messages[0].is_loading);
    assert!(messages[0].voucher_analyzed.is_some());
    assert_eq!(chat.conversation_id().await.as_deref(), Some("c5"));
    assert!(!chat.is_sending().await);
}

#[tokio::test]
async fn started_state_consumes_transport_events_in_order() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(FakeTransport::new());
    let chat = ChatState::start(api, transport.clone()).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

    chat.send_message("Hola", None, None).await.unwrap();
    let events = transport.events();
    events.publish(chunk("He"));
    events.publish(chunk("llo"));
    events.publish(done("c1", "2024-05-10T12:30:00Z"));

    let chat_ref = &chat;
    assert!(eventually(|| async move { !chat_ref.is_sending().await }).await);
    assert_eq!(chat.messages().await[1].content, "Hello");
    assert_eq!(chat.conversation_id().await.as_deref(), Some("c1"));
}

#[tokio::test]
async fn shutdown_disconnects_and_refuses_further_work() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(FakeTransport::new());
    let chat = ChatState::start(api, transport.clone()).await;
    chat.send_message("Hola", None, None).await.unwrap();

    chat.shutdown().await;
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

    chat.handle_event(chunk("late")).await;
    assert_eq!(chat.messages().await[1].content, "");

    let err = chat.send_message("again", None, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Disposed));
}

#[tokio::test]
async fn lagged_listener_fails_the_turn_in_flight() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(FakeTransport::new());
    let chat = ChatState::start(api, transport.clone()).await;
    chat.send_message("Hola", None, None).await.unwrap();

    // The completion is pushed out of the 64-slot buffer before the listener runs.
    let events = transport.events();
    events.publish(done("c1", "2024-05-10T12:30:00Z"));
    for _ in 0..100 {
        events.publish(chunk("x"));
    }

    let chat_ref = &chat;
    assert!(eventually(|| async move { !chat_ref.is_sending().await }).await);
    let reply = chat.messages().await[1].clone();
    assert!(reply.content.starts_with(ERROR_MARKER));
    assert!(reply.content.contains("reply lost"));
    assert!(!reply.is_loading);
    assert_eq!(chat.streaming_id().await, None);

    chat.send_message("otra vez", None, None).await.unwrap();
    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test]
async fn turn_changes_arrive_in_order() {
    let (_api, _transport, chat) = setup();
    let mut changes = chat.subscribe();

    chat.send_message("Hola", None, None).await.unwrap();
    chat.handle_event(chunk("Hi")).await;
    chat.handle_event(done("c1", "2024-05-10T12:30:00Z")).await;

    let messages = chat.messages().await;
    let (user, reply) = (messages[0].id.clone(), messages[1].id.clone());
    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(change);
    }
    assert_eq!(seen, vec![
        ChatChange::Appended { id: user },
        ChatChange::Appended { id: reply.clone() },
        ChatChange::Busy(true),
        ChatChange::Chunk { id: reply.clone(), chunk: "Hi".to_string() },
        ChatChange::Finalized { id: reply },
        ChatChange::Busy(false)
    ]);
}
