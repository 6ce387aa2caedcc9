#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::Mutex;
use std::time::Duration;

use voucher_vault::api::{ ConfirmVoucherRequest, VoucherApi };
use voucher_vault::attachment::Attachment;
use voucher_vault::error::{ ClientError, Result };
use voucher_vault::models::chat::{ ChatResponse, ConversationMessageRaw };
use voucher_vault::models::voucher::{
    ExtractOnlyResponse,
    Voucher,
    VoucherFilters,
    VoucherInsights,
    VoucherPatch,
    VoucherStatus,
};
use voucher_vault::models::websocket::SendMessagePayload;
use voucher_vault::socket::{ ChatTransport, SocketEvents };

pub fn voucher(id: &str, payer: &str, payee: &str) -> Voucher {
    Voucher {
        id: id.to_string(),
        payer: payer.to_string(),
        payee: payee.to_string(),
        amount: 100.0,
        currency: "MXN".to_string(),
        payment_date: "2024-05-10".to_string(),
        description: None,
        reference_number: None,
        bank_name: None,
        status: VoucherStatus::Analyzed,
        raw_file_path: None,
        conversation_id: None,
        created_at: None,
        updated_at: None,
    }
}

pub fn raw_message(id: &str, role: &str, content: &str) -> ConversationMessageRaw {
    ConversationMessageRaw {
        id: id.to_string(),
        role: role.to_string(),
        content: content.to_string(),
        created_at: Some("2024-05-10T12:00:00Z".to_string()),
        timestamp: None,
        voucher_analyzed: None,
    }
}

fn failure(what: &str) -> ClientError {
    ClientError::Status { status: 500, body: format!("{} failed", what) }
}

/// In-memory backend with call counters.
#[derive(Default)]
pub struct FakeApi {
    pub conversations: Mutex<HashMap<String, Vec<ConversationMessageRaw>>>,
    pub history_delays: Mutex<HashMap<String, Duration>>,
    pub vouchers: Mutex<Vec<Voucher>>,
    pub insights: Mutex<Option<VoucherInsights>>,
    pub extract_response: Mutex<Option<ExtractOnlyResponse>>,
    pub confirm_response: Mutex<Option<ChatResponse>>,
    pub confirm_requests: Mutex<Vec<ConfirmVoucherRequest>>,
    pub fail_vouchers: AtomicBool,
    pub conversation_calls: AtomicUsize,
    pub insights_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl FakeApi {
    pub fn with_vouchers(vouchers: Vec<Voucher>) -> Self {
        let api = Self::default();
        *api.vouchers.lock().unwrap() = vouchers;
        api
    }

    pub fn insights_calls(&self) -> usize {
        self.insights_calls.load(Ordering::SeqCst)
    }

    pub fn conversation_calls(&self) -> usize {
        self.conversation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoucherApi for FakeApi {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<ConversationMessageRaw>> {
        self.conversation_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.history_delays.lock().unwrap().get(conversation_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| failure("history"))
    }

    async fn extract_only(&self, _file: &Attachment) -> Result<ExtractOnlyResponse> {
        self.extract_response.lock().unwrap().clone().ok_or_else(|| failure("extract"))
    }

    async fn confirm_voucher(&self, request: ConfirmVoucherRequest) -> Result<ChatResponse> {
        self.confirm_requests.lock().unwrap().push(request);
        self.confirm_response.lock().unwrap().clone().ok_or_else(|| failure("confirm"))
    }

    async fn get_vouchers(&self, filters: &VoucherFilters) -> Result<Vec<Voucher>> {
        if self.fail_vouchers.load(Ordering::SeqCst) {
            return Err(failure("vouchers"));
        }
        let mut list = self.vouchers.lock().unwrap().clone();
        if let Some(limit) = filters.limit {
            list.truncate(limit as usize);
        }
        Ok(list)
    }

    async fn get_voucher_by_id(&self, id: &str) -> Result<Voucher> {
        self.vouchers
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| failure("voucher"))
    }

    async fn update_voucher(&self, id: &str, patch: &VoucherPatch) -> Result<Voucher> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut vouchers = self.vouchers.lock().unwrap();
        let v = vouchers
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| failure("update"))?;
        if let Some(status) = patch.status {
            v.status = status;
        }
        if let Some(payee) = &patch.payee {
            v.payee = payee.clone();
        }
        Ok(v.clone())
    }

    async fn get_insights(&self) -> Result<VoucherInsights> {
        self.insights_calls.fetch_add(1, Ordering::SeqCst);
        self.insights.lock().unwrap().clone().ok_or_else(|| failure("insights"))
    }
}

/// Transport that records sends; tests inject inbound events via `events()`.
pub struct FakeTransport {
    events: SocketEvents,
    pub sent: Mutex<Vec<SendMessagePayload>>,
    pub connected: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub fail_sends: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            events: SocketEvents::new(64),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<SendMessagePayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn send_message(&self, payload: SendMessagePayload) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        self.connect().await?;
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> &SocketEvents {
        &self.events
    }
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool where F: FnMut() -> Fut, Fut: std::future::Future<Output = bool> {
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
