mod client;

pub use client::ApiClient;

use async_trait::async_trait;

use crate::attachment::Attachment;
use crate::error::Result;
use crate::models::chat::{ ChatResponse, ConversationMessageRaw };
use crate::models::voucher::{
    ExtractOnlyResponse,
    ExtractedVoucherData,
    Voucher,
    VoucherFilters,
    VoucherInsights,
    VoucherPatch,
};

/// Multipart body of `POST /chat/confirm`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmVoucherRequest {
    pub file: Attachment,
    pub fields: ExtractedVoucherData,
    pub conversation_id: Option<String>,
}

impl ConfirmVoucherRequest {
    /// Text parts in the order the backend expects them.
    pub fn text_fields(&self) -> Vec<(&'static str, String)> {
        let f = &self.fields;
        let mut parts = vec![
            ("payer", f.payer.clone()),
            ("payee", f.payee.clone()),
            ("amount", f.amount.clone()),
            ("currency", f.currency.clone()),
            ("payment_date", f.payment_date.clone()),
            ("description", f.description.clone()),
            ("reference_number", f.reference_number.clone()),
            ("bank_name", f.bank_name.clone()),
            ("confidence_score", f.confidence_score.to_string())
        ];
        if let Some(id) = &self.conversation_id {
            parts.push(("conversationId", id.clone()));
        }
        parts
    }
}

/// REST surface of the voucher backend. Every call unwraps the `data` envelope.
#[async_trait]
pub trait VoucherApi: Send + Sync {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<ConversationMessageRaw>>;

    async fn extract_only(&self, file: &Attachment) -> Result<ExtractOnlyResponse>;

    async fn confirm_voucher(&self, request: ConfirmVoucherRequest) -> Result<ChatResponse>;

    async fn get_vouchers(&self, filters: &VoucherFilters) -> Result<Vec<Voucher>>;

    async fn get_voucher_by_id(&self, id: &str) -> Result<Voucher>;

    async fn update_voucher(&self, id: &str, patch: &VoucherPatch) -> Result<Voucher>;

    async fn get_insights(&self) -> Result<VoucherInsights>;
}
