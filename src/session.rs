//! Root context wiring the API, the chat state and the vault together, plus
//! the extract-then-confirm flow for uploaded receipts.

use log::{ info, warn };
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::api::{ ConfirmVoucherRequest, VoucherApi };
use crate::attachment::Attachment;
use crate::chat::ChatState;
use crate::error::Result;
use crate::models::voucher::{ ExtractedVoucherData, Voucher };
use crate::socket::ChatTransport;
use crate::vault::VaultState;

/// Prompt used when extraction fails and the receipt goes through the chat.
pub const FALLBACK_PROMPT: &str = "Analiza este comprobante";

/// Extracted fields awaiting user review.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherDraft {
    pub data: ExtractedVoucherData,
    pub file: Attachment,
    pub preview_base64: String,
    pub preview_mime: String,
    pub preview_name: String,
}

impl VoucherDraft {
    pub fn is_pdf(&self) -> bool {
        self.preview_mime.contains("pdf")
    }

    /// `data:` URL of the server's re-encoded preview.
    pub fn preview_url(&self) -> String {
        format!("data:{};base64,{}", self.preview_mime, self.preview_base64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftField {
    Payer,
    Payee,
    Amount,
    Currency,
    PaymentDate,
    Description,
    ReferenceNumber,
    BankName,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown draft field: '{0}'")]
pub struct UnknownDraftField(pub String);

impl FromStr for DraftField {
    type Err = UnknownDraftField;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "payer" => Ok(DraftField::Payer),
            "payee" => Ok(DraftField::Payee),
            "amount" => Ok(DraftField::Amount),
            "currency" => Ok(DraftField::Currency),
            "payment_date" | "date" => Ok(DraftField::PaymentDate),
            "description" => Ok(DraftField::Description),
            "reference_number" | "ref" => Ok(DraftField::ReferenceNumber),
            "bank_name" | "bank" => Ok(DraftField::BankName),
            other => Err(UnknownDraftField(other.to_string())),
        }
    }
}

impl fmt::Display for DraftField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DraftField::Payer => "payer",
            DraftField::Payee => "payee",
            DraftField::Amount => "amount",
            DraftField::Currency => "currency",
            DraftField::PaymentDate => "payment_date",
            DraftField::Description => "description",
            DraftField::ReferenceNumber => "reference_number",
            DraftField::BankName => "bank_name",
        };
        f.write_str(name)
    }
}

fn set_field(data: &mut ExtractedVoucherData, field: DraftField, value: String) {
    match field {
        DraftField::Payer => {
            data.payer = value;
        }
        DraftField::Payee => {
            data.payee = value;
        }
        DraftField::Amount => {
            data.amount = value;
        }
        DraftField::Currency => {
            data.currency = value;
        }
        DraftField::PaymentDate => {
            data.payment_date = value;
        }
        DraftField::Description => {
            data.description = value;
        }
        DraftField::ReferenceNumber => {
            data.reference_number = value;
        }
        DraftField::BankName => {
            data.bank_name = value;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Fields extracted; a draft is waiting for confirmation.
    Draft,
    /// Extraction failed; the file was sent as a streamed chat turn instead.
    Streamed,
}

/// Context line prepended to questions about the selected voucher.
pub fn context_message(voucher: &Voucher, text: &str) -> String {
    format!(
        "[Contexto: comprobante ID={}, Pagador={}, Receptor={}, Monto={} {}, Banco={}, Fecha={}, Ref={}, Estado={}]\n{}",
        voucher.id,
        voucher.payer,
        voucher.payee,
        voucher.currency,
        voucher.amount,
        voucher.bank_name.as_deref().unwrap_or(""),
        voucher.payment_date,
        voucher.reference_number.as_deref().unwrap_or(""),
        voucher.status,
        text
    )
}

pub struct Session {
    api: Arc<dyn VoucherApi>,
    chat: Arc<ChatState>,
    vault: Arc<VaultState>,
    draft: Mutex<Option<VoucherDraft>>,
    follower: JoinHandle<()>,
}

impl Session {
    pub async fn start(api: Arc<dyn VoucherApi>, transport: Arc<dyn ChatTransport>) -> Self {
        let vault = Arc::new(VaultState::new(Arc::clone(&api)));
        let chat = ChatState::start(Arc::clone(&api), transport).await;
        let follower = vault.follow(chat.subscribe_analyzed());
        Self {
            api,
            chat,
            vault,
            draft: Mutex::new(None),
            follower,
        }
    }

    pub fn chat(&self) -> &Arc<ChatState> {
        &self.chat
    }

    pub fn vault(&self) -> &Arc<VaultState> {
        &self.vault
    }

    pub async fn draft(&self) -> Option<VoucherDraft> {
        self.draft.lock().await.clone()
    }

    /// Selects a voucher and opens the conversation it came from.
    pub async fn select_voucher(&self, id: &str) -> Option<Voucher> {
        self.vault.select_voucher(id).await;
        let selected = self.vault.selected().await;
        match selected.as_ref().and_then(|v| v.conversation_id.as_deref()) {
            Some(conversation_id) => self.chat.load_conversation(conversation_id).await,
            None => info!("Voucher {} has no conversation to open", id),
        }
        selected
    }

    /// Sends free text, tagged with the selected voucher's details if any.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        match self.vault.selected().await {
            Some(voucher) => {
                let message = context_message(&voucher, text);
                self.chat.send_message(&message, None, voucher.conversation_id.clone()).await
            }
            None => self.chat.send_message(text, None, None).await,
        }
    }

    /// Extracts fields for review. Falls back to a streamed chat turn when
    /// extraction is unavailable.
    pub async fn start_validation(&self, file: Attachment) -> Result<ValidationOutcome> {
        match self.api.extract_only(&file).await {
            Ok(resp) => {
                info!(
                    "Extracted draft from {} (confidence {:.2})",
                    resp.file_name,
                    resp.extracted.confidence_score
                );
                *self.draft.lock().await = Some(VoucherDraft {
                    data: resp.extracted,
                    file,
                    preview_base64: resp.file_base64,
                    preview_mime: resp.file_mime,
                    preview_name: resp.file_name,
                });
                Ok(ValidationOutcome::Draft)
            }
            Err(e) => {
                warn!("Extraction failed, sending file through chat: {}", e);
                self.chat.send_message(FALLBACK_PROMPT, Some(file), None).await?;
                Ok(ValidationOutcome::Streamed)
            }
        }
    }

    /// Edits one draft field. Returns false when no draft is open.
    pub async fn update_draft(&self, field: DraftField, value: &str) -> bool {
        let mut draft = self.draft.lock().await;
        match draft.as_mut() {
            Some(d) => {
                set_field(&mut d.data, field, value.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn cancel_validation(&self) {
        self.draft.lock().await.take();
    }

    /// Saves the reviewed draft. `Ok(None)` when there was nothing to confirm.
    /// On failure the draft stays open for another attempt.
    pub async fn confirm_draft(&self) -> Result<Option<Voucher>> {
        let Some(draft) = self.draft.lock().await.clone() else {
            return Ok(None);
        };
        let conversation_id = self.vault.selected().await.and_then(|v| v.conversation_id);

        let request = ConfirmVoucherRequest {
            file: draft.file,
            fields: draft.data,
            conversation_id,
        };
        let response = self.api.confirm_voucher(request).await?;
        let voucher = response.voucher_analyzed.clone();

        if let Some(v) = &voucher {
            self.vault.add_or_update(v.clone()).await;
            self.vault.load_insights().await;
        }
        self.chat.add_assistant_message(response).await;
        self.cancel_validation().await;
        Ok(voucher)
    }

    pub async fn shutdown(&self) {
        self.follower.abort();
        self.chat.shutdown().await;
    }
}
