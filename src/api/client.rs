use async_trait::async_trait;
use log::{ debug, error };
use reqwest::multipart::{ Form, Part };
use reqwest::{ Client as HttpClient, RequestBuilder };
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::{ ConfirmVoucherRequest, VoucherApi };
use crate::attachment::Attachment;
use crate::error::{ ClientError, Result };
use crate::models::chat::{ ChatResponse, ConversationData, ConversationMessageRaw };
use crate::models::voucher::{
    ExtractOnlyResponse,
    Voucher,
    VoucherFilters,
    VoucherInsights,
    VoucherPatch,
};

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    data: Option<T>,
}

/// `VoucherApi` over HTTP. `base_url` includes any path prefix, e.g. `http://localhost:3000/api`.
pub struct ApiClient {
    http: HttpClient,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(HttpClient::new(), base_url)
    }

    pub fn with_client(http: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        ApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base_url` followed by `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Protocol(format!("'{}' cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends `req` and unwraps the `{ data }` envelope. Returns the request path with the payload.
    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<(String, Option<T>)> {
        let req = req.build()?;
        let route = req.url().path().to_string();
        debug!("-> {} {}", req.method(), route);
        let resp = self.http.execute(req).await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("{} failed with status {}: {}", route, status, body);
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
        Ok((route, envelope.data))
    }

    async fn fetch_data<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let (route, data) = self.fetch(req).await?;
        data.ok_or(ClientError::MissingData(route))
    }
}

fn file_part(file: &Attachment) -> Result<Part> {
    let part = Part::bytes(file.bytes.clone())
        .file_name(file.file_name.clone())
        .mime_str(&file.mime)?;
    Ok(part)
}

#[async_trait]
impl VoucherApi for ApiClient {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<ConversationMessageRaw>> {
        let req = self.http.get(self.url(&["chat", conversation_id])?);
        let (_, data): (_, Option<ConversationData>) = self.fetch(req).await?;
        Ok(data.map(ConversationData::into_messages).unwrap_or_default())
    }

    async fn extract_only(&self, file: &Attachment) -> Result<ExtractOnlyResponse> {
        let form = Form::new().part("file", file_part(file)?).text("message", "");
        let req = self.http.post(self.url(&["chat", "extract"])?).multipart(form);
        self.fetch_data(req).await
    }

    async fn confirm_voucher(&self, request: ConfirmVoucherRequest) -> Result<ChatResponse> {
        let mut form = Form::new().part("file", file_part(&request.file)?);
        for (name, value) in request.text_fields() {
            form = form.text(name, value);
        }
        let req = self.http.post(self.url(&["chat", "confirm"])?).multipart(form);
        self.fetch_data(req).await
    }

    async fn get_vouchers(&self, filters: &VoucherFilters) -> Result<Vec<Voucher>> {
        let req = self.http.get(self.url(&["vouchers"])?).query(&filters.to_query());
        self.fetch_data(req).await
    }

    async fn get_voucher_by_id(&self, id: &str) -> Result<Voucher> {
        let req = self.http.get(self.url(&["vouchers", id])?);
        self.fetch_data(req).await
    }

    async fn update_voucher(&self, id: &str, patch: &VoucherPatch) -> Result<Voucher> {
        let req = self.http.patch(self.url(&["vouchers", id])?).json(patch);
        self.fetch_data(req).await
    }

    async fn get_insights(&self) -> Result<VoucherInsights> {
        let req = self.http.get(self.url(&["vouchers", "insights"])?);
        self.fetch_data(req).await
    }
}
