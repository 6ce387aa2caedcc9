use serde::{ Deserialize, Deserializer, Serialize };
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherStatus {
    Pending,
    Analyzed,
    Corrected,
    Rejected,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Pending => "PENDING",
            VoucherStatus::Analyzed => "ANALYZED",
            VoucherStatus::Corrected => "CORRECTED",
            VoucherStatus::Rejected => "REJECTED",
        }
    }

    /// Human-facing label used by the console.
    pub fn label(&self) -> &'static str {
        match self {
            VoucherStatus::Pending => "Pendiente",
            VoucherStatus::Analyzed => "Procesado",
            VoucherStatus::Corrected => "Corregido",
            VoucherStatus::Rejected => "Rechazado",
        }
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
#[error("Invalid voucher status: '{input}'")]
pub struct ParseVoucherStatusError {
    input: String,
}

impl FromStr for VoucherStatus {
    type Err = ParseVoucherStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(VoucherStatus::Pending),
            "ANALYZED" => Ok(VoucherStatus::Analyzed),
            "CORRECTED" => Ok(VoucherStatus::Corrected),
            "REJECTED" => Ok(VoucherStatus::Rejected),
            _ =>
                Err(ParseVoucherStatusError {
                    input: s.to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub id: String,
    #[serde(default)]
    pub payer: String,
    #[serde(default)]
    pub payee: String,
    #[serde(deserialize_with = "number_or_string")]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub payment_date: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
    pub status: VoucherStatus,
    #[serde(default)]
    pub raw_file_path: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Voucher {
    /// Case-insensitive substring match over payer, payee, bank and reference.
    /// `needle` must already be lowercase.
    pub fn matches(&self, needle: &str) -> bool {
        let hit = |field: &str| field.to_lowercase().contains(needle);
        hit(&self.payer) ||
            hit(&self.payee) ||
            self.bank_name.as_deref().map_or(false, hit) ||
            self.reference_number.as_deref().map_or(false, hit)
    }
}

// Decimal columns come back as strings from some endpoints.
fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error> where D: Deserializer<'de> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(f64),
        Text(String),
    }

    match Amount::deserialize(deserializer)? {
        Amount::Number(n) => Ok(n),
        Amount::Text(s) =>
            s
                .trim()
                .parse::<f64>()
                .map_err(|e| serde::de::Error::custom(format!("invalid amount '{}': {}", s, e))),
    }
}

/// Partial update for `PATCH /vouchers/{id}`. Only set fields go on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<VoucherStatus>,
}

impl VoucherPatch {
    pub fn status(status: VoucherStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoucherFilters {
    pub payer: Option<String>,
    pub payee: Option<String>,
    pub bank_name: Option<String>,
    pub reference_number: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub status: Option<VoucherStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl VoucherFilters {
    pub fn limit(limit: u32) -> Self {
        Self { limit: Some(limit), ..Default::default() }
    }

    /// Query pairs for `GET /vouchers`, skipping unset and empty values.
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let text = [
            ("payer", &self.payer),
            ("payee", &self.payee),
            ("bankName", &self.bank_name),
            ("referenceNumber", &self.reference_number),
            ("dateFrom", &self.date_from),
            ("dateTo", &self.date_to),
        ];
        let mut query: Vec<(&'static str, String)> = text
            .into_iter()
            .filter_map(|(key, value)| {
                value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| (key, v.to_string()))
            })
            .collect();

        if let Some(status) = self.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(page) = self.page {
            query.push(("page", page.to_string()));
        }
        if let Some(limit) = self.limit {
            query.push(("limit", limit.to_string()));
        }
        query
    }
}

// Aggregates come back as numbers, numeric strings, or null on an empty vault.
#[derive(Deserialize)]
#[serde(untagged)]
enum Aggregate {
    Number(serde_json::Number),
    Text(String),
}

fn aggregate_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where D: Deserializer<'de>
{
    Ok(
        Option::<Aggregate>::deserialize(deserializer)?.map(|value| {
            match value {
                Aggregate::Number(n) => n.to_string(),
                Aggregate::Text(s) => s,
            }
        })
    )
}

fn aggregate_count<'de, D>(deserializer: D) -> Result<i64, D::Error> where D: Deserializer<'de> {
    match Option::<Aggregate>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Aggregate::Number(n)) =>
            n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| serde::de::Error::custom(format!("invalid count {}", n))),
        Some(Aggregate::Text(s)) =>
            s
                .trim()
                .parse::<i64>()
                .map_err(|e| serde::de::Error::custom(format!("invalid count '{}': {}", s, e))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCount {
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "aggregate_text")]
    pub count: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmountSummary {
    #[serde(default, deserialize_with = "aggregate_text")]
    pub total: Option<String>,
    #[serde(default, deserialize_with = "aggregate_text")]
    pub average: Option<String>,
    #[serde(default, deserialize_with = "aggregate_text")]
    pub max: Option<String>,
    #[serde(default, deserialize_with = "aggregate_text")]
    pub min: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankTotal {
    #[serde(default, deserialize_with = "aggregate_text")]
    pub bank: Option<String>,
    #[serde(default, deserialize_with = "aggregate_text")]
    pub count: Option<String>,
    #[serde(default, deserialize_with = "aggregate_text")]
    pub total: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherInsights {
    #[serde(default, deserialize_with = "aggregate_count")]
    pub total: i64,
    #[serde(default)]
    pub by_status: Vec<StatusCount>,
    #[serde(default)]
    pub amounts: AmountSummary,
    #[serde(default)]
    pub by_bank: Vec<BankTotal>,
}

/// Draft fields returned by `POST /chat/extract`, edited before confirmation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedVoucherData {
    #[serde(default)]
    pub payer: String,
    #[serde(default)]
    pub payee: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub payment_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference_number: String,
    #[serde(default)]
    pub bank_name: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractOnlyResponse {
    pub extracted: ExtractedVoucherData,
    pub file_base64: String,
    pub file_mime: String,
    pub file_name: String,
}
