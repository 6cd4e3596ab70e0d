use chrono::{DateTime, Utc};
use dotpay_engine::db_types::{Quote, Transaction};
use serde::{Deserialize, Serialize};

/// The uniform response envelope for every JSON endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), message: None, error: None, timestamp: Utc::now() }
    }

    pub fn success_with_message<S: Into<String>>(data: T, message: S) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure<S: Into<String>>(error: S) -> Self {
        Self { success: false, data: None, message: None, error: Some(error.into()), timestamp: Utc::now() }
    }
}

//--------------------------------------     Requests      ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteParams {
    pub flow_type: String,
    pub amount: f64,
    pub currency: String,
    pub kes_per_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnrampInitiateParams {
    pub quote_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub kes_per_usd: Option<f64>,
    pub phone: String,
    pub business_id: Option<String>,
}

/// Authorization material shared by all payout flows.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutAuthorizationParams {
    pub pin: String,
    pub signature: String,
    pub nonce: String,
    pub signed_at: String,
    pub onchain_tx_hash: Option<String>,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfframpInitiateParams {
    pub quote_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub kes_per_usd: Option<f64>,
    pub phone: String,
    pub business_id: Option<String>,
    #[serde(flatten)]
    pub authorization: PayoutAuthorizationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaybillInitiateParams {
    pub quote_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub kes_per_usd: Option<f64>,
    pub paybill: String,
    pub account_reference: String,
    pub business_id: Option<String>,
    #[serde(flatten)]
    pub authorization: PayoutAuthorizationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuygoodsInitiateParams {
    pub quote_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub kes_per_usd: Option<f64>,
    pub till: String,
    pub account_reference: Option<String>,
    pub business_id: Option<String>,
    #[serde(flatten)]
    pub authorization: PayoutAuthorizationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionListQuery {
    pub flow_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileParams {
    pub max_age_minutes: Option<i64>,
    pub execute_query: Option<bool>,
    pub transaction_id: Option<String>,
}

/// `?tx=<transactionId>` on webhook URLs: the canonical correlation parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookQuery {
    pub tx: Option<String>,
    pub secret: Option<String>,
}

//--------------------------------------     Responses     ----------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct QuoteResult {
    pub quote: Quote,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiateResult {
    pub transaction: Transaction,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileReport {
    pub scanned: u32,
    pub marked_failed: u32,
    pub refunded: u32,
    pub queried: u32,
    pub query_errors: u32,
}

/// The acknowledgement body the provider expects from every webhook, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}

impl WebhookAck {
    pub fn accepted() -> Self {
        Self { result_code: 0, result_desc: "Accepted" }
    }
}
