use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use dp_common::{MicroKes, MicroUsd};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Type;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Invalid value: {0}")]
pub struct ConversionError(String);

//--------------------------------------      FlowType       ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// Mobile money in, stablecoin credit out.
    Onramp,
    /// Stablecoin in, cash to the user's phone.
    Offramp,
    /// Stablecoin in, settlement to a merchant paybill.
    Paybill,
    /// Stablecoin in, settlement to a merchant till.
    Buygoods,
}

impl FlowType {
    /// Whether the flow requires the user to fund the treasury on-chain before payout.
    pub fn is_funded(&self) -> bool {
        !matches!(self, FlowType::Onramp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Onramp => "onramp",
            FlowType::Offramp => "offramp",
            FlowType::Paybill => "paybill",
            FlowType::Buygoods => "buygoods",
        }
    }
}

impl Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlowType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onramp" => Ok(Self::Onramp),
            "offramp" => Ok(Self::Offramp),
            "paybill" => Ok(Self::Paybill),
            "buygoods" => Ok(Self::Buygoods),
            s => Err(ConversionError(format!("Invalid flow type: {s}"))),
        }
    }
}

//--------------------------------------  TransactionStatus  ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Created,
    Quoted,
    AwaitingUserAuthorization,
    AwaitingOnchainFunding,
    MpesaSubmitted,
    MpesaProcessing,
    Succeeded,
    Failed,
    RefundPending,
    Refunded,
}

impl TransactionStatus {
    /// Terminal statuses admit no outbound transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Succeeded | TransactionStatus::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Quoted => "quoted",
            TransactionStatus::AwaitingUserAuthorization => "awaiting_user_authorization",
            TransactionStatus::AwaitingOnchainFunding => "awaiting_onchain_funding",
            TransactionStatus::MpesaSubmitted => "mpesa_submitted",
            TransactionStatus::MpesaProcessing => "mpesa_processing",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
            TransactionStatus::RefundPending => "refund_pending",
            TransactionStatus::Refunded => "refunded",
        }
    }
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "quoted" => Ok(Self::Quoted),
            "awaiting_user_authorization" => Ok(Self::AwaitingUserAuthorization),
            "awaiting_onchain_funding" => Ok(Self::AwaitingOnchainFunding),
            "mpesa_submitted" => Ok(Self::MpesaSubmitted),
            "mpesa_processing" => Ok(Self::MpesaProcessing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "refund_pending" => Ok(Self::RefundPending),
            "refunded" => Ok(Self::Refunded),
            s => Err(ConversionError(format!("Invalid transaction status: {s}"))),
        }
    }
}

//--------------------------------------      Currency       ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Kes,
    Usd,
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Currency::Kes => write!(f, "KES"),
            Currency::Usd => write!(f, "USD"),
        }
    }
}

impl FromStr for Currency {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KES" => Ok(Self::Kes),
            "USD" => Ok(Self::Usd),
            s => Err(ConversionError(format!("Unknown currency: {s}"))),
        }
    }
}

//--------------------------------------  VerificationStatus ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    NotRequired,
    Pending,
    Verified,
    Failed,
}

impl Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationStatus::NotRequired => "not_required",
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

//--------------------------------------     RefundStatus    ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    #[default]
    None,
    Pending,
    Completed,
    Failed,
}

//--------------------------------------    TransactionId    ---------------------------------------------------------

/// The opaque identifier clients use to refer to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(format!("dp_{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

//--------------------------------------      PayTarget      ---------------------------------------------------------

/// The destination of a flow. One variant is required per flow type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PayTarget {
    /// Onramp: the handset that receives the STK push.
    Onramp { phone: String },
    /// Offramp: the handset that receives the cashout.
    Phone { phone: String },
    Paybill { paybill: String, account_ref: String },
    Buygoods { till: String, account_ref: Option<String> },
}

impl PayTarget {
    /// The canonical descriptor that is embedded in the signed authorization message.
    pub fn descriptor(&self) -> String {
        match self {
            PayTarget::Onramp { .. } => "onramp".to_string(),
            PayTarget::Phone { phone } => format!("phone:{phone}"),
            PayTarget::Paybill { paybill, account_ref } => format!("paybill:{paybill}:{account_ref}"),
            PayTarget::Buygoods { till, account_ref } => {
                format!("buygoods:{till}:{}", account_ref.as_deref().unwrap_or("DotPay"))
            },
        }
    }

    pub fn phone(&self) -> Option<&str> {
        match self {
            PayTarget::Onramp { phone } | PayTarget::Phone { phone } => Some(phone),
            _ => None,
        }
    }
}

//--------------------------------------        Quote        ---------------------------------------------------------

/// A time-bounded priced snapshot binding an amount to a rate and fee schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub currency: Currency,
    /// The amount as requested, in micro-units of `currency`.
    pub amount_requested: i64,
    pub amount_kes: MicroKes,
    pub amount_usd: MicroUsd,
    pub rate_kes_per_usd: MicroKes,
    pub fee_kes: MicroKes,
    pub network_fee_kes: MicroKes,
    pub total_debit_kes: MicroKes,
    pub expected_receive_kes: MicroKes,
    pub expires_at: DateTime<Utc>,
    pub snapshot_at: DateTime<Utc>,
}

impl Quote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

//--------------------------------------    Authorization    ---------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub pin_verified: bool,
    pub wallet_signature: Option<String>,
    pub signer_address: Option<String>,
    pub nonce: Option<String>,
    /// The `signedAt` value exactly as the client provided it; it is part of the signed message.
    pub signed_at: Option<String>,
}

//--------------------------------------   OnchainFunding    ---------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainFunding {
    pub required: bool,
    pub tx_hash: Option<String>,
    pub chain_id: Option<u64>,
    pub token: Option<String>,
    pub treasury: Option<String>,
    pub expected_amount_units: Option<u128>,
    pub expected_amount_usd: MicroUsd,
    pub funded_amount_units: Option<u128>,
    pub funded_amount_usd: Option<MicroUsd>,
    pub from_address: Option<String>,
    pub log_index: Option<u64>,
    pub verification_status: VerificationStatus,
    pub verification_error: Option<String>,
}

impl OnchainFunding {
    pub fn not_required() -> Self {
        Self::default()
    }
}

//--------------------------------------    DarajaDetails    ---------------------------------------------------------

/// Everything the mobile-money provider told us about a transaction, raw payloads included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DarajaDetails {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    /// Synchronous acknowledgement code, raw.
    pub response_code: Option<String>,
    /// Final result code from the callback, raw. Providers sometimes return non-numeric codes.
    pub result_code: Option<String>,
    pub result_code_num: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub raw_request: Option<Value>,
    pub raw_response: Option<Value>,
    pub raw_callback: Option<Value>,
    pub callback_received_at: Option<DateTime<Utc>>,
}

//--------------------------------------     RefundInfo      ---------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundInfo {
    pub status: RefundStatus,
    pub reason: Option<String>,
    pub tx_hash: Option<String>,
    pub initiated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

//--------------------------------------    HistoryEntry     ---------------------------------------------------------

/// One entry in the append-only transition history of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub reason: String,
    pub source: String,
    pub at: DateTime<Utc>,
}

//--------------------------------------     Transaction     ---------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub transaction_id: TransactionId,
    pub flow_type: FlowType,
    pub status: TransactionStatus,
    /// Lowercase hex EVM address of the wallet that owns this transaction.
    pub user_address: String,
    pub business_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub quote: Quote,
    /// Set at initiate time. Quote-only transactions have no payout target yet.
    pub target: Option<PayTarget>,
    pub authorization: Authorization,
    pub onchain: OnchainFunding,
    pub daraja: DarajaDetails,
    pub refund: RefundInfo,
    pub history: Vec<HistoryEntry>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The target descriptor used in the signed authorization message. Onramp transactions have
    /// no payout target; their descriptor is the flow name.
    pub fn target_descriptor(&self) -> String {
        self.target.as_ref().map(|t| t.descriptor()).unwrap_or_else(|| self.flow_type.to_string())
    }
}

//--------------------------------------    NewTransaction   ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_id: TransactionId,
    pub flow_type: FlowType,
    pub user_address: String,
    pub business_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub quote: Quote,
    pub target: Option<PayTarget>,
    pub onchain: OnchainFunding,
    pub metadata: Value,
}

impl NewTransaction {
    pub fn new(flow_type: FlowType, user_address: String, quote: Quote, target: Option<PayTarget>) -> Self {
        Self {
            transaction_id: TransactionId::generate(),
            flow_type,
            user_address,
            business_id: None,
            idempotency_key: None,
            quote,
            target,
            onchain: OnchainFunding::not_required(),
            metadata: Value::Null,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_onchain(mut self, onchain: OnchainFunding) -> Self {
        self.onchain = onchain;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_business_id(mut self, business_id: Option<String>) -> Self {
        self.business_id = business_id;
        self
    }
}

//--------------------------------------     EventSource     ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Reconcile,
    System,
}

impl Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventSource::Webhook => "webhook",
            EventSource::Reconcile => "reconcile",
            EventSource::System => "system",
        };
        write!(f, "{s}")
    }
}

//--------------------------------------      DedupEvent     ---------------------------------------------------------

/// A persisted record that uniquely identifies an applied provider callback.
#[derive(Debug, Clone, Serialize)]
pub struct DedupEvent {
    pub id: i64,
    pub event_key: String,
    pub transaction_id: TransactionId,
    pub source: EventSource,
    pub event_type: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDedupEvent {
    pub event_key: String,
    pub transaction_id: TransactionId,
    pub source: EventSource,
    pub event_type: String,
    pub payload: Value,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn funded_flows() {
        assert!(!FlowType::Onramp.is_funded());
        assert!(FlowType::Offramp.is_funded());
        assert!(FlowType::Paybill.is_funded());
        assert!(FlowType::Buygoods.is_funded());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransactionStatus::Succeeded.is_terminal());
        assert!(TransactionStatus::Refunded.is_terminal());
        assert!(!TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::RefundPending.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TransactionStatus::Created,
            TransactionStatus::Quoted,
            TransactionStatus::AwaitingUserAuthorization,
            TransactionStatus::AwaitingOnchainFunding,
            TransactionStatus::MpesaSubmitted,
            TransactionStatus::MpesaProcessing,
            TransactionStatus::Succeeded,
            TransactionStatus::Failed,
            TransactionStatus::RefundPending,
            TransactionStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert!("paid".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn target_descriptors() {
        let t = PayTarget::Phone { phone: "254700000000".into() };
        assert_eq!(t.descriptor(), "phone:254700000000");
        let t = PayTarget::Paybill { paybill: "888880".into(), account_ref: "ACC-1".into() };
        assert_eq!(t.descriptor(), "paybill:888880:ACC-1");
        let t = PayTarget::Buygoods { till: "55667".into(), account_ref: None };
        assert_eq!(t.descriptor(), "buygoods:55667:DotPay");
        let t = PayTarget::Onramp { phone: "254700000000".into() };
        assert_eq!(t.descriptor(), "onramp");
    }

    #[test]
    fn transaction_ids_are_unique_and_prefixed() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("dp_"));
        assert_eq!(a.as_str().len(), 3 + 24);
    }
}
