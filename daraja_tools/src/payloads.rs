//! Wire payload builders for the Daraja APIs.
//!
//! Field names must match the provider exactly, including its historical quirks
//! (`RecieverIdentifierType` is misspelled on the wire).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, FixedOffset, Utc};
use rand::RngCore;
use serde::Serialize;

use crate::config::DarajaConfig;

const STK_ACCOUNT_REF_MAX: usize = 12;
const STK_DESC_MAX: usize = 182;

/// Daraja timestamps are East Africa Time, `yyyyMMddHHmmss`.
pub fn daraja_timestamp(at: DateTime<Utc>) -> String {
    let eat = FixedOffset::east_opt(3 * 3600).expect("EAT is a valid offset");
    at.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string()
}

/// The STK push password: `base64(shortcode || passkey || timestamp)`.
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{shortcode}{passkey}{timestamp}"))
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn new_originator_conversation_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("dotpay-{hex}")
}

//--------------------------------------     STK push      ---------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushRequest {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    pub transaction_type: String,
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub call_back_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

impl StkPushRequest {
    pub fn build(
        config: &DarajaConfig,
        phone: &str,
        amount_kes: u64,
        account_reference: &str,
        description: &str,
        callback_url: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let shortcode = config.stk_shortcode().to_string();
        let timestamp = daraja_timestamp(now);
        let password = stk_password(&shortcode, config.passkey.reveal(), &timestamp);
        Self {
            business_short_code: shortcode.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: amount_kes,
            party_a: phone.to_string(),
            party_b: shortcode,
            phone_number: phone.to_string(),
            call_back_url: callback_url.to_string(),
            account_reference: truncate(account_reference, STK_ACCOUNT_REF_MAX),
            transaction_desc: truncate(description, STK_DESC_MAX),
        }
    }
}

//--------------------------------------       B2C        ----------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct B2cRequest {
    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: String,
    pub initiator_name: String,
    pub security_credential: String,
    #[serde(rename = "CommandID")]
    pub command_id: String,
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    pub remarks: String,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_time_out_url: String,
    #[serde(rename = "ResultURL")]
    pub result_url: String,
    pub occasion: String,
}

impl B2cRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: &DarajaConfig,
        security_credential: String,
        phone: &str,
        amount_kes: u64,
        remarks: &str,
        occasion: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Self {
        Self {
            originator_conversation_id: new_originator_conversation_id(),
            initiator_name: config.initiator_name.clone(),
            security_credential,
            command_id: "BusinessPayment".to_string(),
            amount: amount_kes,
            party_a: config.b2c_shortcode().to_string(),
            party_b: phone.to_string(),
            remarks: truncate(remarks, 100),
            queue_time_out_url: timeout_url.to_string(),
            result_url: result_url.to_string(),
            occasion: truncate(occasion, 100),
        }
    }
}

//--------------------------------------       B2B        ----------------------------------------------------------

/// The two merchant settlement channels: account-based paybill and till-based buygoods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum B2bKind {
    Paybill,
    Buygoods,
}

impl B2bKind {
    pub fn command_id(&self) -> &'static str {
        match self {
            B2bKind::Paybill => "BusinessPayBill",
            B2bKind::Buygoods => "BusinessBuyGoods",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct B2bRequest {
    pub initiator: String,
    pub security_credential: String,
    #[serde(rename = "CommandID")]
    pub command_id: String,
    pub sender_identifier_type: u8,
    // Daraja's own spelling.
    #[serde(rename = "RecieverIdentifierType")]
    pub receiver_identifier_type: u8,
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    pub account_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    pub remarks: String,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_time_out_url: String,
    #[serde(rename = "ResultURL")]
    pub result_url: String,
}

impl B2bRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: &DarajaConfig,
        security_credential: String,
        kind: B2bKind,
        destination_shortcode: &str,
        account_reference: &str,
        amount_kes: u64,
        requester: Option<&str>,
        remarks: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Self {
        let receiver_identifier_type = match kind {
            B2bKind::Paybill => config.paybill_receiver_type,
            B2bKind::Buygoods => config.buygoods_receiver_type,
        };
        Self {
            initiator: config.initiator_name.clone(),
            security_credential,
            command_id: kind.command_id().to_string(),
            sender_identifier_type: 4,
            receiver_identifier_type,
            amount: amount_kes,
            party_a: config.b2b_shortcode().to_string(),
            party_b: destination_shortcode.to_string(),
            account_reference: truncate(account_reference, 20),
            requester: requester.map(String::from),
            remarks: truncate(remarks, 100),
            queue_time_out_url: timeout_url.to_string(),
            result_url: result_url.to_string(),
        }
    }
}

//--------------------------------------  Status query    ----------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransactionStatusRequest {
    pub initiator: String,
    pub security_credential: String,
    #[serde(rename = "CommandID")]
    pub command_id: String,
    #[serde(rename = "TransactionID")]
    pub transaction_id: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    pub identifier_type: String,
    #[serde(rename = "ResultURL")]
    pub result_url: String,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_time_out_url: String,
    pub remarks: String,
    pub occasion: String,
}

impl TransactionStatusRequest {
    pub fn build(
        config: &DarajaConfig,
        security_credential: String,
        provider_transaction_id: &str,
        remarks: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Self {
        Self {
            initiator: config.initiator_name.clone(),
            security_credential,
            command_id: "TransactionStatusQuery".to_string(),
            transaction_id: provider_transaction_id.to_string(),
            party_a: config.shortcode.clone(),
            identifier_type: "4".to_string(),
            result_url: result_url.to_string(),
            queue_time_out_url: timeout_url.to_string(),
            remarks: truncate(remarks, 100),
            occasion: String::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn config() -> DarajaConfig {
        DarajaConfig {
            shortcode: "174379".to_string(),
            passkey: dp_common::Secret::new("bfb279f9aa9bdbcf1e".to_string()),
            initiator_name: "testapi".to_string(),
            paybill_receiver_type: 4,
            buygoods_receiver_type: 2,
            ..Default::default()
        }
    }

    #[test]
    fn timestamps_are_east_africa_time() {
        // 2026-03-01 10:00:00 UTC is 13:00:00 in Nairobi
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(daraja_timestamp(at), "20260301130000");
    }

    #[test]
    fn stk_password_is_base64_of_the_concatenation() {
        let password = stk_password("174379", "passkey", "20260301130000");
        let decoded = BASE64.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey20260301130000");
    }

    #[test]
    fn stk_payload_matches_the_wire_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let req = StkPushRequest::build(
            &config(),
            "254700000000",
            1013,
            "a-rather-long-account-reference",
            "DotPay onramp",
            "https://api.dotpay.example/api/mpesa/webhooks/stk?tx=dp_1",
            at,
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["BusinessShortCode"], "174379");
        assert_eq!(value["TransactionType"], "CustomerPayBillOnline");
        assert_eq!(value["Amount"], 1013);
        assert_eq!(value["PartyA"], "254700000000");
        assert_eq!(value["PartyB"], "174379");
        assert_eq!(value["PhoneNumber"], "254700000000");
        assert_eq!(value["Timestamp"], "20260301130000");
        assert!(value.get("CallBackURL").is_some(), "CallBackURL must keep its exact spelling");
        // Account reference is clamped to 12 characters
        assert_eq!(value["AccountReference"], "a-rather-lon");
    }

    #[test]
    fn b2c_payload_matches_the_wire_format() {
        let req = B2cRequest::build(
            &config(),
            "Y3JlZA==".to_string(),
            "254700000000",
            1550,
            "DotPay offramp",
            "offramp",
            "https://api.dotpay.example/api/mpesa/webhooks/b2c/result?tx=dp_1",
            "https://api.dotpay.example/api/mpesa/webhooks/b2c/timeout?tx=dp_1",
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["CommandID"], "BusinessPayment");
        assert_eq!(value["InitiatorName"], "testapi");
        assert_eq!(value["PartyA"], "174379");
        assert_eq!(value["PartyB"], "254700000000");
        assert!(value.get("OriginatorConversationID").is_some());
        assert!(value.get("QueueTimeOutURL").is_some());
        assert!(value.get("ResultURL").is_some());
        assert!(value["OriginatorConversationID"].as_str().unwrap().starts_with("dotpay-"));
    }

    #[test]
    fn b2b_receiver_types_follow_the_channel() {
        let paybill = B2bRequest::build(
            &config(),
            "Y3JlZA==".to_string(),
            B2bKind::Paybill,
            "888880",
            "INV-001",
            2000,
            None,
            "settlement",
            "https://r",
            "https://t",
        );
        assert_eq!(paybill.receiver_identifier_type, 4);
        assert_eq!(paybill.command_id, "BusinessPayBill");

        let buygoods = B2bRequest::build(
            &config(),
            "Y3JlZA==".to_string(),
            B2bKind::Buygoods,
            "55667",
            "DotPay",
            2000,
            Some("254700000000"),
            "settlement",
            "https://r",
            "https://t",
        );
        assert_eq!(buygoods.receiver_identifier_type, 2);
        assert_eq!(buygoods.command_id, "BusinessBuyGoods");
        let value = serde_json::to_value(&buygoods).unwrap();
        assert!(value.get("RecieverIdentifierType").is_some(), "provider spelling must be preserved");
        assert_eq!(value["Requester"], "254700000000");
        // Absent requester is omitted entirely
        let value = serde_json::to_value(&paybill).unwrap();
        assert!(value.get("Requester").is_none());
        assert_eq!(value, json!({
            "Initiator": "testapi",
            "SecurityCredential": "Y3JlZA==",
            "CommandID": "BusinessPayBill",
            "SenderIdentifierType": 4,
            "RecieverIdentifierType": 4,
            "Amount": 2000,
            "PartyA": "174379",
            "PartyB": "888880",
            "AccountReference": "INV-001",
            "Remarks": "settlement",
            "QueueTimeOutURL": "https://t",
            "ResultURL": "https://r",
        }));
    }

    #[test]
    fn status_query_payload() {
        let req = TransactionStatusRequest::build(
            &config(),
            "Y3JlZA==".to_string(),
            "SBC123XYZ",
            "reconcile",
            "https://r",
            "https://t",
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["CommandID"], "TransactionStatusQuery");
        assert_eq!(value["TransactionID"], "SBC123XYZ");
        assert_eq!(value["IdentifierType"], "4");
    }
}
