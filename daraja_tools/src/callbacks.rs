//! Tolerant parsers for the asynchronous Daraja callbacks.
//!
//! Callback shapes vary: result codes arrive as strings or numbers, metadata arrays may be
//! missing, and timeout callbacks carry a different envelope entirely. These parsers extract the
//! fields the gateway acts on and leave the rest to the raw payload the caller stores.

use serde_json::Value;

use crate::api::value_as_string;

/// The provider-agnostic digest of a callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCallback {
    /// Result code, raw. Success iff this is the string `"0"`.
    pub result_code: Option<String>,
    pub result_code_num: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
}

fn code_fields(value: &Value) -> (Option<String>, Option<i64>) {
    let raw = value_as_string(value);
    let num = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    (raw, num)
}

/// Parse an STK push callback (`Body.stkCallback`).
pub fn parse_stk_callback(payload: &Value) -> ParsedCallback {
    let callback = &payload["Body"]["stkCallback"];
    let (result_code, result_code_num) = code_fields(&callback["ResultCode"]);
    let mut parsed = ParsedCallback {
        result_code,
        result_code_num,
        result_desc: value_as_string(&callback["ResultDesc"]),
        merchant_request_id: value_as_string(&callback["MerchantRequestID"]),
        checkout_request_id: value_as_string(&callback["CheckoutRequestID"]),
        ..Default::default()
    };
    if let Some(items) = callback["CallbackMetadata"]["Item"].as_array() {
        for item in items {
            if item["Name"].as_str() == Some("MpesaReceiptNumber") {
                parsed.receipt_number = value_as_string(&item["Value"]);
            }
        }
    }
    parsed
}

/// Parse a B2C/B2B result or timeout callback (`Result`).
pub fn parse_result_callback(payload: &Value) -> ParsedCallback {
    let result = &payload["Result"];
    let (result_code, result_code_num) = code_fields(&result["ResultCode"]);
    let mut parsed = ParsedCallback {
        result_code,
        result_code_num,
        result_desc: value_as_string(&result["ResultDesc"]),
        conversation_id: value_as_string(&result["ConversationID"]),
        originator_conversation_id: value_as_string(&result["OriginatorConversationID"]),
        receipt_number: value_as_string(&result["TransactionID"]).filter(|s| !s.is_empty() && s != "0"),
        ..Default::default()
    };
    if let Some(params) = result["ResultParameters"]["ResultParameter"].as_array() {
        for param in params {
            if matches!(param["Key"].as_str(), Some("TransactionReceipt") | Some("ReceiptNo")) {
                if let Some(receipt) = value_as_string(&param["Value"]) {
                    parsed.receipt_number = Some(receipt);
                }
            }
        }
    }
    parsed
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn stk_success_with_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 1013.00},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "PhoneNumber", "Value": 254700000000u64}
                        ]
                    }
                }
            }
        });
        let parsed = parse_stk_callback(&payload);
        assert_eq!(parsed.result_code.as_deref(), Some("0"));
        assert_eq!(parsed.result_code_num, Some(0));
        assert_eq!(parsed.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(parsed.checkout_request_id.as_deref(), Some("ws_CO_191220191020363925"));
        assert_eq!(parsed.merchant_request_id.as_deref(), Some("29115-34620561-1"));
    }

    #[test]
    fn stk_failure_without_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": "1032",
                    "ResultDesc": "Request cancelled by user."
                }
            }
        });
        let parsed = parse_stk_callback(&payload);
        assert_eq!(parsed.result_code.as_deref(), Some("1032"));
        assert_eq!(parsed.result_code_num, Some(1032));
        assert!(parsed.receipt_number.is_none());
    }

    #[test]
    fn non_numeric_result_codes_keep_the_raw_string() {
        let payload = json!({
            "Body": {"stkCallback": {"ResultCode": "SVC_UNAVAILABLE", "ResultDesc": "try later"}}
        });
        let parsed = parse_stk_callback(&payload);
        assert_eq!(parsed.result_code.as_deref(), Some("SVC_UNAVAILABLE"));
        assert!(parsed.result_code_num.is_none());
    }

    #[test]
    fn b2c_result_extracts_receipt_from_parameters() {
        let payload = json!({
            "Result": {
                "ResultType": 0,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "OriginatorConversationID": "10571-7910404-1",
                "ConversationID": "AG_20191219_00005797af5d7d75f652",
                "TransactionID": "NLJ41HAY6Q",
                "ResultParameters": {
                    "ResultParameter": [
                        {"Key": "TransactionAmount", "Value": 1550},
                        {"Key": "TransactionReceipt", "Value": "NLJ41HAY6Q"},
                        {"Key": "B2CUtilityAccountAvailableFunds", "Value": 10116.0}
                    ]
                }
            }
        });
        let parsed = parse_result_callback(&payload);
        assert_eq!(parsed.result_code.as_deref(), Some("0"));
        assert_eq!(parsed.receipt_number.as_deref(), Some("NLJ41HAY6Q"));
        assert_eq!(parsed.conversation_id.as_deref(), Some("AG_20191219_00005797af5d7d75f652"));
        assert_eq!(parsed.originator_conversation_id.as_deref(), Some("10571-7910404-1"));
    }

    #[test]
    fn timeout_callbacks_parse_without_parameters() {
        let payload = json!({
            "Result": {
                "ResultType": 1,
                "ResultCode": 1,
                "ResultDesc": "The service request timed out.",
                "OriginatorConversationID": "10571-7910404-1",
                "ConversationID": "AG_20191219_00005797af5d7d75f652"
            }
        });
        let parsed = parse_result_callback(&payload);
        assert_eq!(parsed.result_code.as_deref(), Some("1"));
        assert!(parsed.receipt_number.is_none());
    }

    #[test]
    fn empty_payloads_produce_an_empty_digest() {
        assert_eq!(parse_stk_callback(&json!({})), ParsedCallback::default());
        assert_eq!(parse_result_callback(&json!({})), ParsedCallback::default());
    }
}
