//! A scripted mobile-money client for endpoint tests.

use std::sync::{Arc, Mutex};

use daraja_tools::{B2bKind, DarajaApiError, ProviderResponse};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehaviour {
    /// HTTP 200 with `ResponseCode: "0"`.
    Accept,
    /// HTTP 200 with a non-zero response code.
    Reject,
    /// Transport-level failure (timeout, DNS, ...).
    TransportError,
}

#[derive(Clone)]
pub struct MockMobileMoney {
    behaviour: Arc<Mutex<MockBehaviour>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockMobileMoney {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self { behaviour: Arc::new(Mutex::new(behaviour)), calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn accepting() -> Self {
        Self::new(MockBehaviour::Accept)
    }

    pub fn set_behaviour(&self, behaviour: MockBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, call: String) -> Result<ProviderResponse, DarajaApiError> {
        self.calls.lock().unwrap().push(call.clone());
        match *self.behaviour.lock().unwrap() {
            MockBehaviour::Accept => Ok(ProviderResponse {
                http_status: 200,
                accepted: true,
                response_code: Some("0".to_string()),
                response_description: Some("Accept the service request successfully.".to_string()),
                merchant_request_id: Some("29115-mock-1".to_string()),
                checkout_request_id: Some("ws_CO_mock_1".to_string()),
                conversation_id: Some("AG_mock_1".to_string()),
                originator_conversation_id: Some("10571-mock-1".to_string()),
                raw_request: json!({ "call": call }),
                raw_response: json!({ "ResponseCode": "0" }),
            }),
            MockBehaviour::Reject => Ok(ProviderResponse {
                http_status: 200,
                accepted: false,
                response_code: Some("1".to_string()),
                response_description: Some("Insufficient float".to_string()),
                merchant_request_id: None,
                checkout_request_id: None,
                conversation_id: None,
                originator_conversation_id: None,
                raw_request: json!({ "call": call }),
                raw_response: json!({ "ResponseCode": "1" }),
            }),
            MockBehaviour::TransportError => {
                Err(DarajaApiError::RequestError("connection timed out".to_string()))
            },
        }
    }
}

impl crate::orchestrator::MobileMoney for MockMobileMoney {
    async fn stk_push(
        &self,
        phone: &str,
        amount_kes: u64,
        _account_reference: &str,
        _description: &str,
        _callback_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        self.respond(format!("stk_push:{phone}:{amount_kes}"))
    }

    async fn b2c_payment(
        &self,
        phone: &str,
        amount_kes: u64,
        _remarks: &str,
        _occasion: &str,
        _result_url: &str,
        _timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        self.respond(format!("b2c:{phone}:{amount_kes}"))
    }

    async fn b2b_payment(
        &self,
        kind: B2bKind,
        destination_shortcode: &str,
        _account_reference: &str,
        amount_kes: u64,
        _requester: Option<&str>,
        _result_url: &str,
        _timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        self.respond(format!("b2b:{kind:?}:{destination_shortcode}:{amount_kes}"))
    }

    async fn transaction_status(
        &self,
        provider_transaction_id: &str,
        _result_url: &str,
        _timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        self.respond(format!("status:{provider_transaction_id}"))
    }
}
