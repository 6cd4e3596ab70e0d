use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::*;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{config::DarajaConfig, error::DarajaApiError};

/// OAuth tokens are refreshed this many seconds before the provider says they expire.
const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 30;
const TOKEN_MIN_VALIDITY_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// The classified outcome of a synchronous provider call.
///
/// A request is accepted iff the HTTP status is 2xx and `ResponseCode` is the string `"0"`.
/// Everything else, including well-formed error envelopes, is a synchronous rejection.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub http_status: u16,
    pub accepted: bool,
    pub response_code: Option<String>,
    pub response_description: Option<String>,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    pub raw_request: Value,
    pub raw_response: Value,
}

/// Providers return codes as strings or numbers depending on the endpoint and the day.
pub(crate) fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn classify(raw_request: Value, status: StatusCode, body: Value) -> ProviderResponse {
    let response_code = value_as_string(&body["ResponseCode"]);
    let response_description = value_as_string(&body["ResponseDescription"])
        .or_else(|| value_as_string(&body["errorMessage"]))
        .or_else(|| value_as_string(&body["CustomerMessage"]));
    let accepted = status.is_success() && response_code.as_deref() == Some("0");
    ProviderResponse {
        http_status: status.as_u16(),
        accepted,
        response_code,
        response_description,
        merchant_request_id: value_as_string(&body["MerchantRequestID"]),
        checkout_request_id: value_as_string(&body["CheckoutRequestID"]),
        conversation_id: value_as_string(&body["ConversationID"]),
        originator_conversation_id: value_as_string(&body["OriginatorConversationID"]),
        raw_request,
        raw_response: body,
    }
}

#[derive(Clone)]
pub struct DarajaApi {
    config: DarajaConfig,
    client: Arc<Client>,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl DarajaApi {
    pub fn new(config: DarajaConfig) -> Result<Self, DarajaApiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DarajaApiError::Initialization(e.to_string()))?;
        Ok(Self { config, client: Arc::new(client), token: Arc::new(Mutex::new(None)) })
    }

    pub fn config(&self) -> &DarajaConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// The process-wide bearer token. At most one refresh is in flight at a time; expired reads
    /// fall through to a refresh.
    async fn access_token(&self, force_refresh: bool) -> Result<String, DarajaApiError> {
        let mut guard = self.token.lock().await;
        if !force_refresh {
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Utc::now() {
                    return Ok(cached.token.clone());
                }
            }
        }
        trace!("📱️ Requesting a new OAuth token");
        let response = self
            .client
            .get(self.url("/oauth/v1/generate"))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(
                self.config.consumer_key.reveal(),
                Some(self.config.consumer_secret.reveal()),
            )
            .send()
            .await
            .map_err(|e| DarajaApiError::OAuth(e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.map_err(|e| DarajaApiError::OAuth(e.to_string()))?;
        if !status.is_success() {
            return Err(DarajaApiError::OAuth(format!("token endpoint returned {status}: {body}")));
        }
        let token = value_as_string(&body["access_token"])
            .ok_or_else(|| DarajaApiError::OAuth(format!("no access_token in {body}")))?;
        let expires_in = value_as_string(&body["expires_in"])
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(3600);
        let validity = (expires_in - TOKEN_EXPIRY_MARGIN_SECONDS).max(TOKEN_MIN_VALIDITY_SECONDS);
        let expires_at = Utc::now() + Duration::seconds(validity);
        debug!("📱️ OAuth token cached until {expires_at}");
        *guard = Some(CachedToken { token: token.clone(), expires_at });
        Ok(token)
    }

    async fn post_once<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        token: &str,
    ) -> Result<(StatusCode, Value), DarajaApiError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| DarajaApiError::RequestError(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| DarajaApiError::RequestError(e.to_string()))?;
        let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, value))
    }

    /// POST a payload, refreshing the token and retrying once on 401.
    async fn post_api<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ProviderResponse, DarajaApiError> {
        let raw_request =
            serde_json::to_value(body).map_err(|e| DarajaApiError::JsonError(e.to_string()))?;
        let token = self.access_token(false).await?;
        let (status, response) = self.post_once(path, body, &token).await?;
        let (status, response) = if status == StatusCode::UNAUTHORIZED {
            debug!("📱️ 401 from {path}; refreshing token and retrying once");
            let token = self.access_token(true).await?;
            self.post_once(path, body, &token).await?
        } else {
            (status, response)
        };
        trace!("📱️ {path} returned {status}: {response}");
        Ok(classify(raw_request, status, response))
    }

    pub async fn stk_push(
        &self,
        request: &crate::payloads::StkPushRequest,
    ) -> Result<ProviderResponse, DarajaApiError> {
        info!("📱️ STK push of {} KES to {}", request.amount, request.phone_number);
        self.post_api("/mpesa/stkpush/v1/processrequest", request).await
    }

    pub async fn b2c_payment(
        &self,
        request: &crate::payloads::B2cRequest,
    ) -> Result<ProviderResponse, DarajaApiError> {
        info!("📱️ B2C payment of {} KES to {}", request.amount, request.party_b);
        self.post_api("/mpesa/b2c/v3/paymentrequest", request).await
    }

    pub async fn b2b_payment(
        &self,
        request: &crate::payloads::B2bRequest,
    ) -> Result<ProviderResponse, DarajaApiError> {
        info!("📱️ B2B {} of {} KES to {}", request.command_id, request.amount, request.party_b);
        self.post_api("/mpesa/b2b/v1/paymentrequest", request).await
    }

    pub async fn transaction_status(
        &self,
        request: &crate::payloads::TransactionStatusRequest,
    ) -> Result<ProviderResponse, DarajaApiError> {
        debug!("📱️ Transaction status query for {}", request.transaction_id);
        self.post_api("/mpesa/transactionstatus/v1/query", request).await
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn acceptance_requires_2xx_and_response_code_zero() {
        let ok = classify(
            json!({}),
            StatusCode::OK,
            json!({"ResponseCode": "0", "ResponseDescription": "Success", "ConversationID": "AG_1"}),
        );
        assert!(ok.accepted);
        assert_eq!(ok.response_code.as_deref(), Some("0"));
        assert_eq!(ok.conversation_id.as_deref(), Some("AG_1"));

        // Numeric response codes are tolerated
        let numeric = classify(json!({}), StatusCode::OK, json!({"ResponseCode": 0}));
        assert!(numeric.accepted);

        let rejected = classify(
            json!({}),
            StatusCode::OK,
            json!({"ResponseCode": "1032", "ResponseDescription": "Request cancelled by user"}),
        );
        assert!(!rejected.accepted);
        assert_eq!(rejected.response_description.as_deref(), Some("Request cancelled by user"));

        let error = classify(
            json!({}),
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"ResponseCode": "0"}),
        );
        assert!(!error.accepted, "a 5xx is a rejection even with a zero code");

        let daraja_error = classify(
            json!({}),
            StatusCode::BAD_REQUEST,
            json!({"errorCode": "400.002.02", "errorMessage": "Bad Request - Invalid Timestamp"}),
        );
        assert!(!daraja_error.accepted);
        assert_eq!(daraja_error.response_description.as_deref(), Some("Bad Request - Invalid Timestamp"));
    }

    #[test]
    fn non_json_bodies_are_preserved_as_strings() {
        let response = classify(json!({}), StatusCode::BAD_GATEWAY, Value::String("<html>".into()));
        assert!(!response.accepted);
        assert_eq!(response.raw_response, Value::String("<html>".into()));
    }
}
