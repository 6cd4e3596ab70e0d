//! Adapts the stand-alone Daraja client to the orchestrator's mobile-money seam.

use chrono::Utc;
use daraja_tools::{
    B2bKind,
    B2bRequest,
    B2cRequest,
    DarajaApi,
    DarajaApiError,
    ProviderResponse,
    StkPushRequest,
    TransactionStatusRequest,
};

use crate::orchestrator::MobileMoney;

impl MobileMoney for DarajaApi {
    async fn stk_push(
        &self,
        phone: &str,
        amount_kes: u64,
        account_reference: &str,
        description: &str,
        callback_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        let request = StkPushRequest::build(
            self.config(),
            phone,
            amount_kes,
            account_reference,
            description,
            callback_url,
            Utc::now(),
        );
        DarajaApi::stk_push(self, &request).await
    }

    async fn b2c_payment(
        &self,
        phone: &str,
        amount_kes: u64,
        remarks: &str,
        occasion: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        let credential = self.config().security_credential()?;
        let request = B2cRequest::build(
            self.config(),
            credential,
            phone,
            amount_kes,
            remarks,
            occasion,
            result_url,
            timeout_url,
        );
        DarajaApi::b2c_payment(self, &request).await
    }

    async fn b2b_payment(
        &self,
        kind: B2bKind,
        destination_shortcode: &str,
        account_reference: &str,
        amount_kes: u64,
        requester: Option<&str>,
        result_url: &str,
        timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        let credential = self.config().security_credential()?;
        let request = B2bRequest::build(
            self.config(),
            credential,
            kind,
            destination_shortcode,
            account_reference,
            amount_kes,
            requester,
            "DotPay merchant settlement",
            result_url,
            timeout_url,
        );
        DarajaApi::b2b_payment(self, &request).await
    }

    async fn transaction_status(
        &self,
        provider_transaction_id: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError> {
        let credential = self.config().security_credential()?;
        let request = TransactionStatusRequest::build(
            self.config(),
            credential,
            provider_transaction_id,
            "DotPay reconciliation",
            result_url,
            timeout_url,
        );
        DarajaApi::transaction_status(self, &request).await
    }
}
