//! The transaction orchestrator: one entry point per flow, plus the webhook application,
//! reconciliation sweep and the background refund/settlement tasks.
//!
//! The orchestrator sequences the engine (state, storage, treasury) and the mobile-money client.
//! Every step persists atomically through the engine before the next external call is made, so a
//! crash mid-flow leaves a transaction that the webhook demultiplexer or the reconciler can still
//! finish or refund.

use chrono::{Duration, Utc};
use daraja_tools::{callbacks::ParsedCallback, B2bKind, DarajaApiError, ProviderResponse};
use dotpay_engine::{
    db_types::{FlowType, PayTarget, Transaction, TransactionId, TransactionStatus},
    helpers::validation::{
        normalize_address,
        validate_account_ref,
        validate_msisdn,
        validate_shortcode,
        validate_tx_hash,
    },
    quotes::QuoteRequest,
    traits::{CallbackMerge, DarajaSubmission, PaymentDatabase, ProviderIdQuery},
    treasury::TreasuryClient,
    AuthorizationRequest,
    CallbackKind,
    CallbackOutcome,
    FollowUp,
    PaymentFlowApi,
    PaymentFlowError,
};
use log::*;
use serde_json::{json, Value};

use crate::{
    config::ServerConfig,
    data_objects::{
        BuygoodsInitiateParams,
        InitiateResult,
        OfframpInitiateParams,
        OnrampInitiateParams,
        PaybillInitiateParams,
        PayoutAuthorizationParams,
        QuoteParams,
        ReconcileParams,
        ReconcileReport,
    },
    errors::ServerError,
};

/// The provider seam the orchestrator submits through. Implemented by
/// [`daraja_tools::DarajaApi`]; endpoint tests substitute a scripted mock.
#[allow(async_fn_in_trait)]
pub trait MobileMoney: Clone {
    async fn stk_push(
        &self,
        phone: &str,
        amount_kes: u64,
        account_reference: &str,
        description: &str,
        callback_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError>;

    async fn b2c_payment(
        &self,
        phone: &str,
        amount_kes: u64,
        remarks: &str,
        occasion: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError>;

    #[allow(clippy::too_many_arguments)]
    async fn b2b_payment(
        &self,
        kind: B2bKind,
        destination_shortcode: &str,
        account_reference: &str,
        amount_kes: u64,
        requester: Option<&str>,
        result_url: &str,
        timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError>;

    async fn transaction_status(
        &self,
        provider_transaction_id: &str,
        result_url: &str,
        timeout_url: &str,
    ) -> Result<ProviderResponse, DarajaApiError>;
}

pub struct PaymentOrchestrator<B, M> {
    flow: PaymentFlowApi<B>,
    mobile_money: M,
    treasury: TreasuryClient,
    config: ServerConfig,
}

impl<B: Clone, M: Clone> Clone for PaymentOrchestrator<B, M> {
    fn clone(&self) -> Self {
        Self {
            flow: self.flow.clone(),
            mobile_money: self.mobile_money.clone(),
            treasury: self.treasury.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B, M> PaymentOrchestrator<B, M>
where
    B: PaymentDatabase + 'static,
    M: MobileMoney + 'static,
{
    pub fn new(db: B, mobile_money: M, treasury: TreasuryClient, config: ServerConfig) -> Self {
        Self { flow: PaymentFlowApi::new(db), mobile_money, treasury, config }
    }

    pub fn flow(&self) -> &PaymentFlowApi<B> {
        &self.flow
    }

    fn quote_ttl(&self) -> Duration {
        Duration::seconds(self.config.quote_ttl_seconds)
    }

    fn result_url(&self, kind: &str, id: &TransactionId) -> String {
        format!("{}/api/mpesa/webhooks/{kind}?tx={id}", self.config.result_base_url.trim_end_matches('/'))
    }

    fn timeout_url(&self, kind: &str, id: &TransactionId) -> String {
        let base = self.config.timeout_base_url.as_deref().unwrap_or(&self.config.result_base_url);
        format!("{}/api/mpesa/webhooks/{kind}?tx={id}", base.trim_end_matches('/'))
    }

    fn parse_quote_request(
        flow_type: FlowType,
        amount: Option<f64>,
        currency: Option<&str>,
        kes_per_usd: Option<f64>,
    ) -> Result<QuoteRequest, ServerError> {
        let amount =
            amount.ok_or_else(|| ServerError::Validation("Either quoteId or amount is required".into()))?;
        let currency = currency
            .unwrap_or("KES")
            .parse()
            .map_err(|_| ServerError::Validation(format!("Unknown currency: {}", currency.unwrap_or(""))))?;
        Ok(QuoteRequest { flow_type, amount, currency, kes_per_usd })
    }

    fn request_metadata(source: &str, ip: Option<String>, user_agent: Option<String>) -> Value {
        json!({ "source": source, "ip": ip, "userAgent": user_agent })
    }

    //------------------------------------------  Quotes  ------------------------------------------

    /// `POST /api/mpesa/quotes`: price a request and create the transaction carrying the quote.
    pub async fn quote(
        &self,
        user_address: &str,
        params: &QuoteParams,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<Transaction, ServerError> {
        let flow_type: FlowType = params
            .flow_type
            .parse()
            .map_err(|_| ServerError::Validation(format!("Unknown flow type: {}", params.flow_type)))?;
        let request = Self::parse_quote_request(
            flow_type,
            Some(params.amount),
            Some(params.currency.as_str()),
            params.kes_per_usd,
        )?;
        let tx = self
            .flow
            .create_quoted_transaction(
                &request,
                user_address,
                self.config.kes_per_usd,
                self.quote_ttl(),
                &self.treasury,
                self.config.require_onchain_funding,
                None,
                None,
                None,
                Self::request_metadata("quote", ip, user_agent),
            )
            .await?;
        Ok(tx)
    }

    //----------------------------------------  Initiation  ----------------------------------------

    /// Shared front half of every initiate handler: idempotency, quote binding or fresh quote,
    /// target attachment and limit checks.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_initiation(
        &self,
        user_address: &str,
        flow_type: FlowType,
        idempotency_key: &str,
        quote_id: Option<&str>,
        quote_request: Result<QuoteRequest, ServerError>,
        business_id: Option<String>,
        target: PayTarget,
        metadata: Value,
    ) -> Result<(Transaction, bool), ServerError> {
        if let Some(existing) =
            self.flow.find_existing_initiation(user_address, flow_type, idempotency_key).await?
        {
            info!("💻️ Idempotent replay of {idempotency_key} for {user_address}; returning {}", existing.transaction_id);
            return Ok((existing, true));
        }

        let tx = match quote_id {
            Some(quote_id) => {
                let tx = self.flow.bind_quote(quote_id, user_address).await?;
                self.flow.attach_initiation(&tx.transaction_id, idempotency_key, &target, metadata).await?
            },
            None => {
                self.flow
                    .create_quoted_transaction(
                        &quote_request?,
                        user_address,
                        self.config.kes_per_usd,
                        self.quote_ttl(),
                        &self.treasury,
                        self.config.require_onchain_funding,
                        business_id,
                        Some(target),
                        Some(idempotency_key.to_string()),
                        metadata,
                    )
                    .await?
            },
        };
        self.flow.check_limits(&tx, &self.config.limits).await?;
        Ok((tx, false))
    }

    /// Authorization and funding for payout flows: PIN + wallet signature, then on-chain funding
    /// verification when required. Failures persist their reason and fail the transaction.
    async fn authorize_and_fund(
        &self,
        tx: Transaction,
        auth: &PayoutAuthorizationParams,
    ) -> Result<Transaction, ServerError> {
        let request = AuthorizationRequest {
            pin: auth.pin.clone(),
            signature: auth.signature.clone(),
            nonce: auth.nonce.clone(),
            signed_at: auth.signed_at.clone(),
        };
        self.flow
            .verify_authorization(
                &tx,
                &request,
                self.config.pin_length,
                Duration::seconds(self.config.signature_max_age_seconds),
            )
            .await?;
        let tx = self
            .flow
            .transition(
                &tx.transaction_id,
                TransactionStatus::AwaitingUserAuthorization,
                "PIN and wallet signature verified",
                "api",
            )
            .await?;

        if !tx.onchain.required {
            return Ok(self
                .flow
                .transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "funding not required", "api")
                .await?);
        }

        let tx_hash = auth
            .onchain_tx_hash
            .as_deref()
            .map(normalize_address)
            .ok_or_else(|| ServerError::Validation("onchainTxHash is required for this flow".into()))?;
        validate_tx_hash(&tx_hash).map_err(|e| ServerError::Validation(e.to_string()))?;
        let tx = self
            .flow
            .transition(
                &tx.transaction_id,
                TransactionStatus::AwaitingOnchainFunding,
                "awaiting funding verification",
                "api",
            )
            .await?;
        match self.flow.verify_funding(&tx, &tx_hash, auth.chain_id, &self.treasury).await {
            Ok(_) => Ok(self
                .flow
                .transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "funding verified", "api")
                .await?),
            Err(e) => {
                warn!("💻️ Funding verification failed for {}: {e}", tx.transaction_id);
                self.flow
                    .transition(
                        &tx.transaction_id,
                        TransactionStatus::Failed,
                        &format!("funding verification failed: {e}"),
                        "api",
                    )
                    .await?;
                Err(e.into())
            },
        }
    }

    /// Submit to the provider and classify the outcome. Transport-level failures are recorded as
    /// synchronous rejections so the transaction fails and (for funded flows) refunds.
    async fn submit(
        &self,
        tx: Transaction,
        outcome: Result<ProviderResponse, DarajaApiError>,
    ) -> Result<Transaction, ServerError> {
        let (submission, accepted) = match outcome {
            Ok(response) => {
                let submission = DarajaSubmission {
                    raw_request: response.raw_request.clone(),
                    raw_response: response.raw_response.clone(),
                    response_code: response.response_code.clone(),
                    response_description: response.response_description.clone(),
                    provider_ids: ProviderIdQuery {
                        merchant_request_id: response.merchant_request_id.clone(),
                        checkout_request_id: response.checkout_request_id.clone(),
                        conversation_id: response.conversation_id.clone(),
                        originator_conversation_id: response.originator_conversation_id.clone(),
                    },
                };
                (submission, response.accepted)
            },
            Err(e) => {
                warn!("💻️ Provider call failed for {}: {e}", tx.transaction_id);
                let submission = DarajaSubmission {
                    raw_request: Value::Null,
                    raw_response: json!({ "error": e.to_string() }),
                    response_code: None,
                    response_description: Some(e.to_string()),
                    provider_ids: ProviderIdQuery::default(),
                };
                (submission, false)
            },
        };
        let updated = self.flow.record_submission(&tx.transaction_id, submission, accepted).await?;
        if !accepted && updated.flow_type.is_funded() {
            self.spawn_auto_refund(updated.transaction_id.clone(), "provider rejected the request");
        }
        Ok(updated)
    }

    /// `POST /api/mpesa/onramp/stk/initiate`: mobile money in, stablecoin credit out. No PIN,
    /// signature or funding; the STK push debits the user's handset for the full quote.
    pub async fn initiate_onramp(
        &self,
        user_address: &str,
        idempotency_key: &str,
        params: &OnrampInitiateParams,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<InitiateResult, ServerError> {
        validate_msisdn(&params.phone).map_err(|e| ServerError::Validation(e.to_string()))?;
        if let Some(existing) = self
            .flow
            .find_existing_initiation(user_address, FlowType::Onramp, idempotency_key)
            .await?
        {
            return Ok(InitiateResult { transaction: existing, idempotent: true });
        }
        let quote_request = Self::parse_quote_request(
            FlowType::Onramp,
            params.amount,
            params.currency.as_deref(),
            params.kes_per_usd,
        );
        let target = PayTarget::Onramp { phone: params.phone.clone() };
        let metadata = Self::request_metadata("api", ip, user_agent);
        let tx = match params.quote_id.as_deref() {
            Some(quote_id) => {
                let tx = self.flow.bind_quote(quote_id, user_address).await?;
                self.flow.attach_initiation(&tx.transaction_id, idempotency_key, &target, metadata).await?
            },
            None => {
                self.flow
                    .create_quoted_transaction(
                        &quote_request?,
                        user_address,
                        self.config.kes_per_usd,
                        self.quote_ttl(),
                        &self.treasury,
                        self.config.require_onchain_funding,
                        params.business_id.clone(),
                        Some(target),
                        Some(idempotency_key.to_string()),
                        metadata,
                    )
                    .await?
            },
        };
        self.flow.check_limits(&tx, &self.config.limits).await?;

        let tx = self
            .flow
            .transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "submitting STK push", "api")
            .await?;
        let callback_url = self.result_url("stk", &tx.transaction_id);
        let outcome = self
            .mobile_money
            .stk_push(
                &params.phone,
                tx.quote.total_debit_kes.ceil_whole(),
                tx.transaction_id.as_str(),
                "DotPay onramp",
                &callback_url,
            )
            .await;
        let transaction = self.submit(tx, outcome).await?;
        Ok(InitiateResult { transaction, idempotent: false })
    }

    /// `POST /api/mpesa/offramp/initiate`: stablecoin in, cash to the user's phone.
    pub async fn initiate_offramp(
        &self,
        user_address: &str,
        idempotency_key: &str,
        params: &OfframpInitiateParams,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<InitiateResult, ServerError> {
        validate_msisdn(&params.phone).map_err(|e| ServerError::Validation(e.to_string()))?;
        let quote_request = Self::parse_quote_request(
            FlowType::Offramp,
            params.amount,
            params.currency.as_deref(),
            params.kes_per_usd,
        );
        let prepared = self
            .prepare_initiation(
                user_address,
                FlowType::Offramp,
                idempotency_key,
                params.quote_id.as_deref(),
                quote_request,
                params.business_id.clone(),
                PayTarget::Phone { phone: params.phone.clone() },
                Self::request_metadata("api", ip, user_agent),
            )
            .await?;
        let (tx, idempotent) = prepared;
        if idempotent {
            return Ok(InitiateResult { transaction: tx, idempotent: true });
        }

        let tx = self.authorize_and_fund(tx, &params.authorization).await?;
        let result_url = self.result_url("b2c/result", &tx.transaction_id);
        let timeout_url = self.timeout_url("b2c/timeout", &tx.transaction_id);
        let outcome = self
            .mobile_money
            .b2c_payment(
                &params.phone,
                tx.quote.expected_receive_kes.ceil_whole(),
                "DotPay offramp",
                tx.transaction_id.as_str(),
                &result_url,
                &timeout_url,
            )
            .await;
        let transaction = self.submit(tx, outcome).await?;
        Ok(InitiateResult { transaction, idempotent: false })
    }

    /// `POST /api/mpesa/merchant/paybill/initiate`: stablecoin in, settlement to a paybill.
    pub async fn initiate_paybill(
        &self,
        user_address: &str,
        idempotency_key: &str,
        params: &PaybillInitiateParams,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<InitiateResult, ServerError> {
        validate_shortcode(&params.paybill).map_err(|e| ServerError::Validation(e.to_string()))?;
        validate_account_ref(&params.account_reference)
            .map_err(|e| ServerError::Validation(e.to_string()))?;
        let quote_request = Self::parse_quote_request(
            FlowType::Paybill,
            params.amount,
            params.currency.as_deref(),
            params.kes_per_usd,
        );
        let target = PayTarget::Paybill {
            paybill: params.paybill.clone(),
            account_ref: params.account_reference.clone(),
        };
        let prepared = self
            .prepare_initiation(
                user_address,
                FlowType::Paybill,
                idempotency_key,
                params.quote_id.as_deref(),
                quote_request,
                params.business_id.clone(),
                target,
                Self::request_metadata("api", ip, user_agent),
            )
            .await?;
        let (tx, idempotent) = prepared;
        if idempotent {
            return Ok(InitiateResult { transaction: tx, idempotent: true });
        }

        let tx = self.authorize_and_fund(tx, &params.authorization).await?;
        let result_url = self.result_url("b2b/result", &tx.transaction_id);
        let timeout_url = self.timeout_url("b2b/timeout", &tx.transaction_id);
        let outcome = self
            .mobile_money
            .b2b_payment(
                B2bKind::Paybill,
                &params.paybill,
                &params.account_reference,
                tx.quote.amount_kes.ceil_whole(),
                None,
                &result_url,
                &timeout_url,
            )
            .await;
        let transaction = self.submit(tx, outcome).await?;
        Ok(InitiateResult { transaction, idempotent: false })
    }

    /// `POST /api/mpesa/merchant/buygoods/initiate`: stablecoin in, settlement to a till.
    pub async fn initiate_buygoods(
        &self,
        user_address: &str,
        idempotency_key: &str,
        params: &BuygoodsInitiateParams,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<InitiateResult, ServerError> {
        validate_shortcode(&params.till).map_err(|e| ServerError::Validation(e.to_string()))?;
        if let Some(account_ref) = &params.account_reference {
            validate_account_ref(account_ref).map_err(|e| ServerError::Validation(e.to_string()))?;
        }
        let quote_request = Self::parse_quote_request(
            FlowType::Buygoods,
            params.amount,
            params.currency.as_deref(),
            params.kes_per_usd,
        );
        let target =
            PayTarget::Buygoods { till: params.till.clone(), account_ref: params.account_reference.clone() };
        let prepared = self
            .prepare_initiation(
                user_address,
                FlowType::Buygoods,
                idempotency_key,
                params.quote_id.as_deref(),
                quote_request,
                params.business_id.clone(),
                target,
                Self::request_metadata("api", ip, user_agent),
            )
            .await?;
        let (tx, idempotent) = prepared;
        if idempotent {
            return Ok(InitiateResult { transaction: tx, idempotent: true });
        }

        let tx = self.authorize_and_fund(tx, &params.authorization).await?;
        let result_url = self.result_url("b2b/result", &tx.transaction_id);
        let timeout_url = self.timeout_url("b2b/timeout", &tx.transaction_id);
        let account_ref = params.account_reference.as_deref().unwrap_or("DotPay");
        let outcome = self
            .mobile_money
            .b2b_payment(
                B2bKind::Buygoods,
                &params.till,
                account_ref,
                tx.quote.amount_kes.ceil_whole(),
                None,
                &result_url,
                &timeout_url,
            )
            .await;
        let transaction = self.submit(tx, outcome).await?;
        Ok(InitiateResult { transaction, idempotent: false })
    }

    //----------------------------------------  Webhooks  ------------------------------------------

    /// Apply a provider callback and kick off any follow-up work. Errors are for the caller to
    /// log; webhook handlers always acknowledge regardless.
    pub async fn apply_webhook(
        &self,
        kind: CallbackKind,
        tx_param: Option<&str>,
        parsed: ParsedCallback,
        raw_payload: Value,
    ) -> Result<(), PaymentFlowError> {
        let merge = CallbackMerge {
            result_code: parsed.result_code,
            result_code_num: parsed.result_code_num,
            result_desc: parsed.result_desc,
            receipt_number: parsed.receipt_number,
            raw_callback: raw_payload,
            provider_ids: ProviderIdQuery {
                merchant_request_id: parsed.merchant_request_id,
                checkout_request_id: parsed.checkout_request_id,
                conversation_id: parsed.conversation_id,
                originator_conversation_id: parsed.originator_conversation_id,
            },
            received_at: Utc::now(),
        };
        match self.flow.apply_callback(kind, tx_param, merge).await? {
            CallbackOutcome::NotFound => {
                warn!("📨️ {} callback matched no transaction; dropping", kind.as_str());
            },
            CallbackOutcome::Duplicate => {
                debug!("📨️ Duplicate {} callback dropped", kind.as_str());
            },
            CallbackOutcome::Applied { transaction, follow_up } => {
                info!(
                    "📨️ {} callback applied to {}; status is now {}",
                    kind.as_str(),
                    transaction.transaction_id,
                    transaction.status
                );
                match follow_up {
                    FollowUp::None => {},
                    FollowUp::ScheduleRefund => {
                        self.spawn_auto_refund(transaction.transaction_id, "provider reported failure");
                    },
                    FollowUp::SettleOnrampCredit => self.spawn_credit_settlement(transaction.transaction_id),
                }
            },
        }
        Ok(())
    }

    /// Fire-and-forget compensating refund. The webhook ack must not wait for the chain.
    fn spawn_auto_refund(&self, id: TransactionId, reason: &str) {
        if !self.config.auto_refund {
            debug!("🔄️ Auto-refund disabled; skipping refund for {id}");
            return;
        }
        let flow = self.flow.clone();
        let treasury = self.treasury.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            match flow.schedule_auto_refund(&id, &treasury, &reason).await {
                Ok(Some(tx)) => info!("🔄️ Refund for {id} finished with status {:?}", tx.refund.status),
                Ok(None) => debug!("🔄️ Refund for {id} was not applicable"),
                Err(e) => error!("🔄️ Refund for {id} errored: {e}"),
            }
        });
    }

    /// Fire-and-forget onramp credit settlement after the webhook ack. The settler re-loads the
    /// transaction and checks idempotency before transferring.
    fn spawn_credit_settlement(&self, id: TransactionId) {
        let flow = self.flow.clone();
        let treasury = self.treasury.clone();
        tokio::spawn(async move {
            match flow.settle_onramp_credit(&id, &treasury).await {
                Ok(tx) => info!("🔄️ Onramp settlement for {id} finished in status {}", tx.status),
                Err(e) => error!("🔄️ Onramp settlement for {id} failed: {e}"),
            }
        });
    }

    //---------------------------------------  Reconciler  -----------------------------------------

    /// Sweep stuck `mpesa_processing` transactions: optionally query the provider, then fail and
    /// refund anything past the cutoff.
    pub async fn reconcile(&self, params: &ReconcileParams) -> Result<ReconcileReport, ServerError> {
        let max_age = Duration::minutes(params.max_age_minutes.unwrap_or(30).max(0));
        let forced_id = params.transaction_id.as_ref().map(|id| TransactionId(id.clone()));
        let execute_query = params.execute_query.unwrap_or(false);
        let candidates = self.flow.reconcile_candidates(max_age, forced_id.as_ref(), 100).await?;

        let mut report = ReconcileReport::default();
        for tx in candidates {
            report.scanned += 1;
            if execute_query {
                let provider_ref = tx
                    .daraja
                    .receipt_number
                    .clone()
                    .or_else(|| tx.daraja.conversation_id.clone());
                if let Some(provider_ref) = provider_ref {
                    let result_url = self.result_url("b2c/result", &tx.transaction_id);
                    let timeout_url = self.timeout_url("b2c/timeout", &tx.transaction_id);
                    match self
                        .mobile_money
                        .transaction_status(&provider_ref, &result_url, &timeout_url)
                        .await
                    {
                        Ok(response) => {
                            report.queried += 1;
                            self.flow
                                .db()
                                .append_metadata(
                                    &tx.transaction_id,
                                    "reconcile_query",
                                    response.raw_response.clone(),
                                )
                                .await
                                .map_err(PaymentFlowError::from)?;
                        },
                        Err(e) => {
                            warn!("🕰️ Status query for {} failed: {e}", tx.transaction_id);
                            report.query_errors += 1;
                        },
                    }
                }
            }
            // The status filter applies to cutoff-driven sweeps only: a forced id overrides both
            // the cutoff and the status, and the state machine still rejects terminal states.
            if forced_id.is_none() && tx.status != TransactionStatus::MpesaProcessing {
                continue;
            }
            self.flow.mark_reconcile_failed(&tx.transaction_id).await?;
            report.marked_failed += 1;
            if self.config.auto_refund && tx.flow_type.is_funded() {
                let refunded = self
                    .flow
                    .schedule_auto_refund(&tx.transaction_id, &self.treasury, "reconcile: stuck in processing")
                    .await?;
                if refunded.is_some() {
                    report.refunded += 1;
                }
            }
        }
        info!(
            "🕰️ Reconcile complete: {} scanned, {} failed, {} refunded, {} queried, {} query errors",
            report.scanned, report.marked_failed, report.refunded, report.queried, report.query_errors
        );
        Ok(report)
    }
}
