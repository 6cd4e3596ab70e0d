//! `PaymentFlowApi` is the primary API for driving transactions through their lifecycle in
//! response to initiate calls, provider callbacks and reconciliation sweeps.

use chrono::{Duration, NaiveTime, Utc};
use dp_common::MicroKes;
use log::*;
use serde_json::Value;
use thiserror::Error;

use crate::{
    db_types::{
        Authorization,
        EventSource,
        FlowType,
        NewDedupEvent,
        NewTransaction,
        OnchainFunding,
        PayTarget,
        Quote,
        RefundInfo,
        RefundStatus,
        Transaction,
        TransactionId,
        TransactionStatus,
        VerificationStatus,
    },
    helpers::{
        pin::{validate_pin_format, verify_pin},
        auth_message::verify_wallet_signature,
        validation::ValidationError,
        AuthError,
    },
    quotes::{build_quote, QuoteRequest},
    state_machine::{allowed, StateError},
    traits::{CallbackMerge, DarajaSubmission, PaymentDatabase, PaymentDatabaseError},
    treasury::{expected_funding_units, simulated_refund_reference, FundingProof, TreasuryClient, TreasuryError},
};

#[derive(Debug, Clone, Error)]
pub enum PaymentFlowError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("{0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Database(PaymentDatabaseError),
    #[error("{0}")]
    Treasury(#[from] TreasuryError),
    #[error("Transaction {0} not found")]
    NotFound(String),
}

impl From<PaymentDatabaseError> for PaymentFlowError {
    fn from(e: PaymentDatabaseError) -> Self {
        match e {
            PaymentDatabaseError::State(e) => PaymentFlowError::State(e),
            PaymentDatabaseError::TransactionNotFound(id) => PaymentFlowError::NotFound(id),
            other => PaymentFlowError::Database(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlowLimits {
    pub max_txn_kes: MicroKes,
    pub max_daily_kes: MicroKes,
}

/// The client-supplied authorization material for a payout flow.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub pin: String,
    pub signature: String,
    pub nonce: String,
    pub signed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Stk,
    B2cResult,
    B2cTimeout,
    B2bResult,
    B2bTimeout,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Stk => "stk",
            CallbackKind::B2cResult => "b2c_result",
            CallbackKind::B2cTimeout => "b2c_timeout",
            CallbackKind::B2bResult => "b2b_result",
            CallbackKind::B2bTimeout => "b2b_timeout",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallbackKind::B2cTimeout | CallbackKind::B2bTimeout)
    }
}

/// What the caller should do after a callback has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// The payout failed; a compensating refund should be attempted (funded flows).
    ScheduleRefund,
    /// An onramp STK push succeeded; the credit settler should run out-of-band.
    SettleOnrampCredit,
}

#[derive(Debug)]
pub enum CallbackOutcome {
    /// No transaction matches the callback; acknowledge and drop.
    NotFound,
    /// This callback was already applied; acknowledge and drop.
    Duplicate,
    Applied { transaction: Transaction, follow_up: FollowUp },
}

pub struct PaymentFlowApi<B> {
    db: B,
}

impl<B> Clone for PaymentFlowApi<B>
where B: Clone
{
    fn clone(&self) -> Self {
        Self { db: self.db.clone() }
    }
}

impl<B> PaymentFlowApi<B>
where B: PaymentDatabase
{
    pub fn new(db: B) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    /// Initiate idempotency: an existing `(user, flow, key)` row short-circuits the handler.
    pub async fn find_existing_initiation(
        &self,
        user_address: &str,
        flow_type: FlowType,
        idempotency_key: &str,
    ) -> Result<Option<Transaction>, PaymentFlowError> {
        Ok(self.db.fetch_by_idempotency_key(user_address, flow_type, idempotency_key).await?)
    }

    /// Build a quote and create the transaction that carries it, with funding defaults applied
    /// for funded flows. The transaction starts in `created` and immediately moves to `quoted`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_quoted_transaction(
        &self,
        request: &QuoteRequest,
        user_address: &str,
        default_rate: MicroKes,
        ttl: Duration,
        treasury: &TreasuryClient,
        require_funding: bool,
        business_id: Option<String>,
        target: Option<PayTarget>,
        idempotency_key: Option<String>,
        metadata: Value,
    ) -> Result<Transaction, PaymentFlowError> {
        let quote = build_quote(request, default_rate, ttl)?;
        let onchain = self.funding_defaults(request.flow_type, &quote, treasury, require_funding)?;
        let new_tx = NewTransaction::new(request.flow_type, user_address.to_string(), quote, target)
            .with_idempotency_key(idempotency_key)
            .with_business_id(business_id)
            .with_onchain(onchain)
            .with_metadata(metadata);
        let tx = self.db.insert_transaction(new_tx).await?;
        let tx = self
            .db
            .transition(&tx.transaction_id, TransactionStatus::Quoted, "quote issued", "quote")
            .await?;
        info!("🔄️ Quote {} issued on transaction {}", tx.quote.quote_id, tx.transaction_id);
        Ok(tx)
    }

    /// Resolve a previously issued quote for an initiate call.
    ///
    /// Rejects quotes that do not exist, belong to another user, are already bound to an
    /// initiation, or have expired.
    pub async fn bind_quote(
        &self,
        quote_id: &str,
        user_address: &str,
    ) -> Result<Transaction, PaymentFlowError> {
        let tx = self
            .db
            .fetch_by_quote_id(quote_id)
            .await?
            .filter(|t| t.user_address == user_address)
            .ok_or_else(|| PaymentFlowError::NotFound(format!("quote {quote_id}")))?;
        if tx.idempotency_key.is_some() {
            return Err(ValidationError(format!("Quote {quote_id} is already bound to an initiation")).into());
        }
        if tx.quote.is_expired(Utc::now()) {
            return Err(StateError::QuoteExpired(quote_id.to_string()).into());
        }
        Ok(tx)
    }

    /// Attach the initiate context (idempotency key, target, request metadata) to a quote-bound
    /// transaction.
    pub async fn attach_initiation(
        &self,
        id: &TransactionId,
        idempotency_key: &str,
        target: &PayTarget,
        metadata: Value,
    ) -> Result<Transaction, PaymentFlowError> {
        Ok(self.db.bind_initiation(id, idempotency_key, target, metadata).await?)
    }

    /// Per-transaction and daily caps. The daily window starts at UTC midnight.
    pub async fn check_limits(
        &self,
        tx: &Transaction,
        limits: &FlowLimits,
    ) -> Result<(), PaymentFlowError> {
        let amount = tx.quote.amount_kes;
        if amount > limits.max_txn_kes {
            return Err(ValidationError(format!(
                "Amount {amount} exceeds the per-transaction limit of {}",
                limits.max_txn_kes
            ))
            .into());
        }
        let day_start = Utc::now().with_time(NaiveTime::MIN).single().unwrap_or_else(Utc::now);
        let today =
            self.db.volume_kes_since(&tx.user_address, day_start, &tx.transaction_id).await?;
        if today + amount > limits.max_daily_kes {
            return Err(ValidationError(format!(
                "Amount {amount} exceeds the daily limit of {} ({today} already used today)",
                limits.max_daily_kes
            ))
            .into());
        }
        Ok(())
    }

    /// Verify PIN and wallet signature for a payout flow, and persist the authorization.
    pub async fn verify_authorization(
        &self,
        tx: &Transaction,
        request: &AuthorizationRequest,
        pin_length: usize,
        signature_max_age: Duration,
    ) -> Result<Authorization, PaymentFlowError> {
        let pin = validate_pin_format(&request.pin, pin_length)?;
        let pin_hash =
            self.db.pin_hash_for(&tx.user_address).await?.ok_or(AuthError::PinNotSet)?;
        if !verify_pin(&pin, &pin_hash)? {
            return Err(AuthError::InvalidPin.into());
        }
        let signer = verify_wallet_signature(
            tx,
            &request.signature,
            &request.nonce,
            &request.signed_at,
            &tx.user_address,
            signature_max_age,
        )?;
        let authorization = Authorization {
            pin_verified: true,
            wallet_signature: Some(request.signature.clone()),
            signer_address: Some(signer),
            nonce: Some(request.nonce.clone()),
            signed_at: Some(request.signed_at.clone()),
        };
        self.db.update_authorization(&tx.transaction_id, &authorization).await?;
        debug!("🔄️ Authorization verified for {}", tx.transaction_id);
        Ok(authorization)
    }

    /// The funding expectation recorded on funded transactions at creation time.
    pub fn funding_defaults(
        &self,
        flow_type: FlowType,
        quote: &Quote,
        treasury: &TreasuryClient,
        require_funding: bool,
    ) -> Result<OnchainFunding, PaymentFlowError> {
        if !flow_type.is_funded() || !require_funding {
            return Ok(OnchainFunding::not_required());
        }
        let config = treasury.config();
        config.can_verify().map_err(PaymentFlowError::Treasury)?;
        let units =
            expected_funding_units(quote.total_debit_kes, quote.rate_kes_per_usd, config.decimals)?;
        let expected_usd = quote
            .total_debit_kes
            .to_usd(quote.rate_kes_per_usd)
            .map_err(|e| ValidationError(e.to_string()))?;
        Ok(OnchainFunding {
            required: true,
            token: config.token.clone(),
            treasury: config.treasury_address(),
            chain_id: config.chain_id,
            expected_amount_units: Some(units),
            expected_amount_usd: expected_usd,
            verification_status: VerificationStatus::Pending,
            ..Default::default()
        })
    }

    /// Verify the user's funding transaction and persist the result either way.
    ///
    /// A funding hash can back exactly one payout; reuse is rejected before touching the chain.
    pub async fn verify_funding(
        &self,
        tx: &Transaction,
        onchain_tx_hash: &str,
        request_chain_id: Option<u64>,
        treasury: &TreasuryClient,
    ) -> Result<OnchainFunding, PaymentFlowError> {
        if let Some(other) =
            self.db.funding_tx_in_use(onchain_tx_hash, &tx.transaction_id).await?
        {
            return Err(StateError::DuplicateFundingTx {
                tx_hash: onchain_tx_hash.to_string(),
                other: other.to_string(),
            }
            .into());
        }
        let expected_units = tx.onchain.expected_amount_units.unwrap_or_default();
        let result = treasury
            .verify_funding(onchain_tx_hash, &tx.user_address, expected_units, request_chain_id)
            .await;
        match result {
            Ok(proof) => {
                let onchain = self.verified_funding(&tx.onchain, &proof);
                self.db.update_funding(&tx.transaction_id, &onchain).await?;
                Ok(onchain)
            },
            Err(e) => {
                let mut onchain = tx.onchain.clone();
                onchain.tx_hash = Some(onchain_tx_hash.to_string());
                onchain.verification_status = VerificationStatus::Failed;
                onchain.verification_error = Some(e.to_string());
                self.db.update_funding(&tx.transaction_id, &onchain).await?;
                Err(e.into())
            },
        }
    }

    fn verified_funding(&self, current: &OnchainFunding, proof: &FundingProof) -> OnchainFunding {
        OnchainFunding {
            required: true,
            tx_hash: Some(proof.tx_hash.clone()),
            chain_id: Some(proof.chain_id),
            token: Some(proof.token.clone()),
            treasury: Some(proof.treasury.clone()),
            expected_amount_units: current.expected_amount_units,
            expected_amount_usd: current.expected_amount_usd,
            funded_amount_units: Some(proof.funded_units),
            funded_amount_usd: Some(proof.funded_usd),
            from_address: Some(proof.from.clone()),
            log_index: Some(proof.log_index),
            verification_status: VerificationStatus::Verified,
            verification_error: None,
        }
    }

    pub async fn transition(
        &self,
        id: &TransactionId,
        to: TransactionStatus,
        reason: &str,
        source: &str,
    ) -> Result<Transaction, PaymentFlowError> {
        Ok(self.db.transition(id, to, reason, source).await?)
    }

    /// Persist the synchronous provider response and classify it: accepted submissions move to
    /// `mpesa_processing`, rejections to `failed`.
    pub async fn record_submission(
        &self,
        id: &TransactionId,
        submission: DarajaSubmission,
        accepted: bool,
    ) -> Result<Transaction, PaymentFlowError> {
        let (to, reason) = if accepted {
            (TransactionStatus::MpesaProcessing, "provider accepted the request".to_string())
        } else {
            let desc = submission
                .response_description
                .clone()
                .or_else(|| submission.response_code.clone())
                .unwrap_or_else(|| "no response".to_string());
            (TransactionStatus::Failed, format!("provider rejected the request: {desc}"))
        };
        Ok(self.db.record_submission(id, &submission, to, &reason, "mpesa").await?)
    }

    /// Apply an asynchronous provider callback: locate, dedup, merge, transition.
    ///
    /// Webhooks are delivered at least once and may arrive before, with, or after the synchronous
    /// submission response. Late callbacks that would require an illegal transition are merged
    /// without a status change.
    pub async fn apply_callback(
        &self,
        kind: CallbackKind,
        tx_param: Option<&str>,
        merge: CallbackMerge,
    ) -> Result<CallbackOutcome, PaymentFlowError> {
        let tx = match tx_param {
            Some(id) => self.db.fetch_transaction(&TransactionId(id.to_string())).await?,
            None => None,
        };
        let tx = match tx {
            Some(tx) => Some(tx),
            None => self.db.fetch_by_provider_ids(&merge.provider_ids).await?,
        };
        let Some(tx) = tx else {
            return Ok(CallbackOutcome::NotFound);
        };

        let provider_id = merge
            .provider_ids
            .checkout_request_id
            .as_deref()
            .or(merge.provider_ids.merchant_request_id.as_deref())
            .or(merge.provider_ids.conversation_id.as_deref())
            .or(merge.provider_ids.originator_conversation_id.as_deref())
            .unwrap_or("none");
        let code_part = if kind.is_timeout() {
            "timeout"
        } else {
            merge.result_code.as_deref().unwrap_or("none")
        };
        let event_key =
            format!("{}:{}:{provider_id}:{code_part}", kind.as_str(), tx.transaction_id);
        let fresh = self
            .db
            .insert_dedup_event(&NewDedupEvent {
                event_key: event_key.clone(),
                transaction_id: tx.transaction_id.clone(),
                source: EventSource::Webhook,
                event_type: kind.as_str().to_string(),
                payload: merge.raw_callback.clone(),
            })
            .await?;
        if !fresh {
            debug!("🔄️ Callback {event_key} already applied; dropping");
            return Ok(CallbackOutcome::Duplicate);
        }

        let success = !kind.is_timeout() && merge.result_code.as_deref() == Some("0");
        let (mut to, mut follow_up, reason) = if success {
            match (kind, tx.flow_type) {
                (CallbackKind::Stk, FlowType::Onramp) => {
                    // The submitted -> processing hop only applies when the callback races ahead
                    // of the synchronous response; the settler runs either way (it re-checks
                    // state and is idempotent), except on terminal transactions.
                    let to = if tx.status == TransactionStatus::MpesaSubmitted {
                        Some(TransactionStatus::MpesaProcessing)
                    } else {
                        None
                    };
                    let follow_up = if tx.status.is_terminal() {
                        FollowUp::None
                    } else {
                        FollowUp::SettleOnrampCredit
                    };
                    (to, follow_up, "STK push confirmed".to_string())
                },
                _ => (Some(TransactionStatus::Succeeded), FollowUp::None, "provider reported success".to_string()),
            }
        } else {
            let reason = if kind.is_timeout() {
                "provider timed out".to_string()
            } else {
                format!(
                    "provider reported failure: {}",
                    merge.result_desc.clone().or(merge.result_code.clone()).unwrap_or_else(|| "unknown".into())
                )
            };
            let follow_up =
                if tx.flow_type.is_funded() { FollowUp::ScheduleRefund } else { FollowUp::None };
            (Some(TransactionStatus::Failed), follow_up, reason)
        };

        // A late callback cannot move a terminal transaction; merge the payload and drop the hop.
        if let Some(target) = to {
            if target != tx.status && !allowed(tx.status, target) {
                warn!(
                    "📨️ Callback {event_key} would move {} from {} to {target}; keeping status",
                    tx.transaction_id, tx.status
                );
                to = None;
                if follow_up == FollowUp::ScheduleRefund {
                    follow_up = FollowUp::None;
                }
            }
        }

        let updated =
            self.db.record_callback(&tx.transaction_id, &merge, to, &reason, "webhook").await?;
        Ok(CallbackOutcome::Applied { transaction: updated, follow_up })
    }

    /// Compensate the funder of a failed payout with a treasury transfer.
    ///
    /// Eligible only for funded flows in `failed` state with no refund attempt recorded yet;
    /// anything else is a no-op returning `None`.
    pub async fn schedule_auto_refund(
        &self,
        id: &TransactionId,
        treasury: &TreasuryClient,
        reason: &str,
    ) -> Result<Option<Transaction>, PaymentFlowError> {
        let tx = self
            .db
            .fetch_transaction(id)
            .await?
            .ok_or_else(|| PaymentFlowError::NotFound(id.to_string()))?;
        if !tx.flow_type.is_funded()
            || tx.status != TransactionStatus::Failed
            || tx.refund.status != RefundStatus::None
        {
            trace!("🔄️ Refund not applicable for {id} ({}, {}, {:?})", tx.flow_type, tx.status, tx.refund.status);
            return Ok(None);
        }

        let now = Utc::now();
        let refund = RefundInfo {
            status: RefundStatus::Pending,
            reason: Some(reason.to_string()),
            tx_hash: None,
            initiated_at: Some(now),
            completed_at: None,
        };
        let tx = self
            .db
            .update_refund(id, &refund, Some(TransactionStatus::RefundPending), reason, "refund")
            .await?;

        let recipient = tx
            .onchain
            .from_address
            .clone()
            .or_else(|| tx.authorization.signer_address.clone())
            .unwrap_or_else(|| tx.user_address.clone());
        if let Err(e) = crate::helpers::validation::validate_evm_address(&recipient) {
            let refund = RefundInfo {
                status: RefundStatus::Failed,
                reason: Some(format!("{reason}; refund error: {e}")),
                tx_hash: None,
                initiated_at: Some(now),
                completed_at: None,
            };
            error!("🔄️ Refund for {id} has no valid recipient: {e}");
            let updated = self
                .db
                .update_refund(id, &refund, Some(TransactionStatus::Failed), "refund failed", "refund")
                .await?;
            return Ok(Some(updated));
        }
        let amount_usd = tx
            .onchain
            .funded_amount_usd
            .unwrap_or(if tx.onchain.expected_amount_usd.is_positive() {
                tx.onchain.expected_amount_usd
            } else {
                tx.quote.amount_usd
            });
        let units = amount_usd.to_token_units(treasury.config().decimals);

        let config = treasury.config();
        let outcome = if config.can_transfer() && config.refund_enabled {
            treasury.transfer(&recipient, units).await
        } else if config.sandbox {
            let reference = simulated_refund_reference();
            info!("🔄️ Treasury not configured; simulated refund {reference} for {id}");
            Ok(reference)
        } else {
            Err(TreasuryError::NotConfigured("refunds are disabled or the treasury is not configured".into()))
        };

        let updated = match outcome {
            Ok(refund_tx) => {
                let refund = RefundInfo {
                    status: RefundStatus::Completed,
                    reason: Some(reason.to_string()),
                    tx_hash: Some(refund_tx.clone()),
                    initiated_at: Some(now),
                    completed_at: Some(Utc::now()),
                };
                info!("🔄️ Refund for {id} completed in {refund_tx}");
                self.db
                    .update_refund(id, &refund, Some(TransactionStatus::Refunded), "refund completed", "refund")
                    .await?
            },
            Err(e) => {
                let refund = RefundInfo {
                    status: RefundStatus::Failed,
                    reason: Some(format!("{reason}; refund error: {e}")),
                    tx_hash: None,
                    initiated_at: Some(now),
                    completed_at: None,
                };
                error!("🔄️ Refund for {id} failed: {e}");
                self.db
                    .update_refund(id, &refund, Some(TransactionStatus::Failed), "refund failed", "refund")
                    .await?
            },
        };
        Ok(Some(updated))
    }

    /// Onramp credit settlement: after a successful STK callback, transfer the quoted USD amount
    /// from the treasury to the user and drive the transaction to `succeeded`.
    ///
    /// Idempotent: a transaction whose credit is already verified is returned unchanged. Runs
    /// out-of-band after the webhook ack, so it re-loads state before acting.
    pub async fn settle_onramp_credit(
        &self,
        id: &TransactionId,
        treasury: &TreasuryClient,
    ) -> Result<Transaction, PaymentFlowError> {
        let tx = self
            .db
            .fetch_transaction(id)
            .await?
            .ok_or_else(|| PaymentFlowError::NotFound(id.to_string()))?;
        if tx.flow_type != FlowType::Onramp {
            return Err(ValidationError(format!("{id} is not an onramp transaction")).into());
        }
        if tx.onchain.verification_status == VerificationStatus::Verified && tx.onchain.tx_hash.is_some() {
            debug!("🔄️ Onramp credit for {id} already settled");
            return Ok(tx);
        }

        let config = treasury.config();
        let units = tx.quote.amount_usd.to_token_units(config.decimals);
        match treasury.transfer(&tx.user_address, units).await {
            Ok(credit_tx) => {
                let onchain = OnchainFunding {
                    required: false,
                    tx_hash: Some(credit_tx.clone()),
                    chain_id: config.chain_id,
                    token: config.token.clone(),
                    treasury: config.treasury_address(),
                    expected_amount_units: Some(units),
                    expected_amount_usd: tx.quote.amount_usd,
                    funded_amount_units: Some(units),
                    funded_amount_usd: Some(tx.quote.amount_usd),
                    from_address: config.treasury_address(),
                    log_index: None,
                    verification_status: VerificationStatus::Verified,
                    verification_error: None,
                };
                self.db.update_funding(id, &onchain).await?;
                info!("🔄️ Onramp credit for {id} settled in {credit_tx}");
                let mut tx = self
                    .db
                    .fetch_transaction(id)
                    .await?
                    .ok_or_else(|| PaymentFlowError::NotFound(id.to_string()))?;
                if tx.status == TransactionStatus::MpesaSubmitted {
                    tx = self
                        .db
                        .transition(id, TransactionStatus::MpesaProcessing, "credit settlement started", "system")
                        .await?;
                }
                if tx.status == TransactionStatus::MpesaProcessing {
                    tx = self
                        .db
                        .transition(id, TransactionStatus::Succeeded, "onramp credit settled", "system")
                        .await?;
                }
                Ok(tx)
            },
            Err(e) => {
                let mut onchain = tx.onchain.clone();
                onchain.verification_status = VerificationStatus::Failed;
                onchain.verification_error = Some(e.to_string());
                self.db.update_funding(id, &onchain).await?;
                error!("🔄️ Onramp credit for {id} failed: {e}. Leaving for operational retry");
                Err(e.into())
            },
        }
    }

    /// Candidates for the reconciliation sweep: either one forced transaction, or up to `limit`
    /// `mpesa_processing` transactions whose last update is older than `max_age`.
    pub async fn reconcile_candidates(
        &self,
        max_age: Duration,
        transaction_id: Option<&TransactionId>,
        limit: i64,
    ) -> Result<Vec<Transaction>, PaymentFlowError> {
        match transaction_id {
            Some(id) => {
                let tx = self
                    .db
                    .fetch_transaction(id)
                    .await?
                    .ok_or_else(|| PaymentFlowError::NotFound(id.to_string()))?;
                Ok(vec![tx])
            },
            None => {
                let cutoff = Utc::now() - max_age;
                Ok(self.db.stuck_processing(cutoff, limit).await?)
            },
        }
    }

    /// Fail a stuck transaction from the reconciler.
    pub async fn mark_reconcile_failed(
        &self,
        id: &TransactionId,
    ) -> Result<Transaction, PaymentFlowError> {
        Ok(self
            .db
            .transition(id, TransactionStatus::Failed, "stuck in mpesa_processing past cutoff", "reconcile")
            .await?)
    }
}
