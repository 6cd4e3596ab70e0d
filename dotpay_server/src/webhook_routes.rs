//! The webhook demultiplexer: five handlers for the provider's asynchronous callbacks.
//!
//! Callbacks are delivered at least once and in no particular order relative to the synchronous
//! submission response. Every handler acknowledges with HTTP 200 and the provider's expected body
//! even when processing fails internally; anything else makes the provider retry indefinitely.
//! Internal errors are logged, never surfaced.

use actix_web::{web, HttpRequest, HttpResponse};
use daraja_tools::callbacks::{parse_result_callback, parse_stk_callback, ParsedCallback};
use dotpay_engine::{traits::PaymentDatabase, CallbackKind};
use log::*;
use serde_json::Value;

use crate::{
    auth::secrets_match,
    config::ServerConfig,
    data_objects::{WebhookAck, WebhookQuery},
    orchestrator::{MobileMoney, PaymentOrchestrator},
    route,
};

/// Shared-secret check. Deployments without a configured secret accept everything; with one, a
/// mismatch drops the callback (but still acks, so the provider does not retry).
fn secret_ok(req: &HttpRequest, query: &WebhookQuery, config: &ServerConfig) -> bool {
    let Some(expected) = &config.webhook_secret else {
        return true;
    };
    let provided = req
        .headers()
        .get("X-Webhook-Secret")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .or(query.secret.as_deref());
    match provided {
        Some(secret) => secrets_match(secret, expected.reveal()),
        None => false,
    }
}

fn ack() -> HttpResponse {
    HttpResponse::Ok().json(WebhookAck::accepted())
}

async fn handle_webhook<TB, TM>(
    kind: CallbackKind,
    req: HttpRequest,
    query: web::Query<WebhookQuery>,
    body: web::Json<Value>,
    orchestrator: web::Data<PaymentOrchestrator<TB, TM>>,
    config: web::Data<ServerConfig>,
) -> HttpResponse
where
    TB: PaymentDatabase + 'static,
    TM: MobileMoney + 'static,
{
    let query = query.into_inner();
    let payload = body.into_inner();
    trace!("📨️ Received {} callback: {payload}", kind.as_str());
    if !secret_ok(&req, &query, &config) {
        warn!("📨️ {} callback failed the shared-secret check; dropping", kind.as_str());
        return ack();
    }
    let parsed: ParsedCallback = match kind {
        CallbackKind::Stk => parse_stk_callback(&payload),
        _ => parse_result_callback(&payload),
    };
    if let Err(e) = orchestrator.apply_webhook(kind, query.tx.as_deref(), parsed, payload).await {
        error!("📨️ Failed to process {} callback: {e}", kind.as_str());
    }
    ack()
}

route!(stk_webhook => Post "/stk" impl PaymentDatabase, MobileMoney);
pub async fn stk_webhook<TPaymentDatabase, TMobileMoney>(
    req: HttpRequest,
    query: web::Query<WebhookQuery>,
    body: web::Json<Value>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> HttpResponse
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    handle_webhook(CallbackKind::Stk, req, query, body, orchestrator, config).await
}

route!(b2c_result_webhook => Post "/b2c/result" impl PaymentDatabase, MobileMoney);
pub async fn b2c_result_webhook<TPaymentDatabase, TMobileMoney>(
    req: HttpRequest,
    query: web::Query<WebhookQuery>,
    body: web::Json<Value>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> HttpResponse
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    handle_webhook(CallbackKind::B2cResult, req, query, body, orchestrator, config).await
}

route!(b2c_timeout_webhook => Post "/b2c/timeout" impl PaymentDatabase, MobileMoney);
pub async fn b2c_timeout_webhook<TPaymentDatabase, TMobileMoney>(
    req: HttpRequest,
    query: web::Query<WebhookQuery>,
    body: web::Json<Value>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> HttpResponse
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    handle_webhook(CallbackKind::B2cTimeout, req, query, body, orchestrator, config).await
}

route!(b2b_result_webhook => Post "/b2b/result" impl PaymentDatabase, MobileMoney);
pub async fn b2b_result_webhook<TPaymentDatabase, TMobileMoney>(
    req: HttpRequest,
    query: web::Query<WebhookQuery>,
    body: web::Json<Value>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> HttpResponse
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    handle_webhook(CallbackKind::B2bResult, req, query, body, orchestrator, config).await
}

route!(b2b_timeout_webhook => Post "/b2b/timeout" impl PaymentDatabase, MobileMoney);
pub async fn b2b_timeout_webhook<TPaymentDatabase, TMobileMoney>(
    req: HttpRequest,
    query: web::Query<WebhookQuery>,
    body: web::Json<Value>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> HttpResponse
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    handle_webhook(CallbackKind::B2bTimeout, req, query, body, orchestrator, config).await
}
