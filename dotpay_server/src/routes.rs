//! Request handler definitions
//!
//! Define each route and its handler here. Handlers that are more than a line or two go through
//! the orchestrator; keep this module neat and tidy 🙏
//!
//! Handlers are generic over the storage and mobile-money seams so endpoint tests can run them
//! against an in-memory database and a scripted provider.

use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use dotpay_engine::{
    db_types::{FlowType, TransactionId, TransactionStatus},
    helpers::validation::validate_idempotency_key,
    traits::{PaymentDatabase, TransactionQueryFilter},
};
use log::*;

use crate::{
    auth::{check_internal_key, JwtClaims},
    config::ServerConfig,
    data_objects::{
        ApiResponse,
        BuygoodsInitiateParams,
        InitiateResult,
        OfframpInitiateParams,
        OnrampInitiateParams,
        PaybillInitiateParams,
        QuoteParams,
        QuoteResult,
        ReconcileParams,
        TransactionListQuery,
    },
    errors::ServerError,
    orchestrator::{MobileMoney, PaymentOrchestrator},
};

// Actix cannot handle generics in attribute-macro handlers, so registration is implemented
// manually using the `route!` macro.
#[macro_export]
macro_rules! route {
    ($name:ident => $method:ident $path:literal impl $($bounds:ty),+) => {
        paste::paste! { pub struct [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ >( $( core::marker::PhantomData<fn() -> [< T $bounds:camel> ] >,)+ );}
        paste::paste! { impl< $( [< T $bounds:camel> ],)+ > [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ > {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self($( core::marker::PhantomData::<fn() -> [< T $bounds:camel> ] >,)+)
            }
        }}
        paste::paste! { impl<$( [< T $bounds:camel >] , )+> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<$([<T $bounds:camel>],)+>
        where
            $([<T $bounds:camel>]: $bounds + 'static,)+
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::< $( [< T $bounds:camel >], )+>);
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };
}

fn remote_ip(req: &HttpRequest) -> Option<String> {
    req.connection_info().realip_remote_addr().map(String::from)
}

fn user_agent(req: &HttpRequest) -> Option<String> {
    req.headers().get("User-Agent").and_then(|v| v.to_str().ok()).map(String::from)
}

fn idempotency_key(req: &HttpRequest) -> Result<String, ServerError> {
    let key = req
        .headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ServerError::Validation("Idempotency-Key header is required".to_string()))?;
    validate_idempotency_key(key).map_err(|e| ServerError::Validation(e.to_string()))?;
    Ok(key.to_string())
}

fn ensure_enabled(config: &ServerConfig) -> Result<(), ServerError> {
    if config.enabled {
        Ok(())
    } else {
        Err(ServerError::Disabled)
    }
}

// ----------------------------------------------   Health  ----------------------------------------------------

#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().body("👍️\n")
}

//----------------------------------------------   Quotes  ----------------------------------------------------

route!(quote => Post "/quotes" impl PaymentDatabase, MobileMoney);
/// Price a request. Creates the transaction that carries the quote, so the client can sign the
/// authorization message over the real transaction id before initiating.
pub async fn quote<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    req: HttpRequest,
    body: web::Json<QuoteParams>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    ensure_enabled(&config)?;
    debug!("💻️ POST quote for {} ({} {})", claims.address, body.amount, body.currency);
    let transaction = orchestrator
        .quote(&claims.address, &body.into_inner(), remote_ip(&req), user_agent(&req))
        .await?;
    let result = QuoteResult { quote: transaction.quote.clone(), transaction };
    Ok(HttpResponse::Ok().json(ApiResponse::success(result)))
}

//----------------------------------------------  Initiate  ----------------------------------------------------

fn initiate_response(result: InitiateResult) -> HttpResponse {
    if result.idempotent {
        HttpResponse::Ok().json(ApiResponse::success_with_message(result, "Idempotent replay"))
    } else {
        HttpResponse::Ok().json(ApiResponse::success(result))
    }
}

route!(initiate_onramp => Post "/onramp/stk/initiate" impl PaymentDatabase, MobileMoney);
pub async fn initiate_onramp<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    req: HttpRequest,
    body: web::Json<OnrampInitiateParams>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    ensure_enabled(&config)?;
    let key = idempotency_key(&req)?;
    debug!("💻️ POST onramp initiate for {} ({key})", claims.address);
    let result = orchestrator
        .initiate_onramp(&claims.address, &key, &body.into_inner(), remote_ip(&req), user_agent(&req))
        .await?;
    Ok(initiate_response(result))
}

route!(initiate_offramp => Post "/offramp/initiate" impl PaymentDatabase, MobileMoney);
pub async fn initiate_offramp<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    req: HttpRequest,
    body: web::Json<OfframpInitiateParams>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    ensure_enabled(&config)?;
    let key = idempotency_key(&req)?;
    debug!("💻️ POST offramp initiate for {} ({key})", claims.address);
    let result = orchestrator
        .initiate_offramp(&claims.address, &key, &body.into_inner(), remote_ip(&req), user_agent(&req))
        .await?;
    Ok(initiate_response(result))
}

route!(initiate_paybill => Post "/merchant/paybill/initiate" impl PaymentDatabase, MobileMoney);
pub async fn initiate_paybill<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    req: HttpRequest,
    body: web::Json<PaybillInitiateParams>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    ensure_enabled(&config)?;
    let key = idempotency_key(&req)?;
    debug!("💻️ POST paybill initiate for {} ({key})", claims.address);
    let result = orchestrator
        .initiate_paybill(&claims.address, &key, &body.into_inner(), remote_ip(&req), user_agent(&req))
        .await?;
    Ok(initiate_response(result))
}

route!(initiate_buygoods => Post "/merchant/buygoods/initiate" impl PaymentDatabase, MobileMoney);
pub async fn initiate_buygoods<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    req: HttpRequest,
    body: web::Json<BuygoodsInitiateParams>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    ensure_enabled(&config)?;
    let key = idempotency_key(&req)?;
    debug!("💻️ POST buygoods initiate for {} ({key})", claims.address);
    let result = orchestrator
        .initiate_buygoods(&claims.address, &key, &body.into_inner(), remote_ip(&req), user_agent(&req))
        .await?;
    Ok(initiate_response(result))
}

//--------------------------------------------  Transactions  --------------------------------------------------

route!(get_transaction => Get "/transactions/{id}" impl PaymentDatabase, MobileMoney);
/// Fetch a single transaction. Users can only see their own.
pub async fn get_transaction<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    path: web::Path<String>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    let id = TransactionId(path.into_inner());
    debug!("💻️ GET transaction {id} for {}", claims.address);
    let tx = orchestrator
        .flow()
        .db()
        .fetch_transaction(&id)
        .await
        .map_err(|e| ServerError::BackendError(e.to_string()))?
        .filter(|tx| tx.user_address == claims.address)
        .ok_or_else(|| ServerError::NotFound(format!("Transaction {id}")))?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(tx)))
}

route!(list_transactions => Get "/transactions" impl PaymentDatabase, MobileMoney);
/// List the caller's transactions, newest first. `flowType`, `status` and `limit` filters.
pub async fn list_transactions<TPaymentDatabase, TMobileMoney>(
    claims: JwtClaims,
    query: web::Query<TransactionListQuery>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    let query = query.into_inner();
    let flow_type = query
        .flow_type
        .as_deref()
        .map(|f| f.parse::<FlowType>().map_err(|_| ServerError::Validation(format!("Unknown flow type: {f}"))))
        .transpose()?;
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<TransactionStatus>().map_err(|_| ServerError::Validation(format!("Unknown status: {s}")))
        })
        .transpose()?;
    debug!("💻️ GET transactions for {}", claims.address);
    let filter = TransactionQueryFilter {
        user_address: Some(claims.address),
        flow_type,
        status,
        limit: query.limit,
    };
    let transactions = orchestrator
        .flow()
        .db()
        .search_transactions(&filter)
        .await
        .map_err(|e| ServerError::BackendError(e.to_string()))?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(transactions)))
}

//---------------------------------------------  Reconcile  ----------------------------------------------------

route!(reconcile => Post "/internal/reconcile" impl PaymentDatabase, MobileMoney);
/// Operator endpoint: sweep stuck `mpesa_processing` transactions. Authenticated by the internal
/// API key, not a user token.
pub async fn reconcile<TPaymentDatabase, TMobileMoney>(
    req: HttpRequest,
    body: web::Json<ReconcileParams>,
    orchestrator: web::Data<PaymentOrchestrator<TPaymentDatabase, TMobileMoney>>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, ServerError>
where
    TPaymentDatabase: PaymentDatabase + 'static,
    TMobileMoney: MobileMoney + 'static,
{
    check_internal_key(&req, config.internal_api_key.reveal())?;
    let params = body.into_inner();
    info!(
        "💻️ POST reconcile (max_age={:?}m, query={:?}, tx={:?})",
        params.max_age_minutes, params.execute_query, params.transaction_id
    );
    let report = orchestrator.reconcile(&params).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}
