use std::time::Duration;

use actix_web::{dev::Server, http::KeepAlive, middleware::Logger, web, App, HttpServer};
use daraja_tools::{DarajaApi, DarajaConfig};
use dotpay_engine::{
    treasury::{TreasuryClient, TreasuryConfig},
    SqliteDatabase,
};

use crate::{
    config::ServerConfig,
    errors::ServerError,
    orchestrator::PaymentOrchestrator,
    routes::{
        health,
        GetTransactionRoute,
        InitiateBuygoodsRoute,
        InitiateOfframpRoute,
        InitiateOnrampRoute,
        InitiatePaybillRoute,
        ListTransactionsRoute,
        QuoteRoute,
        ReconcileRoute,
    },
    webhook_routes::{
        B2bResultWebhookRoute,
        B2bTimeoutWebhookRoute,
        B2cResultWebhookRoute,
        B2cTimeoutWebhookRoute,
        StkWebhookRoute,
    },
};

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let db = SqliteDatabase::new_with_url(&config.database_url, 25)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let daraja = DarajaApi::new(DarajaConfig::from_env_or_default())
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let srv = create_server_instance(config, db, daraja)?;
    srv.await.map_err(|e| ServerError::InitializeError(e.to_string()))
}

pub fn create_server_instance(
    config: ServerConfig,
    db: SqliteDatabase,
    daraja: DarajaApi,
) -> Result<Server, ServerError> {
    let bind_address = (config.host.clone(), config.port);
    let srv = HttpServer::new(move || {
        let treasury = TreasuryClient::new(TreasuryConfig::from_env_or_default());
        let orchestrator =
            PaymentOrchestrator::new(db.clone(), daraja.clone(), treasury, config.clone());
        App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %U").log_target("dotpay_server"))
            .app_data(web::Data::new(config.auth.clone()))
            .app_data(web::Data::new(config.clone()))
            .app_data(web::Data::new(orchestrator))
            .service(health)
            .service(
                web::scope("/api/mpesa")
                    .service(QuoteRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(InitiateOnrampRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(InitiateOfframpRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(InitiatePaybillRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(InitiateBuygoodsRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(ListTransactionsRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(GetTransactionRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(ReconcileRoute::<SqliteDatabase, DarajaApi>::new())
                    .service(
                        web::scope("/webhooks")
                            .service(StkWebhookRoute::<SqliteDatabase, DarajaApi>::new())
                            .service(B2cResultWebhookRoute::<SqliteDatabase, DarajaApi>::new())
                            .service(B2cTimeoutWebhookRoute::<SqliteDatabase, DarajaApi>::new())
                            .service(B2bResultWebhookRoute::<SqliteDatabase, DarajaApi>::new())
                            .service(B2bTimeoutWebhookRoute::<SqliteDatabase, DarajaApi>::new()),
                    ),
            )
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind(bind_address)?
    .run();
    Ok(srv)
}
