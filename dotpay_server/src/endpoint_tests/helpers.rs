use actix_web::web::{self, ServiceConfig};
use dotpay_engine::{
    treasury::{TreasuryClient, TreasuryConfig},
    SqliteDatabase,
};

use super::mocks::MockMobileMoney;
use crate::{
    auth::TokenIssuer,
    config::ServerConfig,
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

pub const USER: &str = "0x00a329c0648769a73afac7f9381e08fb43dbea72";

/// Default test configuration: the treasury is not configured in tests, so funded flows run with
/// on-chain funding verification switched off unless a test opts back in.
pub fn test_config() -> ServerConfig {
    ServerConfig { require_onchain_funding: false, ..ServerConfig::default() }
}

pub fn bearer(config: &ServerConfig, address: &str, scope: &str) -> String {
    let token = TokenIssuer::new(&config.auth).issue_token(address, scope, 600).unwrap();
    format!("Bearer {token}")
}

/// Register the full route table against an in-memory database and the scripted provider.
pub fn configure_app(
    db: SqliteDatabase,
    mobile_money: MockMobileMoney,
    config: ServerConfig,
) -> impl FnOnce(&mut ServiceConfig) {
    move |cfg| {
        let treasury = TreasuryClient::new(TreasuryConfig::default());
        let orchestrator = PaymentOrchestrator::new(db, mobile_money, treasury, config.clone());
        cfg.app_data(web::Data::new(config.auth.clone()))
            .app_data(web::Data::new(config))
            .app_data(web::Data::new(orchestrator))
            .service(health)
            .service(
                web::scope("/api/mpesa")
                    .service(QuoteRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(InitiateOnrampRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(InitiateOfframpRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(InitiatePaybillRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(InitiateBuygoodsRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(ListTransactionsRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(GetTransactionRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(ReconcileRoute::<SqliteDatabase, MockMobileMoney>::new())
                    .service(
                        web::scope("/webhooks")
                            .service(StkWebhookRoute::<SqliteDatabase, MockMobileMoney>::new())
                            .service(B2cResultWebhookRoute::<SqliteDatabase, MockMobileMoney>::new())
                            .service(B2cTimeoutWebhookRoute::<SqliteDatabase, MockMobileMoney>::new())
                            .service(B2bResultWebhookRoute::<SqliteDatabase, MockMobileMoney>::new())
                            .service(B2bTimeoutWebhookRoute::<SqliteDatabase, MockMobileMoney>::new()),
                    ),
            );
    }
}
