use std::env;

use dotenvy::dotenv;
use dotpay_server::{
    config::{AuthConfig, ServerConfig},
    server::run_server,
};
use log::{error, info};

#[actix_web::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    let config = ServerConfig::from_env_or_default();
    if !preflight_check(&config) {
        eprintln!("🚀️ Preflight check failed. Exiting. Check the logs for details.");
        return;
    }

    info!("🚀️ Starting server on {}:{}", config.host, config.port);
    match run_server(config).await {
        Ok(_) => println!("Bye!"),
        Err(e) => eprintln!("{e}"),
    }
}

fn preflight_check(config: &ServerConfig) -> bool {
    if env::var("DOTPAY_SKIP_PREFLIGHT").ok() == Some("Yes".to_string()) {
        info!("🚦️ Skipping preflight checks. I hope you know what you're doing!");
        return true;
    }
    let mut result = true;
    info!("🚦️ Running preflight checks...");
    if AuthConfig::try_from_env().is_err() {
        error!("🚦️ Preflight check FAILED: DOTPAY_BACKEND_JWT_SECRET must be set before carrying on.");
        result = false;
    }
    if env::var("DOTPAY_INTERNAL_API_KEY").is_err() {
        error!("🚦️ DOTPAY_INTERNAL_API_KEY is not set. The reconcile endpoint will be unusable.");
    }
    if env::var("MPESA_CONSUMER_KEY").is_err() || env::var("MPESA_CONSUMER_SECRET").is_err() {
        error!("🚦️ MPESA_CONSUMER_KEY / MPESA_CONSUMER_SECRET are not set. Provider calls will fail.");
        result = false;
    }
    if env::var("MPESA_RESULT_BASE_URL").is_err() {
        error!(
            "🚦️ MPESA_RESULT_BASE_URL is not set. This must be the public base URL of this server, \
             or provider callbacks will never arrive."
        );
        result = false;
    }
    if config.require_onchain_funding {
        let treasury = dotpay_engine::treasury::TreasuryConfig::from_env_or_default();
        if let Err(e) = treasury.can_verify() {
            error!(
                "🚦️ On-chain funding is required but the treasury cannot verify it: {e}. Set the \
                 TREASURY_* variables or disable MPESA_REQUIRE_ONCHAIN_FUNDING."
            );
            result = false;
        }
    }
    if config.database_url.is_empty() {
        error!("🚦️ DOTPAY_DATABASE_URL is not set. Please set it to the URL for the gateway database.");
        return false;
    }
    if result {
        info!("🚦️ Preflight check PASSED.");
    } else {
        error!("🚦️ Preflight check FAILED: Please fix the issues above before starting the server.");
        info!(
            "🚦️ If you really know what you're doing and want to skip the preflight check, set \
             `DOTPAY_SKIP_PREFLIGHT` to `Yes` in your environment variables"
        );
    }
    result
}
