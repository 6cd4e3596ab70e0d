use actix_web::{body::MessageBody, http::StatusCode, test, test::TestRequest, App};
use dotpay_engine::SqliteDatabase;

use super::{
    helpers::{bearer, configure_app, test_config, USER},
    mocks::MockMobileMoney,
};
use crate::auth::TokenIssuer;

async fn get_transactions(auth_header: Option<String>) -> (StatusCode, String) {
    let _ = env_logger::try_init().ok();
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let app = App::new().configure(configure_app(db, MockMobileMoney::accepting(), config.clone()));
    let app = test::init_service(app).await;
    let mut req = TestRequest::get().uri("/api/mpesa/transactions");
    if let Some(header) = auth_header {
        req = req.insert_header(("Authorization", header));
    }
    let (_, res) = test::call_service(&app, req.to_request()).await.into_parts();
    let status = res.status();
    let body = String::from_utf8_lossy(&res.into_body().try_into_bytes().unwrap()).into_owned();
    (status, body)
}

#[actix_web::test]
async fn missing_bearer_token_is_unauthorized() {
    let (status, body) = get_transactions(None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Missing bearer token"), "was: {body}");
}

#[actix_web::test]
async fn garbage_token_is_unauthorized() {
    let (status, body) = get_transactions(Some("Bearer made-up-nonsense".to_string())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Invalid bearer token"), "was: {body}");
}

#[actix_web::test]
async fn token_without_mpesa_scope_is_rejected() {
    let config = test_config();
    let (status, body) = get_transactions(Some(bearer(&config, USER, "users"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("scope"), "was: {body}");
}

#[actix_web::test]
async fn expired_token_is_rejected() {
    let config = test_config();
    let token = TokenIssuer::new(&config.auth).issue_token(USER, "mpesa", -120).unwrap();
    let (status, body) = get_transactions(Some(format!("Bearer {token}"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("expired"), "was: {body}");
}

#[actix_web::test]
async fn valid_token_passes_through() {
    let config = test_config();
    let (status, body) = get_transactions(Some(bearer(&config, USER, "mpesa users"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""success":true"#), "was: {body}");
}

#[actix_web::test]
async fn health_needs_no_auth() {
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let app = App::new().configure(configure_app(db, MockMobileMoney::accepting(), config));
    let app = test::init_service(app).await;
    let res = test::call_service(&app, TestRequest::get().uri("/health").to_request()).await;
    assert!(res.status().is_success());
}
