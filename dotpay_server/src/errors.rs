use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use dotpay_engine::{treasury::TreasuryError, PaymentFlowError};
use thiserror::Error;

use crate::data_objects::ApiResponse;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Validation(String),
    #[error("Authentication error. {0}")]
    Auth(String),
    #[error("{0}")]
    State(String),
    #[error("Upstream provider error. {0}")]
    External(String),
    #[error("Invalid server configuration. {0}")]
    Configuration(String),
    #[error("Mobile money is currently disabled")]
    Disabled,
    #[error("{0} not found")]
    NotFound(String),
    #[error("Backend error. {0}")]
    BackendError(String),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not initialize server. {0}")]
    InitializeError(String),
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::State(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiResponse::<()>::failure(self.to_string()))
    }
}

impl From<PaymentFlowError> for ServerError {
    fn from(e: PaymentFlowError) -> Self {
        match e {
            PaymentFlowError::Validation(e) => ServerError::Validation(e.to_string()),
            PaymentFlowError::Auth(e) => ServerError::Auth(e.to_string()),
            PaymentFlowError::State(e) => ServerError::State(e.to_string()),
            PaymentFlowError::NotFound(what) => ServerError::NotFound(what),
            PaymentFlowError::Database(e) => ServerError::BackendError(e.to_string()),
            PaymentFlowError::Treasury(e) => match e {
                TreasuryError::NotConfigured(_) => ServerError::Configuration(e.to_string()),
                TreasuryError::Rpc(_) | TreasuryError::ReceiptNotFound(_) => {
                    ServerError::External(e.to_string())
                },
                other => ServerError::State(other.to_string()),
            },
        }
    }
}
