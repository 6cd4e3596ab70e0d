use thiserror::Error;

#[derive(Debug, Error)]
pub enum DarajaApiError {
    #[error("Could not initialize client: {0}")]
    Initialization(String),
    #[error("Daraja configuration error: {0}")]
    Config(String),
    #[error("OAuth token request failed: {0}")]
    OAuth(String),
    #[error("Request failed: {0}")]
    RequestError(String),
    #[error("Query failed. Error {status}. {message}")]
    QueryError { status: u16, message: String },
    #[error("Could not deserialize JSON: {0}")]
    JsonError(String),
    #[error("Invalid security credential: {0}")]
    InvalidSecurityCredential(String),
}
