//! DotPay Payment Engine
//!
//! The payment engine is the backend of record for the DotPay mobile-money gateway. It owns the
//! transaction lifecycle (quote, authorization, on-chain funding, provider submission, callback
//! reconciliation, refunds) and is provider-agnostic: the mobile-money network client lives in a
//! separate crate and talks to the engine through the data types defined here.
//!
//! The library is divided into three main sections:
//! 1. Database management. SQLite is the supported backend. You should never need to access the
//!    database directly; use the [`PaymentFlowApi`] instead. The exception is the data types used
//!    in the database, which are defined in the `db_types` module and are public.
//! 2. Flow management. The [`PaymentFlowApi`] drives the transaction state machine and enforces
//!    the invariants of the lifecycle (idempotency, quote expiry, limits, webhook dedup).
//! 3. Treasury management. The `treasury` module verifies on-chain funding of payouts and executes
//!    compensating refunds and onramp credits against the stablecoin contract.

pub mod db_types;
pub mod helpers;
pub mod test_utils;
pub mod quotes;
pub mod state_machine;
pub mod traits;
pub mod treasury;

mod flow_api;
mod sqlite;

pub use flow_api::{
    AuthorizationRequest,
    CallbackKind,
    CallbackOutcome,
    FlowLimits,
    FollowUp,
    PaymentFlowApi,
    PaymentFlowError,
};
pub use sqlite::{db_url, SqliteDatabase};
