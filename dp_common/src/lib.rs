mod helpers;
mod money;

pub mod op;
mod secret;

pub use helpers::parse_boolean_flag;
pub use money::{MicroKes, MicroUsd, MoneyConversionError, KES_CURRENCY_CODE, USD_CURRENCY_CODE};
pub use secret::Secret;
