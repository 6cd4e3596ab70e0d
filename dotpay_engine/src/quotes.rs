//! Pricing: turn a requested amount into a time-bounded quote.

use chrono::{Duration, Utc};
use dp_common::{MicroKes, MicroUsd};
use log::trace;
use rand::RngCore;

use crate::{
    db_types::{Currency, FlowType, Quote},
    helpers::validation::ValidationError,
};

/// Service fee in basis points, per flow.
fn fee_basis_points(flow: FlowType) -> i64 {
    match flow {
        FlowType::Onramp => 130,
        FlowType::Offramp => 180,
        FlowType::Paybill => 120,
        FlowType::Buygoods => 120,
    }
}

/// Minimum service fee.
const FEE_FLOOR: MicroKes = MicroKes::from_kes_const(5);
/// Flat network fee for payout flows. Onramp carries none.
const NETWORK_FEE: MicroKes = MicroKes::from_kes_const(3);

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub flow_type: FlowType,
    pub amount: f64,
    pub currency: Currency,
    /// Optional exchange-rate override; used only when positive.
    pub kes_per_usd: Option<f64>,
}

pub fn new_quote_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("q_{hex}")
}

/// Price a request and produce a quote that expires `ttl` from now.
pub fn build_quote(
    req: &QuoteRequest,
    default_rate: MicroKes,
    ttl: Duration,
) -> Result<Quote, ValidationError> {
    if !req.amount.is_finite() || req.amount <= 0.0 {
        return Err(ValidationError(format!("Invalid amount: {}", req.amount)));
    }
    let rate = match req.kes_per_usd {
        Some(r) if r.is_finite() && r > 0.0 => {
            MicroKes::try_from_f64(r).map_err(|e| ValidationError(e.to_string()))?
        },
        Some(r) if !r.is_finite() => {
            return Err(ValidationError(format!("Invalid exchange rate: {r}")));
        },
        _ => default_rate,
    };
    if !rate.is_positive() {
        return Err(ValidationError(format!("Invalid exchange rate: {rate}")));
    }

    let (amount_requested, amount_kes, amount_usd) = match req.currency {
        Currency::Kes => {
            let kes = MicroKes::try_from_f64(req.amount)
                .map_err(|e| ValidationError(e.to_string()))?
                .round2();
            let usd = kes.to_usd(rate).map_err(|e| ValidationError(e.to_string()))?;
            (kes.value(), kes, usd)
        },
        Currency::Usd => {
            let usd = MicroUsd::try_from_f64(req.amount).map_err(|e| ValidationError(e.to_string()))?;
            let kes = usd.to_kes(rate).map_err(|e| ValidationError(e.to_string()))?;
            (usd.value(), kes, usd)
        },
    };

    let fee_kes = amount_kes.bps(fee_basis_points(req.flow_type)).max(FEE_FLOOR);
    let network_fee_kes =
        if req.flow_type == FlowType::Onramp { MicroKes::default() } else { NETWORK_FEE };
    let total_debit_kes = amount_kes + fee_kes + network_fee_kes;

    let snapshot_at = Utc::now();
    let quote = Quote {
        quote_id: new_quote_id(),
        currency: req.currency,
        amount_requested,
        amount_kes,
        amount_usd,
        rate_kes_per_usd: rate,
        fee_kes,
        network_fee_kes,
        total_debit_kes,
        expected_receive_kes: amount_kes,
        expires_at: snapshot_at + ttl,
        snapshot_at,
    };
    trace!(
        "💱️ Quote {} built for {} {}: {} + {} fee + {} network = {} debit",
        quote.quote_id,
        req.flow_type,
        amount_kes,
        amount_kes,
        fee_kes,
        network_fee_kes,
        total_debit_kes
    );
    Ok(quote)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rate(kes: i64) -> MicroKes {
        MicroKes::from_kes(kes)
    }

    #[test]
    fn kes_onramp_quote() {
        let req = QuoteRequest {
            flow_type: FlowType::Onramp,
            amount: 1000.0,
            currency: Currency::Kes,
            kes_per_usd: None,
        };
        let q = build_quote(&req, rate(130), Duration::seconds(120)).unwrap();
        assert_eq!(q.amount_kes, MicroKes::from_kes(1000));
        assert_eq!(q.amount_usd.format_6dp(), "7.690000");
        assert_eq!(q.fee_kes, MicroKes::from_kes(13));
        assert_eq!(q.network_fee_kes, MicroKes::default());
        assert_eq!(q.total_debit_kes, MicroKes::from_kes(1013));
        assert_eq!(q.expected_receive_kes, MicroKes::from_kes(1000));
        let ttl = (q.expires_at - q.snapshot_at).num_milliseconds();
        assert!((ttl - 120_000).abs() < 1000, "ttl was {ttl}ms");
    }

    #[test]
    fn usd_offramp_quote_with_rate_override() {
        let req = QuoteRequest {
            flow_type: FlowType::Offramp,
            amount: 10.0,
            currency: Currency::Usd,
            kes_per_usd: Some(155.0),
        };
        let q = build_quote(&req, rate(130), Duration::seconds(300)).unwrap();
        assert_eq!(q.amount_usd, MicroUsd::from_usd(10));
        assert_eq!(q.amount_kes, MicroKes::from_kes(1550));
        // max(5, 1550 * 0.018) = 27.90
        assert_eq!(q.fee_kes, MicroKes::from(27_900_000));
        assert_eq!(q.network_fee_kes, MicroKes::from_kes(3));
        assert_eq!(q.total_debit_kes.format_2dp(), "1580.90");
        assert_eq!(q.expected_receive_kes, MicroKes::from_kes(1550));
    }

    #[test]
    fn fee_floor_applies_to_small_amounts() {
        let req = QuoteRequest {
            flow_type: FlowType::Paybill,
            amount: 100.0,
            currency: Currency::Kes,
            kes_per_usd: None,
        };
        // 100 KES * 120bps = 1.20, floored to 5
        let q = build_quote(&req, rate(130), Duration::seconds(300)).unwrap();
        assert_eq!(q.fee_kes, MicroKes::from_kes(5));
        assert_eq!(q.total_debit_kes, MicroKes::from_kes(108));
    }

    #[test]
    fn invalid_amounts_are_rejected() {
        for amount in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let req = QuoteRequest {
                flow_type: FlowType::Offramp,
                amount,
                currency: Currency::Kes,
                kes_per_usd: None,
            };
            assert!(build_quote(&req, rate(130), Duration::seconds(300)).is_err(), "{amount} accepted");
        }
    }

    #[test]
    fn non_positive_rate_override_falls_back_to_config() {
        let req = QuoteRequest {
            flow_type: FlowType::Offramp,
            amount: 130.0,
            currency: Currency::Kes,
            kes_per_usd: Some(-1.0),
        };
        let q = build_quote(&req, rate(130), Duration::seconds(300)).unwrap();
        assert_eq!(q.rate_kes_per_usd, rate(130));
        assert_eq!(q.amount_usd, MicroUsd::from_usd(1));
    }

    #[test]
    fn quote_ids_are_opaque_and_unique() {
        let a = new_quote_id();
        let b = new_quote_id();
        assert_ne!(a, b);
        assert!(a.starts_with("q_"));
        assert_eq!(a.len(), 2 + 32);
    }
}
