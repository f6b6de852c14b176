//! Price & fee engine.
//!
//! All money is integer: USD in micro-USD (1 USD = 1 000 000), native amounts
//! in each asset's smallest unit, prices in micro-USD per whole unit. Oracle
//! floats are converted once at the cache boundary.

mod cache;
mod fees;

pub use cache::{PriceCache, PriceOracle, PriceSnapshot};
pub use fees::{allocations, compute_fees, FeeBreakdown, FeeComponents, FeeEngine, FeeRequest};

/// Micro-USD per USD.
pub const MICRO_USD: u64 = 1_000_000;

/// Integer division rounding up.
pub fn ceil_div(numerator: u128, denominator: u128) -> u128 {
    numerator.div_ceil(denominator)
}

/// Convert an oracle price (USD per whole unit) to micro-USD, rejecting
/// non-positive and non-finite values.
pub fn usd_price_to_micro(price: f64) -> Option<u64> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let micro = (price * MICRO_USD as f64).round();
    (micro >= 1.0 && micro < u64::MAX as f64).then_some(micro as u64)
}

/// Native amount worth `usd_micro` at `price_micro` per whole unit (rounded down).
pub fn usd_to_native(usd_micro: u64, price_micro: u64, decimals: u8) -> u64 {
    if price_micro == 0 {
        return 0;
    }
    let scale = 10u128.pow(decimals as u32);
    let native = usd_micro as u128 * scale / price_micro as u128;
    native.min(u64::MAX as u128) as u64
}

/// USD value of a native amount (rounded up, so costs are never understated).
pub fn native_to_usd_ceil(native: u64, price_micro: u64, decimals: u8) -> u64 {
    let scale = 10u128.pow(decimals as u32);
    ceil_div(native as u128 * price_micro as u128, scale).min(u64::MAX as u128) as u64
}

/// `amount * bps / 10 000`, rounded up.
pub fn bps_ceil(amount: u64, bps: u64) -> u64 {
    ceil_div(amount as u128 * bps as u128, crate::types::BPS_DENOMINATOR as u128) as u64
}

/// Format micro-USD as dollars and cents.
pub fn format_usd(micro_usd: u64) -> String {
    format!(
        "${}.{:02}",
        micro_usd / MICRO_USD,
        (micro_usd % MICRO_USD) / 10_000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_conversion() {
        assert_eq!(usd_price_to_micro(150.0), Some(150_000_000));
        assert_eq!(usd_price_to_micro(0.00002), Some(20));
        assert_eq!(usd_price_to_micro(0.0), None);
        assert_eq!(usd_price_to_micro(f64::NAN), None);
        assert_eq!(usd_price_to_micro(-3.0), None);
    }

    #[test]
    fn test_usd_native_round_trip_bounds() {
        // $50 of SOL at $150
        let lamports = usd_to_native(50_000_000, 150_000_000, 9);
        assert_eq!(lamports, 333_333_333);
        // Converting back never overstates by more than one micro-dollar.
        let usd = native_to_usd_ceil(lamports, 150_000_000, 9);
        assert!(usd <= 50_000_000 && 50_000_000 - usd <= 1);
    }

    #[test]
    fn test_native_to_usd_rounds_up() {
        assert_eq!(native_to_usd_ceil(1, 150_000_000, 9), 1);
        assert_eq!(native_to_usd_ceil(905_880, 150_000_000, 9), 135_882);
    }

    #[test]
    fn test_bps_ceil() {
        assert_eq!(bps_ceil(100, 450), 5);
        assert_eq!(bps_ceil(30_000_000, 50), 150_000);
        assert_eq!(bps_ceil(0, 450), 0);
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(50_000_000), "$50.00");
        assert_eq!(format_usd(1_234_567), "$1.23");
        assert_eq!(format_usd(0), "$0.00");
    }
}
