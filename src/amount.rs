//! Base-unit integer amounts: decimal string parsing/formatting, and
//! basis-point revenue-distribution arithmetic.
//!
//! All monetary quantities are non-negative, unbounded-in-practice integers
//! in a token's smallest base unit (sats for the native coin; fungible-token
//! decimals are queried at runtime). [`U256`] from `alloy-primitives` backs
//! every amount so a single token with up to 30 fractional digits never
//! overflows.

use alloy_primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors converting between decimal strings and base-unit amounts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("not a well-formed decimal string: {0}")]
    InvalidFormat(String),
    #[error("fractional part has more digits than the token supports ({digits} > {decimals})")]
    TooManyFractionalDigits { digits: u32, decimals: u32 },
    #[error("amount underflow: {0}")]
    Underflow(String),
    #[error("amount overflow: {0}")]
    Overflow(String),
}

static DECIMAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)(?:\.(\d+))?$").expect("regex"));

/// Parses a decimal string `"W.F"` into `W*10^d + pad(F, d)` base units.
///
/// `decimals` is the token's base-unit exponent (0..=30). Fails if the
/// fractional part carries more digits than `decimals` allows, or if the
/// input isn't a well-formed non-negative decimal.
pub fn parse_units(s: &str, decimals: u32) -> Result<U256, AmountError> {
    let caps = DECIMAL_RE
        .captures(s.trim())
        .ok_or_else(|| AmountError::InvalidFormat(s.to_string()))?;
    let whole = &caps[1];
    let frac = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    if frac.len() as u32 > decimals {
        return Err(AmountError::TooManyFractionalDigits {
            digits: frac.len() as u32,
            decimals,
        });
    }

    let whole_units = U256::from_str_radix(whole, 10)
        .map_err(|_| AmountError::InvalidFormat(s.to_string()))?
        * pow10(decimals);

    let padded_frac = format!("{frac:0<width$}", width = decimals as usize);
    let frac_units = if padded_frac.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(&padded_frac, 10)
            .map_err(|_| AmountError::InvalidFormat(s.to_string()))?
    };

    Ok(whole_units + frac_units)
}

/// Formats a base-unit amount back to a decimal string, trimming trailing
/// fractional zeros (and the decimal point itself when the result is whole).
pub fn format_units(amount: U256, decimals: u32) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let divisor = pow10(decimals);
    let whole = amount / divisor;
    let frac = amount % divisor;
    let frac_str = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    let trimmed = frac_str.trim_end_matches('0');
    if trimmed.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{trimmed}")
    }
}

fn pow10(exp: u32) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Subtracts `rhs` from `lhs`, returning [`AmountError::Underflow`] instead
/// of silently wrapping. Every amount subtraction in this crate goes through
/// this helper.
pub fn checked_sub(lhs: U256, rhs: U256, context: &str) -> Result<U256, AmountError> {
    lhs.checked_sub(rhs)
        .ok_or_else(|| AmountError::Underflow(context.to_string()))
}

/// Adds `lhs` and `rhs`, returning [`AmountError::Overflow`] instead of
/// silently wrapping.
pub fn checked_add(lhs: U256, rhs: U256, context: &str) -> Result<U256, AmountError> {
    lhs.checked_add(rhs)
        .ok_or_else(|| AmountError::Overflow(context.to_string()))
}

/// One recipient of a basis-point revenue split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpsRecipient<K> {
    pub key: K,
    pub bps: u32,
}

/// Splits `balance` across `recipients` by basis points of `total_bps`.
///
/// Every recipient but the last gets `floor(balance * bps / total_bps)`;
/// the *last* recipient absorbs the remainder so shares always sum exactly
/// to `balance` with no rounding leakage. Returns `None` (the whole
/// distribution is disabled) when the recipients' bps don't sum to
/// `total_bps`, when there are no recipients, or when `total_bps == 0`.
/// Recipients whose computed share is zero are dropped from the result.
pub fn split_by_bps<K: Clone>(
    balance: U256,
    total_bps: u32,
    recipients: &[BpsRecipient<K>],
) -> Option<Vec<(K, U256)>> {
    if total_bps == 0 || recipients.is_empty() {
        return None;
    }
    let sum: u64 = recipients.iter().map(|r| r.bps as u64).sum();
    if sum != total_bps as u64 {
        return None;
    }

    let total_bps_u256 = U256::from(total_bps);
    let mut shares = Vec::with_capacity(recipients.len());
    let mut distributed = U256::ZERO;
    let last_index = recipients.len() - 1;

    for (i, r) in recipients.iter().enumerate() {
        let share = if i == last_index {
            balance - distributed
        } else {
            let share = balance * U256::from(r.bps) / total_bps_u256;
            distributed += share;
            share
        };
        if !share.is_zero() {
            shares.push((r.key.clone(), share));
        }
    }

    Some(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_format_round_trip() {
        for (s, d) in [("0", 0u32), ("1.5", 8), ("123.000456", 6), ("0.1", 30)] {
            let units = parse_units(s, d).unwrap();
            let formatted = format_units(units, d);
            let reparsed = parse_units(&formatted, d).unwrap();
            assert_eq!(units, reparsed);
        }
    }

    #[test]
    fn format_trims_trailing_zeros() {
        let units = parse_units("1.500000", 8).unwrap();
        assert_eq!(format_units(units, 8), "1.5");
    }

    #[test]
    fn format_whole_number_has_no_dot() {
        let units = parse_units("42", 8).unwrap();
        assert_eq!(format_units(units, 8), "42");
    }

    #[test]
    fn rejects_too_many_fractional_digits() {
        assert!(matches!(
            parse_units("1.123", 2),
            Err(AmountError::TooManyFractionalDigits { .. })
        ));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(parse_units("-1.5", 8).is_err());
        assert!(parse_units("abc", 8).is_err());
    }

    #[test]
    fn bps_split_last_recipient_absorbs_remainder() {
        // S3: balance=1_000_003, total_bps=10_000, A=6000 B=4000.
        let recipients = vec![
            BpsRecipient { key: "A", bps: 6_000 },
            BpsRecipient { key: "B", bps: 4_000 },
        ];
        let shares = split_by_bps(U256::from(1_000_003u64), 10_000, &recipients).unwrap();
        assert_eq!(shares[0], ("A", U256::from(600_001u64)));
        assert_eq!(shares[1], ("B", U256::from(400_002u64)));
        let total: U256 = shares.iter().fold(U256::ZERO, |acc, (_, v)| acc + v);
        assert_eq!(total, U256::from(1_000_003u64));
    }

    #[test]
    fn bps_split_disabled_on_mismatch() {
        // S4: recipients sum to total_bps - 1.
        let recipients = vec![
            BpsRecipient { key: "A", bps: 6_000 },
            BpsRecipient { key: "B", bps: 3_999 },
        ];
        assert!(split_by_bps(U256::from(1_000_003u64), 10_000, &recipients).is_none());
    }

    #[test]
    fn bps_split_zero_share_recipient_is_dropped() {
        let recipients = vec![
            BpsRecipient { key: "A", bps: 10_000 },
            BpsRecipient { key: "B", bps: 0 },
        ];
        let shares = split_by_bps(U256::from(100u64), 10_000, &recipients).unwrap();
        assert_eq!(shares, vec![("A", U256::from(100u64))]);
    }

    proptest! {
        #[test]
        fn bps_split_sums_exactly(balance in 0u64..=1_000_000_000u64) {
            let recipients = vec![
                BpsRecipient { key: 0u8, bps: 6_000 },
                BpsRecipient { key: 1u8, bps: 3_000 },
                BpsRecipient { key: 2u8, bps: 1_000 },
            ];
            if let Some(shares) = split_by_bps(U256::from(balance), 10_000, &recipients) {
                let total: U256 = shares.iter().fold(U256::ZERO, |acc, (_, v)| acc + v);
                prop_assert_eq!(total, U256::from(balance));
            }
        }

        #[test]
        fn parse_units_format_units_round_trip(units in 0u128..u128::MAX, decimals in 0u32..=30u32) {
            // Invariant 2 (spec §8): parse_units(format_units(n, d), d) = n.
            let amount = U256::from(units);
            let formatted = format_units(amount, decimals);
            prop_assert_eq!(parse_units(&formatted, decimals).unwrap(), amount);
        }
    }
}
