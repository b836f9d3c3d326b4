//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in satoshi) is valid.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Renders an amount as a decimal coin string with up to eight fraction digits.
pub fn format_amount(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let coin = COIN as u64;
    let whole = abs / coin;
    let frac = abs % coin;
    if frac == 0 {
        return format!("{sign}{whole}");
    }
    let digits = format!("{frac:08}");
    format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
}
