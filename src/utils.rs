//! Utility functions for address, gas and retry handling.
//!
//! This module provides helper functions for:
//! - Checksum address validation
//! - Gas price and gas limit arithmetic
//! - Retry backoff calculation

use std::time::Duration;

use alloy::primitives::Address;

use crate::error::{Result, WalletError};

/// Standard gas limit for basic native transfer transactions
pub const GAS_LIMIT: u64 = 21000;

/// Extra gas price applied on each broadcast retry, in percent of the base price.
pub const RETRY_GAS_BUMP_PCT: u64 = 30;

/// Gas price bump used to replace a pending transaction whose price is known.
pub const REPLACEMENT_BUMP_PCT: u64 = 120;

/// Gas price multiplier used to replace a pending transaction whose price is unknown.
pub const REPLACEMENT_FALLBACK_PCT: u64 = 300;

/// Parses a user supplied address.
///
/// Mixed-case input must carry a valid EIP-55 checksum. All-lowercase or
/// all-uppercase input has no checksum information and is accepted as is.
///
/// # Returns
/// * `Result<Address>` - The parsed address or a validation error
pub fn parse_address(input: &str) -> Result<Address> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| WalletError::Validation(format!("Address must start with 0x: {}", input)))?;

    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WalletError::Validation(format!(
            "Address must be 20 bytes of hex: {}",
            input
        )));
    }

    let has_lower = hex.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex.chars().any(|c| c.is_ascii_uppercase());

    if has_lower && has_upper {
        Address::parse_checksummed(trimmed, None)
            .map_err(|_| WalletError::Validation(format!("Invalid address checksum: {}", input)))
    } else {
        trimmed
            .parse::<Address>()
            .map_err(|e| WalletError::Validation(format!("Invalid address {}: {}", input, e)))
    }
}

/// Scales `value` by `pct` percent using integer arithmetic.
pub fn apply_pct(value: u128, pct: u64) -> u128 {
    value.saturating_mul(pct as u128) / 100
}

/// Gas price for the given broadcast attempt (1-based): the base price scaled
/// by the policy multiplier, raised by [`RETRY_GAS_BUMP_PCT`] per retry.
pub fn gas_price_for_attempt(base: u128, multiplier_pct: u64, attempt: u32) -> u128 {
    let bump = 100 + RETRY_GAS_BUMP_PCT * u64::from(attempt.saturating_sub(1));
    apply_pct(apply_pct(base, multiplier_pct), bump)
}

/// Gas price needed to replace a pending transaction.
pub fn replacement_gas_price(previous: Option<u128>, current: u128) -> u128 {
    match previous {
        Some(previous) => apply_pct(previous, REPLACEMENT_BUMP_PCT).max(current),
        None => apply_pct(current, REPLACEMENT_FALLBACK_PCT),
    }
}

/// Bounded retry schedule for transient RPC failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to 10% jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt - 1);
        let capped = base_ms.saturating_mul(exponential).min(max_ms);

        let jitter_range = capped / 10;
        let jitter = if jitter_range > 0 {
            rand::random_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped + jitter)
    }
}

/// Serializes any `Display` value as a string.
pub(crate) fn serialize_display<T, S>(value: &T, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    T: std::fmt::Display,
    S: serde::Serializer,
{
    serializer.collect_str(value)
}

/// Same as [`serialize_display`] for optional values.
pub(crate) fn serialize_display_opt<T, S>(
    value: &Option<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    T: std::fmt::Display,
    S: serde::Serializer,
{
    match value {
        Some(value) => serializer.collect_str(value),
        None => serializer.serialize_none(),
    }
}
