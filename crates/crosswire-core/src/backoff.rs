//! Reconnect delay schedule.
//!
//! Exponential growth from a base delay, clamped at a ceiling. No jitter is
//! applied, so the schedule is fully deterministic.
//!
//! TODO: add optional jitter if synchronized reconnect storms across many
//! clients ever become a problem in practice.

/// Delay before retry attempt `attempt` (1-based), in milliseconds.
///
/// Formula: `base_delay_ms * 2^(attempt - 1)`, clamped to `max_delay_ms`.
/// Attempt 0 is treated as attempt 1.
#[must_use]
pub fn reconnect_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(31);
    base_delay_ms
        .saturating_mul(1u64 << shift)
        .min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
