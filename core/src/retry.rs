/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Retry schedule for engine calls.
//!
//! Backoff math and the engine-busy sentinel policy live here; the signed
//! client drives the actual loop. Two distinct delays exist on purpose: the
//! exponential schedule covers transport failures, while the busy sentinel
//! (an engine mid-compile) waits a flat two seconds and does NOT consume an
//! attempt from the schedule.

/// Sentinel body an engine returns while compiling or reimporting.
pub const ENGINE_BUSY_SENTINEL: &str = "Engine Busy: Compiling or Updating";

/// Flat delay before retrying a busy engine.
pub const BUSY_RETRY_DELAY_MS: u64 = 2_000;

/// Retry schedule configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first try.
    pub max_attempts: u32,
    /// Base delay doubled on each failed attempt.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

/// Delay before retrying after failed attempt `attempt` (0-indexed):
/// `min(base · 2^attempt, max)`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    base.min(config.max_delay_ms)
}

/// Whether an engine response body is the busy sentinel.
pub fn is_busy_response(body: &serde_json::Value) -> bool {
    body.get("error").and_then(|v| v.as_str()) == Some(ENGINE_BUSY_SENTINEL)
}
