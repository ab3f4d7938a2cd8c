/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Monotonic id issuer.
//!
//! One mutex-serialized counter hands out the strictly increasing ids that
//! order journal entries and engine calls. On startup the counter is seeded
//! from the highest id observed in the external audit log so a restarted
//! kernel never reissues an id.

use std::sync::Mutex;

/// Strictly increasing id source, serialized by an internal mutex.
pub struct MonotonicClock {
    counter: Mutex<u64>,
}

impl MonotonicClock {
    /// Start counting from zero; the first id issued is 1.
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
        }
    }

    /// Start counting above an externally observed id.
    pub fn seeded(last_observed: u64) -> Self {
        Self {
            counter: Mutex::new(last_observed),
        }
    }

    /// Issue the next id.
    pub fn next_id(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        *counter += 1;
        *counter
    }

    /// Last id issued (0 if none yet).
    pub fn current(&self) -> u64 {
        *self.counter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raise the floor to `last_observed` if it is ahead of the counter.
    /// Used when re-discovery finds the external audit log has advanced.
    pub fn advance_to(&self, last_observed: u64) {
        let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        if last_observed > *counter {
            *counter = last_observed;
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Current Unix time in whole seconds.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current time as an RFC 3339 string (the wire timestamp form).
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
