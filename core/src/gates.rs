/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Invariant gates — entropy budget, idempotency ledger, numerical safety.
//!
//! Gates compose in a fixed order (audit → numerical → idempotency →
//! entropy) and the first failure short-circuits. The audit gate lives in
//! `sanitizer`; this module owns the stateful two and the float check.

use crate::contract::EntropyBudget;
use crate::error::{InvariantKind, KernelError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

// ── Entropy budget ─────────────────────────────────────────────────

/// Session-wide mutation allowance. Every mutation spends one unit; once
/// `used` reaches `limit`, every further mutation fails.
pub struct EntropyGate {
    budget: Mutex<EntropyBudget>,
}

impl EntropyGate {
    pub fn new(limit: u64) -> Self {
        Self {
            budget: Mutex::new(EntropyBudget { limit, used: 0 }),
        }
    }

    /// Atomically spend one unit of entropy.
    pub fn check(&self) -> Result<(), KernelError> {
        let mut budget = self.budget.lock().unwrap_or_else(|e| e.into_inner());
        if budget.used >= budget.limit {
            return Err(KernelError::InvariantViolation {
                kind: InvariantKind::Entropy,
                detail: format!("budget exhausted ({}/{})", budget.used, budget.limit),
            });
        }
        budget.used += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> EntropyBudget {
        *self.budget.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Idempotency ledger ─────────────────────────────────────────────

/// Key → canonical payload hash. Once a key is seen, any later arrival with
/// a different hash is an invariant breach; the same hash is a no-op replay.
pub struct IdempotencyLedger {
    seen: Mutex<HashMap<String, String>>,
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Check `key` against `payload_hash`, storing it on first sight.
    /// An empty key skips the check entirely.
    pub fn check(&self, key: &str, payload_hash: &str) -> Result<(), KernelError> {
        if key.is_empty() {
            return Ok(());
        }
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        match seen.get(key) {
            Some(stored) if stored != payload_hash => Err(KernelError::InvariantViolation {
                kind: InvariantKind::Idempotency,
                detail: format!("key '{key}' replayed with a different payload"),
            }),
            Some(_) => Ok(()),
            None => {
                seen.insert(key.to_string(), payload_hash.to_string());
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical payload hash used as the idempotency fingerprint.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ── Numerical safety ───────────────────────────────────────────────

/// Reject NaN and non-finite values before they can reach an engine.
pub fn check_numerical(values: &[f64]) -> Result<(), KernelError> {
    for v in values {
        if v.is_nan() || v.is_infinite() {
            return Err(KernelError::NumericalInstability(format!(
                "non-finite component: {v}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entropy_spends_until_limit() {
        let gate = EntropyGate::new(3);
        assert!(gate.check().is_ok());
        assert!(gate.check().is_ok());
        assert!(gate.check().is_ok());
        let err = gate.check().unwrap_err();
        assert!(matches!(
            err,
            KernelError::InvariantViolation {
                kind: InvariantKind::Entropy,
                ..
            }
        ));
        // Used never exceeds limit, and every further mutation fails.
        assert_eq!(gate.snapshot().used, 3);
        assert!(gate.check().is_err());
        assert_eq!(gate.snapshot().used, 3);
    }

    #[test]
    fn test_entropy_snapshot_tracks_usage() {
        let gate = EntropyGate::new(10);
        gate.check().unwrap();
        gate.check().unwrap();
        let snap = gate.snapshot();
        assert_eq!(snap.limit, 10);
        assert_eq!(snap.used, 2);
    }

    #[test]
    fn test_idempotency_same_key_same_payload_replays() {
        let ledger = IdempotencyLedger::new();
        let hash = payload_hash(&json!({"op": "scale", "factor": 2.0}));
        assert!(ledger.check("k-1", &hash).is_ok());
        assert!(ledger.check("k-1", &hash).is_ok());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_idempotency_same_key_different_payload_fails() {
        let ledger = IdempotencyLedger::new();
        let h1 = payload_hash(&json!({"op": "scale"}));
        let h2 = payload_hash(&json!({"op": "delete"}));
        assert!(ledger.check("k-1", &h1).is_ok());
        let err = ledger.check("k-1", &h2).unwrap_err();
        assert!(matches!(
            err,
            KernelError::InvariantViolation {
                kind: InvariantKind::Idempotency,
                ..
            }
        ));
    }

    #[test]
    fn test_idempotency_empty_key_skips() {
        let ledger = IdempotencyLedger::new();
        assert!(ledger.check("", "a").is_ok());
        assert!(ledger.check("", "b").is_ok());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_payload_hash_canonical() {
        let a = payload_hash(&json!({"x": 1}));
        let b = payload_hash(&json!({"x": 1}));
        let c = payload_hash(&json!({"x": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_numerical_rejects_nan_and_inf() {
        assert!(check_numerical(&[1.0, f64::NAN, 0.0]).is_err());
        assert!(check_numerical(&[f64::INFINITY]).is_err());
        assert!(check_numerical(&[f64::NEG_INFINITY]).is_err());
    }

    #[test]
    fn test_numerical_accepts_finite() {
        assert!(check_numerical(&[0.0, -1.5, 1e300, f64::MIN_POSITIVE]).is_ok());
        assert!(check_numerical(&[]).is_ok());
    }
}
