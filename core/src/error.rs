/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Kernel error taxonomy.
//!
//! Every failure surfaced by the tool surface or journaled into the WAL is
//! one of these kinds. Display forms use the wire-stable SCREAMING codes the
//! engines and forensic tooling key on.

use crate::contract::FailureClass;

/// Which invariant gate rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantKind {
    Entropy,
    Idempotency,
}

/// Error kind for every governed operation in the kernel.
#[derive(Debug, Clone)]
pub enum KernelError {
    /// Handshake or signature verification failed.
    AuthFailed(String),
    /// Global per-target request ceiling hit.
    RateLimit { target: String },
    /// Sub-200 ms mutation burst tripped the adaptive limiter.
    RateLimitedAdaptive { target: String },
    /// A live HUMAN_ACTIVE lock covers the named object.
    Locked { uuid: String },
    /// Target engine is quarantined and the call is not read-only.
    Quarantined { target: String },
    /// Target engine's trust window has lapsed without a heartbeat.
    Expired { target: String },
    /// Payload matched the static denylist.
    SecurityViolation(String),
    /// NaN or non-finite values in a payload.
    NumericalInstability(String),
    /// An invariant gate (entropy budget or idempotency ledger) rejected.
    InvariantViolation { kind: InvariantKind, detail: String },
    /// Governance policy refused the call (missing rationale, human lock
    /// escalation, revoked id, permission mask).
    PolicyViolation(String),
    /// Expected and observed state hashes disagree.
    HashMismatch { expected: String, observed: String },
    /// Engine state diverged from the registry (generation or state hash).
    Drift(String),
    /// A deadline elapsed.
    Timeout(String),
    /// The engine returned an error or was unreachable after retries.
    EngineError(String),
    Unknown(String),
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::AuthFailed(msg) => write!(f, "AUTH_FAILED: {msg}"),
            KernelError::RateLimit { target } => write!(f, "RATE_LIMIT: {target}"),
            KernelError::RateLimitedAdaptive { target } => {
                write!(f, "RATE_LIMITED_ADAPTIVE: {target}")
            }
            KernelError::Locked { uuid } => write!(f, "WAIT_HUMAN_LOCK: {uuid}"),
            KernelError::Quarantined { target } => write!(f, "QUARANTINED: {target}"),
            KernelError::Expired { target } => write!(f, "TRUST_EXPIRED: {target}"),
            KernelError::SecurityViolation(msg) => write!(f, "SECURITY_VIOLATION: {msg}"),
            KernelError::NumericalInstability(msg) => {
                write!(f, "NUMERICAL_INSTABILITY: {msg}")
            }
            KernelError::InvariantViolation { kind, detail } => {
                let which = match kind {
                    InvariantKind::Entropy => "entropy",
                    InvariantKind::Idempotency => "idempotency",
                };
                write!(f, "INVARIANT_VIOLATION ({which}): {detail}")
            }
            KernelError::PolicyViolation(msg) => write!(f, "POLICY_VIOLATION: {msg}"),
            KernelError::HashMismatch { expected, observed } => {
                write!(f, "HASH_MISMATCH: expected {expected}, observed {observed}")
            }
            KernelError::Drift(msg) => write!(f, "DRIFT_DETECTED: {msg}"),
            KernelError::Timeout(msg) => write!(f, "TIMEOUT: {msg}"),
            KernelError::EngineError(msg) => write!(f, "ENGINE_ERROR | {msg}"),
            KernelError::Unknown(msg) => write!(f, "UNKNOWN: {msg}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl KernelError {
    /// Whether the signed client may retry this failure on its backoff
    /// schedule. Everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KernelError::EngineError(_) | KernelError::Timeout(_))
    }

    /// Map to the coarse failure class recorded in journal entries.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            KernelError::SecurityViolation(_)
            | KernelError::PolicyViolation(_)
            | KernelError::Locked { .. } => FailureClass::PolicyViolationRisk,
            KernelError::HashMismatch { .. } | KernelError::Drift(_) => {
                FailureClass::AssetMismatch
            }
            KernelError::Quarantined { .. }
            | KernelError::Expired { .. }
            | KernelError::AuthFailed(_) => FailureClass::InvalidState,
            KernelError::NumericalInstability(_) | KernelError::InvariantViolation { .. } => {
                FailureClass::InvalidState
            }
            KernelError::RateLimit { .. } | KernelError::RateLimitedAdaptive { .. } => {
                FailureClass::ToolUnavailable
            }
            KernelError::Timeout(_) | KernelError::EngineError(_) => {
                FailureClass::DependencyMissing
            }
            KernelError::Unknown(_) => FailureClass::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_codes_are_wire_stable() {
        assert_eq!(
            KernelError::SecurityViolation("os.system".to_string()).to_string(),
            "SECURITY_VIOLATION: os.system"
        );
        assert_eq!(
            KernelError::RateLimitedAdaptive {
                target: "editor".to_string()
            }
            .to_string(),
            "RATE_LIMITED_ADAPTIVE: editor"
        );
        assert_eq!(
            KernelError::Locked {
                uuid: "u-9".to_string()
            }
            .to_string(),
            "WAIT_HUMAN_LOCK: u-9"
        );
        assert!(
            KernelError::EngineError("connection refused".to_string())
                .to_string()
                .starts_with("ENGINE_ERROR | ")
        );
    }

    #[test]
    fn test_invariant_display_names_kind() {
        let err = KernelError::InvariantViolation {
            kind: InvariantKind::Idempotency,
            detail: "key reused".to_string(),
        };
        assert!(err.to_string().contains("(idempotency)"));
    }

    #[test]
    fn test_retryable_split() {
        assert!(KernelError::EngineError("busy".to_string()).is_retryable());
        assert!(KernelError::Timeout("verify".to_string()).is_retryable());
        assert!(!KernelError::SecurityViolation("eval(".to_string()).is_retryable());
        assert!(
            !KernelError::RateLimitedAdaptive {
                target: "dcc".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_failure_class_mapping() {
        assert_eq!(
            KernelError::HashMismatch {
                expected: "a".to_string(),
                observed: "b".to_string()
            }
            .failure_class(),
            FailureClass::AssetMismatch
        );
        assert_eq!(
            KernelError::PolicyViolation("rationale".to_string()).failure_class(),
            FailureClass::PolicyViolationRisk
        );
        assert_eq!(
            KernelError::Unknown("?".to_string()).failure_class(),
            FailureClass::Unknown
        );
    }
}
