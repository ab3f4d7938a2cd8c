/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Intent ledger and transaction manager.
//!
//! Intents are immutable once accepted: submission validates the envelope
//! (non-empty rationale and provenance, confidence in range) and files it
//! under a fresh UUID. The confidence gate itself is a pure function — the
//! cluster-wide halt it can trigger is orchestrated by the tool surface.
//!
//! Transactions: many may be open, at most one is *active* (stamped onto
//! outgoing engine calls and journal entries). A background sweep aborts
//! anything older than the transaction deadline.

use crate::contract::{IntentEnvelope, Transaction, TxStatus};
use crate::error::KernelError;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Confidence below this halts every engine for human review.
pub const CONFIDENCE_FLOOR: f64 = 0.8;

/// Open transactions older than this are force-aborted by the sweep.
pub const TX_DEADLINE_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Intent ledger
// ---------------------------------------------------------------------------

/// Outcome of the confidence gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Allow,
    HumanInterventionRequired,
}

/// Pure confidence gate over a stored envelope.
pub fn confidence_gate(envelope: &IntentEnvelope) -> ValidationOutcome {
    if envelope.confidence < CONFIDENCE_FLOOR {
        ValidationOutcome::HumanInterventionRequired
    } else {
        ValidationOutcome::Allow
    }
}

pub struct IntentLedger {
    intents: Mutex<HashMap<String, IntentEnvelope>>,
}

impl IntentLedger {
    pub fn new() -> Self {
        Self {
            intents: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and file an envelope, returning its fresh id.
    pub fn submit(&self, envelope: IntentEnvelope) -> Result<String, KernelError> {
        if envelope.rationale.trim().is_empty() {
            return Err(KernelError::PolicyViolation("RATIONALE_REQUIRED".to_string()));
        }
        if envelope.provenance.trim().is_empty() {
            return Err(KernelError::PolicyViolation("PROVENANCE_REQUIRED".to_string()));
        }
        if !(0.0..=1.0).contains(&envelope.confidence) {
            return Err(KernelError::PolicyViolation("INVALID_CONFIDENCE".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        self.intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), envelope);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<IntentEnvelope> {
        self.intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.intents.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IntentLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Transaction manager
// ---------------------------------------------------------------------------

pub struct TransactionManager {
    transactions: Mutex<HashMap<String, Transaction>>,
    /// Shared with the signed client, which stamps the active id onto
    /// outgoing calls.
    active: Arc<Mutex<Option<Transaction>>>,
    audit_command: Vec<String>,
}

impl TransactionManager {
    /// `active` is the shared active-transaction slot; `audit_command` is
    /// the external mechanical audit run at commit (empty = none
    /// configured, commit proceeds on proof of work alone).
    pub fn new(active: Arc<Mutex<Option<Transaction>>>, audit_command: Vec<String>) -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            active,
            audit_command,
        }
    }

    /// Open a transaction for `intent_id` and make it the active one,
    /// overwriting any prior active slot.
    pub fn begin(&self, intent_id: &str) -> Transaction {
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            intent_id: intent_id.to_string(),
            start_time: Utc::now(),
            status: TxStatus::Open,
        };
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(intent_id.to_string(), tx.clone());
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx.clone());
        tx
    }

    /// Commit: mechanical audit first, then the proof-of-work check, then
    /// removal. Both failure modes leave the transaction open.
    pub async fn commit(
        &self,
        intent_id: &str,
        proof_of_work: Option<&str>,
        _reason: &str,
    ) -> Result<(), KernelError> {
        {
            let transactions = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
            if !transactions.contains_key(intent_id) {
                return Err(KernelError::Unknown(format!(
                    "no open transaction for intent '{intent_id}'"
                )));
            }
        }

        self.run_mechanical_audit().await?;

        match proof_of_work {
            Some(proof) if !proof.trim().is_empty() => {}
            _ => {
                return Err(KernelError::PolicyViolation(
                    "PROOF_OF_WORK_REQUIRED".to_string(),
                ))
            }
        }

        self.remove(intent_id);
        Ok(())
    }

    /// Unconditionally remove the transaction and clear the active slot.
    pub fn abort(&self, intent_id: &str) {
        self.remove(intent_id);
    }

    fn remove(&self, intent_id: &str) {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(intent_id);
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn find(&self, intent_id: &str) -> Option<Transaction> {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(intent_id)
            .cloned()
    }

    pub fn active_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.id.clone())
    }

    pub fn open_count(&self) -> usize {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Collect and drop every transaction past the deadline, clearing the
    /// active slot if it pointed at one of them. The caller broadcasts the
    /// rollback and journals each abort.
    pub fn sweep_expired(&self) -> Vec<Transaction> {
        let deadline = Utc::now() - Duration::seconds(TX_DEADLINE_SECS);
        let mut transactions = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
        let expired_keys: Vec<String> = transactions
            .iter()
            .filter(|(_, tx)| tx.start_time < deadline)
            .map(|(k, _)| k.clone())
            .collect();

        let mut expired = Vec::new();
        for key in expired_keys {
            if let Some(mut tx) = transactions.remove(&key) {
                tx.status = TxStatus::Aborted;
                expired.push(tx);
            }
        }
        if !expired.is_empty() {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ref current) = *active {
                if expired.iter().any(|tx| tx.id == current.id) {
                    *active = None;
                }
            }
        }
        expired
    }

    /// Run the external mechanical audit. Spawn failure and non-zero exit
    /// are both fatal to the enclosing commit.
    async fn run_mechanical_audit(&self) -> Result<(), KernelError> {
        if self.audit_command.is_empty() {
            return Ok(());
        }
        let output = tokio::process::Command::new(&self.audit_command[0])
            .args(&self.audit_command[1..])
            .output()
            .await
            .map_err(|e| {
                KernelError::EngineError(format!("mechanical audit spawn failed: {e}"))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().rev().take(200).collect::<String>();
            let tail: String = tail.chars().rev().collect();
            return Err(KernelError::EngineError(format!(
                "mechanical audit rejected commit: {tail}"
            )));
        }
        Ok(())
    }
}
