/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Engine registry and lifecycle state machine.
//!
//! One record per engine: rotating shared secret, lifecycle state, handshake
//! generation, trust score, and the counters behind the adaptive mutation
//! limiter. Lifecycle moves are expressed as events fed through a pure
//! `transition` function; nothing outside this module assigns states
//! directly (the lone exception is the operator override behind
//! `set_engine_state`, which is deliberately explicit).

use crate::contract::{EngineState, ENGINE_DCC, ENGINE_EDITOR};
use crate::error::KernelError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

/// Bootstrap secrets rotated away by the first handshake.
pub const EDITOR_BOOTSTRAP_TOKEN: &str = "VIBE_EDITOR_BOOTSTRAP_SECRET";
pub const DCC_BOOTSTRAP_TOKEN: &str = "VIBE_DCC_BOOTSTRAP_SECRET";

/// Trust floor below which an engine is quarantined.
pub const QUARANTINE_TRUST_FLOOR: i32 = 20;

/// Mutations closer together than this feed the adaptive limiter.
pub const MUTATION_BURST_WINDOW_MS: i64 = 200;

/// Burst count at which the adaptive limiter trips.
pub const MUTATION_BURST_LIMIT: u32 = 5;

// ---------------------------------------------------------------------------
// EngineRecord
// ---------------------------------------------------------------------------

/// Everything the kernel knows about one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRecord {
    pub token: String,
    pub state: EngineState,
    pub generation: u64,
    pub version: String,
    pub trust_expiry: DateTime<Utc>,
    /// Integer trust in [0, 100], decayed by misbehavior.
    pub trust_score: i32,
    #[serde(default)]
    pub mutation_count: u32,
    /// Unix millis of the last mutation sent to this engine.
    #[serde(default)]
    pub last_mutation_ms: i64,
}

impl EngineRecord {
    fn bootstrap(token: &str) -> Self {
        Self {
            token: token.to_string(),
            state: EngineState::Stopped,
            generation: 0,
            version: String::new(),
            trust_expiry: Utc::now(),
            trust_score: 100,
            mutation_count: 0,
            last_mutation_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle transitions
// ---------------------------------------------------------------------------

/// Events that drive the engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    HandshakeInit,
    ChallengeAccepted,
    TrustCollapsed,
    HeartbeatTimeout,
    GenerationDrift,
    AssetHashMismatch,
    LowConfidenceIntent,
    HumanApproved,
    Decommission,
    OperatorReset,
}

/// Compute the next lifecycle state, or refuse the move.
pub fn transition(
    current: EngineState,
    event: TransitionEvent,
) -> Result<EngineState, KernelError> {
    use EngineState::*;
    use TransitionEvent::*;

    let next = match (current, event) {
        (Stopped, HandshakeInit) => Starting,
        (Starting, ChallengeAccepted) => Running,
        (Running, TrustCollapsed) => Quarantine,
        (Running, HeartbeatTimeout) | (Running, GenerationDrift) => Panic,
        (Running, AssetHashMismatch) => Desync,
        // The confidence gate halts the whole cluster from any state.
        (_, LowConfidenceIntent) => HumanInterventionRequired,
        (HumanInterventionRequired, HumanApproved) => Running,
        (_, Decommission) => Panic,
        // Operator recovery is the only exit from QUARANTINE.
        (_, OperatorReset) => Stopped,
        (state, event) => {
            return Err(KernelError::PolicyViolation(format!(
                "no transition from {state} on {event:?}"
            )))
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// EngineRegistry
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Default)]
struct RegistrySnapshot {
    engines: HashMap<String, EngineRecord>,
    id_map: HashMap<String, String>,
    credits: i64,
}

/// Registry of managed engines plus the session-scoped bookkeeping that
/// persists alongside them (global id map, revocation list, credit balance).
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, EngineRecord>>,
    id_map: Mutex<HashMap<String, String>>,
    revocations: Mutex<HashMap<String, String>>,
    credits: Mutex<i64>,
    state_path: PathBuf,
}

impl EngineRegistry {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let mut engines = HashMap::new();
        engines.insert(
            ENGINE_EDITOR.to_string(),
            EngineRecord::bootstrap(EDITOR_BOOTSTRAP_TOKEN),
        );
        engines.insert(
            ENGINE_DCC.to_string(),
            EngineRecord::bootstrap(DCC_BOOTSTRAP_TOKEN),
        );
        Self {
            engines: RwLock::new(engines),
            id_map: Mutex::new(HashMap::new()),
            revocations: Mutex::new(HashMap::new()),
            credits: Mutex::new(100),
            state_path: state_path.into(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Cloned view of one engine record.
    pub fn snapshot(&self, name: &str) -> Result<EngineRecord, KernelError> {
        self.engines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::Unknown(format!("unknown engine '{name}'")))
    }

    /// Cloned view of every record.
    pub fn snapshot_all(&self) -> HashMap<String, EngineRecord> {
        self.engines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate one record under the write lock.
    pub fn update<F>(&self, name: &str, mutate: F) -> Result<(), KernelError>
    where
        F: FnOnce(&mut EngineRecord),
    {
        let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
        match engines.get_mut(name) {
            Some(record) => {
                mutate(record);
                Ok(())
            }
            None => Err(KernelError::Unknown(format!("unknown engine '{name}'"))),
        }
    }

    /// Feed one lifecycle event to one engine.
    pub fn apply_event(
        &self,
        name: &str,
        event: TransitionEvent,
    ) -> Result<EngineState, KernelError> {
        let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
        let record = engines
            .get_mut(name)
            .ok_or_else(|| KernelError::Unknown(format!("unknown engine '{name}'")))?;
        let next = transition(record.state, event)?;
        record.state = next;
        Ok(next)
    }

    /// Feed one lifecycle event to every engine, skipping records where the
    /// transition is not defined (e.g. approving an engine that never
    /// halted).
    pub fn apply_event_all(&self, event: TransitionEvent) -> Vec<(String, EngineState)> {
        let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
        let mut moved = Vec::new();
        for (name, record) in engines.iter_mut() {
            if let Ok(next) = transition(record.state, event) {
                record.state = next;
                moved.push((name.clone(), next));
            }
        }
        moved.sort_by(|a, b| a.0.cmp(&b.0));
        moved
    }

    /// Operator override used only by `set_engine_state` and `/recover`.
    pub fn force_state(&self, name: &str, state: EngineState) -> Result<(), KernelError> {
        self.update(name, |record| record.state = state)
    }

    /// Decay an engine's trust. Returns `(new_score, quarantined)`; a
    /// running engine whose score falls below the floor is quarantined.
    pub fn decay_trust(&self, name: &str, points: i32) -> Result<(i32, bool), KernelError> {
        let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
        let record = engines
            .get_mut(name)
            .ok_or_else(|| KernelError::Unknown(format!("unknown engine '{name}'")))?;
        record.trust_score = (record.trust_score - points).max(0);
        let mut quarantined = false;
        if record.trust_score < QUARANTINE_TRUST_FLOOR && record.state == EngineState::Running {
            record.state = EngineState::Quarantine;
            quarantined = true;
        }
        Ok((record.trust_score, quarantined))
    }

    /// Push the trust window out by `minutes` from now.
    pub fn extend_trust(&self, name: &str, minutes: i64) -> Result<(), KernelError> {
        self.update(name, |record| {
            record.trust_expiry = Utc::now() + Duration::minutes(minutes);
        })
    }

    /// Adaptive mutation limiter. Mutations arriving inside the burst
    /// window grow the per-engine counter; hitting the limit fails the call
    /// (the caller also decays trust by 5). A gap outside the window resets
    /// the counter.
    pub fn record_mutation(&self, name: &str, now_ms: i64) -> Result<(), KernelError> {
        let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
        let record = engines
            .get_mut(name)
            .ok_or_else(|| KernelError::Unknown(format!("unknown engine '{name}'")))?;
        if now_ms - record.last_mutation_ms < MUTATION_BURST_WINDOW_MS {
            record.mutation_count += 1;
        } else {
            record.mutation_count = 0;
        }
        record.last_mutation_ms = now_ms;
        if record.mutation_count >= MUTATION_BURST_LIMIT {
            return Err(KernelError::RateLimitedAdaptive {
                target: name.to_string(),
            });
        }
        Ok(())
    }

    // ── Global id map / revocations / credits ──────────────────────

    /// Record the editor-GUID ↔ DCC-name pairing in both directions.
    pub fn map_ids(&self, editor_guid: &str, dcc_name: &str) {
        let mut map = self.id_map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(editor_guid.to_string(), dcc_name.to_string());
        map.insert(dcc_name.to_string(), editor_guid.to_string());
    }

    pub fn resolve_id(&self, id: &str) -> Option<String> {
        self.id_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn revoke_id(&self, id: &str, reason: &str) {
        self.revocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), reason.to_string());
    }

    pub fn is_revoked(&self, id: &str) -> bool {
        self.revocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn credit_balance(&self) -> i64 {
        *self.credits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn debit_credits(&self, amount: i64) -> i64 {
        let mut credits = self.credits.lock().unwrap_or_else(|e| e.into_inner());
        *credits -= amount;
        *credits
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Serialize engines, id map, and credits to the state file. Failures
    /// are reported but never fatal to the operation that triggered them.
    pub fn save_state(&self) {
        let snapshot = RegistrySnapshot {
            engines: self.snapshot_all(),
            id_map: self
                .id_map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            credits: self.credit_balance(),
        };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.state_path, data) {
                    tracing::warn!("STATE SNAPSHOT | write failed: {e}");
                }
            }
            Err(e) => tracing::warn!("STATE SNAPSHOT | encode failed: {e}"),
        }
    }

    /// Merge a previous snapshot back in. Only known engines are touched;
    /// state, token, and version carry over, trust resets to bootstrap.
    pub fn load_state(&self) {
        let data = match std::fs::read_to_string(&self.state_path) {
            Ok(d) => d,
            Err(_) => return,
        };
        let snapshot: RegistrySnapshot = match serde_json::from_str(&data) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("STATE SNAPSHOT | decode failed: {e}");
                return;
            }
        };
        {
            let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
            for (name, saved) in snapshot.engines {
                if let Some(record) = engines.get_mut(&name) {
                    record.state = saved.state;
                    record.token = saved.token;
                    record.version = saved.version;
                    record.generation = saved.generation;
                }
            }
        }
        *self.id_map.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.id_map;
        *self.credits.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.credits;
    }
}
