/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Shared wire contract for the orchestration kernel.
//!
//! Every type that crosses a boundary lives here: the engine lifecycle
//! states, the agent intent envelope, the hash-chained journal entry, lock
//! records, and the bridge introspection structures. The serialized names
//! are part of the adapter contract with the engines and must not drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire schema version stamped into every tool result envelope.
pub const SCHEMA_VERSION: &str = "v0.4";

/// Canonical engine names. The editor engine gets the relaxed handshake
/// contract; everything else must echo the challenge.
pub const ENGINE_EDITOR: &str = "editor";
pub const ENGINE_DCC: &str = "dcc";

// ---------------------------------------------------------------------------
// Engine lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a managed engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PANIC")]
    Panic,
    #[serde(rename = "HUMAN_INTERVENTION_REQUIRED")]
    HumanInterventionRequired,
    #[serde(rename = "DESYNC")]
    Desync,
    #[serde(rename = "QUARANTINE")]
    Quarantine,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Stopped => "STOPPED",
            EngineState::Starting => "STARTING",
            EngineState::Running => "RUNNING",
            EngineState::Panic => "PANIC",
            EngineState::HumanInterventionRequired => "HUMAN_INTERVENTION_REQUIRED",
            EngineState::Desync => "DESYNC",
            EngineState::Quarantine => "QUARANTINE",
        };
        write!(f, "{}", s)
    }
}

impl EngineState {
    /// Parse the wire form back into the enum (used by `set_engine_state`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(EngineState::Stopped),
            "STARTING" => Some(EngineState::Starting),
            "RUNNING" => Some(EngineState::Running),
            "PANIC" => Some(EngineState::Panic),
            "HUMAN_INTERVENTION_REQUIRED" => Some(EngineState::HumanInterventionRequired),
            "DESYNC" => Some(EngineState::Desync),
            "QUARANTINE" => Some(EngineState::Quarantine),
            _ => None,
        }
    }
}

/// Who performed (or is the subject of) an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Human,
    Ai,
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Human => write!(f, "human"),
            Actor::Ai => write!(f, "ai"),
            Actor::System => write!(f, "system"),
        }
    }
}

// ---------------------------------------------------------------------------
// Intent envelope
// ---------------------------------------------------------------------------

/// Blast-radius classification attached to an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentClass {
    Cosmetic,
    Structural,
    Destructive,
}

impl Default for IntentClass {
    fn default() -> Self {
        IntentClass::Cosmetic
    }
}

/// Agent-submitted declaration of a desired mutation. Immutable once
/// accepted; identified by a fresh UUID at submission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentEnvelope {
    pub instruction_hash: String,
    pub plan_hash: String,
    /// Free-text justification. Required non-empty.
    pub rationale: String,
    /// Who (or what) produced this intent. Required non-empty.
    pub provenance: String,
    /// Agent self-estimate in [0, 1]. Below 0.8 the cluster halts for a human.
    pub confidence: f64,
    /// Target object names/UUIDs this intent may touch.
    pub scope: Vec<String>,
    pub capabilities: Vec<String>,
    pub budget_ms: u64,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<IntentClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<u8>,
    pub dry_run: bool,
    pub based_on_hashes: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Journal entry
// ---------------------------------------------------------------------------

/// Phase of a journaled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalPhase {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ATTEMPTED")]
    Attempted,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "HALTED")]
    Halted,
    #[serde(rename = "TERMINAL")]
    Terminal,
    #[serde(rename = "PROVISIONAL")]
    Provisional,
    #[serde(rename = "FINAL")]
    Final,
    #[serde(rename = "ROLLED_BACK")]
    RolledBack,
    #[serde(rename = "QUARANTINED")]
    Quarantined,
    #[serde(rename = "WAIT_HUMAN_LOCK")]
    WaitHumanLock,
}

/// Coarse classification of why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    SyntaxError,
    DependencyMissing,
    NamespaceCollision,
    AssetMismatch,
    InvalidState,
    ToolUnavailable,
    PolicyViolationRisk,
    Unknown,
}

/// Cluster health marker stamped into every journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemHealth {
    #[serde(rename = "SAFE")]
    Safe,
    #[serde(rename = "QUARANTINED")]
    Quarantined,
}

/// Object scope touched by a journal entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalScope {
    pub uuids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub closure_uuids: Vec<String>,
    #[serde(rename = "intent_class")]
    pub class: IntentClass,
}

/// Expected-versus-observed verification record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalVerify {
    pub expected_hash: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub observed_hash: String,
    pub epsilon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<i64>,
}

/// Undo material captured before a mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalRollback {
    pub undo_token: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub snapshot_ref: String,
}

/// Conflict detail recorded when two intents collide on the same scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub resolution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_intent_id: Option<u64>,
    pub reason: String,
}

/// Per-role execution permissions carried on an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolePermissions {
    pub can_execute: bool,
    pub can_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub can_escalate: bool,
    #[serde(default)]
    pub can_freeze: bool,
}

pub type PermissionsMask = HashMap<String, RolePermissions>;

/// One record in the hash-chained write-ahead log.
///
/// `parent_hash` is the previous entry's `entry_hash`; `entry_hash` covers
/// the serialized body concatenated with the parent hash. The journal fills
/// both fields and the monotonic `intent_id` at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub intent_id: u64,
    pub parent_hash: String,
    pub entry_hash: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Active transaction id at append time, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    pub engine: String,
    pub actor: Actor,
    pub scope: WalScope,
    pub phase: WalPhase,
    #[serde(rename = "verification")]
    pub verify: WalVerify,
    pub rollback: WalRollback,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    pub retry_count: u32,
    pub escalation_level: u32,
    #[serde(rename = "permissions_mask", skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionsMask>,
    pub system_health: SystemHealth,
}

impl WalEntry {
    /// New entry with empty hashes; the journal assigns ids and hashes.
    pub fn new(engine: impl Into<String>, actor: Actor, phase: WalPhase) -> Self {
        Self {
            intent_id: 0,
            parent_hash: String::new(),
            entry_hash: String::new(),
            timestamp: Utc::now().timestamp(),
            tid: None,
            engine: engine.into(),
            actor,
            scope: WalScope::default(),
            phase,
            verify: WalVerify::default(),
            rollback: WalRollback::default(),
            conflict: None,
            failure_class: None,
            retry_count: 0,
            escalation_level: 0,
            permissions: None,
            system_health: SystemHealth::Safe,
        }
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Lock classes. Only `HUMAN_ACTIVE` blocks mutations; the other two are
/// advisory and surface in forensic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    #[serde(rename = "HUMAN_ACTIVE")]
    HumanActive,
    #[serde(rename = "AI_SPECULATIVE")]
    AiSpeculative,
    #[serde(rename = "PERIMETER_LOCK")]
    Perimeter,
}

/// A held lock on one object UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectLock {
    pub uuid: String,
    #[serde(rename = "type")]
    pub lock_type: LockType,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

/// An open atomic operation. At most one transaction is *active* (attached
/// to outgoing engine calls) at any moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub intent_id: String,
    pub start_time: DateTime<Utc>,
    pub status: TxStatus,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

/// Structured event appended to the side-channel event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: EventLevel,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub next_step: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub intent_id: String,
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Mutation entropy budget: `used` may never exceed `limit`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EntropyBudget {
    pub limit: u64,
    pub used: u64,
}

// ---------------------------------------------------------------------------
// Bridge introspection
// ---------------------------------------------------------------------------

/// Liveness snapshot returned by `get_bridge_heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeHeartbeat {
    pub bridge_pid: u32,
    pub uptime_sec: u64,
    pub epoch_id: i64,
    pub orchestrator_connected: bool,
    pub editor_connected: bool,
    pub dcc_connected: bool,
    pub last_tick_hash: String,
    pub expected_interval_ms: u64,
    pub last_seen_ms: u64,
}

/// Last atomic asset handshake observed by the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeHandshakeState {
    pub asset_id: String,
    pub dcc_export_hash: String,
    pub editor_import_hash: String,
    pub hash_match: bool,
    pub last_verified: String,
}

/// Journal head summary returned by `get_bridge_wal_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeWalState {
    pub wal_head: u64,
    pub wal_hash: String,
    pub last_committed_op: String,
    pub pending_ops: usize,
    pub rollback_available: bool,
    pub reversible: bool,
}

/// What a commit currently requires, returned by
/// `get_bridge_commit_requirements`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeCommitRequirements {
    pub required_hashes: HashMap<String, String>,
    pub rationale_required: bool,
    pub commit_allowed: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
