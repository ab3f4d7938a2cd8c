/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! The kernel handle.
//!
//! All process-wide mutable state hangs off one `Kernel` composed of
//! independently lockable subsystems. Construction is explicit:
//! `Kernel::init` runs discovery, seeds the clock from the external audit
//! log, restores the registry snapshot, and wires the signed client.
//! Background loops (coalescing drain, heartbeat, transaction GC,
//! discovery poll) are spawned separately so tests can drive each tick by
//! hand.

use crate::clock::{now_iso, MonotonicClock};
use crate::config::KernelConfig;
use crate::contract::{
    Actor, BridgeHandshakeState, EventLevel, SystemHealth, Transaction, WalEntry, WalPhase,
    ENGINE_EDITOR, SCHEMA_VERSION,
};
use crate::discovery::Discovery;
use crate::error::KernelError;
use crate::events::EventLog;
use crate::gates::{EntropyGate, IdempotencyLedger};
use crate::intents::{IntentLedger, TransactionManager};
use crate::journal::Wal;
use crate::locks::LockTable;
use crate::multiplex::DriverRegistry;
use crate::registry::EngineRegistry;
use crate::rpc::SignedRpcClient;
use crate::speculative::CoalescingBuffer;
use crate::contract::EngineState;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Process-wide session identity and flags.
pub struct SessionState {
    pub session_id: Uuid,
    started_at: Instant,
    trust_tier: Mutex<u8>,
    performance_mode: AtomicBool,
    last_activity: Mutex<String>,
    external_audit_hash: Mutex<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Instant::now(),
            trust_tier: Mutex::new(1),
            performance_mode: AtomicBool::new(false),
            last_activity: Mutex::new(String::new()),
            external_audit_hash: Mutex::new(String::new()),
        }
    }

    pub fn trust_tier(&self) -> u8 {
        *self.trust_tier.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_trust_tier(&self, tier: u8) {
        *self.trust_tier.lock().unwrap_or_else(|e| e.into_inner()) = tier;
    }

    pub fn performance_mode(&self) -> bool {
        self.performance_mode.load(Ordering::Relaxed)
    }

    pub fn set_performance_mode(&self, on: bool) {
        self.performance_mode.store(on, Ordering::Relaxed);
    }

    pub fn touch_activity(&self, marker: &str) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = marker.to_string();
    }

    pub fn last_activity(&self) -> String {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn external_audit_hash(&self) -> String {
        self.external_audit_hash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_external_audit_hash(&self, hash: &str) {
        *self
            .external_audit_hash
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = hash.to_string();
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct Kernel {
    pub config: Arc<KernelConfig>,
    pub session: Arc<SessionState>,
    pub clock: Arc<MonotonicClock>,
    pub wal: Arc<Wal>,
    pub events: Arc<EventLog>,
    pub registry: Arc<EngineRegistry>,
    pub locks: Arc<LockTable>,
    pub entropy: Arc<EntropyGate>,
    pub idempotency: Arc<IdempotencyLedger>,
    pub intents: Arc<IntentLedger>,
    pub transactions: Arc<TransactionManager>,
    pub buffer: Arc<CoalescingBuffer>,
    pub drivers: Arc<DriverRegistry>,
    pub discovery: Arc<Discovery>,
    pub rpc: SignedRpcClient,
    /// Last atomic asset handshake, for bridge introspection.
    pub asset_handshake: Mutex<BridgeHandshakeState>,
}

impl Kernel {
    /// Build the kernel: discovery first (ports, token, audit seed), then
    /// the persistence layer, then the signed client over all of it.
    pub fn init(mut config: KernelConfig) -> Result<Arc<Self>, KernelError> {
        let discovery = Arc::new(Discovery::new(
            config.settings_sidecar(),
            config.status_sidecar(),
            config.audit_sidecar(),
        ));
        let info = discovery.bootstrap();
        if let Some(port) = info.editor_port {
            config.editor_port = port;
        }
        if let Some(port) = info.dcc_port {
            config.dcc_port = port;
        }

        config.ensure_dirs()?;
        let config = Arc::new(config);

        let session = Arc::new(SessionState::new());
        session.set_external_audit_hash(&info.audit_seed.last_hash);

        let clock = Arc::new(MonotonicClock::seeded(info.audit_seed.line_count));
        let wal = Arc::new(Wal::new(config.wal_path(), config.wal_max_bytes));
        let events = Arc::new(EventLog::new(config.events_path()));

        let registry = Arc::new(EngineRegistry::new(config.state_path()));
        registry.load_state();
        if let Some(token) = info.token {
            registry.update(ENGINE_EDITOR, |record| record.token = token)?;
        }

        let locks = Arc::new(LockTable::new());
        let entropy = Arc::new(EntropyGate::new(config.entropy_limit));
        let idempotency = Arc::new(IdempotencyLedger::new());
        let intents = Arc::new(IntentLedger::new());
        let buffer = Arc::new(CoalescingBuffer::new());
        let drivers = Arc::new(DriverRegistry::new());

        let active_tx: Arc<Mutex<Option<Transaction>>> = Arc::new(Mutex::new(None));
        let transactions = Arc::new(TransactionManager::new(
            Arc::clone(&active_tx),
            config.mechanical_audit_command.clone(),
        ));

        let rpc = SignedRpcClient::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&wal),
            Arc::clone(&events),
            Arc::clone(&session),
            active_tx,
        )?;

        let kernel = Arc::new(Self {
            config,
            session,
            clock,
            wal,
            events,
            registry,
            locks,
            entropy,
            idempotency,
            intents,
            transactions,
            buffer,
            drivers,
            discovery,
            rpc,
            asset_handshake: Mutex::new(BridgeHandshakeState::default()),
        });

        kernel.events.dispatch(
            EventLevel::Info,
            "kernel_initialized",
            "",
            "",
            json!({
                "session_id": kernel.session.session_id.to_string(),
                "seeded_monotonic_id": kernel.clock.current(),
            }),
        );
        tracing::info!(
            "KERNEL INIT | session {} seeded at id {}",
            kernel.session.session_id,
            kernel.clock.current()
        );
        Ok(kernel)
    }

    // ── Background loops ───────────────────────────────────────────

    /// Spawn the four standing loops. Handles are returned so the daemon
    /// can abort them during shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        // Coalescing drain.
        let kernel = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(kernel.config.coalesce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                kernel.drain_speculative();
            }
        }));

        // Heartbeat.
        let kernel = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(kernel.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                crate::heartbeat::heartbeat_tick(&kernel).await;
            }
        }));

        // Transaction GC.
        let kernel = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(kernel.config.tx_gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                kernel.gc_transactions().await;
            }
        }));

        // Discovery poll.
        let kernel = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(kernel.config.discovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                kernel.discovery.poll(
                    &kernel.registry,
                    &kernel.clock,
                    &kernel.events,
                    &kernel.session,
                );
            }
        }));

        handles
    }

    /// One coalescing drain: promote everything staged to FINAL under a
    /// single combined verification hash.
    pub fn drain_speculative(&self) {
        if let Some(batch) = self.buffer.drain() {
            let mut promotion = WalEntry::new("cluster", Actor::System, WalPhase::Final);
            promotion.scope.uuids = batch.uuids.clone();
            promotion.verify.expected_hash = batch.combined_hash.clone();
            promotion.system_health = self.cluster_health();
            if let Err(e) = self.wal.append(&self.clock, &mut promotion) {
                tracing::warn!("COALESCE | promotion append failed: {e}");
                return;
            }
            tracing::debug!(
                "COALESCE | promoted {} provisional entr{} to FINAL",
                batch.entries.len(),
                if batch.entries.len() == 1 { "y" } else { "ies" }
            );
        }
    }

    /// One GC sweep: force-abort transactions past the deadline and
    /// broadcast a rollback to every reachable engine.
    pub async fn gc_transactions(&self) {
        let expired = self.transactions.sweep_expired();
        if expired.is_empty() {
            return;
        }
        for tx in &expired {
            tracing::warn!("TX GC | aborting stale transaction {} ({})", tx.id, tx.intent_id);
            let mut entry = WalEntry::new("cluster", Actor::System, WalPhase::RolledBack);
            entry.tid = Some(tx.id.clone());
            entry.system_health = self.cluster_health();
            if let Err(e) = self.wal.append(&self.clock, &mut entry) {
                tracing::warn!("TX GC | journal append failed: {e}");
            }
            self.events.dispatch(
                EventLevel::Warn,
                "transaction_expired",
                &tx.intent_id,
                "ROLLBACK",
                json!({"transaction_id": tx.id}),
            );
            for name in self.registry.names() {
                if let Ok(record) = self.registry.snapshot(&name) {
                    if record.state == EngineState::Stopped {
                        continue;
                    }
                }
                let payload = json!({
                    "reason": "TRANSACTION_TIMEOUT",
                    "transaction_id": tx.id,
                });
                if let Err(e) = self.rpc.send(&name, "rollback", "POST", Some(payload)).await {
                    tracing::warn!("TX GC | rollback to {name} failed: {e}");
                }
            }
        }
    }

    // ── Reporting ──────────────────────────────────────────────────

    pub fn cluster_health(&self) -> SystemHealth {
        let quarantined = self
            .registry
            .snapshot_all()
            .values()
            .any(|r| r.state == EngineState::Quarantine);
        if quarantined {
            SystemHealth::Quarantined
        } else {
            SystemHealth::Safe
        }
    }

    /// Forensic context stapled onto every tool result.
    pub fn forensic_report(&self) -> Value {
        let engines: serde_json::Map<String, Value> = self
            .registry
            .snapshot_all()
            .into_iter()
            .map(|(name, record)| {
                (
                    name,
                    json!({
                        "state": record.state.to_string(),
                        "trust_score": record.trust_score,
                        "generation": record.generation,
                    }),
                )
            })
            .collect();
        let locks: Vec<Value> = self
            .locks
            .active()
            .into_iter()
            .map(|lock| {
                json!({
                    "uuid": lock.uuid,
                    "type": lock.lock_type,
                    "actor": lock.actor,
                })
            })
            .collect();
        json!({
            "wal_tail": self.wal.read_tail(3),
            "engine_status": engines,
            "entropy": self.entropy.snapshot(),
            "active_locks": locks,
            "system_time": now_iso(),
        })
    }

    /// Standard tool-result envelope.
    pub fn wrap_result(&self, result: Value) -> Value {
        json!({
            "result": result,
            "forensic_report": self.forensic_report(),
            "schema_version": SCHEMA_VERSION,
        })
    }

    /// Status body served by `/pulse` and `get_bridge_pulse`.
    pub fn pulse(&self) -> Value {
        let engines: serde_json::Map<String, Value> = self
            .registry
            .snapshot_all()
            .into_iter()
            .map(|(name, record)| {
                (
                    name,
                    json!({
                        "state": record.state.to_string(),
                        "trust_score": record.trust_score,
                        "generation": record.generation,
                        "version": record.version,
                        "trust_expiry": record.trust_expiry.to_rfc3339(),
                    }),
                )
            })
            .collect();
        json!({
            "session_id": self.session.session_id.to_string(),
            "uptime_sec": self.session.uptime_secs(),
            "engines": engines,
            "entropy": self.entropy.snapshot(),
            "wal_tip": self.wal.tip(),
            "external_audit_hash": self.session.external_audit_hash(),
            "credits": self.registry.credit_balance(),
            "open_transactions": self.transactions.open_count(),
            "pending_speculative": self.buffer.len(),
            "schema_version": SCHEMA_VERSION,
        })
    }

    /// Update the activity marker (session field plus the one-line file).
    pub fn touch_activity(&self, marker: &str) {
        let line = format!("{} {}", now_iso(), marker);
        self.session.touch_activity(&line);
        if let Err(e) = std::fs::write(&self.config.activity_path, format!("{line}\n")) {
            tracing::debug!("ACTIVITY | marker write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_config() -> KernelConfig {
        let base = std::env::temp_dir().join(format!("vibe-kernel-{}", Uuid::new_v4()));
        KernelConfig {
            persistence_dir: base.join("persist"),
            discovery_dir: base.join("discover"),
            activity_path: base.join("metadata/bridge_activity.txt"),
            mechanical_audit_command: vec![],
            preflight_command: vec![],
            ..Default::default()
        }
    }

    #[test]
    fn test_init_builds_clean_kernel() {
        let kernel = Kernel::init(test_config()).unwrap();
        assert_eq!(kernel.clock.current(), 0);
        assert_eq!(kernel.registry.names(), vec!["dcc", "editor"]);
        assert_eq!(kernel.entropy.snapshot().used, 0);
        assert!(kernel.transactions.active_id().is_none());
    }

    #[test]
    fn test_init_seeds_from_audit_sidecar() {
        let config = test_config();
        std::fs::create_dir_all(&config.discovery_dir).unwrap();
        std::fs::write(
            config.audit_sidecar(),
            "{\"entry_hash\":\"aa\"}\n{\"entry_hash\":\"bb\"}\n",
        )
        .unwrap();
        std::fs::write(config.status_sidecar(), r#"{"token":"tok-disc"}"#).unwrap();
        std::fs::write(config.settings_sidecar(), r#"{"editor_port": 9191}"#).unwrap();

        let kernel = Kernel::init(config).unwrap();
        assert_eq!(kernel.clock.current(), 2);
        assert_eq!(kernel.session.external_audit_hash(), "bb");
        assert_eq!(kernel.config.editor_port, 9191);
        assert_eq!(
            kernel.registry.snapshot(ENGINE_EDITOR).unwrap().token,
            "tok-disc"
        );
    }

    #[test]
    fn test_forensic_report_shape() {
        let kernel = Kernel::init(test_config()).unwrap();
        let report = kernel.forensic_report();
        assert!(report.get("wal_tail").is_some());
        assert!(report["engine_status"].get("editor").is_some());
        assert!(report["engine_status"].get("dcc").is_some());
        assert_eq!(report["entropy"]["used"], 0);
        assert!(report.get("system_time").is_some());
    }

    #[test]
    fn test_wrap_result_envelope() {
        let kernel = Kernel::init(test_config()).unwrap();
        let wrapped = kernel.wrap_result(json!("OK"));
        assert_eq!(wrapped["result"], "OK");
        assert_eq!(wrapped["schema_version"], SCHEMA_VERSION);
        assert!(wrapped.get("forensic_report").is_some());
    }

    #[test]
    fn test_wal_tail_in_forensics_is_capped_at_three() {
        let kernel = Kernel::init(test_config()).unwrap();
        for _ in 0..5 {
            let mut entry = WalEntry::new("editor", Actor::System, WalPhase::Attempted);
            kernel.wal.append(&kernel.clock, &mut entry).unwrap();
        }
        let report = kernel.forensic_report();
        assert_eq!(report["wal_tail"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_drain_speculative_promotes_to_final() {
        let kernel = Kernel::init(test_config()).unwrap();
        let mut staged = WalEntry::new("editor", Actor::Ai, WalPhase::Provisional);
        staged.scope.uuids = vec!["u-1".to_string()];
        kernel.buffer.stage("u-1", staged);

        kernel.drain_speculative();

        let entries = kernel.wal.read_entries(0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phase, WalPhase::Final);
        assert_eq!(entries[0].scope.uuids, vec!["u-1"]);
        assert!(!entries[0].verify.expected_hash.is_empty());
        assert!(kernel.buffer.is_empty());
    }

    #[test]
    fn test_drain_speculative_noop_when_empty() {
        let kernel = Kernel::init(test_config()).unwrap();
        kernel.drain_speculative();
        assert!(kernel.wal.read_entries(0).is_empty());
    }

    #[test]
    fn test_pulse_shape() {
        let kernel = Kernel::init(test_config()).unwrap();
        let pulse = kernel.pulse();
        assert!(pulse["engines"]["editor"]["state"].is_string());
        assert_eq!(pulse["credits"], 100);
        assert_eq!(pulse["open_transactions"], 0);
        assert_eq!(pulse["schema_version"], SCHEMA_VERSION);
    }

    #[test]
    fn test_touch_activity_writes_marker_file() {
        let kernel = Kernel::init(test_config()).unwrap();
        kernel.touch_activity("sync_transform");
        let content = std::fs::read_to_string(&kernel.config.activity_path).unwrap();
        assert!(content.contains("sync_transform"));
        assert!(kernel.session.last_activity().contains("sync_transform"));
    }

    #[test]
    fn test_session_flags() {
        let session = SessionState::new();
        assert_eq!(session.trust_tier(), 1);
        session.set_trust_tier(0);
        assert_eq!(session.trust_tier(), 0);
        assert!(!session.performance_mode());
        session.set_performance_mode(true);
        assert!(session.performance_mode());
    }
}
