/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Kernel configuration.
//!
//! Every timing knob and filesystem location in one place. Defaults match
//! the deployed bridge; the discovery sidecars may override the engine port
//! and token at runtime.

use crate::contract::{ENGINE_DCC, ENGINE_EDITOR};
use crate::error::KernelError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Root for the journal, event stream, state snapshot, and sandbox.
    pub persistence_dir: PathBuf,
    /// Where the external discovery sidecars live.
    pub discovery_dir: PathBuf,
    /// One-line activity marker consumed by supervision tooling.
    pub activity_path: PathBuf,

    pub editor_port: u16,
    pub dcc_port: u16,
    pub control_port: u16,

    /// Session mutation allowance.
    pub entropy_limit: u64,
    pub wal_max_bytes: u64,

    pub heartbeat_interval: Duration,
    pub heartbeat_probe_timeout: Duration,
    pub coalesce_interval: Duration,
    pub tx_gc_interval: Duration,
    pub tx_timeout: Duration,
    pub discovery_interval: Duration,
    pub verify_deadline: Duration,
    /// Minutes a successful handshake or heartbeat extends trust by.
    pub trust_window_min: i64,

    pub preflight_command: Vec<String>,
    pub mechanical_audit_command: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            persistence_dir: PathBuf::from(".vibesync"),
            discovery_dir: PathBuf::from("."),
            activity_path: PathBuf::from("metadata/bridge_activity.txt"),
            editor_port: 8085,
            dcc_port: 22000,
            control_port: 8080,
            entropy_limit: 500,
            wal_max_bytes: crate::journal::DEFAULT_MAX_WAL_BYTES,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_probe_timeout: Duration::from_secs(2),
            coalesce_interval: Duration::from_millis(250),
            tx_gc_interval: Duration::from_secs(10),
            tx_timeout: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(2),
            verify_deadline: Duration::from_secs(15),
            trust_window_min: 60,
            preflight_command: vec![
                "python3".to_string(),
                "scripts/preflight.py".to_string(),
            ],
            mechanical_audit_command: vec![
                "python3".to_string(),
                "../security_gate.py".to_string(),
            ],
        }
    }
}

impl KernelConfig {
    pub fn wal_path(&self) -> PathBuf {
        self.persistence_dir.join("wal.jsonl")
    }

    pub fn events_path(&self) -> PathBuf {
        self.persistence_dir.join("events.jsonl")
    }

    pub fn state_path(&self) -> PathBuf {
        self.persistence_dir.join("state.json")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.persistence_dir.join("tmp")
    }

    pub fn settings_sidecar(&self) -> PathBuf {
        self.discovery_dir.join("vibe_settings.json")
    }

    pub fn status_sidecar(&self) -> PathBuf {
        self.discovery_dir.join("vibe_status.json")
    }

    pub fn audit_sidecar(&self) -> PathBuf {
        self.discovery_dir.join("vibe_audit.jsonl")
    }

    /// Loopback port for a named engine.
    pub fn port_for(&self, engine: &str) -> Result<u16, KernelError> {
        match engine {
            ENGINE_EDITOR => Ok(self.editor_port),
            ENGINE_DCC => Ok(self.dcc_port),
            other => Err(KernelError::Unknown(format!("unknown engine '{other}'"))),
        }
    }

    /// Create the persistence and sandbox directories.
    pub fn ensure_dirs(&self) -> Result<(), KernelError> {
        for dir in [&self.persistence_dir, &self.sandbox_dir()] {
            std::fs::create_dir_all(dir)
                .map_err(|e| KernelError::Unknown(format!("mkdir {}: {e}", dir.display())))?;
        }
        if let Some(parent) = self.activity_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KernelError::Unknown(format!("mkdir {}: {e}", parent.display())))?;
            }
        }
        Ok(())
    }
}
