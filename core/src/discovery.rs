/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Sidecar discovery.
//!
//! The bridge is configured from the outside by three read-only files:
//! `vibe_settings.json` (engine ports), `vibe_status.json` (current editor
//! token), and `vibe_audit.jsonl` (the external audit log whose tip hash
//! and line count seed the session). A 2-second poller re-reads them and
//! adopts token or tip changes live.

use crate::clock::MonotonicClock;
use crate::contract::{EventLevel, ENGINE_EDITOR};
use crate::events::EventLog;
use crate::kernel::SessionState;
use crate::registry::EngineRegistry;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;

/// Errors at the sidecar boundary. These never escape discovery — a broken
/// sidecar degrades to defaults — but they are logged with full cause.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("sidecar io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SidecarSettings {
    pub editor_port: Option<u16>,
    pub dcc_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SidecarStatus {
    pub token: Option<String>,
}

/// Tip of the external audit log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSeed {
    pub last_hash: String,
    pub line_count: u64,
}

pub fn read_settings(path: &PathBuf) -> Result<SidecarSettings, SidecarError> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub fn read_status(path: &PathBuf) -> Result<SidecarStatus, SidecarError> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Read the external audit log tip: line count plus the last line's hash
/// (`entry_hash` preferred, bare `hash` accepted).
pub fn read_audit_seed(path: &PathBuf) -> Result<AuditSeed, SidecarError> {
    let data = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
    let last_hash = lines
        .last()
        .and_then(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .and_then(|value| {
            value
                .get("entry_hash")
                .or_else(|| value.get("hash"))
                .and_then(|h| h.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_default();
    Ok(AuditSeed {
        last_hash,
        line_count: lines.len() as u64,
    })
}

/// Everything discovery contributes at startup.
#[derive(Debug, Clone, Default)]
pub struct BootstrapInfo {
    pub editor_port: Option<u16>,
    pub dcc_port: Option<u16>,
    pub token: Option<String>,
    pub audit_seed: AuditSeed,
}

pub struct Discovery {
    settings_path: PathBuf,
    status_path: PathBuf,
    audit_path: PathBuf,
    last_token: Mutex<Option<String>>,
    last_seed: Mutex<AuditSeed>,
}

impl Discovery {
    pub fn new(settings_path: PathBuf, status_path: PathBuf, audit_path: PathBuf) -> Self {
        Self {
            settings_path,
            status_path,
            audit_path,
            last_token: Mutex::new(None),
            last_seed: Mutex::new(AuditSeed::default()),
        }
    }

    /// One-shot startup read. Missing or malformed sidecars fall back to
    /// defaults; only their absence is noted.
    pub fn bootstrap(&self) -> BootstrapInfo {
        let mut info = BootstrapInfo::default();

        match read_settings(&self.settings_path) {
            Ok(settings) => {
                info.editor_port = settings.editor_port;
                info.dcc_port = settings.dcc_port;
            }
            Err(e) => tracing::debug!("DISCOVERY | settings sidecar unavailable: {e}"),
        }
        match read_status(&self.status_path) {
            Ok(status) => info.token = status.token,
            Err(e) => tracing::debug!("DISCOVERY | status sidecar unavailable: {e}"),
        }
        match read_audit_seed(&self.audit_path) {
            Ok(seed) => info.audit_seed = seed,
            Err(e) => tracing::debug!("DISCOVERY | audit sidecar unavailable: {e}"),
        }

        *self.last_token.lock().unwrap_or_else(|e| e.into_inner()) = info.token.clone();
        *self.last_seed.lock().unwrap_or_else(|e| e.into_inner()) = info.audit_seed.clone();
        info
    }

    /// One poll tick: adopt token rotations and audit tip advances live.
    pub fn poll(
        &self,
        registry: &EngineRegistry,
        clock: &MonotonicClock,
        events: &EventLog,
        session: &SessionState,
    ) {
        if let Ok(status) = read_status(&self.status_path) {
            if let Some(token) = status.token {
                let mut last = self.last_token.lock().unwrap_or_else(|e| e.into_inner());
                if last.as_deref() != Some(token.as_str()) {
                    tracing::info!("DISCOVERY | editor token rotated externally");
                    let _ = registry.update(ENGINE_EDITOR, |record| {
                        record.token = token.clone();
                    });
                    events.dispatch(
                        EventLevel::Info,
                        "discovery_token_rotated",
                        "",
                        "",
                        json!({"target": ENGINE_EDITOR}),
                    );
                    *last = Some(token);
                }
            }
        }

        if let Ok(seed) = read_audit_seed(&self.audit_path) {
            let mut last = self.last_seed.lock().unwrap_or_else(|e| e.into_inner());
            if *last != seed {
                tracing::info!(
                    "DISCOVERY | external audit advanced to line {} ({})",
                    seed.line_count,
                    &seed.last_hash.get(..12.min(seed.last_hash.len())).unwrap_or("")
                );
                clock.advance_to(seed.line_count);
                session.set_external_audit_hash(&seed.last_hash);
                events.dispatch(
                    EventLevel::Debug,
                    "discovery_audit_advanced",
                    "",
                    "",
                    json!({"line_count": seed.line_count, "last_hash": seed.last_hash}),
                );
                *last = seed;
            }
        }
    }
}
