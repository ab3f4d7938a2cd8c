/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Structured event stream.
//!
//! The event stream is the narrative side channel to the WAL: handshakes,
//! security intercepts, quarantines, panics, and approvals are appended as
//! line-delimited JSON to `events.jsonl`. `reconstruct_state` replays it
//! into an ordered trace of event types.

use crate::contract::{EventLevel, VibeEvent};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct EventLog {
    path: PathBuf,
    write_mu: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_mu: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are swallowed: the event stream is
    /// observational and must never fail the operation that emitted it.
    pub fn dispatch(
        &self,
        level: EventLevel,
        kind: &str,
        intent_id: &str,
        next_step: &str,
        payload: serde_json::Value,
    ) {
        let event = VibeEvent {
            kind: kind.to_string(),
            level,
            timestamp: Utc::now(),
            payload,
            next_step: next_step.to_string(),
            intent_id: intent_id.to_string(),
        };
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(_) => return,
        };
        let _guard = self.write_mu.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(file, "{line}");
        }
    }

    /// Last `limit` parsed events (0 = all).
    pub fn recent(&self, limit: usize) -> Vec<VibeEvent> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let events: Vec<VibeEvent> = content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if limit > 0 && events.len() > limit {
            events[events.len() - limit..].to_vec()
        } else {
            events
        }
    }

    /// Replay the stream into an `a -> b -> c` trace of event types.
    pub fn replay_trace(&self) -> String {
        self.recent(0)
            .iter()
            .map(|e| e.kind.clone())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
