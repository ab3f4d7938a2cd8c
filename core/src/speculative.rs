/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Speculative coalescing buffer.
//!
//! Cosmetic mutations (transform nudges, camera moves) are provisional:
//! the tool stages a PROVISIONAL journal shape keyed by object UUID, fires
//! the engine calls asynchronously, and returns immediately. A 250 ms
//! ticker drains the buffer and promotes everything staged to FINAL under
//! one combined verification hash. Keying by UUID gives last-writer-wins
//! inside the window: a burst of updates to the same object collapses to
//! the newest write intent.

use crate::contract::WalEntry;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Result of a drain: what was promoted and under which combined hash.
#[derive(Debug, Clone)]
pub struct DrainBatch {
    pub uuids: Vec<String>,
    pub entries: Vec<WalEntry>,
    pub combined_hash: String,
}

pub struct CoalescingBuffer {
    pending: Mutex<HashMap<String, WalEntry>>,
}

impl CoalescingBuffer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stage a provisional entry for `uuid`, replacing any entry already
    /// buffered for the same object. Returns the staged entry hash.
    pub fn stage(&self, uuid: &str, mut entry: WalEntry) -> String {
        let hash = staged_hash(&entry);
        entry.verify.expected_hash = hash.clone();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid.to_string(), entry);
        hash
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything staged. Returns `None` when the buffer is empty.
    /// The combined hash is the concatenation of the buffered entry hashes
    /// in UUID order, hashed once.
    pub fn drain(&self) -> Option<DrainBatch> {
        let drained: HashMap<String, WalEntry> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.is_empty() {
                return None;
            }
            std::mem::take(&mut *pending)
        };

        let mut uuids: Vec<String> = drained.keys().cloned().collect();
        uuids.sort();

        let mut hasher = Sha256::new();
        let mut entries = Vec::with_capacity(uuids.len());
        for uuid in &uuids {
            let entry = &drained[uuid];
            hasher.update(entry.verify.expected_hash.as_bytes());
            entries.push(entry.clone());
        }

        Some(DrainBatch {
            uuids,
            entries,
            combined_hash: hex::encode(hasher.finalize()),
        })
    }
}

impl Default for CoalescingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Content hash of a staged entry (chain fields excluded).
fn staged_hash(entry: &WalEntry) -> String {
    let mut stripped = entry.clone();
    stripped.parent_hash = String::new();
    stripped.entry_hash = String::new();
    stripped.verify.expected_hash = String::new();
    let body = serde_json::to_string(&stripped).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}
