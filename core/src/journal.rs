/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Hash-chained write-ahead log.
//!
//! Every intent and engine side effect is appended as one line-delimited
//! JSON record whose `entry_hash` is the SHA-256 of the previous entry's
//! hash concatenated with the serialized body. The chain makes the journal
//! tamper-evident: editing any historical line breaks every hash after it.
//! The file is never rewritten in place; when it outgrows the rotation
//! limit it is renamed aside with an `.old` suffix and a fresh file begins
//! (the chain continues across the rotation boundary).

use crate::clock::MonotonicClock;
use crate::contract::WalEntry;
use crate::error::KernelError;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default rotation threshold: 10 MiB.
pub const DEFAULT_MAX_WAL_BYTES: u64 = 10 * 1024 * 1024;

struct WalInner {
    /// `entry_hash` of the most recent append; empty before the first.
    tip: String,
}

/// Append-only journal. All appends are serialized by one mutex, which also
/// guarantees that WAL order matches monotonic-id order: the id is issued
/// inside the critical section.
pub struct Wal {
    path: PathBuf,
    max_bytes: u64,
    inner: Mutex<WalInner>,
}

impl Wal {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            inner: Mutex::new(WalInner { tip: String::new() }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash of the most recent entry (empty before the first append).
    pub fn tip(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tip
            .clone()
    }

    /// Append one entry. Fills `intent_id`, `parent_hash`, and `entry_hash`
    /// in place and returns the new entry hash.
    pub fn append(
        &self,
        clock: &MonotonicClock,
        entry: &mut WalEntry,
    ) -> Result<String, KernelError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        entry.intent_id = clock.next_id();
        entry.parent_hash = String::new();
        entry.entry_hash = String::new();

        let body = serde_json::to_string(entry)
            .map_err(|e| KernelError::Unknown(format!("journal encode: {e}")))?;
        let hash = chain_hash(&inner.tip, &body);

        entry.parent_hash = inner.tip.clone();
        entry.entry_hash = hash.clone();

        let line = serde_json::to_string(entry)
            .map_err(|e| KernelError::Unknown(format!("journal encode: {e}")))?;

        self.rotate_if_oversized()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| KernelError::Unknown(format!("journal open: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| KernelError::Unknown(format!("journal write: {e}")))?;

        inner.tip = hash.clone();
        Ok(hash)
    }

    fn rotate_if_oversized(&self) -> Result<(), KernelError> {
        if let Ok(meta) = std::fs::metadata(&self.path) {
            if meta.len() > self.max_bytes {
                let mut rotated = self.path.clone().into_os_string();
                rotated.push(".old");
                std::fs::rename(&self.path, PathBuf::from(rotated))
                    .map_err(|e| KernelError::Unknown(format!("journal rotate: {e}")))?;
            }
        }
        Ok(())
    }

    /// Last `limit` raw lines from the current journal file (0 = all).
    pub fn read_tail(&self, limit: usize) -> Vec<String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        if limit > 0 && lines.len() > limit {
            lines[lines.len() - limit..].to_vec()
        } else {
            lines
        }
    }

    /// Last `limit` parsed entries; unparseable lines are skipped.
    pub fn read_entries(&self, limit: usize) -> Vec<WalEntry> {
        self.read_tail(limit)
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Walk the current file and recompute every hash. Returns the first
    /// break as an error, keyed by the offending monotonic id.
    pub fn verify_chain(&self) -> Result<usize, KernelError> {
        let entries = self.read_entries(0);
        let mut expected_parent = entries
            .first()
            .map(|e| e.parent_hash.clone())
            .unwrap_or_default();

        for entry in &entries {
            if entry.parent_hash != expected_parent {
                return Err(KernelError::HashMismatch {
                    expected: expected_parent,
                    observed: entry.parent_hash.clone(),
                });
            }
            let mut stripped = entry.clone();
            stripped.parent_hash = String::new();
            stripped.entry_hash = String::new();
            let body = serde_json::to_string(&stripped)
                .map_err(|e| KernelError::Unknown(format!("journal encode: {e}")))?;
            let recomputed = chain_hash(&entry.parent_hash, &body);
            if recomputed != entry.entry_hash {
                return Err(KernelError::HashMismatch {
                    expected: recomputed,
                    observed: entry.entry_hash.clone(),
                });
            }
            expected_parent = entry.entry_hash.clone();
        }
        Ok(entries.len())
    }
}

/// `H(parent_hash ∥ body)`, hex-encoded.
fn chain_hash(parent: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}
