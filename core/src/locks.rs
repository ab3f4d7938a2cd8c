/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Per-object lock table.
//!
//! Locks expire 30 seconds after they are applied. A live `HUMAN_ACTIVE`
//! lock blocks any mutation naming its object; `AI_SPECULATIVE` and
//! `PERIMETER_LOCK` are advisory and only show up in forensic output.

use crate::contract::{Actor, LockType, ObjectLock};
use crate::error::KernelError;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Lock lifetime.
pub const LOCK_TTL_SECS: i64 = 30;

pub struct LockTable {
    locks: Mutex<HashMap<String, ObjectLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or replace) a lock on `uuid` with the standard TTL.
    pub fn apply(&self, uuid: &str, lock_type: LockType, actor: Actor) -> ObjectLock {
        let now = Utc::now();
        let lock = ObjectLock {
            uuid: uuid.to_string(),
            lock_type,
            actor,
            timestamp: now,
            expires_at: now + Duration::seconds(LOCK_TTL_SECS),
        };
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid.to_string(), lock.clone());
        lock
    }

    /// Remove a lock. Returns whether one was held.
    pub fn release(&self, uuid: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid)
            .is_some()
    }

    /// Gate for mutations naming `uuid`: rejects iff an unexpired
    /// HUMAN_ACTIVE lock is held. Expired locks are pruned on sight.
    pub fn check_human_lock(&self, uuid: &str) -> Result<(), KernelError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(uuid) {
            if lock.expires_at <= Utc::now() {
                locks.remove(uuid);
                return Ok(());
            }
            if lock.lock_type == LockType::HumanActive {
                return Err(KernelError::Locked {
                    uuid: uuid.to_string(),
                });
            }
        }
        Ok(())
    }

    /// All currently unexpired locks, for forensic reporting.
    pub fn active(&self) -> Vec<ObjectLock> {
        let now = Utc::now();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, l| l.expires_at > now);
        let mut out: Vec<ObjectLock> = locks.values().cloned().collect();
        out.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        out
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}
