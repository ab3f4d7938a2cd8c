/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Graceful shutdown — ordered teardown for a clean bridge exit.
//!
//! When the daemon receives SIGTERM or Ctrl+C, teardown runs in a fixed
//! order to avoid losing journal tail or state:
//! 1. Stop accepting tool calls (draining)
//! 2. Stop background loops (heartbeat, GC, drain ticker, discovery)
//! 3. Final coalescing drain so nothing provisional is stranded
//! 4. Snapshot the registry to the state file
//! 5. Exit

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shutdown phase identifiers (in execution order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ShutdownPhase {
    Running = 0,
    Draining = 1,
    StoppingBackground = 2,
    FlushingSpeculative = 3,
    SnapshottingState = 4,
    Complete = 5,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::StoppingBackground => write!(f, "stopping_background"),
            Self::FlushingSpeculative => write!(f, "flushing_speculative"),
            Self::SnapshottingState => write!(f, "snapshotting_state"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

impl ShutdownPhase {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::StoppingBackground,
            3 => Self::FlushingSpeculative,
            4 => Self::SnapshottingState,
            _ => Self::Complete,
        }
    }
}

/// Log entry for a completed shutdown phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseLog {
    pub phase: ShutdownPhase,
    pub duration_ms: u64,
    pub success: bool,
}

/// Tracks the state of a shutdown in progress. Thread-safe via atomics.
pub struct ShutdownCoordinator {
    is_shutting_down: AtomicBool,
    current_phase: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    total_timeout: Duration,
    phase_log: Mutex<Vec<PhaseLog>>,
}

impl ShutdownCoordinator {
    pub fn new(total_timeout: Duration) -> Self {
        Self {
            is_shutting_down: AtomicBool::new(false),
            current_phase: AtomicU8::new(ShutdownPhase::Running as u8),
            started_at: Mutex::new(None),
            total_timeout,
            phase_log: Mutex::new(Vec::new()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }

    /// Initiate shutdown. Returns `false` if already shutting down.
    pub fn initiate(&self) -> bool {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        true
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.current_phase.load(Ordering::Relaxed))
    }

    /// Record the current phase and advance to `next`.
    pub fn advance_phase(&self, next: ShutdownPhase, success: bool) {
        let elapsed = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.phase_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PhaseLog {
                phase: self.current_phase(),
                duration_ms: elapsed,
                success,
            });
        self.current_phase.store(next as u8, Ordering::SeqCst);
    }

    pub fn is_timeout_exceeded(&self) -> bool {
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.elapsed() > self.total_timeout)
            .unwrap_or(false)
    }

    pub fn phases_completed(&self) -> Vec<PhaseLog> {
        self.phase_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
