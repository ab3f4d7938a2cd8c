/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Heartbeat and cluster panic controller.
//!
//! Every five seconds each RUNNING engine gets a two-second health probe.
//! Transport failure or a non-200 marks the engine PANIC. A 200 is parsed
//! for the engine's own `generation`: disagreement with the registry means
//! the engine reloaded without a handshake and is equally fatal. Healthy
//! probes extend the trust window. If anything panicked this tick, a
//! cluster panic is broadcast to every engine that ever handshook.

use crate::contract::{EngineState, EventLevel};
use crate::kernel::Kernel;
use crate::registry::TransitionEvent;
use serde_json::json;
use tokio::task::JoinSet;

/// Verdict for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Unresponsive,
    /// Engine reported a generation other than the registry's.
    Drift { observed: u64 },
}

/// Pure probe evaluation: `response` is `(status, body)` when the engine
/// answered at all.
pub fn evaluate_probe(
    response: Option<(u16, serde_json::Value)>,
    expected_generation: u64,
) -> ProbeVerdict {
    let (status, body) = match response {
        Some(r) => r,
        None => return ProbeVerdict::Unresponsive,
    };
    if status != 200 {
        return ProbeVerdict::Unresponsive;
    }
    if let Some(observed) = body.get("generation").and_then(|g| g.as_u64()) {
        if observed != expected_generation {
            return ProbeVerdict::Drift { observed };
        }
    }
    ProbeVerdict::Healthy
}

/// One heartbeat tick over every RUNNING engine.
pub async fn heartbeat_tick(kernel: &Kernel) {
    let targets: Vec<(String, u64, u16)> = kernel
        .registry
        .snapshot_all()
        .into_iter()
        .filter(|(_, record)| record.state == EngineState::Running)
        .filter_map(|(name, record)| {
            kernel
                .config
                .port_for(&name)
                .ok()
                .map(|port| (name, record.generation, port))
        })
        .collect();

    if targets.is_empty() {
        return;
    }

    let probe_client = match reqwest::Client::builder()
        .timeout(kernel.config.heartbeat_probe_timeout)
        .no_proxy()
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("HEARTBEAT | probe client build failed: {e}");
            return;
        }
    };

    let mut probes = JoinSet::new();
    for (name, generation, port) in targets {
        let client = probe_client.clone();
        probes.spawn(async move {
            let url = format!("http://127.0.0.1:{port}/health");
            let response = match client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.json::<serde_json::Value>().await.unwrap_or(json!({}));
                    Some((status, body))
                }
                Err(_) => None,
            };
            (name, evaluate_probe(response, generation))
        });
    }

    let mut panic_required = false;
    while let Some(joined) = probes.join_next().await {
        let (name, verdict) = match joined {
            Ok(v) => v,
            Err(_) => continue,
        };
        match verdict {
            ProbeVerdict::Healthy => {
                let _ = kernel
                    .registry
                    .extend_trust(&name, kernel.config.trust_window_min);
            }
            ProbeVerdict::Unresponsive => {
                tracing::error!("HEARTBEAT FAILURE | {name} is unresponsive");
                let _ = kernel
                    .registry
                    .apply_event(&name, TransitionEvent::HeartbeatTimeout);
                kernel.events.dispatch(
                    EventLevel::Error,
                    "heartbeat_failure",
                    "",
                    "PANIC",
                    json!({"target": name}),
                );
                panic_required = true;
            }
            ProbeVerdict::Drift { observed } => {
                tracing::error!(
                    "DRIFT DETECTED | {name} reported generation {observed}; engine reloaded without handshake"
                );
                let _ = kernel
                    .registry
                    .apply_event(&name, TransitionEvent::GenerationDrift);
                kernel.events.dispatch(
                    EventLevel::Error,
                    "generation_drift",
                    "",
                    "PANIC",
                    json!({"target": name, "observed_generation": observed}),
                );
                panic_required = true;
            }
        }
    }

    if panic_required {
        kernel.rpc.broadcast_panic("HEARTBEAT_TIMEOUT").await;
    }
}
