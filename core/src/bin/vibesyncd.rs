/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Bridge daemon.
//!
//! Runs the orchestration kernel with its stdio frame channel and HTTP
//! control plane. Requests arrive on stdin as line-delimited JSON
//! `{"name": ..., "arguments": ...}`; each response is one JSON line on
//! stdout. Logs go to stderr so stdout stays a clean frame channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use vibe_kernel::config::KernelConfig;
use vibe_kernel::control;
use vibe_kernel::kernel::Kernel;
use vibe_kernel::shutdown::{ShutdownCoordinator, ShutdownPhase};
use vibe_kernel::tools;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let kernel = match Kernel::init(KernelConfig::default()) {
        Ok(kernel) => kernel,
        Err(e) => {
            tracing::error!("KERNEL INIT | {e}");
            std::process::exit(1);
        }
    };

    let background = kernel.spawn_background_tasks();

    let control_kernel = Arc::clone(&kernel);
    let control_port = kernel.config.control_port;
    let control_task = tokio::spawn(async move {
        control::serve(control_kernel, control_port).await;
    });

    let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    {
        let coordinator = Arc::clone(&coordinator);
        if let Err(e) = ctrlc::set_handler(move || {
            if coordinator.initiate() {
                let _ = shutdown_tx.send(());
            }
        }) {
            tracing::warn!("SIGNAL | handler install failed: {e}");
        }
    }

    kernel.touch_activity("bridge_started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_frame(&kernel, &line).await;
                println!("{response}");
            }
        }
    }

    // Ordered teardown.
    coordinator.initiate();
    coordinator.advance_phase(ShutdownPhase::Draining, true);
    tracing::info!("SHUTDOWN | draining");

    for handle in background {
        handle.abort();
    }
    control_task.abort();
    coordinator.advance_phase(ShutdownPhase::StoppingBackground, true);

    kernel.drain_speculative();
    coordinator.advance_phase(ShutdownPhase::FlushingSpeculative, true);

    kernel.registry.save_state();
    kernel.touch_activity("bridge_stopped");
    coordinator.advance_phase(ShutdownPhase::SnapshottingState, true);

    coordinator.advance_phase(ShutdownPhase::Complete, true);
    tracing::info!("SHUTDOWN | complete");
}

/// Handle one stdio frame: parse, dispatch, frame the reply.
async fn handle_frame(kernel: &Arc<Kernel>, line: &str) -> String {
    let frame: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return serde_json::json!({"error": format!("bad frame: {e}")}).to_string(),
    };
    let name = frame.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let arguments = frame
        .get("arguments")
        .cloned()
        .unwrap_or(serde_json::json!({}));

    match tools::dispatch(kernel, name, arguments).await {
        Ok(result) => result.to_string(),
        Err(err) => serde_json::json!({"error": err.to_string()}).to_string(),
    }
}
