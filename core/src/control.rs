/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! HTTP control plane.
//!
//! A small warp server beside the stdio frame channel: `/pulse` for status,
//! `/recover` for the operator reset that is the only exit from PANIC and
//! QUARANTINE, `/activity` for the one-line liveness marker, and `/call`
//! for name-dispatched access to the tool surface.

use crate::contract::{EngineState, EventLevel};
use crate::kernel::Kernel;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Deserialize)]
struct CallRequest {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Build the control-plane route tree.
pub fn routes(
    kernel: Arc<Kernel>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let pulse_kernel = Arc::clone(&kernel);
    let pulse = warp::path("pulse")
        .and(warp::get())
        .map(move || warp::reply::json(&pulse_kernel.pulse()));

    let recover_kernel = Arc::clone(&kernel);
    let recover = warp::path("recover").and(warp::post()).map(move || {
        for name in recover_kernel.registry.names() {
            let _ = recover_kernel
                .registry
                .force_state(&name, EngineState::Stopped);
        }
        recover_kernel.registry.save_state();
        recover_kernel.events.dispatch(
            EventLevel::Warn,
            "operator_recover",
            "",
            "STOPPED",
            json!({}),
        );
        tracing::warn!("OPERATOR | cluster reset to STOPPED via /recover");
        warp::reply::json(&json!({"status": "RECOVERED"}))
    });

    let activity_kernel = Arc::clone(&kernel);
    let activity = warp::path("activity")
        .and(warp::get())
        .map(move || activity_kernel.session.last_activity());

    let call_kernel = Arc::clone(&kernel);
    let call = warp::path("call")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |req: CallRequest| {
            let kernel = Arc::clone(&call_kernel);
            async move {
                let reply = match crate::tools::dispatch(&kernel, &req.name, req.arguments).await
                {
                    Ok(value) => {
                        warp::reply::with_status(warp::reply::json(&value), StatusCode::OK)
                    }
                    Err(err) => warp::reply::with_status(
                        warp::reply::json(&json!({"error": err.to_string()})),
                        StatusCode::BAD_REQUEST,
                    ),
                };
                Ok::<_, warp::Rejection>(reply)
            }
        });

    pulse.or(recover).or(activity).or(call)
}

/// Serve the control plane on loopback until the process exits.
pub async fn serve(kernel: Arc<Kernel>, port: u16) {
    tracing::info!("CONTROL PLANE | listening on 127.0.0.1:{port}");
    warp::serve(routes(kernel)).run(([127, 0, 0, 1], port)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use uuid::Uuid;

    fn test_kernel() -> Arc<Kernel> {
        let base = std::env::temp_dir().join(format!("vibe-control-{}", Uuid::new_v4()));
        Kernel::init(KernelConfig {
            persistence_dir: base.join("persist"),
            discovery_dir: base.join("discover"),
            activity_path: base.join("metadata/bridge_activity.txt"),
            mechanical_audit_command: vec![],
            preflight_command: vec![],
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pulse_route() {
        let kernel = test_kernel();
        let response = warp::test::request()
            .method("GET")
            .path("/pulse")
            .reply(&routes(kernel))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["engines"]["editor"].is_object());
        assert!(body["session_id"].is_string());
    }

    #[tokio::test]
    async fn test_recover_resets_all_engines() {
        let kernel = test_kernel();
        for name in kernel.registry.names() {
            kernel.registry.force_state(&name, EngineState::Panic).unwrap();
        }

        let response = warp::test::request()
            .method("POST")
            .path("/recover")
            .reply(&routes(Arc::clone(&kernel)))
            .await;
        assert_eq!(response.status(), 200);
        for name in kernel.registry.names() {
            assert_eq!(
                kernel.registry.snapshot(&name).unwrap().state,
                EngineState::Stopped
            );
        }
    }

    #[tokio::test]
    async fn test_activity_route_is_plain_text() {
        let kernel = test_kernel();
        kernel.touch_activity("sync_material");
        let response = warp::test::request()
            .method("GET")
            .path("/activity")
            .reply(&routes(kernel))
            .await;
        assert_eq!(response.status(), 200);
        let body = String::from_utf8_lossy(response.body()).to_string();
        assert!(body.contains("sync_material"));
    }

    #[tokio::test]
    async fn test_call_route_dispatches() {
        let kernel = test_kernel();
        let response = warp::test::request()
            .method("POST")
            .path("/call")
            .json(&json!({"name": "get_bridge_pulse"}))
            .reply(&routes(kernel))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["result"]["engines"].is_object());
        assert!(body["forensic_report"].is_object());
    }

    #[tokio::test]
    async fn test_call_route_surfaces_errors() {
        let kernel = test_kernel();
        let response = warp::test::request()
            .method("POST")
            .path("/call")
            .json(&json!({"name": "no_such_tool"}))
            .reply(&routes(kernel))
            .await;
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("no_such_tool"));
    }

    #[tokio::test]
    async fn test_call_route_runs_operator_tools() {
        let kernel = test_kernel();
        let response = warp::test::request()
            .method("POST")
            .path("/call")
            .json(&json!({
                "name": "set_engine_state",
                "arguments": {"target": "dcc", "state": "QUARANTINE"},
            }))
            .reply(&routes(Arc::clone(&kernel)))
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            kernel.registry.snapshot("dcc").unwrap().state,
            EngineState::Quarantine
        );
    }
}
