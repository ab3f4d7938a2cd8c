/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! The tool surface.
//!
//! Every externally callable operation is dispatched by name through
//! `dispatch`, which parses arguments, runs the tool, and wraps the result
//! in the standard `{result, forensic_report, schema_version}` envelope.
//! The same dispatcher backs the stdio frame channel and the control
//! plane's `/call` route.

use crate::clock::now_iso;
use crate::contract::{
    Actor, BridgeHeartbeat, BridgeWalState, EngineState, EventLevel, IntentClass,
    IntentEnvelope, LockType, WalEntry, WalPhase, ENGINE_DCC, ENGINE_EDITOR,
};
use crate::error::KernelError;
use crate::gates::{check_numerical, payload_hash};
use crate::intents::{confidence_gate, ValidationOutcome};
use crate::kernel::Kernel;
use crate::multiplex::is_specialist;
use crate::registry::TransitionEvent;
use crate::sanitizer::audit_payload;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Argument shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StabilizeArgs {
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "v0.4.0".to_string()
}

#[derive(Deserialize)]
struct HandshakeInitArgs {
    target: String,
    version: String,
}

#[derive(Deserialize)]
struct TargetArgs {
    target: String,
}

#[derive(Deserialize)]
struct VerifyStateArgs {
    target: String,
    expected_hash: String,
}

#[derive(Deserialize)]
struct SubmitIntentArgs {
    envelope: IntentEnvelope,
}

#[derive(Deserialize)]
struct IntentIdArgs {
    intent_id: String,
}

#[derive(Deserialize)]
struct AtomicOpArgs {
    intent_id: String,
    #[serde(default)]
    proof_of_work: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct LockObjectArgs {
    target: String,
    object_id: String,
    locked: bool,
}

#[derive(Deserialize)]
struct ApplyLockArgs {
    uuid: String,
    lock_type: LockType,
}

#[derive(Deserialize)]
struct ReleaseLockArgs {
    uuid: String,
}

#[derive(Deserialize)]
struct SyncTransformArgs {
    object_id: String,
    #[serde(default)]
    position: Vec<f64>,
    #[serde(default)]
    rotation: Vec<f64>,
    #[serde(default)]
    scale: Vec<f64>,
}

#[derive(Deserialize)]
struct SyncMaterialArgs {
    object_id: String,
    properties: Value,
}

#[derive(Deserialize)]
struct SyncCameraArgs {
    source: String,
}

#[derive(Deserialize)]
struct SyncSelectionArgs {
    source: String,
    ids: Vec<String>,
}

#[derive(Deserialize)]
struct SyncAssetAtomicArgs {
    asset_path: String,
}

#[derive(Deserialize)]
struct JournalArgs {
    #[serde(default)]
    limit: usize,
}

#[derive(Deserialize)]
struct PlaybackArgs {
    action: String,
    #[serde(default)]
    time: f64,
}

#[derive(Deserialize)]
struct MapIdsArgs {
    editor_guid: String,
    dcc_name: String,
}

#[derive(Deserialize)]
struct MultiplexArgs {
    sensor_id: String,
    target: String,
    endpoint: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct SetEngineStateArgs {
    target: String,
    state: String,
}

#[derive(Deserialize)]
struct RevokeIdArgs {
    id: String,
    reason: String,
}

#[derive(Deserialize)]
struct ReasonArgs {
    reason: String,
}

#[derive(Deserialize)]
struct SpecialistArgs {
    specialist_id: String,
    intent_id: String,
    #[serde(default)]
    current_hash: String,
    #[serde(default)]
    target_intent: Value,
}

#[derive(Deserialize)]
struct GovernedMutationArgs {
    target: String,
    intent_id: String,
    #[serde(default)]
    idempotency_key: String,
    op_spec: Value,
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, KernelError> {
    serde_json::from_value(args)
        .map_err(|e| KernelError::Unknown(format!("invalid arguments: {e}")))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run a named tool. The result is already wrapped in the standard
/// envelope; errors surface to the caller for framing.
pub async fn dispatch(
    kernel: &Arc<Kernel>,
    name: &str,
    args: Value,
) -> Result<Value, KernelError> {
    kernel.touch_activity(name);
    let result = match name {
        "stabilize_and_start" => stabilize_and_start(kernel, parse(args)?).await?,
        "get_bridge_pulse" => kernel.pulse(),
        "verify_identity_parity" => verify_identity_parity(kernel).await?,
        "handshake_init" => handshake_init(kernel, parse(args)?).await?,
        "read_engine_state" => read_engine_state(kernel, parse(args)?).await?,
        "verify_engine_state" => verify_engine_state(kernel, parse(args)?).await?,
        "submit_intent" => submit_intent(kernel, parse(args)?)?,
        "validate_intent" => validate_intent(kernel, parse(args)?)?,
        "human_approve_intent" => human_approve_intent(kernel, parse(args)?)?,
        "begin_atomic_operation" => begin_atomic_operation(kernel, parse(args)?)?,
        "commit_atomic_operation" => commit_atomic_operation(kernel, parse(args)?).await?,
        "abort_atomic_operation" => abort_atomic_operation(kernel, parse(args)?)?,
        "emit_diag_bundle" => emit_diag_bundle(kernel)?,
        "lock_object" => lock_object(kernel, parse(args)?).await?,
        "apply_lock" => apply_lock(kernel, parse(args)?)?,
        "release_lock" => release_lock(kernel, parse(args)?)?,
        "get_metrics" => get_metrics(kernel, parse(args)?).await?,
        "sync_transform" => sync_transform(kernel, parse(args)?)?,
        "sync_material" => sync_material(kernel, parse(args)?).await?,
        "sync_camera" => sync_camera(kernel, parse(args)?).await?,
        "sync_selection" => sync_selection(kernel, parse(args)?).await?,
        "sync_asset_atomic" => sync_asset_atomic(kernel, parse(args)?).await?,
        "get_operation_journal" => get_operation_journal(kernel, parse(args)?)?,
        "control_playback" => control_playback(kernel, parse(args)?).await?,
        "global_id_map_resolve" => global_id_map_resolve(kernel, parse(args)?)?,
        "vibe_multiplex" => vibe_multiplex(kernel, parse(args)?).await?,
        "set_engine_state" => set_engine_state(kernel, parse(args)?)?,
        "revoke_id" => revoke_id(kernel, parse(args)?)?,
        "epistemic_refusal" => epistemic_refusal(kernel, parse(args)?)?,
        "decommission_bridge" => decommission_bridge(kernel)?,
        "reconstruct_state" => json!(kernel.events.replay_trace()),
        "invoke_specialist" => invoke_specialist(kernel, parse(args)?)?,
        "get_bridge_heartbeat" => get_bridge_heartbeat(kernel),
        "get_bridge_handshake_state" => get_bridge_handshake_state(kernel),
        "get_bridge_wal_state" => get_bridge_wal_state(kernel),
        "get_bridge_commit_requirements" => get_bridge_commit_requirements(kernel),
        "execute_governed_mutation" => execute_governed_mutation(kernel, parse(args)?).await?,
        other => {
            return Err(KernelError::Unknown(format!("no tool named '{other}'")));
        }
    };
    Ok(kernel.wrap_result(result))
}

// ---------------------------------------------------------------------------
// Lifecycle tools
// ---------------------------------------------------------------------------

async fn stabilize_and_start(
    kernel: &Arc<Kernel>,
    args: StabilizeArgs,
) -> Result<Value, KernelError> {
    run_preflight(kernel).await?;
    for target in [ENGINE_EDITOR, ENGINE_DCC] {
        handshake_init(
            kernel,
            HandshakeInitArgs {
                target: target.to_string(),
                version: args.version.clone(),
            },
        )
        .await?;
    }
    Ok(kernel.pulse())
}

/// External preflight script. Spawn failure or non-zero exit is fatal.
async fn run_preflight(kernel: &Arc<Kernel>) -> Result<(), KernelError> {
    let command = &kernel.config.preflight_command;
    if command.is_empty() {
        return Ok(());
    }
    let output = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .output()
        .await
        .map_err(|e| KernelError::EngineError(format!("preflight spawn failed: {e}")))?;
    if !output.status.success() {
        return Err(KernelError::EngineError(format!(
            "preflight failed with {}",
            output.status
        )));
    }
    Ok(())
}

async fn handshake_init(
    kernel: &Arc<Kernel>,
    args: HandshakeInitArgs,
) -> Result<Value, KernelError> {
    let target = &args.target;
    kernel
        .registry
        .apply_event(target, TransitionEvent::HandshakeInit)?;
    kernel.registry.update(target, |record| {
        record.generation += 1;
    })?;

    let new_token = Uuid::new_v4().to_string();
    let challenge = format!("{:032x}", rand::random::<u128>());

    let response = kernel
        .rpc
        .send(
            target,
            "handshake",
            "POST",
            Some(json!({
                "version": args.version,
                "new_token": new_token,
                "challenge": challenge,
            })),
        )
        .await?;

    let echoed = response.get("response").and_then(|r| r.as_str())
        == Some(format!("VIBE_HASH_{challenge}").as_str());
    let health_style = response.get("status").and_then(|s| s.as_str()) == Some("ok");
    let accepted = if target == ENGINE_EDITOR {
        health_style || echoed
    } else {
        echoed
    };
    if !accepted {
        return Err(KernelError::AuthFailed(format!(
            "engine '{target}' failed the challenge"
        )));
    }

    let engine_version = response
        .get("engine_version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    kernel
        .registry
        .apply_event(target, TransitionEvent::ChallengeAccepted)?;
    kernel.registry.update(target, |record| {
        record.token = new_token;
        record.version = engine_version;
    })?;
    kernel
        .registry
        .extend_trust(target, kernel.config.trust_window_min)?;

    kernel.events.dispatch(
        EventLevel::Info,
        "handshake_complete",
        "",
        "READY",
        json!({"target": target}),
    );
    kernel.registry.save_state();
    tracing::info!("HANDSHAKE | {target} is RUNNING");
    Ok(json!("OK"))
}

async fn verify_identity_parity(kernel: &Arc<Kernel>) -> Result<Value, KernelError> {
    let editor = kernel
        .rpc
        .send(ENGINE_EDITOR, "state/get", "GET", None)
        .await?;
    let dcc = kernel.rpc.send(ENGINE_DCC, "state/get", "GET", None).await?;
    let matched = editor.get("hash") == dcc.get("hash") && editor.get("hash").is_some();
    Ok(json!(if matched { "MATCHED" } else { "DRIFT_DETECTED" }))
}

async fn read_engine_state(
    kernel: &Arc<Kernel>,
    args: TargetArgs,
) -> Result<Value, KernelError> {
    let response = kernel
        .rpc
        .send(&args.target, "state/get", "GET", None)
        .await?;
    Ok(json!({"hash": response.get("hash").cloned().unwrap_or(Value::Null)}))
}

async fn verify_engine_state(
    kernel: &Arc<Kernel>,
    args: VerifyStateArgs,
) -> Result<Value, KernelError> {
    let response = kernel
        .rpc
        .send(&args.target, "state/get", "GET", None)
        .await?;
    let observed = response
        .get("hash")
        .and_then(|h| h.as_str())
        .unwrap_or_default();
    if observed == args.expected_hash {
        Ok(json!("VERIFIED"))
    } else {
        Err(KernelError::Drift(format!(
            "{}: expected {}, observed {observed}",
            args.target, args.expected_hash
        )))
    }
}

// ---------------------------------------------------------------------------
// Intent tools
// ---------------------------------------------------------------------------

fn submit_intent(kernel: &Arc<Kernel>, args: SubmitIntentArgs) -> Result<Value, KernelError> {
    let confidence = args.envelope.confidence;
    let id = kernel.intents.submit(args.envelope)?;
    kernel.events.dispatch(
        EventLevel::Info,
        "intent_submitted",
        &id,
        "VALIDATE",
        json!({"confidence": confidence}),
    );
    Ok(json!(id))
}

fn validate_intent(kernel: &Arc<Kernel>, args: IntentIdArgs) -> Result<Value, KernelError> {
    let envelope = kernel
        .intents
        .get(&args.intent_id)
        .ok_or_else(|| KernelError::Unknown("UNKNOWN_INTENT".to_string()))?;

    match confidence_gate(&envelope) {
        ValidationOutcome::Allow => Ok(json!("ALLOW")),
        ValidationOutcome::HumanInterventionRequired => {
            kernel
                .registry
                .apply_event_all(TransitionEvent::LowConfidenceIntent);
            kernel.events.dispatch(
                EventLevel::Warn,
                "low_confidence_intercept",
                &args.intent_id,
                "HUMAN_APPROVAL",
                json!({"confidence": envelope.confidence}),
            );
            tracing::warn!(
                "CONFIDENCE GATE | intent {} at {:.2}; cluster halted for human review",
                args.intent_id,
                envelope.confidence
            );
            Ok(json!("HUMAN_INTERVENTION_REQUIRED"))
        }
    }
}

fn human_approve_intent(kernel: &Arc<Kernel>, args: IntentIdArgs) -> Result<Value, KernelError> {
    if kernel.intents.get(&args.intent_id).is_none() {
        return Err(KernelError::Unknown("UNKNOWN_INTENT".to_string()));
    }
    kernel
        .registry
        .apply_event_all(TransitionEvent::HumanApproved);
    kernel.events.dispatch(
        EventLevel::Info,
        "human_approval_granted",
        &args.intent_id,
        "EXECUTE",
        json!({}),
    );
    Ok(json!("APPROVED"))
}

// ---------------------------------------------------------------------------
// Transaction tools
// ---------------------------------------------------------------------------

fn begin_atomic_operation(
    kernel: &Arc<Kernel>,
    args: AtomicOpArgs,
) -> Result<Value, KernelError> {
    let tx = kernel.transactions.begin(&args.intent_id);
    Ok(json!({"status": "TX_OPEN", "transaction_id": tx.id}))
}

async fn commit_atomic_operation(
    kernel: &Arc<Kernel>,
    args: AtomicOpArgs,
) -> Result<Value, KernelError> {
    let tx = kernel.transactions.find(&args.intent_id);
    kernel
        .transactions
        .commit(
            &args.intent_id,
            args.proof_of_work.as_deref(),
            args.reason.as_deref().unwrap_or(""),
        )
        .await?;

    let mut entry = WalEntry::new("cluster", Actor::Ai, WalPhase::Terminal);
    entry.tid = tx.map(|t| t.id);
    entry.system_health = kernel.cluster_health();
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut entry) {
        tracing::warn!("COMMIT | journal append failed: {e}");
    }
    kernel.registry.save_state();
    Ok(json!("COMMITTED"))
}

fn abort_atomic_operation(
    kernel: &Arc<Kernel>,
    args: AtomicOpArgs,
) -> Result<Value, KernelError> {
    let tx = kernel.transactions.find(&args.intent_id);
    kernel.transactions.abort(&args.intent_id);
    let mut entry = WalEntry::new("cluster", Actor::Ai, WalPhase::RolledBack);
    entry.tid = tx.map(|t| t.id);
    entry.system_health = kernel.cluster_health();
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut entry) {
        tracing::warn!("ABORT | journal append failed: {e}");
    }
    Ok(json!("ABORTED"))
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Write a manifest describing the forensic surfaces. No archive is built;
/// supervision tooling packages the named files itself.
fn emit_diag_bundle(kernel: &Arc<Kernel>) -> Result<Value, KernelError> {
    let wal_lines = kernel.wal.read_tail(0).len();
    let event_lines = kernel.events.recent(0).len();
    let manifest = json!({
        "generated_at": now_iso(),
        "session_id": kernel.session.session_id.to_string(),
        "journal": {
            "path": kernel.wal.path().display().to_string(),
            "lines": wal_lines,
            "tip_hash": kernel.wal.tip(),
        },
        "events": {
            "path": kernel.events.path().display().to_string(),
            "lines": event_lines,
        },
        "state": {
            "path": kernel.config.state_path().display().to_string(),
            "exists": kernel.config.state_path().exists(),
        },
    });
    let path = kernel.config.persistence_dir.join("diag_manifest.json");
    std::fs::write(&path, serde_json::to_string_pretty(&manifest).unwrap_or_default())
        .map_err(|e| KernelError::Unknown(format!("diag manifest write: {e}")))?;
    Ok(json!(path.display().to_string()))
}

// ---------------------------------------------------------------------------
// Lock tools
// ---------------------------------------------------------------------------

async fn lock_object(kernel: &Arc<Kernel>, args: LockObjectArgs) -> Result<Value, KernelError> {
    let response = kernel
        .rpc
        .send(
            &args.target,
            "object/lock",
            "POST",
            Some(json!({"id": args.object_id, "locked": args.locked})),
        )
        .await?;
    kernel.events.dispatch(
        EventLevel::Info,
        "object_lock_changed",
        "",
        "",
        json!({"id": args.object_id, "locked": args.locked, "target": args.target}),
    );
    Ok(response.get("status").cloned().unwrap_or(json!("OK")))
}

fn apply_lock(kernel: &Arc<Kernel>, args: ApplyLockArgs) -> Result<Value, KernelError> {
    let actor = match args.lock_type {
        LockType::HumanActive => Actor::Human,
        LockType::AiSpeculative => Actor::Ai,
        LockType::Perimeter => Actor::System,
    };
    let lock = kernel.locks.apply(&args.uuid, args.lock_type, actor);
    Ok(serde_json::to_value(lock).unwrap_or(json!("LOCKED")))
}

fn release_lock(kernel: &Arc<Kernel>, args: ReleaseLockArgs) -> Result<Value, KernelError> {
    let held = kernel.locks.release(&args.uuid);
    Ok(json!(if held { "RELEASED" } else { "NOT_HELD" }))
}

async fn get_metrics(kernel: &Arc<Kernel>, args: TargetArgs) -> Result<Value, KernelError> {
    kernel.rpc.send(&args.target, "metrics", "GET", None).await
}

// ---------------------------------------------------------------------------
// Sync tools
// ---------------------------------------------------------------------------

fn sync_transform(kernel: &Arc<Kernel>, args: SyncTransformArgs) -> Result<Value, KernelError> {
    let mut components = Vec::new();
    components.extend_from_slice(&args.position);
    components.extend_from_slice(&args.rotation);
    components.extend_from_slice(&args.scale);
    check_numerical(&components)?;
    kernel.locks.check_human_lock(&args.object_id)?;

    let payload = json!({
        "id": args.object_id,
        "transform": {"pos": args.position, "rot": args.rotation, "sca": args.scale},
    });

    // Stage the provisional journal shape; the drain ticker promotes it.
    let mut staged = WalEntry::new("cluster", Actor::Ai, WalPhase::Provisional);
    staged.scope.uuids = vec![args.object_id.clone()];
    staged.scope.class = IntentClass::Cosmetic;
    staged.tid = kernel.transactions.active_id();
    kernel.buffer.stage(&args.object_id, staged);

    // Fire both engine writes without blocking the caller.
    let fanout = Arc::clone(kernel);
    tokio::spawn(async move {
        for target in [ENGINE_EDITOR, ENGINE_DCC] {
            if let Err(e) = fanout
                .rpc
                .send(target, "transform/set", "POST", Some(payload.clone()))
                .await
            {
                tracing::warn!("SYNC TRANSFORM | {target}: {e}");
            }
        }
    });

    Ok(json!("PROVISIONAL_OK"))
}

async fn sync_material(
    kernel: &Arc<Kernel>,
    args: SyncMaterialArgs,
) -> Result<Value, KernelError> {
    kernel.locks.check_human_lock(&args.object_id)?;

    let mut entry = WalEntry::new("cluster", Actor::Ai, WalPhase::Pending);
    entry.scope.uuids = vec![args.object_id.clone()];
    entry.scope.class = IntentClass::Cosmetic;
    entry.tid = kernel.transactions.active_id();
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut entry) {
        tracing::warn!("SYNC MATERIAL | journal append failed: {e}");
    }

    let payload = json!({"id": args.object_id, "properties": args.properties});
    for target in [ENGINE_EDITOR, ENGINE_DCC] {
        if let Err(e) = kernel
            .rpc
            .send(target, "material/update", "POST", Some(payload.clone()))
            .await
        {
            tracing::warn!("SYNC MATERIAL | {target}: {e}");
        }
    }
    Ok(json!("OK"))
}

fn counterpart(source: &str) -> &'static str {
    if source == ENGINE_EDITOR {
        ENGINE_DCC
    } else {
        ENGINE_EDITOR
    }
}

async fn sync_camera(kernel: &Arc<Kernel>, args: SyncCameraArgs) -> Result<Value, KernelError> {
    let target = counterpart(&args.source);
    let camera = kernel
        .rpc
        .send(&args.source, "camera/get", "GET", None)
        .await?;
    kernel
        .rpc
        .send(target, "camera/set", "POST", Some(camera))
        .await?;
    Ok(json!("OK"))
}

async fn sync_selection(
    kernel: &Arc<Kernel>,
    args: SyncSelectionArgs,
) -> Result<Value, KernelError> {
    let target = counterpart(&args.source);
    kernel
        .rpc
        .send(target, "selection/set", "POST", Some(json!({"ids": args.ids})))
        .await?;
    Ok(json!("OK"))
}

/// Atomic asset pipeline: preflight → export → sandboxed import →
/// validate; a hash mismatch rolls the editor back and desyncs the whole
/// cluster, a match commits.
async fn sync_asset_atomic(
    kernel: &Arc<Kernel>,
    args: SyncAssetAtomicArgs,
) -> Result<Value, KernelError> {
    let path = &args.asset_path;

    let mut entry = WalEntry::new(ENGINE_DCC, Actor::Ai, WalPhase::Pending);
    entry.scope.uuids = vec![path.clone()];
    entry.scope.class = IntentClass::Structural;
    entry.tid = kernel.transactions.active_id();
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut entry) {
        tracing::warn!("ASSET SYNC | journal append failed: {e}");
    }

    let preflight = kernel
        .rpc
        .send(ENGINE_DCC, "preflight/run", "POST", Some(json!({"path": path})))
        .await
        .map_err(|e| KernelError::EngineError(format!("PREFLIGHT_FAILED | {e}")))?;

    let export = kernel
        .rpc
        .send(ENGINE_DCC, "export", "POST", Some(json!({"path": path})))
        .await
        .map_err(|e| KernelError::EngineError(format!("EXPORT_FAILED | {e}")))?;

    kernel
        .rpc
        .send(
            ENGINE_EDITOR,
            "import",
            "POST",
            Some(json!({
                "path": path,
                "meta": export.get("meta").cloned().unwrap_or(Value::Null),
                "mode": "sandbox",
            })),
        )
        .await?;

    let validate = kernel
        .rpc
        .send(ENGINE_EDITOR, "validate", "POST", Some(json!({"path": path})))
        .await
        .map_err(|e| KernelError::EngineError(format!("VALIDATION_FAILED | {e}")))?;

    let expected = preflight
        .get("hash")
        .and_then(|h| h.as_str())
        .unwrap_or_default()
        .to_string();
    let observed = validate
        .get("hash")
        .and_then(|h| h.as_str())
        .unwrap_or_default()
        .to_string();

    {
        let mut handshake = kernel
            .asset_handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        handshake.asset_id = path.clone();
        handshake.dcc_export_hash = expected.clone();
        handshake.editor_import_hash = observed.clone();
        handshake.hash_match = expected == observed;
        handshake.last_verified = now_iso();
    }

    if expected != observed {
        if let Err(e) = kernel
            .rpc
            .send(ENGINE_EDITOR, "rollback", "POST", Some(json!({"path": path})))
            .await
        {
            tracing::warn!("ASSET SYNC | rollback delivery failed: {e}");
        }
        for name in kernel.registry.names() {
            let _ = kernel.registry.force_state(&name, EngineState::Desync);
        }
        let mut failed = WalEntry::new(ENGINE_EDITOR, Actor::Ai, WalPhase::Failed);
        failed.scope.uuids = vec![path.clone()];
        failed.verify.expected_hash = expected.clone();
        failed.verify.observed_hash = observed.clone();
        failed.failure_class = Some(crate::contract::FailureClass::AssetMismatch);
        if let Err(e) = kernel.wal.append(&kernel.clock, &mut failed) {
            tracing::warn!("ASSET SYNC | journal append failed: {e}");
        }
        kernel.events.dispatch(
            EventLevel::Error,
            "asset_desync",
            "",
            "DESYNC",
            json!({"path": path, "expected": expected, "observed": observed}),
        );
        tracing::error!("ASSET SYNC | hash mismatch on {path}; cluster in DESYNC");
        return Err(KernelError::HashMismatch { expected, observed });
    }

    kernel
        .rpc
        .send(ENGINE_EDITOR, "commit", "POST", Some(json!({"path": path})))
        .await?;

    let mut final_entry = WalEntry::new(ENGINE_EDITOR, Actor::Ai, WalPhase::Final);
    final_entry.scope.uuids = vec![path.clone()];
    final_entry.verify.expected_hash = expected;
    final_entry.verify.observed_hash = observed;
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut final_entry) {
        tracing::warn!("ASSET SYNC | journal append failed: {e}");
    }
    Ok(json!("SYNCED"))
}

fn get_operation_journal(kernel: &Arc<Kernel>, args: JournalArgs) -> Result<Value, KernelError> {
    Ok(json!(kernel.wal.read_tail(args.limit).join("\n")))
}

async fn control_playback(
    kernel: &Arc<Kernel>,
    args: PlaybackArgs,
) -> Result<Value, KernelError> {
    check_numerical(&[args.time])?;
    let payload = json!({"action": args.action, "time": args.time});
    for target in [ENGINE_EDITOR, ENGINE_DCC] {
        if let Err(e) = kernel
            .rpc
            .send(target, "playback/control", "POST", Some(payload.clone()))
            .await
        {
            tracing::warn!("PLAYBACK | {target}: {e}");
        }
    }
    Ok(json!("OK"))
}

fn global_id_map_resolve(kernel: &Arc<Kernel>, args: MapIdsArgs) -> Result<Value, KernelError> {
    kernel.registry.map_ids(&args.editor_guid, &args.dcc_name);
    kernel.registry.save_state();
    Ok(json!("RESOLVED"))
}

async fn vibe_multiplex(kernel: &Arc<Kernel>, args: MultiplexArgs) -> Result<Value, KernelError> {
    kernel.drivers.authorize(&args.sensor_id, &args.endpoint)?;
    kernel
        .rpc
        .send(&args.target, &args.endpoint, "POST", Some(args.payload))
        .await
}

// ---------------------------------------------------------------------------
// Operator tools
// ---------------------------------------------------------------------------

fn set_engine_state(kernel: &Arc<Kernel>, args: SetEngineStateArgs) -> Result<Value, KernelError> {
    let state = EngineState::parse(&args.state)
        .ok_or_else(|| KernelError::Unknown(format!("unknown state '{}'", args.state)))?;
    kernel.registry.force_state(&args.target, state)?;
    kernel.registry.save_state();
    tracing::info!("OPERATOR | {} forced to {state}", args.target);
    Ok(json!("OK"))
}

fn revoke_id(kernel: &Arc<Kernel>, args: RevokeIdArgs) -> Result<Value, KernelError> {
    kernel.registry.revoke_id(&args.id, &args.reason);
    kernel.events.dispatch(
        EventLevel::Warn,
        "id_revoked",
        "",
        "",
        json!({"id": args.id, "reason": args.reason}),
    );
    Ok(json!("REVOKED"))
}

fn epistemic_refusal(kernel: &Arc<Kernel>, args: ReasonArgs) -> Result<Value, KernelError> {
    kernel.events.dispatch(
        EventLevel::Info,
        "epistemic_refusal",
        "",
        "",
        json!({"reason": args.reason}),
    );
    Ok(json!(format!("UNKNOWABLE: {}", args.reason)))
}

fn decommission_bridge(kernel: &Arc<Kernel>) -> Result<Value, KernelError> {
    kernel
        .registry
        .apply_event_all(TransitionEvent::Decommission);
    kernel.events.dispatch(
        EventLevel::Warn,
        "bridge_decommissioned",
        "",
        "PANIC",
        json!({}),
    );
    kernel.registry.save_state();
    Ok(json!("DECOMMISSIONED"))
}

fn invoke_specialist(kernel: &Arc<Kernel>, args: SpecialistArgs) -> Result<Value, KernelError> {
    if !is_specialist(&args.specialist_id) {
        return Err(KernelError::PolicyViolation(
            "SPECIALIST_UNREGISTERED".to_string(),
        ));
    }
    if kernel.intents.get(&args.intent_id).is_none() {
        return Err(KernelError::Unknown("UNKNOWN_INTENT".to_string()));
    }
    let work_order_id = Uuid::new_v4().to_string();
    let mut entry = WalEntry::new("cluster", Actor::Ai, WalPhase::Pending);
    entry.tid = kernel.transactions.active_id();
    entry.verify.expected_hash = args.current_hash.clone();
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut entry) {
        tracing::warn!("SPECIALIST | journal append failed: {e}");
    }
    kernel.events.dispatch(
        EventLevel::Info,
        "specialist_invoked",
        &args.intent_id,
        "EXECUTE",
        json!({
            "specialist": args.specialist_id,
            "work_order_id": work_order_id,
            "target_intent": args.target_intent,
        }),
    );
    Ok(json!({"work_order_id": work_order_id, "specialist": args.specialist_id}))
}

// ---------------------------------------------------------------------------
// Bridge introspection
// ---------------------------------------------------------------------------

fn get_bridge_heartbeat(kernel: &Arc<Kernel>) -> Value {
    let engines = kernel.registry.snapshot_all();
    let connected = |name: &str| {
        engines
            .get(name)
            .map(|r| r.state == EngineState::Running)
            .unwrap_or(false)
    };
    let heartbeat = BridgeHeartbeat {
        bridge_pid: std::process::id(),
        uptime_sec: kernel.session.uptime_secs(),
        epoch_id: kernel.clock.current() as i64,
        orchestrator_connected: true,
        editor_connected: connected(ENGINE_EDITOR),
        dcc_connected: connected(ENGINE_DCC),
        last_tick_hash: kernel.wal.tip(),
        expected_interval_ms: kernel.config.heartbeat_interval.as_millis() as u64,
        last_seen_ms: 0,
    };
    serde_json::to_value(heartbeat).unwrap_or(json!({}))
}

fn get_bridge_handshake_state(kernel: &Arc<Kernel>) -> Value {
    let handshake = kernel
        .asset_handshake
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    serde_json::to_value(handshake).unwrap_or(json!({}))
}

fn get_bridge_wal_state(kernel: &Arc<Kernel>) -> Value {
    let last_committed = kernel
        .wal
        .read_entries(1)
        .first()
        .map(|e| format!("{}#{}", e.engine, e.intent_id))
        .unwrap_or_default();
    let state = BridgeWalState {
        wal_head: kernel.clock.current(),
        wal_hash: kernel.wal.tip(),
        last_committed_op: last_committed,
        pending_ops: kernel.buffer.len(),
        rollback_available: kernel.transactions.active_id().is_some(),
        reversible: true,
    };
    serde_json::to_value(state).unwrap_or(json!({}))
}

fn get_bridge_commit_requirements(kernel: &Arc<Kernel>) -> Value {
    let handshake = kernel
        .asset_handshake
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let mut required: HashMap<String, String> = HashMap::new();
    if !handshake.dcc_export_hash.is_empty() {
        required.insert(ENGINE_DCC.to_string(), handshake.dcc_export_hash);
    }
    if !handshake.editor_import_hash.is_empty() {
        required.insert(ENGINE_EDITOR.to_string(), handshake.editor_import_hash);
    }
    json!({
        "required_hashes": required,
        "rationale_required": true,
        "commit_allowed": kernel.transactions.active_id().is_some()
            && kernel.cluster_health() == crate::contract::SystemHealth::Safe,
    })
}

// ---------------------------------------------------------------------------
// Governed mutation
// ---------------------------------------------------------------------------

/// Recursively collect every float in a payload for the numerical gate.
fn collect_floats(value: &Value, out: &mut Vec<f64>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.push(f);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_floats(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_floats(item, out);
            }
        }
        _ => {}
    }
}

/// The fully gated mutation path: audit → numerical → idempotency →
/// entropy, then revocation and human-lock checks, then the engine call.
async fn execute_governed_mutation(
    kernel: &Arc<Kernel>,
    args: GovernedMutationArgs,
) -> Result<Value, KernelError> {
    let envelope = kernel
        .intents
        .get(&args.intent_id)
        .ok_or_else(|| KernelError::Unknown("UNKNOWN_INTENT".to_string()))?;

    // Gate 1: static audit. A security violation costs the target 20 trust
    // points even though no call was emitted.
    if let Err(err) = audit_payload(&args.op_spec) {
        if matches!(err, KernelError::SecurityViolation(_)) {
            let decayed = kernel.registry.decay_trust(&args.target, 20);
            kernel.events.dispatch(
                EventLevel::Error,
                "security_intercept",
                &args.intent_id,
                "PANIC",
                json!({"target": args.target, "error": err.to_string()}),
            );
            if let Ok((_, true)) = decayed {
                kernel.events.dispatch(
                    EventLevel::Error,
                    "quarantine_triggered",
                    "",
                    "",
                    json!({"target": args.target}),
                );
            }
        }
        return Err(err);
    }

    // Gate 2: numerical safety over every float in the op spec.
    let mut floats = Vec::new();
    collect_floats(&args.op_spec, &mut floats);
    check_numerical(&floats)?;

    // Gate 3: idempotency.
    kernel
        .idempotency
        .check(&args.idempotency_key, &payload_hash(&args.op_spec))?;

    // Gate 4: entropy budget.
    kernel.entropy.check()?;

    // Policy: revoked ids and live human locks block the mutation.
    let named_object = args.op_spec.get("id").and_then(|v| v.as_str());
    if let Some(id) = named_object {
        if kernel.registry.is_revoked(id) {
            return Err(KernelError::PolicyViolation(format!("id '{id}' is revoked")));
        }
        kernel.locks.check_human_lock(id)?;
    }
    for uuid in &envelope.scope {
        kernel.locks.check_human_lock(uuid)?;
    }

    let mut entry = WalEntry::new(&args.target, Actor::Ai, WalPhase::Pending);
    entry.scope.uuids = named_object
        .map(|id| vec![id.to_string()])
        .unwrap_or_else(|| envelope.scope.clone());
    entry.scope.class = envelope.class.unwrap_or_default();
    entry.tid = kernel.transactions.active_id();
    entry.system_health = kernel.cluster_health();
    if let Err(e) = kernel.wal.append(&kernel.clock, &mut entry) {
        tracing::warn!("GOVERNED MUTATION | journal append failed: {e}");
    }

    let endpoint = if args.target == ENGINE_DCC {
        "mesh/mutate"
    } else {
        "object/mutate"
    };

    match kernel
        .rpc
        .send(&args.target, endpoint, "POST", Some(args.op_spec))
        .await
    {
        Ok(response) => {
            kernel.registry.debit_credits(1);
            kernel.registry.save_state();
            Ok(json!({
                "status": response.get("status").cloned().unwrap_or(json!("OK")),
            }))
        }
        Err(err) => {
            let mut failed = WalEntry::new(&args.target, Actor::Ai, WalPhase::Failed);
            failed.failure_class = Some(err.failure_class());
            failed.tid = kernel.transactions.active_id();
            if let Err(e) = kernel.wal.append(&kernel.clock, &mut failed) {
                tracing::warn!("GOVERNED MUTATION | journal append failed: {e}");
            }
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn test_kernel() -> Arc<Kernel> {
        let base = std::env::temp_dir().join(format!("vibe-tools-{}", Uuid::new_v4()));
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

    fn envelope(confidence: f64) -> Value {
        json!({
            "envelope": {
                "rationale": "r",
                "provenance": "p",
                "confidence": confidence,
            }
        })
    }

    async fn submit(kernel: &Arc<Kernel>, confidence: f64) -> String {
        let wrapped = dispatch(kernel, "submit_intent", envelope(confidence))
            .await
            .unwrap();
        wrapped["result"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_unknown_tool_name() {
        let kernel = test_kernel();
        let err = dispatch(&kernel, "not_a_tool", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not_a_tool"));
    }

    #[tokio::test]
    async fn test_every_result_is_wrapped() {
        let kernel = test_kernel();
        let wrapped = dispatch(&kernel, "get_bridge_pulse", json!({})).await.unwrap();
        assert!(wrapped.get("result").is_some());
        assert!(wrapped.get("forensic_report").is_some());
        assert!(wrapped.get("schema_version").is_some());
    }

    #[tokio::test]
    async fn test_submit_intent_requires_rationale() {
        let kernel = test_kernel();
        let err = dispatch(
            &kernel,
            "submit_intent",
            json!({"envelope": {"rationale": "", "provenance": "p", "confidence": 0.9}}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("RATIONALE_REQUIRED"));
    }

    #[tokio::test]
    async fn test_confidence_gate_halts_cluster() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.5).await;

        let wrapped = dispatch(&kernel, "validate_intent", json!({"intent_id": id}))
            .await
            .unwrap();
        assert_eq!(wrapped["result"], "HUMAN_INTERVENTION_REQUIRED");
        for name in kernel.registry.names() {
            assert_eq!(
                kernel.registry.snapshot(&name).unwrap().state,
                EngineState::HumanInterventionRequired
            );
        }
    }

    #[tokio::test]
    async fn test_high_confidence_allows() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.9).await;
        let wrapped = dispatch(&kernel, "validate_intent", json!({"intent_id": id}))
            .await
            .unwrap();
        assert_eq!(wrapped["result"], "ALLOW");
        assert_eq!(
            kernel.registry.snapshot(ENGINE_EDITOR).unwrap().state,
            EngineState::Stopped,
            "high confidence leaves engine states untouched"
        );
    }

    #[tokio::test]
    async fn test_human_approval_resumes_cluster() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.3).await;
        dispatch(&kernel, "validate_intent", json!({"intent_id": id}))
            .await
            .unwrap();

        let wrapped = dispatch(&kernel, "human_approve_intent", json!({"intent_id": id}))
            .await
            .unwrap();
        assert_eq!(wrapped["result"], "APPROVED");
        for name in kernel.registry.names() {
            assert_eq!(
                kernel.registry.snapshot(&name).unwrap().state,
                EngineState::Running
            );
        }
    }

    #[tokio::test]
    async fn test_validate_unknown_intent() {
        let kernel = test_kernel();
        let err = dispatch(&kernel, "validate_intent", json!({"intent_id": "ghost"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("UNKNOWN_INTENT"));
    }

    #[tokio::test]
    async fn test_transaction_lifecycle_via_tools() {
        let kernel = test_kernel();
        let wrapped = dispatch(
            &kernel,
            "begin_atomic_operation",
            json!({"intent_id": "i-1"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"]["status"], "TX_OPEN");
        assert!(kernel.transactions.active_id().is_some());

        // Commit without proof of work is refused.
        let err = dispatch(
            &kernel,
            "commit_atomic_operation",
            json!({"intent_id": "i-1"}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("PROOF_OF_WORK_REQUIRED"));

        let wrapped = dispatch(
            &kernel,
            "commit_atomic_operation",
            json!({"intent_id": "i-1", "proof_of_work": "sha:abc", "reason": "done"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"], "COMMITTED");
        assert!(kernel.transactions.active_id().is_none());

        // The commit journaled a TERMINAL entry carrying the tx id.
        let entries = kernel.wal.read_entries(0);
        let terminal = entries
            .iter()
            .find(|e| e.phase == WalPhase::Terminal)
            .expect("terminal entry");
        assert!(terminal.tid.is_some());
    }

    #[tokio::test]
    async fn test_abort_journal_and_clear() {
        let kernel = test_kernel();
        dispatch(&kernel, "begin_atomic_operation", json!({"intent_id": "i-2"}))
            .await
            .unwrap();
        let wrapped = dispatch(
            &kernel,
            "abort_atomic_operation",
            json!({"intent_id": "i-2"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"], "ABORTED");
        assert!(kernel.transactions.active_id().is_none());
        assert!(kernel
            .wal
            .read_entries(0)
            .iter()
            .any(|e| e.phase == WalPhase::RolledBack));
    }

    #[tokio::test]
    async fn test_apply_and_release_lock() {
        let kernel = test_kernel();
        let wrapped = dispatch(
            &kernel,
            "apply_lock",
            json!({"uuid": "u-1", "lock_type": "HUMAN_ACTIVE"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"]["type"], "HUMAN_ACTIVE");
        assert!(kernel.locks.check_human_lock("u-1").is_err());

        let wrapped = dispatch(&kernel, "release_lock", json!({"uuid": "u-1"}))
            .await
            .unwrap();
        assert_eq!(wrapped["result"], "RELEASED");
        assert!(kernel.locks.check_human_lock("u-1").is_ok());
    }

    #[tokio::test]
    async fn test_sync_transform_rejects_nan() {
        // NaN has no JSON spelling, so this arrives through the typed path
        // (callers embedding the kernel directly).
        let kernel = test_kernel();
        let args = SyncTransformArgs {
            object_id: "u-1".to_string(),
            position: vec![f64::NAN, 0.0, 0.0],
            rotation: vec![0.0, 0.0, 0.0],
            scale: vec![1.0, 1.0, 1.0],
        };
        let err = sync_transform(&kernel, args).unwrap_err();
        assert!(matches!(err, KernelError::NumericalInstability(_)));
        assert!(kernel.buffer.is_empty(), "nothing staged on rejection");
    }

    #[tokio::test]
    async fn test_sync_transform_blocked_by_human_lock() {
        let kernel = test_kernel();
        kernel.locks.apply("u-9", LockType::HumanActive, Actor::Human);
        let err = dispatch(
            &kernel,
            "sync_transform",
            json!({"object_id": "u-9", "position": [1.0], "rotation": [], "scale": []}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KernelError::Locked { .. }));
    }

    #[tokio::test]
    async fn test_sync_transform_stages_provisional() {
        let kernel = test_kernel();
        let wrapped = dispatch(
            &kernel,
            "sync_transform",
            json!({"object_id": "u-2", "position": [1.0, 2.0, 3.0], "rotation": [], "scale": []}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"], "PROVISIONAL_OK");
        assert_eq!(kernel.buffer.len(), 1);

        // The drain promotes it.
        kernel.drain_speculative();
        assert!(kernel.buffer.is_empty());
        assert!(kernel
            .wal
            .read_entries(0)
            .iter()
            .any(|e| e.phase == WalPhase::Final && e.scope.uuids == vec!["u-2"]));
    }

    #[tokio::test]
    async fn test_governed_mutation_security_violation_decays_trust() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.9).await;
        let before = kernel.registry.snapshot(ENGINE_EDITOR).unwrap().trust_score;

        let err = dispatch(
            &kernel,
            "execute_governed_mutation",
            json!({
                "target": "editor",
                "intent_id": id,
                "idempotency_key": "k-1",
                "op_spec": {"cmd": "os.system('rm -rf /')"},
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KernelError::SecurityViolation(_)));

        let after = kernel.registry.snapshot(ENGINE_EDITOR).unwrap().trust_score;
        assert_eq!(before - after, 20);
        // No engine call was journaled: the WAL has no entry for editor.
        assert!(kernel
            .wal
            .read_entries(0)
            .iter()
            .all(|e| e.engine != "editor"));
    }

    #[tokio::test]
    async fn test_governed_mutation_idempotency_breach() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.9).await;

        // First call fails at the engine (nothing listening) but passes the
        // gates, so the key is now bound to this payload hash.
        let _ = dispatch(
            &kernel,
            "execute_governed_mutation",
            json!({
                "target": "editor",
                "intent_id": id,
                "idempotency_key": "k-same",
                "op_spec": {"op": "scale", "factor": 2.0},
            }),
        )
        .await;

        let err = dispatch(
            &kernel,
            "execute_governed_mutation",
            json!({
                "target": "editor",
                "intent_id": id,
                "idempotency_key": "k-same",
                "op_spec": {"op": "delete"},
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("idempotency"));
    }

    #[tokio::test]
    async fn test_governed_mutation_revoked_id() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.9).await;
        dispatch(
            &kernel,
            "revoke_id",
            json!({"id": "obj-x", "reason": "compromised"}),
        )
        .await
        .unwrap();

        let err = dispatch(
            &kernel,
            "execute_governed_mutation",
            json!({
                "target": "editor",
                "intent_id": id,
                "idempotency_key": "",
                "op_spec": {"id": "obj-x", "op": "move"},
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("revoked"));
    }

    #[tokio::test]
    async fn test_governed_mutation_entropy_exhaustion() {
        let base = std::env::temp_dir().join(format!("vibe-tools-{}", Uuid::new_v4()));
        let kernel = Kernel::init(KernelConfig {
            persistence_dir: base.join("persist"),
            discovery_dir: base.join("discover"),
            activity_path: base.join("metadata/bridge_activity.txt"),
            mechanical_audit_command: vec![],
            preflight_command: vec![],
            entropy_limit: 1,
            ..Default::default()
        })
        .unwrap();
        let id = submit(&kernel, 0.9).await;

        // First mutation spends the lone entropy unit (engine call fails,
        // but the budget is already consumed).
        let _ = dispatch(
            &kernel,
            "execute_governed_mutation",
            json!({"target": "editor", "intent_id": id, "idempotency_key": "", "op_spec": {"op": "a"}}),
        )
        .await;

        let err = dispatch(
            &kernel,
            "execute_governed_mutation",
            json!({"target": "editor", "intent_id": id, "idempotency_key": "", "op_spec": {"op": "b"}}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("entropy"));
    }

    #[tokio::test]
    async fn test_id_map_resolve_and_persist() {
        let kernel = test_kernel();
        let wrapped = dispatch(
            &kernel,
            "global_id_map_resolve",
            json!({"editor_guid": "guid-1", "dcc_name": "Cube"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"], "RESOLVED");
        assert_eq!(kernel.registry.resolve_id("Cube").as_deref(), Some("guid-1"));
    }

    #[tokio::test]
    async fn test_multiplex_policy() {
        let kernel = test_kernel();
        let err = dispatch(
            &kernel,
            "vibe_multiplex",
            json!({"sensor_id": "rogue", "target": "editor", "endpoint": "render/capture", "payload": {}}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("DRIVER_UNREGISTERED"));

        let err = dispatch(
            &kernel,
            "vibe_multiplex",
            json!({"sensor_id": "vision_mcp", "target": "editor", "endpoint": "object/mutate", "payload": {}}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("PERMISSION_DENIED"));
    }

    #[tokio::test]
    async fn test_set_engine_state_and_decommission() {
        let kernel = test_kernel();
        dispatch(
            &kernel,
            "set_engine_state",
            json!({"target": "editor", "state": "RUNNING"}),
        )
        .await
        .unwrap();
        assert_eq!(
            kernel.registry.snapshot(ENGINE_EDITOR).unwrap().state,
            EngineState::Running
        );

        let wrapped = dispatch(&kernel, "decommission_bridge", json!({})).await.unwrap();
        assert_eq!(wrapped["result"], "DECOMMISSIONED");
        for name in kernel.registry.names() {
            assert_eq!(
                kernel.registry.snapshot(&name).unwrap().state,
                EngineState::Panic
            );
        }
    }

    #[tokio::test]
    async fn test_epistemic_refusal() {
        let kernel = test_kernel();
        let wrapped = dispatch(
            &kernel,
            "epistemic_refusal",
            json!({"reason": "occluded geometry"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"], "UNKNOWABLE: occluded geometry");
    }

    #[tokio::test]
    async fn test_reconstruct_state_replays_events() {
        let kernel = test_kernel();
        submit(&kernel, 0.9).await;
        dispatch(&kernel, "revoke_id", json!({"id": "x", "reason": "r"}))
            .await
            .unwrap();
        let wrapped = dispatch(&kernel, "reconstruct_state", json!({})).await.unwrap();
        let trace = wrapped["result"].as_str().unwrap();
        assert!(trace.contains("intent_submitted"));
        assert!(trace.contains("id_revoked"));
    }

    #[tokio::test]
    async fn test_invoke_specialist_policy() {
        let kernel = test_kernel();
        let id = submit(&kernel, 0.9).await;

        let err = dispatch(
            &kernel,
            "invoke_specialist",
            json!({"specialist_id": "destroyer", "intent_id": id}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("SPECIALIST_UNREGISTERED"));

        let wrapped = dispatch(
            &kernel,
            "invoke_specialist",
            json!({"specialist_id": "optimize", "intent_id": id, "current_hash": "h"}),
        )
        .await
        .unwrap();
        assert_eq!(wrapped["result"]["specialist"], "optimize");
        assert!(wrapped["result"]["work_order_id"].is_string());
    }

    #[tokio::test]
    async fn test_bridge_introspection_shapes() {
        let kernel = test_kernel();
        let hb = dispatch(&kernel, "get_bridge_heartbeat", json!({})).await.unwrap();
        assert!(hb["result"]["bridge_pid"].as_u64().unwrap() > 0);
        assert_eq!(hb["result"]["editor_connected"], false);

        let wal_state = dispatch(&kernel, "get_bridge_wal_state", json!({})).await.unwrap();
        assert_eq!(wal_state["result"]["pending_ops"], 0);
        assert_eq!(wal_state["result"]["rollback_available"], false);

        let reqs = dispatch(&kernel, "get_bridge_commit_requirements", json!({}))
            .await
            .unwrap();
        assert_eq!(reqs["result"]["rationale_required"], true);
        assert_eq!(reqs["result"]["commit_allowed"], false);
    }

    #[tokio::test]
    async fn test_emit_diag_bundle_writes_manifest() {
        let kernel = test_kernel();
        let wrapped = dispatch(&kernel, "emit_diag_bundle", json!({})).await.unwrap();
        let path = wrapped["result"].as_str().unwrap();
        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert!(manifest["journal"]["path"].is_string());
        assert!(manifest["events"]["lines"].is_number());
    }

    #[tokio::test]
    async fn test_get_operation_journal_limit() {
        let kernel = test_kernel();
        for _ in 0..4 {
            let mut entry = WalEntry::new("editor", Actor::System, WalPhase::Attempted);
            kernel.wal.append(&kernel.clock, &mut entry).unwrap();
        }
        let wrapped = dispatch(&kernel, "get_operation_journal", json!({"limit": 2}))
            .await
            .unwrap();
        assert_eq!(wrapped["result"].as_str().unwrap().lines().count(), 2);
    }

    #[test]
    fn test_counterpart() {
        assert_eq!(counterpart("editor"), "dcc");
        assert_eq!(counterpart("dcc"), "editor");
    }

    #[test]
    fn test_collect_floats_recursive() {
        let mut floats = Vec::new();
        collect_floats(
            &json!({"a": 1.5, "b": [2.0, {"c": 3.0}], "d": "text"}),
            &mut floats,
        );
        floats.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(floats, vec![1.5, 2.0, 3.0]);
    }
}
