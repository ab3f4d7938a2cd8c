/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Static payload audit and per-target sanitization.
//!
//! `audit_payload` is the hard gate: the serialized payload is lowercased
//! and rejected outright if it carries anything from the execution denylist
//! or the `nan`/`inf` tokens. `sanitize` runs after the audit and before
//! signing: it rewrites counterpart-engine vocabulary so an editor-bound
//! payload never carries DCC terminology (and vice versa), then redacts
//! anything that looks like an engine-internal handle.

use crate::contract::{ENGINE_DCC, ENGINE_EDITOR};
use crate::error::KernelError;
use lazy_static::lazy_static;
use regex::Regex;

/// Hard execution bans. Substring match against the lowercased payload.
const DENYLIST: &[&str] = &[
    "os.system",
    "exec(",
    "eval(",
    "rm -rf",
    "reflection",
    "process.start",
    "import ",
    "__import__",
    "powershell",
    "cmd.exe",
    "/bin/sh",
    "/bin/bash",
];

/// Replacement marker for redacted engine handles.
pub const REDACTED: &str = "[REDACTED_HANDLE]";

lazy_static! {
    /// Raw pointers, instance-id integers, and prefixed native handles.
    static ref HANDLE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"0x[0-9a-fA-F]{4,}").expect("pointer pattern"),
        Regex::new(r"(?i)instance_?id[=:]\s*-?\d+").expect("instance-id pattern"),
        Regex::new(r"(?i)\b(?:hwnd|swig_cptr|native_handle)[=:]\s*\w+").expect("handle pattern"),
    ];

    /// Editor-bound payloads must not carry DCC datablock vocabulary.
    static ref EDITOR_VOCAB: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\bdatablock\b").expect("vocab"), "asset"),
        (Regex::new(r"(?i)\bcollection\b").expect("vocab"), "group"),
        (Regex::new(r"(?i)\bnode_tree\b").expect("vocab"), "shader_graph"),
    ];

    /// DCC-bound payloads must not carry editor scene-graph vocabulary.
    static ref DCC_VOCAB: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\bgameobject\b").expect("vocab"), "object"),
        (Regex::new(r"(?i)\bprefab\b").expect("vocab"), "collection"),
        (Regex::new(r"(?i)\bguid\b").expect("vocab"), "uuid"),
    ];
}

/// Statically inspect a payload before it can reach an engine.
///
/// The payload is marshaled to its canonical JSON form and lowercased; the
/// first denylist hit fails the call. The trailing `nan`/`inf` token check
/// is the serialization-level numerical guard: JSON has no spelling for
/// either, so their presence means something upstream already went wrong.
pub fn audit_payload(payload: &serde_json::Value) -> Result<(), KernelError> {
    let serialized = payload.to_string().to_lowercase();

    for banned in DENYLIST {
        if serialized.contains(banned) {
            return Err(KernelError::SecurityViolation((*banned).to_string()));
        }
    }

    if serialized.contains("nan") || serialized.contains("inf") {
        return Err(KernelError::NumericalInstability(
            "NaN/Inf detected in payload".to_string(),
        ));
    }

    Ok(())
}

/// Rewrite counterpart vocabulary for the target engine, then redact
/// handle-shaped substrings. Runs after `audit_payload`, before signing.
pub fn sanitize(target: &str, payload: &str) -> String {
    let vocab: &[(Regex, &'static str)] = match target {
        ENGINE_EDITOR => EDITOR_VOCAB.as_slice(),
        ENGINE_DCC => DCC_VOCAB.as_slice(),
        _ => &[],
    };

    let mut out = payload.to_string();
    for (pattern, replacement) in vocab {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    for pattern in HANDLE_PATTERNS.iter() {
        out = pattern.replace_all(&out, REDACTED).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audit_blocks_shell_invocation() {
        let payload = json!({"cmd": "os.system('rm -rf /')"});
        let err = audit_payload(&payload).unwrap_err();
        assert!(matches!(err, KernelError::SecurityViolation(_)));
        assert!(err.to_string().contains("os.system"));
    }

    #[test]
    fn test_audit_blocks_dynamic_eval() {
        for bad in ["eval(user_input)", "exec(code)", "__import__('os')"] {
            let payload = json!({ "script": bad });
            assert!(audit_payload(&payload).is_err(), "should block {bad}");
        }
    }

    #[test]
    fn test_audit_blocks_windows_and_unix_shells() {
        assert!(audit_payload(&json!({"run": "powershell -c x"})).is_err());
        assert!(audit_payload(&json!({"run": "/bin/bash -i"})).is_err());
        assert!(audit_payload(&json!({"run": "cmd.exe /k"})).is_err());
    }

    #[test]
    fn test_audit_flags_nan_inf_tokens() {
        let err = audit_payload(&json!({"val": "this is nan"})).unwrap_err();
        assert!(matches!(err, KernelError::NumericalInstability(_)));
        assert!(audit_payload(&json!({"val": "Infinity"})).is_err());
    }

    #[test]
    fn test_audit_passes_clean_payload() {
        let payload = json!({
            "id": "obj-42",
            "transform": {"pos": [1.0, 2.0, 3.0], "rot": [0.0, 0.0, 0.0]}
        });
        assert!(audit_payload(&payload).is_ok());
    }

    #[test]
    fn test_audit_is_case_insensitive() {
        assert!(audit_payload(&json!({"cmd": "OS.SYSTEM('x')"})).is_err());
        assert!(audit_payload(&json!({"cmd": "PowerShell"})).is_err());
    }

    #[test]
    fn test_sanitize_rewrites_dcc_bound_vocabulary() {
        let out = sanitize(ENGINE_DCC, "select the GameObject with prefab parent");
        assert_eq!(out, "select the object with collection parent");
    }

    #[test]
    fn test_sanitize_rewrites_editor_bound_vocabulary() {
        let out = sanitize(ENGINE_EDITOR, "link datablock into collection");
        assert_eq!(out, "link asset into group");
    }

    #[test]
    fn test_sanitize_redacts_pointers_and_handles() {
        let out = sanitize(ENGINE_EDITOR, "cursor at 0x7F3A2210, hwnd: 4471");
        assert_eq!(out, format!("cursor at {REDACTED}, {REDACTED}"));
    }

    #[test]
    fn test_sanitize_redacts_instance_ids() {
        let out = sanitize(ENGINE_DCC, "ref instance_id: -3382");
        assert_eq!(out, format!("ref {REDACTED}"));
    }

    #[test]
    fn test_sanitize_unknown_target_only_redacts() {
        let out = sanitize("render-farm", "GameObject at 0xDEADBEEF");
        assert_eq!(out, format!("GameObject at {REDACTED}"));
    }

    #[test]
    fn test_sanitize_snapshot() {
        let out = sanitize(
            ENGINE_DCC,
            r#"{"op":"move","target":"GameObject","ref":"0x00FA9C","prefab":true}"#,
        );
        insta::assert_snapshot!(
            out,
            @r#"{"op":"move","target":"object","ref":"[REDACTED_HANDLE]","collection":true}"#
        );
    }
}
