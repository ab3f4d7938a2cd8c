/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Signed RPC client — the only path to an engine.
//!
//! `send` owns the whole zero-trust pipeline: global and adaptive rate
//! limits, the payload audit, engine state gating, per-target vocabulary
//! sanitization, header framing with an HMAC-SHA256 signature, the retry
//! schedule with the busy-engine sentinel, journaling, and the detached
//! verify-read that closes the loop after every mutation. Callers never see
//! header assembly or retry policy.

use crate::clock::{now_epoch, MonotonicClock};
use crate::config::KernelConfig;
use crate::contract::{
    Actor, EngineState, EventLevel, SystemHealth, Transaction, WalEntry, WalPhase,
};
use crate::error::KernelError;
use crate::events::EventLog;
use crate::journal::Wal;
use crate::kernel::SessionState;
use crate::registry::{EngineRecord, EngineRegistry};
use crate::retry::{compute_backoff, is_busy_response, RetryConfig, BUSY_RETRY_DELAY_MS};
use crate::sanitizer::{audit_payload, sanitize};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Per-target request ceiling per second.
const GLOBAL_RATE_LIMIT: u32 = 100;

/// Busy-sentinel waits never consume schedule attempts, but they are capped
/// so a permanently compiling engine cannot pin a task forever.
const MAX_BUSY_WAITS: u32 = 10;

/// Endpoints exempt from signing when the session trust tier allows it.
const PERFORMANCE_ALLOWLIST: &[&str] =
    &["transform/set", "camera/set", "playback/control", "metrics"];

/// Whether the signature header may be omitted for this endpoint.
pub fn signature_exempt(endpoint: &str, trust_tier: u8) -> bool {
    trust_tier >= 1 && PERFORMANCE_ALLOWLIST.contains(&endpoint)
}

/// `HMAC-SHA256(token, ts|METHOD|/endpoint|body)`, hex-encoded. Public so
/// the mock-engine tests can verify header values byte-for-byte.
pub fn sign_request(token: &str, ts: i64, method: &str, endpoint: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{ts}|{method}|/{endpoint}|{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// State gating applied before anything leaves the kernel.
fn gate_engine(
    record: &EngineRecord,
    target: &str,
    method: &str,
    endpoint: &str,
) -> Result<(), KernelError> {
    match record.state {
        EngineState::Panic => {
            return Err(KernelError::EngineError(format!("engine '{target}' is PANIC")))
        }
        EngineState::HumanInterventionRequired => {
            return Err(KernelError::PolicyViolation(format!(
                "engine '{target}' awaits human intervention"
            )))
        }
        EngineState::Quarantine => {
            if method != "GET" && !endpoint.contains("health") {
                return Err(KernelError::Quarantined {
                    target: target.to_string(),
                });
            }
        }
        EngineState::Running => {
            if record.trust_expiry <= chrono::Utc::now() {
                return Err(KernelError::Expired {
                    target: target.to_string(),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

#[derive(Clone)]
pub struct SignedRpcClient {
    http: reqwest::Client,
    config: Arc<KernelConfig>,
    registry: Arc<EngineRegistry>,
    clock: Arc<MonotonicClock>,
    wal: Arc<Wal>,
    events: Arc<EventLog>,
    session: Arc<SessionState>,
    active_tx: Arc<Mutex<Option<Transaction>>>,
    rate: Arc<Mutex<HashMap<String, (i64, u32)>>>,
    retry: RetryConfig,
}

impl SignedRpcClient {
    pub fn new(
        config: Arc<KernelConfig>,
        registry: Arc<EngineRegistry>,
        clock: Arc<MonotonicClock>,
        wal: Arc<Wal>,
        events: Arc<EventLog>,
        session: Arc<SessionState>,
        active_tx: Arc<Mutex<Option<Transaction>>>,
    ) -> Result<Self, KernelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .local_address("127.0.0.1".parse::<std::net::IpAddr>().ok())
            .no_proxy()
            .build()
            .map_err(|e| KernelError::Unknown(format!("http client: {e}")))?;
        Ok(Self {
            http,
            config,
            registry,
            clock,
            wal,
            events,
            session,
            active_tx,
            rate: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryConfig::default(),
        })
    }

    fn check_rate(&self, target: &str) -> Result<(), KernelError> {
        let now_sec = now_epoch();
        let mut rate = self.rate.lock().unwrap_or_else(|e| e.into_inner());
        let entry = rate.entry(target.to_string()).or_insert((now_sec, 0));
        if entry.0 != now_sec {
            *entry = (now_sec, 0);
        }
        entry.1 += 1;
        if entry.1 > GLOBAL_RATE_LIMIT {
            return Err(KernelError::RateLimit {
                target: target.to_string(),
            });
        }
        Ok(())
    }

    fn active_tx_id(&self) -> Option<String> {
        self.active_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.id.clone())
    }

    /// Send one request to a managed engine. The sole mutation path.
    pub async fn send(
        &self,
        target: &str,
        endpoint: &str,
        method: &str,
        payload: Option<Value>,
    ) -> Result<Value, KernelError> {
        let endpoint = endpoint.trim_start_matches('/').to_string();

        self.check_rate(target)?;

        if let Some(ref payload) = payload {
            if let Err(err) = audit_payload(payload) {
                if matches!(err, KernelError::SecurityViolation(_)) {
                    let (_, quarantined) = self.registry.decay_trust(target, 20)?;
                    self.events.dispatch(
                        EventLevel::Error,
                        "security_intercept",
                        "",
                        "PANIC",
                        json!({"target": target, "error": err.to_string()}),
                    );
                    if quarantined {
                        self.events.dispatch(
                            EventLevel::Error,
                            "quarantine_triggered",
                            "",
                            "",
                            json!({"target": target}),
                        );
                    }
                    tracing::error!("SECURITY INTERCEPT | {target}: {err}");
                }
                return Err(err);
            }
        }

        let record = self.registry.snapshot(target)?;
        gate_engine(&record, target, method, &endpoint)?;

        if method == "POST" {
            let now_ms = chrono::Utc::now().timestamp_millis();
            if let Err(err) = self.registry.record_mutation(target, now_ms) {
                let (_, quarantined) = self.registry.decay_trust(target, 5)?;
                if quarantined {
                    self.events.dispatch(
                        EventLevel::Error,
                        "quarantine_triggered",
                        "",
                        "",
                        json!({"target": target}),
                    );
                }
                tracing::warn!("ADAPTIVE LIMIT | mutation burst to {target}");
                return Err(err);
            }
        }

        // Frame the body: injected base fields, then sanitization. The
        // sanitized string is exactly what gets signed and sent.
        let body_str = if method == "POST" {
            let mut body = payload.unwrap_or_else(|| json!({}));
            if let Value::Object(ref mut map) = body {
                map.insert("generation".to_string(), json!(record.generation));
                map.insert(
                    "session_id".to_string(),
                    json!(self.session.session_id.to_string()),
                );
                map.insert("monotonic_id".to_string(), json!(self.clock.next_id()));
            }
            sanitize(target, &body.to_string())
        } else {
            String::new()
        };

        let port = self.config.port_for(target)?;
        let url = format!("http://127.0.0.1:{port}/{endpoint}");

        let mut attempt = 0u32;
        let mut busy_waits = 0u32;
        let mut last_err: Option<KernelError> = None;

        while attempt < self.retry.max_attempts {
            match self
                .attempt_send(target, &url, &endpoint, method, &body_str)
                .await
            {
                Ok(body) => {
                    if is_busy_response(&body) {
                        busy_waits += 1;
                        if busy_waits > MAX_BUSY_WAITS {
                            return Err(KernelError::Timeout(format!(
                                "engine '{target}' stayed busy"
                            )));
                        }
                        tokio::time::sleep(Duration::from_millis(BUSY_RETRY_DELAY_MS)).await;
                        continue;
                    }

                    self.journal_engine_call(target);
                    if method == "POST" && !endpoint.contains("handshake") {
                        self.spawn_verify(target.to_string(), endpoint.clone());
                    }
                    return Ok(body);
                }
                Err(err) => {
                    last_err = Some(err);
                    let delay = compute_backoff(&self.retry, attempt);
                    attempt += 1;
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        let detail = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "exhausted".to_string());
        Err(KernelError::EngineError(format!("{target}/{endpoint}: {detail}")))
    }

    async fn attempt_send(
        &self,
        target: &str,
        url: &str,
        endpoint: &str,
        method: &str,
        body_str: &str,
    ) -> Result<Value, KernelError> {
        // Token and generation re-read per attempt: a concurrent handshake
        // may have rotated them between retries.
        let record = self.registry.snapshot(target)?;
        let ts = now_epoch();

        let mut request = match method {
            "POST" => self.http.post(url),
            "GET" => self.http.get(url),
            other => {
                return Err(KernelError::Unknown(format!("unsupported method '{other}'")))
            }
        };

        request = request
            .header("X-Vibe-Token", &record.token)
            .header("X-Vibe-Timestamp", ts.to_string())
            .header("X-Vibe-Session", self.session.session_id.to_string())
            .header("X-Vibe-Generation", record.generation.to_string())
            .header("Content-Type", "application/json");

        if let Some(tx_id) = self.active_tx_id() {
            request = request.header("X-Vibe-Transaction", tx_id);
        }

        if !signature_exempt(endpoint, self.session.trust_tier()) {
            let signature = sign_request(&record.token, ts, method, endpoint, body_str);
            request = request.header("X-Vibe-Signature", signature);
        }

        if method == "POST" {
            request = request.body(body_str.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| KernelError::EngineError(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KernelError::EngineError(format!("http {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| KernelError::EngineError(format!("read: {e}")))?;
        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text)
            .map_err(|e| KernelError::EngineError(format!("decode: {e}")))
    }

    fn journal_engine_call(&self, target: &str) {
        let mut entry = WalEntry::new(target, Actor::System, WalPhase::Attempted);
        entry.tid = self.active_tx_id();
        entry.system_health = self.cluster_health();
        if let Err(e) = self.wal.append(&self.clock, &mut entry) {
            tracing::warn!("JOURNAL | engine_call append failed: {e}");
        }
    }

    fn cluster_health(&self) -> SystemHealth {
        let quarantined = self
            .registry
            .snapshot_all()
            .values()
            .any(|r| r.state == EngineState::Quarantine);
        if quarantined {
            SystemHealth::Quarantined
        } else {
            SystemHealth::Safe
        }
    }

    /// Fire-and-forget verification read after a mutation. Failure is
    /// observational: it is logged and journaled, never propagated.
    fn spawn_verify(&self, target: String, endpoint: String) {
        let client = self.clone();
        let deadline = self.config.verify_deadline;
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(async move {
                match tokio::time::timeout(
                    deadline,
                    client.send(&target, "state/get", "GET", None),
                )
                .await
                {
                    Err(_) => {
                        tracing::warn!(
                            "VERIFICATION TIMEOUT | {target} gave no state after {endpoint}"
                        );
                        client.events.dispatch(
                            EventLevel::Warn,
                            "verification_timeout",
                            "",
                            "",
                            json!({"target": target, "endpoint": endpoint}),
                        );
                    }
                    Ok(Err(err)) => {
                        tracing::warn!("VERIFICATION FAILURE | {target}: {err}");
                        client.events.dispatch(
                            EventLevel::Warn,
                            "verification_failure",
                            "",
                            "",
                            json!({"target": target, "endpoint": endpoint, "error": err.to_string()}),
                        );
                    }
                    Ok(Ok(body)) => {
                        let observed = body
                            .get("hash")
                            .and_then(|h| h.as_str())
                            .unwrap_or_default()
                            .to_string();
                        tracing::info!("VERIFIED | {target} state hash: {observed}");
                        client.events.dispatch(
                            EventLevel::Info,
                            "verification_complete",
                            "",
                            "",
                            json!({"target": target, "endpoint": endpoint, "observed_hash": observed}),
                        );
                    }
                }
            });
        tokio::spawn(fut);
    }

    /// Cluster panic fan-out. Deliberately outside the governed `send`
    /// pipeline: a panicking engine must still hear the broadcast, and the
    /// broadcast itself must not recurse into verification or rate decay.
    /// Engines still STOPPED (never handshaken) are skipped.
    pub async fn broadcast_panic(&self, reason: &str) {
        for (name, record) in self.registry.snapshot_all() {
            if record.state == EngineState::Stopped {
                continue;
            }
            let port = match self.config.port_for(&name) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let url = format!("http://127.0.0.1:{port}/panic");
            let body = json!({"reason": reason}).to_string();
            let result = self
                .http
                .post(&url)
                .header("X-Vibe-Token", &record.token)
                .header("Content-Type", "application/json")
                .body(body)
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!("PANIC BROADCAST | {name} unreachable: {e}");
            }
        }
        self.events.dispatch(
            EventLevel::Error,
            "cluster_panic",
            "",
            "PANIC",
            json!({"reason": reason}),
        );
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn record(state: EngineState) -> EngineRecord {
        EngineRecord {
            token: "tok".to_string(),
            state,
            generation: 1,
            version: String::new(),
            trust_expiry: Utc::now() + ChronoDuration::minutes(60),
            trust_score: 100,
            mutation_count: 0,
            last_mutation_ms: 0,
        }
    }

    #[test]
    fn test_signature_matches_manual_hmac() {
        let sig = sign_request("secret", 1700000000, "POST", "transform/set", "{\"a\":1}");
        // Recompute by hand over the framing string.
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000|POST|/transform/set|{\"a\":1}");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(sig, expected);
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn test_signature_binds_every_component() {
        let base = sign_request("t", 1, "POST", "e", "b");
        assert_ne!(base, sign_request("t2", 1, "POST", "e", "b"));
        assert_ne!(base, sign_request("t", 2, "POST", "e", "b"));
        assert_ne!(base, sign_request("t", 1, "GET", "e", "b"));
        assert_ne!(base, sign_request("t", 1, "POST", "e2", "b"));
        assert_ne!(base, sign_request("t", 1, "POST", "e", "b2"));
    }

    #[test]
    fn test_signature_exempt_requires_tier_and_allowlist() {
        assert!(signature_exempt("transform/set", 1));
        assert!(signature_exempt("metrics", 2));
        assert!(!signature_exempt("transform/set", 0));
        assert!(!signature_exempt("object/mutate", 1));
        assert!(!signature_exempt("handshake", 3));
    }

    #[test]
    fn test_gate_blocks_panic_and_human_states() {
        let err = gate_engine(&record(EngineState::Panic), "editor", "GET", "health").unwrap_err();
        assert!(matches!(err, KernelError::EngineError(_)));

        let err = gate_engine(
            &record(EngineState::HumanInterventionRequired),
            "editor",
            "POST",
            "object/mutate",
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::PolicyViolation(_)));
    }

    #[test]
    fn test_gate_quarantine_is_read_only() {
        let rec = record(EngineState::Quarantine);
        assert!(gate_engine(&rec, "dcc", "GET", "state/get").is_ok());
        assert!(gate_engine(&rec, "dcc", "POST", "health").is_ok());
        let err = gate_engine(&rec, "dcc", "POST", "object/mutate").unwrap_err();
        assert!(matches!(err, KernelError::Quarantined { .. }));
    }

    #[test]
    fn test_gate_expired_trust() {
        let mut rec = record(EngineState::Running);
        rec.trust_expiry = Utc::now() - ChronoDuration::seconds(1);
        let err = gate_engine(&rec, "editor", "POST", "object/mutate").unwrap_err();
        assert!(matches!(err, KernelError::Expired { .. }));
    }

    fn test_client() -> SignedRpcClient {
        let base = std::env::temp_dir().join(format!("vibe-rpc-{}", uuid::Uuid::new_v4()));
        let config = Arc::new(KernelConfig {
            persistence_dir: base.clone(),
            ..Default::default()
        });
        SignedRpcClient::new(
            config,
            Arc::new(EngineRegistry::new(base.join("state.json"))),
            Arc::new(MonotonicClock::new()),
            Arc::new(Wal::new(base.join("wal.jsonl"), 10 * 1024 * 1024)),
            Arc::new(EventLog::new(base.join("events.jsonl"))),
            Arc::new(SessionState::new()),
            Arc::new(Mutex::new(None)),
        )
        .unwrap()
    }

    #[test]
    fn test_global_rate_limiter_trips_within_a_second() {
        let client = test_client();
        let mut tripped = false;
        for _ in 0..1000 {
            if client.check_rate("editor").is_err() {
                tripped = true;
                break;
            }
        }
        assert!(tripped, "per-target ceiling enforced");
        // The other target keeps its own window.
        assert!(client.check_rate("dcc").is_ok());
    }

    #[test]
    fn test_gate_allows_bootstrap_states() {
        assert!(gate_engine(&record(EngineState::Stopped), "editor", "POST", "handshake").is_ok());
        assert!(gate_engine(&record(EngineState::Starting), "editor", "POST", "handshake").is_ok());
        assert!(gate_engine(&record(EngineState::Running), "editor", "POST", "x").is_ok());
    }
}
