/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Ark VibeSync Orchestrator.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 */

//! Sensor driver registry for the multiplexer.
//!
//! `vibe_multiplex` lets registered sensor drivers reach a narrow set of
//! engine endpoints — nothing else. Patterns support `*` globbing so a
//! driver can be granted a family of read endpoints without enumerating
//! every one.

use crate::error::KernelError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Specialist identities accepted by `invoke_specialist`.
pub const SPECIALISTS: &[&str] = &["optimize", "rig", "light", "animate", "scene_setup"];

pub fn is_specialist(id: &str) -> bool {
    SPECIALISTS.contains(&id)
}

pub struct DriverRegistry {
    drivers: Mutex<HashMap<String, Vec<String>>>,
}

impl DriverRegistry {
    /// Registry preloaded with the built-in sensor drivers.
    pub fn new() -> Self {
        let mut drivers = HashMap::new();
        drivers.insert(
            "vision_mcp".to_string(),
            vec![
                "render/capture".to_string(),
                "material/get".to_string(),
                "light/get".to_string(),
            ],
        );
        drivers.insert(
            "selection_mcp".to_string(),
            vec![
                "selection/set".to_string(),
                "hierarchy/get".to_string(),
                "camera/frame".to_string(),
            ],
        );
        Self {
            drivers: Mutex::new(drivers),
        }
    }

    /// Grant a driver an endpoint pattern list (replaces any prior grant).
    pub fn register(&self, sensor_id: &str, endpoints: Vec<String>) {
        self.drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sensor_id.to_string(), endpoints);
    }

    /// Check that `sensor_id` may call `endpoint`.
    pub fn authorize(&self, sensor_id: &str, endpoint: &str) -> Result<(), KernelError> {
        let drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = drivers
            .get(sensor_id)
            .ok_or_else(|| KernelError::PolicyViolation("DRIVER_UNREGISTERED".to_string()))?;
        if allowed.iter().any(|pattern| glob_match(pattern, endpoint)) {
            Ok(())
        } else {
            Err(KernelError::PolicyViolation("PERMISSION_DENIED".to_string()))
        }
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple glob matching supporting `*` as wildcard.
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == text;
    }

    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 2 {
        let prefix = parts[0];
        let suffix = parts[1];
        return text.starts_with(prefix)
            && text.ends_with(suffix)
            && text.len() >= prefix.len() + suffix.len();
    }

    // General glob: greedy left-to-right matching
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            if !text[pos..].ends_with(part) {
                return false;
            }
        } else {
            match text[pos..].find(part) {
                Some(found) => pos = pos + found + part.len(),
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_drivers() {
        let registry = DriverRegistry::new();
        assert!(registry.authorize("vision_mcp", "render/capture").is_ok());
        assert!(registry.authorize("selection_mcp", "camera/frame").is_ok());
    }

    #[test]
    fn test_unregistered_driver_refused() {
        let registry = DriverRegistry::new();
        let err = registry.authorize("rogue_mcp", "render/capture").unwrap_err();
        assert!(err.to_string().contains("DRIVER_UNREGISTERED"));
    }

    #[test]
    fn test_endpoint_outside_grant_refused() {
        let registry = DriverRegistry::new();
        let err = registry.authorize("vision_mcp", "object/mutate").unwrap_err();
        assert!(err.to_string().contains("PERMISSION_DENIED"));
        // Drivers cannot cross into each other's grants.
        assert!(registry.authorize("vision_mcp", "selection/set").is_err());
    }

    #[test]
    fn test_registered_glob_grant() {
        let registry = DriverRegistry::new();
        registry.register("probe_mcp", vec!["state/*".to_string()]);
        assert!(registry.authorize("probe_mcp", "state/get").is_ok());
        assert!(registry.authorize("probe_mcp", "state/diff").is_ok());
        assert!(registry.authorize("probe_mcp", "object/mutate").is_err());
    }

    #[test]
    fn test_glob_match_exact() {
        assert!(glob_match("state/get", "state/get"));
        assert!(!glob_match("state/get", "state/set"));
    }

    #[test]
    fn test_glob_match_wildcard() {
        assert!(glob_match("state/*", "state/get"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*/get", "material/get"));
        assert!(!glob_match("state/*", "object/get"));
    }

    #[test]
    fn test_glob_match_multi_segment() {
        assert!(glob_match("render/*/preview", "render/eevee/preview"));
        assert!(!glob_match("render/*/preview", "render/eevee/full"));
    }

    #[test]
    fn test_specialists() {
        assert!(is_specialist("optimize"));
        assert!(is_specialist("scene_setup"));
        assert!(!is_specialist("destroyer"));
    }
}
