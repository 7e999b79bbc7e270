// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for engine configuration parsing.
//!
//! Parsing and validation of operator-supplied JSON must reject bad input
//! with an error, and every accepted config must yield usable durations.

#![no_main]

use libfuzzer_sys::fuzz_target;
use offline_sync_engine::EngineConfig;

fuzz_target!(|data: &str| {
    if let Ok(config) = EngineConfig::from_json(data) {
        let p = &config.processor;
        let _ = p.interval_duration();
        let _ = p.retry_policy();
        let _ = p.stale_after();
        let _ = config.retention.completed_record_retention();
        let _ = config.circuit.circuit_config();
        let user = config.default_sync_configuration("fuzz-user", chrono::Utc::now());
        assert!(user.validate().is_ok());
    }
});
