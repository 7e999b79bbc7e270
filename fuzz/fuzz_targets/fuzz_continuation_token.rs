// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for continuation token decoding.
//!
//! Tokens come straight from clients, so decoding must never panic, and
//! anything that decodes must re-encode to an equivalent token.

#![no_main]

use libfuzzer_sys::fuzz_target;
use offline_sync_engine::ContinuationToken;

fuzz_target!(|data: &str| {
    // Should never panic
    if let Ok(token) = ContinuationToken::decode(data) {
        assert!(!token.id.is_empty());
        let again = ContinuationToken::decode(&token.encode()).expect("re-encoded token decodes");
        assert_eq!(again, token);
    }
});
