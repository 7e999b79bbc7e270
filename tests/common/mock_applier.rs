// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock EntityApplier for testing.
//!
//! Records every apply and keeps the applied content per entity, so
//! `is_current` answers truthfully and re-applies can be asserted
//! idempotent. Failures are scriptable.

use offline_sync_engine::{ApplyError, ApplyFuture, ChangeRecord, EntityApplier, Operation};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// A recorded apply_entity_change() call.
#[derive(Debug, Clone)]
pub struct ApplyCall {
    pub change_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    #[allow(dead_code)]
    pub content_hash: String,
}

/// Mock implementation of EntityApplier that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = MockApplier::new();
/// mock.fail_next(2);               // two transient failures, then success
/// mock.reject_entity("t-9");       // validation rejects this entity id
/// ```
pub struct MockApplier {
    calls: RwLock<Vec<ApplyCall>>,
    /// (entity_type, entity_id) -> (content hash, data) of the last apply
    entities: RwLock<HashMap<(String, String), (String, Vec<u8>)>>,
    rejected_entities: RwLock<HashSet<String>>,
    /// Transient failures still to hand out
    transient_failures: AtomicUsize,
    /// Fail every apply transiently while set
    always_fail: AtomicBool,
    /// Fail every apply permanently while set
    permanent_fail: AtomicBool,
    attempts: AtomicUsize,
}

impl MockApplier {
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(Vec::new()),
            entities: RwLock::new(HashMap::new()),
            rejected_entities: RwLock::new(HashSet::new()),
            transient_failures: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            permanent_fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Failure Scripting
    // =========================================================================

    /// Fail the next `n` applies with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every apply transiently until cleared.
    #[allow(dead_code)]
    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Fail every apply permanently until cleared.
    #[allow(dead_code)]
    pub fn set_permanent_fail(&self, fail: bool) {
        self.permanent_fail.store(fail, Ordering::SeqCst);
    }

    /// Make validation reject changes to this entity id.
    #[allow(dead_code)]
    pub async fn reject_entity(&self, entity_id: &str) {
        self.rejected_entities
            .write()
            .await
            .insert(entity_id.to_string());
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    /// Successful applies, in order.
    pub async fn applied(&self) -> Vec<ApplyCall> {
        self.calls.read().await.clone()
    }

    /// Every apply attempt, including failed ones.
    #[allow(dead_code)]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Current content of an entity, `None` if never applied or deleted.
    #[allow(dead_code)]
    pub async fn entity(&self, entity_type: &str, entity_id: &str) -> Option<Vec<u8>> {
        self.entities
            .read()
            .await
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .map(|(_, data)| data.clone())
    }

    #[allow(dead_code)]
    pub async fn was_applied(&self, change_id: &str) -> bool {
        self.calls.read().await.iter().any(|c| c.change_id == change_id)
    }
}

impl Default for MockApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityApplier for MockApplier {
    fn validate_entity_change<'a>(&'a self, change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
        Box::pin(async move {
            if self.rejected_entities.read().await.contains(&change.entity_id) {
                return Err(ApplyError::permanent(format!(
                    "{} failed domain validation",
                    change.entity_id
                )));
            }
            Ok(())
        })
    }

    fn apply_entity_change<'a>(&'a self, change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.permanent_fail.load(Ordering::SeqCst) {
                return Err(ApplyError::permanent("constraint violation"));
            }
            if self.always_fail.load(Ordering::SeqCst) {
                return Err(ApplyError::transient("domain store unavailable"));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ApplyError::transient("domain store busy"));
            }

            let key = (change.entity_type.clone(), change.entity_id.clone());
            {
                let mut entities = self.entities.write().await;
                match change.operation {
                    Operation::Delete => {
                        entities.remove(&key);
                    }
                    Operation::Create | Operation::Update => {
                        entities.insert(key, (change.content_hash.clone(), change.data.clone()));
                    }
                }
            }
            self.calls.write().await.push(ApplyCall {
                change_id: change.id.clone(),
                entity_type: change.entity_type.clone(),
                entity_id: change.entity_id.clone(),
                operation: change.operation,
                content_hash: change.content_hash.clone(),
            });
            Ok(())
        })
    }

    fn is_current<'a>(
        &'a self,
        entity_type: &'a str,
        entity_id: &'a str,
        content_hash: &'a str,
    ) -> ApplyFuture<'a, bool> {
        Box::pin(async move {
            let entities = self.entities.read().await;
            Ok(entities
                .get(&(entity_type.to_string(), entity_id.to_string()))
                .is_some_and(|(hash, _)| hash == content_hash))
        })
    }
}
