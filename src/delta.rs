// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delta feed: cursor-based reads of committed changes.
//!
//! A client (or another subsystem) pulls every committed change for one
//! entity type since a checkpoint, one page at a time, independent of the
//! full sync protocol.
//!
//! # Continuation Tokens
//!
//! A token encodes the keyset position `(created_at, id)` of the last record
//! on a page as hex of `"{created_at_ms}:{id}"`. Resuming from a token
//! returns records strictly after that position, so pages never overlap even
//! when several records share a millisecond.
//!
//! ```text
//! page 1: [ (100,a) (100,b) (101,c) ]  token -> (101,c)
//! page 2: [ (101,d) (105,e) ]          has_more_data = false
//! ```
//!
//! `has_more_data` is set whenever a page came back full. The final request
//! may then return an empty page; that is the signal to stop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::clock::from_millis;
use crate::config::CoordinatorConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::ChangeRecord;
use crate::store::{DeltaQuery, SyncStore};

/// Decoded keyset position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContinuationToken {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl ContinuationToken {
    /// Position just after `record`.
    pub fn after(record: &ChangeRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id.clone(),
        }
    }

    /// Opaque string form handed to clients.
    pub fn encode(&self) -> String {
        hex::encode(format!("{}:{}", self.created_at.timestamp_millis(), self.id))
    }

    /// Parse a token produced by [`encode`](Self::encode).
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = hex::decode(token)
            .map_err(|e| SyncError::InvalidContinuationToken(format!("not hex: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| SyncError::InvalidContinuationToken("not utf-8".into()))?;
        let (millis, id) = text
            .split_once(':')
            .ok_or_else(|| SyncError::InvalidContinuationToken("missing separator".into()))?;
        let millis: i64 = millis
            .parse()
            .map_err(|_| SyncError::InvalidContinuationToken(format!("bad timestamp {millis:?}")))?;
        let created_at = from_millis(millis)
            .ok_or_else(|| SyncError::InvalidContinuationToken("timestamp out of range".into()))?;
        if id.is_empty() {
            return Err(SyncError::InvalidContinuationToken("empty record id".into()));
        }
        Ok(Self {
            created_at,
            id: id.to_string(),
        })
    }
}

/// One delta read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub entity_type: String,
    /// Restrict to one user's records.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Checkpoint (inclusive); `None` reads from the beginning.
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Restrict to these entities; empty means all.
    #[serde(default)]
    pub entity_ids: Vec<String>,
    /// Requested page size; clamped by configuration.
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

/// One page of committed changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPage {
    pub entity_type: String,
    pub changes: Vec<ChangeRecord>,
    /// Resume point; `None` only when the page is empty.
    pub continuation_token: Option<String>,
    /// The page was filled; request again with the token.
    pub has_more_data: bool,
    /// Checkpoint to resume from once every page has been read.
    pub server_timestamp: DateTime<Utc>,
}

/// Read path over committed change records.
#[derive(Clone)]
pub struct DeltaFeed {
    store: Arc<dyn SyncStore>,
    config: CoordinatorConfig,
}

impl DeltaFeed {
    pub fn new(store: Arc<dyn SyncStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    /// Fetch one page.
    pub async fn fetch(&self, request: &DeltaRequest, now: DateTime<Utc>) -> Result<DeltaPage> {
        if request.entity_type.trim().is_empty() {
            return Err(SyncError::validation("entity_type", "must not be empty"));
        }

        let after = request
            .continuation_token
            .as_deref()
            .map(ContinuationToken::decode)
            .transpose()?;
        let limit = self.config.delta_page_size(request.page_size);

        let query = DeltaQuery {
            entity_type: request.entity_type.clone(),
            user_id: request.user_id.clone(),
            entity_ids: request.entity_ids.clone(),
            since: request.last_sync_timestamp,
            after: after.map(|t| (t.created_at, t.id)),
            limit,
        };
        let changes = self.store.delta_changes(&query).await?;

        let has_more_data = changes.len() >= limit;
        let continuation_token = changes
            .last()
            .map(|last| ContinuationToken::after(last).encode());

        metrics::record_delta_fetch(&request.entity_type, changes.len(), has_more_data);
        debug!(
            entity_type = %request.entity_type,
            returned = changes.len(),
            limit,
            has_more_data,
            "Delta page served"
        );

        Ok(DeltaPage {
            entity_type: request.entity_type.clone(),
            changes,
            continuation_token,
            has_more_data,
            server_timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeStatus, Operation};
    use crate::store::MemoryStore;

    fn ts(ms: i64) -> DateTime<Utc> {
        from_millis(ms).unwrap()
    }

    fn committed(entity_id: &str, created_ms: i64) -> ChangeRecord {
        ChangeRecord::new(
            "task",
            entity_id,
            Operation::Update,
            entity_id.as_bytes().to_vec(),
            Some("client-a".into()),
            "user-1",
            ts(created_ms),
            ts(created_ms),
            ChangeStatus::Completed,
        )
    }

    async fn feed_with(records: &[ChangeRecord], page: usize) -> DeltaFeed {
        let store = Arc::new(MemoryStore::new());
        for r in records {
            store.insert_change(r).await.unwrap();
        }
        let config = CoordinatorConfig {
            default_delta_page_size: page,
            ..Default::default()
        };
        DeltaFeed::new(store, config)
    }

    #[test]
    fn test_token_roundtrip() {
        let token = ContinuationToken {
            created_at: ts(1_700_000_000_123),
            id: "abc:def".into(),
        };
        let decoded = ContinuationToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_token_rejects_garbage() {
        let bad_tokens = vec![
            "zz".to_string(),
            String::new(),
            hex::encode("no-separator"),
            hex::encode("x:id"),
            hex::encode("5:"),
            hex::encode([0xff, 0xfe]),
        ];
        for bad in &bad_tokens {
            assert!(
                matches!(ContinuationToken::decode(bad), Err(SyncError::InvalidContinuationToken(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_token_ordering() {
        let a = ContinuationToken { created_at: ts(100), id: "b".into() };
        let b = ContinuationToken { created_at: ts(100), id: "c".into() };
        let c = ContinuationToken { created_at: ts(101), id: "a".into() };
        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test]
    async fn test_pagination_walks_everything_once() {
        let records: Vec<_> = (0..7).map(|i| committed(&format!("t-{i}"), 100 + i / 2)).collect();
        let feed = feed_with(&records, 3).await;

        let mut seen = Vec::new();
        let mut request = DeltaRequest {
            entity_type: "task".into(),
            ..Default::default()
        };
        loop {
            let page = feed.fetch(&request, ts(1_000)).await.unwrap();
            seen.extend(page.changes.iter().map(|c| c.id.clone()));
            if !page.has_more_data {
                break;
            }
            request.continuation_token = page.continuation_token;
        }

        let mut expected: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_full_page_sets_has_more() {
        let records: Vec<_> = (0..3).map(|i| committed(&format!("t-{i}"), 100 + i)).collect();
        let feed = feed_with(&records, 3).await;

        let request = DeltaRequest {
            entity_type: "task".into(),
            ..Default::default()
        };
        let page = feed.fetch(&request, ts(1_000)).await.unwrap();
        assert!(page.has_more_data);

        let next = DeltaRequest {
            continuation_token: page.continuation_token,
            ..request
        };
        let page = feed.fetch(&next, ts(1_000)).await.unwrap();
        assert!(page.changes.is_empty());
        assert!(!page.has_more_data);
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_and_entity_filter() {
        let records = vec![committed("t-1", 100), committed("t-2", 200), committed("t-3", 300)];
        let feed = feed_with(&records, 10).await;

        let request = DeltaRequest {
            entity_type: "task".into(),
            last_sync_timestamp: Some(ts(200)),
            ..Default::default()
        };
        let page = feed.fetch(&request, ts(1_000)).await.unwrap();
        let ids: Vec<_> = page.changes.iter().map(|c| c.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["t-2", "t-3"]);

        let request = DeltaRequest {
            entity_type: "task".into(),
            entity_ids: vec!["t-1".into()],
            ..Default::default()
        };
        let page = feed.fetch(&request, ts(1_000)).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.server_timestamp, ts(1_000));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let feed = feed_with(&[], 10).await;
        let empty_type = DeltaRequest::default();
        assert!(feed.fetch(&empty_type, ts(0)).await.unwrap_err().is_validation());

        let bad_token = DeltaRequest {
            entity_type: "task".into(),
            continuation_token: Some("not-a-token".into()),
            ..Default::default()
        };
        assert!(matches!(
            feed.fetch(&bad_token, ts(0)).await,
            Err(SyncError::InvalidContinuationToken(_))
        ));
    }
}
