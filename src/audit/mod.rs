//! Audit log for finished questions
//!
//! Every completed or failed pipeline is stored with an integrity hash over
//! its provenance trail so it can be verified later. The log is bounded:
//! once full, the oldest record by `created_at` is evicted.

use crate::models::{ProvenanceEvent, QuestionResult};
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, QuestionResult>>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    /// Keep at most `capacity` records (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a finished question result, evicting the oldest when full
    pub async fn record(&self, result: QuestionResult) -> Result<Uuid> {
        let question_id = result.question_id;
        let mut records = self.records.write().await;
        records.insert(question_id, result);

        while records.len() > self.capacity {
            let oldest = records
                .iter()
                .filter(|(id, _)| **id != question_id)
                .min_by_key(|(_, record)| record.created_at)
                .map(|(id, _)| *id);
            let Some(oldest) = oldest else { break };
            records.remove(&oldest);
            debug!(question_id = %oldest, "Evicted audit record");
        }

        Ok(question_id)
    }

    /// Retrieve a result by question ID
    pub async fn get(&self, question_id: Uuid) -> Result<Option<QuestionResult>> {
        let records = self.records.read().await;
        Ok(records.get(&question_id).cloned())
    }

    /// List all question IDs (sorted by created_at)
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .iter()
            .map(|(id, record)| (*id, record.created_at))
            .collect();

        items.sort_by_key(|(_, created_at)| *created_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Verify a record's trail against its stored hash
    pub async fn verify_integrity(&self, question_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        if let Some(record) = records.get(&question_id) {
            let current_hash = compute_trail_hash(&record.audit_trail);
            Ok(current_hash == record.integrity_hash)
        } else {
            Ok(false)
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute SHA256 over a provenance trail
/// Streams JSON directly into the hasher
pub fn compute_trail_hash(events: &[ProvenanceEvent]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), events).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, EventKind, PipelineStatus, Stage};
    use chrono::Utc;

    fn sample_result() -> QuestionResult {
        let audit_trail = vec![ProvenanceEvent {
            ordinal: 1,
            stage: Stage::Router,
            recorded_at: Utc::now(),
            event: EventKind::Classified {
                category: Category::Conceptual,
            },
        }];
        QuestionResult {
            question_id: Uuid::new_v4(),
            question: "What is EBITDA?".to_string(),
            status: PipelineStatus::Completed,
            classification: None,
            specialist_result: None,
            critique: None,
            provenance: vec![],
            integrity_hash: compute_trail_hash(&audit_trail),
            audit_trail,
            provenance_complete: true,
            incomplete_reason: None,
            failure: None,
            created_at: Utc::now(),
            execution_time_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_record_and_verify() {
        let log = AuditLog::new();
        let result = sample_result();
        let id = log.record(result).await.unwrap();

        assert!(log.verify_integrity(id).await.unwrap());
        assert_eq!(log.list().await.unwrap(), vec![id]);
        assert!(log.get(id).await.unwrap().is_some());
        assert!(!log.verify_integrity(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_trail_fails_verification() {
        let log = AuditLog::new();
        let mut result = sample_result();
        result.audit_trail[0].ordinal = 7;
        let id = log.record(result).await.unwrap();

        assert!(!log.verify_integrity(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_oldest_record_is_evicted_when_full() {
        let log = AuditLog::with_capacity(2);
        let mut ids = Vec::new();
        for offset in [3, 2, 1] {
            let mut result = sample_result();
            result.created_at = Utc::now() - chrono::Duration::seconds(offset);
            ids.push(log.record(result).await.unwrap());
        }

        assert_eq!(log.list().await.unwrap(), vec![ids[1], ids[2]]);
        assert!(log.get(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newest_record_survives_even_if_backdated() {
        let log = AuditLog::with_capacity(1);
        let first = log.record(sample_result()).await.unwrap();

        let mut late = sample_result();
        late.created_at = Utc::now() - chrono::Duration::hours(1);
        let second = log.record(late).await.unwrap();

        assert!(log.get(first).await.unwrap().is_none());
        assert!(log.get(second).await.unwrap().is_some());
    }

    #[test]
    fn test_hash_is_stable() {
        let result = sample_result();
        assert_eq!(
            compute_trail_hash(&result.audit_trail),
            compute_trail_hash(&result.audit_trail)
        );
        assert_eq!(compute_trail_hash(&result.audit_trail).len(), 64);
    }
}
