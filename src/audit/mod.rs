//! Audit trail
//!
//! Every successful run is recorded with a content hash of its report so it
//! can be retrieved and verified later. Identical inputs produce identical
//! reports, so repeat runs share a hash and can be looked up together.

use crate::error::OrchestrationError;
use crate::models::{AdvisoryReport, ExecutionRecord};
use crate::Result;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// In-memory, append-only run history
#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<ExecutionRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Audit IDs are unique across the log.
    pub async fn record(&self, record: ExecutionRecord) -> Result<Uuid> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.audit_id == record.audit_id) {
            return Err(OrchestrationError::Execution(format!(
                "audit id {} already recorded",
                record.audit_id
            )));
        }

        let audit_id = record.audit_id;
        debug!(audit_id = %audit_id, report_hash = %record.report_hash, "Run recorded");
        entries.push(record);
        Ok(audit_id)
    }

    pub async fn get(&self, audit_id: Uuid) -> Result<Option<ExecutionRecord>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.audit_id == audit_id).cloned())
    }

    /// Audit IDs in recording order
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().map(|e| e.audit_id).collect())
    }

    /// Runs whose report hashed to `report_hash`
    pub async fn find_by_hash(&self, report_hash: &str) -> Result<Vec<Uuid>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.report_hash == report_hash)
            .map(|e| e.audit_id)
            .collect())
    }

    /// Recompute the report hash; unknown IDs do not verify
    pub async fn verify_integrity(&self, audit_id: Uuid) -> Result<bool> {
        let entries = self.entries.read().await;

        match entries.iter().find(|e| e.audit_id == audit_id) {
            Some(record) => Ok(compute_report_hash(&record.report)? == record.report_hash),
            None => Ok(false),
        }
    }
}

/// Hex SHA-256 of the report's canonical JSON form.
///
/// Field order follows the struct declarations and every collection in the
/// report is ordered, so the hash is stable across runs and pool sizes.
pub fn compute_report_hash(report: &AdvisoryReport) -> Result<String> {
    let canonical = serde_json::to_vec(report)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdvisoryRequest, Allocation, RiskMetrics, UserProfile};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio_test::assert_err;

    fn report(advice: &str) -> AdvisoryReport {
        AdvisoryReport {
            advice: advice.to_string(),
            strategy: "Balanced core.".to_string(),
            allocation: Allocation {
                assets: vec![],
                expected_return: 0.0,
                variance: 0.0,
                objective: 0.0,
                risk_aversion: 2.0,
                iterations: 0,
            },
            risk: RiskMetrics {
                periods_per_year: 252.0,
                assets: vec![],
            },
            trades: vec![],
        }
    }

    fn record(report: AdvisoryReport) -> ExecutionRecord {
        ExecutionRecord {
            audit_id: Uuid::new_v4(),
            request: Arc::new(AdvisoryRequest::new(UserProfile::demo())),
            report_hash: compute_report_hash(&report).unwrap(),
            report: Arc::new(report),
            observations: Arc::new(vec![]),
            reasoning_trace: Arc::new(vec![]),
            created_at: Utc::now(),
            execution_time_ms: 5,
        }
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = compute_report_hash(&report("Hold.")).unwrap();
        assert_eq!(a, compute_report_hash(&report("Hold.")).unwrap());
        assert_ne!(a, compute_report_hash(&report("Sell.")).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_record_and_verify() {
        let log = AuditLog::new();
        let id = log.record(record(report("Hold."))).await.unwrap();

        assert!(log.get(id).await.unwrap().is_some());
        assert!(log.verify_integrity(id).await.unwrap());
        assert!(!log.verify_integrity(Uuid::new_v4()).await.unwrap());
        assert_eq!(log.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_duplicate_audit_id_rejected() {
        let log = AuditLog::new();
        let first = record(report("Hold."));
        let mut second = record(report("Sell."));
        second.audit_id = first.audit_id;

        log.record(first).await.unwrap();
        assert_err!(log.record(second).await);
        assert_eq!(log.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_hash_groups_identical_reports() {
        let log = AuditLog::new();
        let a = log.record(record(report("Hold."))).await.unwrap();
        let b = log.record(record(report("Hold."))).await.unwrap();
        log.record(record(report("Sell."))).await.unwrap();

        let hash = compute_report_hash(&report("Hold.")).unwrap();
        assert_eq!(log.find_by_hash(&hash).await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_tampered_hash_fails_verification() {
        let log = AuditLog::new();
        let mut tampered = record(report("Hold."));
        tampered.report_hash = compute_report_hash(&report("Sell.")).unwrap();
        let id = log.record(tampered).await.unwrap();

        assert!(!log.verify_integrity(id).await.unwrap());
    }
}
