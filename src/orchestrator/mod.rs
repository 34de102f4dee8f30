//! Advisory orchestrator
//!
//! INPUT → PLAN → EXECUTE → AGGREGATE → AUDIT

use crate::audit::{compute_report_hash, AuditLog};
use crate::capability::create_default_registry;
use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::models::{AdvisoryRequest, ExecutionRecord, OrchestrationResult};
use crate::pipeline::{EngineSettings, PipelineEngine};
use crate::planner::{AdvisoryPlanner, Planner};
use crate::report::ReportAggregator;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinates planning, execution and auditing of advisory runs
pub struct Orchestrator {
    planner: Box<dyn Planner>,
    engine: PipelineEngine,
    audit_log: Arc<AuditLog>,
}

impl Orchestrator {
    pub fn new(planner: Box<dyn Planner>, engine: PipelineEngine, audit_log: Arc<AuditLog>) -> Self {
        Self {
            planner,
            engine,
            audit_log,
        }
    }

    /// Default wiring: configured providers, the advisory planner, a fresh audit log
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let registry = create_default_registry(config)?;
        Ok(Self::new(
            Box::new(AdvisoryPlanner::new(config.clone())),
            PipelineEngine::new(Arc::new(registry), EngineSettings::from(config)),
            Arc::new(AuditLog::new()),
        ))
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.audit_log.clone()
    }

    pub async fn run(&self, request: AdvisoryRequest) -> Result<OrchestrationResult> {
        let start_time = Instant::now();
        let mut reasoning_trace = Vec::new();

        info!(
            profile = %request.profile.name,
            risk_tolerance = %request.profile.risk_tolerance,
            "Orchestrator: starting advisory run"
        );
        reasoning_trace.push("INPUT: Advisory request received".to_string());

        // === PLAN ===
        let planned = self.planner.plan(&request).await?;
        let layout = planned.graph.report.clone().ok_or_else(|| {
            OrchestrationError::Configuration("plan declares no report layout".to_string())
        })?;
        reasoning_trace.push(format!(
            "PLAN: {} stages, widest fan {}",
            planned.graph.stages.len(),
            planned.graph.widest_fan()
        ));

        // === EXECUTE ===
        let run = match self.engine.execute(&planned.graph, &planned.inputs).await {
            Ok(run) => run,
            Err(e) => {
                warn!(
                    stage = e.stage().unwrap_or("-"),
                    kind = %e.kind(),
                    "Advisory run failed"
                );
                return Err(e);
            }
        };

        for observation in &run.observations {
            reasoning_trace.push(format!(
                "EXECUTE: {} ({}) - {} call(s), {} ms",
                observation.stage,
                observation.capability,
                observation.invocations,
                observation.execution_time_ms
            ));
        }

        // === AGGREGATE ===
        let report = ReportAggregator::assemble(&layout, &run.outputs)?;
        let report_hash = compute_report_hash(&report)?;
        reasoning_trace.push(format!(
            "AGGREGATE: {} assets allocated, {} trade instructions",
            report.allocation.assets.len(),
            report.trades.len()
        ));
        debug!(report_hash = %report_hash, "Report assembled");

        // === AUDIT ===
        let execution_record = ExecutionRecord {
            audit_id: Uuid::new_v4(),
            request: Arc::new(request),
            report: Arc::new(report.clone()),
            report_hash: report_hash.clone(),
            observations: Arc::new(run.observations),
            reasoning_trace: Arc::new(reasoning_trace.clone()),
            created_at: Utc::now(),
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        };
        let audit_id = self.audit_log.record(execution_record).await?;
        reasoning_trace.push("COMPLETE: Report recorded".to_string());

        info!(
            audit_id = %audit_id,
            report_hash = %report_hash,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Advisory run complete"
        );

        Ok(OrchestrationResult {
            report,
            report_hash,
            audit_id,
            reasoning_trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserProfile;

    fn demo_dirs() -> (String, String) {
        let root = env!("CARGO_MANIFEST_DIR");
        (
            format!("{}/demos/news_data", root),
            format!("{}/demos/reports_data", root),
        )
    }

    fn config() -> OrchestratorConfig {
        let (news_dir, reports_dir) = demo_dirs();
        OrchestratorConfig {
            news_dir,
            reports_dir,
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_orchestrator_run() {
        let orchestrator = Orchestrator::from_config(&config()).unwrap();

        let result = orchestrator
            .run(AdvisoryRequest::new(UserProfile::demo()))
            .await
            .unwrap();

        assert!(!result.reasoning_trace.is_empty());
        assert_eq!(result.report.allocation.assets.len(), 3);
        assert!(orchestrator
            .audit_log()
            .verify_integrity(result.audit_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_repeat_runs_hash_identically() {
        let orchestrator = Orchestrator::from_config(&config()).unwrap();

        let first = orchestrator
            .run(AdvisoryRequest::new(UserProfile::demo()))
            .await
            .unwrap();
        let second = orchestrator
            .run(AdvisoryRequest::new(UserProfile::demo()))
            .await
            .unwrap();

        assert_eq!(first.report_hash, second.report_hash);
        assert_ne!(first.audit_id, second.audit_id);
        assert_eq!(
            orchestrator
                .audit_log()
                .find_by_hash(&first.report_hash)
                .await
                .unwrap(),
            vec![first.audit_id, second.audit_id]
        );
    }

    #[tokio::test]
    async fn test_missing_news_directory_fails_with_stage() {
        let config = OrchestratorConfig {
            news_dir: "/nonexistent/news".to_string(),
            ..config()
        };
        let orchestrator = Orchestrator::from_config(&config).unwrap();

        let err = orchestrator
            .run(AdvisoryRequest::new(UserProfile::demo()))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some("news"));
        assert_eq!(err.kind(), crate::error::ErrorKind::CapabilityFailure);
        assert!(orchestrator.audit_log().list().await.unwrap().is_empty());
    }
}
