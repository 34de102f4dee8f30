//! In-process compute capabilities
//!
//! Allocation, risk and trade derivation are pure functions of their inputs,
//! so they are always served locally regardless of where the data comes from.

use super::{Capability, CapabilityRegistry, CapabilityRequest, ParameterSchema, ValueKind};
use crate::config::OrchestratorConfig;
use crate::models::{Allocation, AssetWeight, PriceSeries, RiskTolerance};
use crate::optimizer::{AllocationProblem, AllocationSolver};
use crate::risk::{self, ReturnStatistics};
use crate::trading;
use crate::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PORTFOLIO_OPTIMIZATION: &str = "portfolio_optimization";
pub const RISK_ASSESSMENT: &str = "risk_assessment";
pub const TRADE_INSTRUCTIONS: &str = "trade_instructions";

/// Estimates return statistics from price history and solves for weights
pub struct PortfolioOptimizationCapability {
    solver: AllocationSolver,
    periods_per_year: f64,
    min_return: f64,
}

impl PortfolioOptimizationCapability {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            solver: AllocationSolver::new(config.solver_max_iterations),
            periods_per_year: config.trading_periods_per_year,
            min_return: config.min_target_return,
        }
    }
}

#[async_trait::async_trait]
impl Capability for PortfolioOptimizationCapability {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let series: Vec<PriceSeries> = request.require("price_series")?;
        let tolerance: RiskTolerance = request.require("risk_tolerance")?;
        let risk_aversion = tolerance.risk_aversion()?;

        let stats = ReturnStatistics::estimate(&series, self.periods_per_year)?;
        let problem = AllocationProblem::new(stats.expected_returns, stats.covariances, risk_aversion)
            .with_min_return(self.min_return);
        let solved = self.solver.solve(&problem)?;

        let allocation = Allocation {
            assets: stats
                .tickers
                .into_iter()
                .zip(solved.weights)
                .map(|(ticker, weight)| AssetWeight { ticker, weight })
                .collect(),
            expected_return: solved.expected_return,
            variance: solved.variance,
            objective: solved.objective,
            risk_aversion,
            iterations: solved.iterations,
        };

        Ok(serde_json::to_value(allocation)?)
    }
}

pub struct RiskAssessmentCapability {
    periods_per_year: f64,
}

#[async_trait::async_trait]
impl Capability for RiskAssessmentCapability {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let series: Vec<PriceSeries> = request.require("price_series")?;
        let metrics = risk::assess(&series, self.periods_per_year)?;
        Ok(serde_json::to_value(metrics)?)
    }
}

pub struct TradeInstructionsCapability;

#[async_trait::async_trait]
impl Capability for TradeInstructionsCapability {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let allocation: Allocation = request.require("allocation")?;
        let amount: f64 = request.require("investment_amount")?;
        let holdings: BTreeMap<String, f64> = request.optional("holdings")?.unwrap_or_default();

        let instructions = trading::derive_instructions(&allocation, amount, &holdings)?;
        Ok(serde_json::to_value(instructions)?)
    }
}

/// Register the compute capabilities
pub fn register_local(registry: &mut CapabilityRegistry, config: &OrchestratorConfig) -> Result<()> {
    registry.register(
        PORTFOLIO_OPTIMIZATION,
        Arc::new(PortfolioOptimizationCapability::new(config)),
        vec![
            ParameterSchema::required("price_series", ValueKind::Array),
            ParameterSchema::required("risk_tolerance", ValueKind::Any),
        ],
        ValueKind::Object,
    )?;

    registry.register(
        RISK_ASSESSMENT,
        Arc::new(RiskAssessmentCapability {
            periods_per_year: config.trading_periods_per_year,
        }),
        vec![ParameterSchema::required("price_series", ValueKind::Array)],
        ValueKind::Object,
    )?;

    registry.register(
        TRADE_INSTRUCTIONS,
        Arc::new(TradeInstructionsCapability),
        vec![
            ParameterSchema::required("allocation", ValueKind::Object),
            ParameterSchema::required("investment_amount", ValueKind::Number),
            ParameterSchema::optional("holdings", ValueKind::Object),
        ],
        ValueKind::Array,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, OrchestrationError};
    use crate::models::{RiskMetrics, TradeAction, TradeInstruction};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        register_local(&mut registry, &OrchestratorConfig::default()).unwrap();
        registry
    }

    fn prices() -> Value {
        json!([
            {"ticker": "A", "prices": [100.0, 101.0, 103.0, 102.0, 105.0, 107.0]},
            {"ticker": "B", "prices": [50.0, 50.5, 50.2, 50.6, 50.9, 51.0]},
            {"ticker": "C", "prices": [20.0, 21.5, 20.4, 22.8, 21.1, 23.9]},
        ])
    }

    #[tokio::test]
    async fn test_optimization_returns_ordered_weights() {
        let registry = registry();
        let request = CapabilityRequest::new(PORTFOLIO_OPTIMIZATION)
            .arg("price_series", prices())
            .arg("risk_tolerance", json!("medium"));

        let output = assert_ok!(registry.invoke(&request).await);
        let allocation: Allocation = serde_json::from_value(output).unwrap();

        let tickers: Vec<&str> = allocation.assets.iter().map(|a| a.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B", "C"]);
        let total: f64 = allocation.assets.iter().map(|a| a.weight).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert_eq!(allocation.risk_aversion, 2.0);
    }

    #[tokio::test]
    async fn test_optimization_short_history_is_insufficient_data() {
        let registry = registry();
        let request = CapabilityRequest::new(PORTFOLIO_OPTIMIZATION)
            .arg("price_series", json!([{"ticker": "A", "prices": [100.0]}]))
            .arg("risk_tolerance", json!(1.0));

        let err = assert_err!(registry.invoke(&request).await);
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }

    #[tokio::test]
    async fn test_unreachable_floor_is_infeasible() {
        let config = OrchestratorConfig {
            min_target_return: 1_000.0,
            ..OrchestratorConfig::default()
        };
        let mut registry = CapabilityRegistry::new();
        register_local(&mut registry, &config).unwrap();

        let request = CapabilityRequest::new(PORTFOLIO_OPTIMIZATION)
            .arg("price_series", prices())
            .arg("risk_tolerance", json!("low"));

        let err = assert_err!(registry.invoke(&request).await);
        assert!(matches!(err, OrchestrationError::Infeasible(_)));
    }

    #[tokio::test]
    async fn test_risk_assessment_reports_each_asset() {
        let registry = registry();
        let request = CapabilityRequest::new(RISK_ASSESSMENT).arg("price_series", prices());

        let metrics: RiskMetrics =
            serde_json::from_value(assert_ok!(registry.invoke(&request).await)).unwrap();
        assert_eq!(metrics.periods_per_year, 252.0);
        assert_eq!(metrics.assets.len(), 3);
        assert!(metrics.assets.iter().all(|a| a.annualized_volatility > 0.0));
    }

    #[tokio::test]
    async fn test_trade_instructions_use_holdings() {
        let registry = registry();
        let allocation = json!({
            "assets": [{"ticker": "A", "weight": 0.25}, {"ticker": "B", "weight": 0.75}],
            "expected_return": 0.1,
            "variance": 0.02,
            "objective": 0.06,
            "risk_aversion": 2.0,
            "iterations": 10
        });
        let request = CapabilityRequest::new(TRADE_INSTRUCTIONS)
            .arg("allocation", allocation)
            .arg("investment_amount", json!(1000.0))
            .arg("holdings", json!({"A": 250.0}));

        let trades: Vec<TradeInstruction> =
            serde_json::from_value(assert_ok!(registry.invoke(&request).await)).unwrap();
        assert_eq!(trades[0].action, TradeAction::Hold);
        assert_eq!(trades[1].action, TradeAction::Buy);
        assert_eq!(trades[1].quantity, 750.0);
    }

    #[tokio::test]
    async fn test_bad_tolerance_is_argument_mismatch() {
        let registry = registry();
        let request = CapabilityRequest::new(PORTFOLIO_OPTIMIZATION)
            .arg("price_series", prices())
            .arg("risk_tolerance", json!("reckless"));

        let err = assert_err!(registry.invoke(&request).await);
        assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    }
}
