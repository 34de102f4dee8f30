//! Core data models for the advisory pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::OrchestrationError;
use crate::Result;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceLevel {
    Low,
    Medium,
    High,
}

/// Risk tolerance as gathered from the user: an ordinal level or a raw
/// risk-aversion scalar (higher means more averse).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RiskTolerance {
    Level(ToleranceLevel),
    Scalar(f64),
}

impl RiskTolerance {
    /// Risk-aversion coefficient fed to the allocation solver
    pub fn risk_aversion(&self) -> Result<f64> {
        match self {
            RiskTolerance::Level(ToleranceLevel::Low) => Ok(5.0),
            RiskTolerance::Level(ToleranceLevel::Medium) => Ok(2.0),
            RiskTolerance::Level(ToleranceLevel::High) => Ok(0.5),
            RiskTolerance::Scalar(value) if value.is_finite() && *value >= 0.0 => Ok(*value),
            RiskTolerance::Scalar(value) => Err(OrchestrationError::InvalidInput(format!(
                "risk tolerance scalar must be a non-negative number, got {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

//
// ================= Profile =================
//

/// Immutable once gathered; every downstream stage reads the same value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub investment_goals: Vec<String>,
    pub risk_tolerance: RiskTolerance,
    pub investment_amount: f64,
    /// Current notional held per ticker
    #[serde(default)]
    pub current_holdings: BTreeMap<String, f64>,
}

impl UserProfile {
    pub fn validate(&self) -> Result<()> {
        if !self.investment_amount.is_finite() || self.investment_amount < 0.0 {
            return Err(OrchestrationError::InvalidInput(format!(
                "investment_amount must be a non-negative amount, got {}",
                self.investment_amount
            )));
        }

        self.risk_tolerance.risk_aversion()?;

        if let Some((ticker, amount)) = self
            .current_holdings
            .iter()
            .find(|(_, amount)| !amount.is_finite() || **amount < 0.0)
        {
            return Err(OrchestrationError::InvalidInput(format!(
                "holding for {} must be non-negative, got {}",
                ticker, amount
            )));
        }

        Ok(())
    }

    /// Profile used by the CLI when none is supplied
    pub fn demo() -> Self {
        Self {
            name: "John Doe".to_string(),
            age: Some(40),
            investment_goals: vec!["retirement".to_string(), "college fund".to_string()],
            risk_tolerance: RiskTolerance::Level(ToleranceLevel::Medium),
            investment_amount: 100_000.0,
            current_holdings: BTreeMap::new(),
        }
    }
}

//
// ================= Market Data =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSeries {
    pub ticker: String,
    pub prices: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub name: String,
    pub text: String,
}

//
// ================= Allocation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetWeight {
    pub ticker: String,
    pub weight: f64,
}

/// Solved allocation keyed by asset, in the order the assets were supplied
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub assets: Vec<AssetWeight>,
    pub expected_return: f64,
    pub variance: f64,
    pub objective: f64,
    pub risk_aversion: f64,
    pub iterations: usize,
}

//
// ================= Risk =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetRisk {
    pub ticker: String,
    pub annualized_volatility: f64,
    pub observations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskMetrics {
    pub periods_per_year: f64,
    pub assets: Vec<AssetRisk>,
}

//
// ================= Trading =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeInstruction {
    pub ticker: String,
    pub action: TradeAction,
    /// Currency notional, always non-negative
    pub quantity: f64,
}

//
// ================= Report =================
//

/// Terminal artifact of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvisoryReport {
    pub advice: String,
    pub strategy: String,
    pub allocation: Allocation,
    pub risk: RiskMetrics,
    pub trades: Vec<TradeInstruction>,
}

//
// ================= Execution =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    /// Never started because the run was cancelled
    Cancelled,
    /// Finished after cancellation; output dropped
    Discarded,
    /// Never started because a dependency failed
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageObservation {
    pub stage: String,
    pub capability: String,
    pub status: StageStatus,
    pub invocations: usize,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

//
// ================= Requests =================
//

/// One advisory run. Everything but the profile falls back to configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub profile: UserProfile,
    #[serde(default)]
    pub tickers: Option<Vec<String>>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub news_dir: Option<String>,
    #[serde(default)]
    pub reports_dir: Option<String>,
}

impl AdvisoryRequest {
    pub fn new(profile: UserProfile) -> Self {
        Self {
            profile,
            tickers: None,
            start_date: None,
            end_date: None,
            news_dir: None,
            reports_dir: None,
        }
    }
}

//
// ================= Execution Record =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub audit_id: uuid::Uuid,
    pub request: Arc<AdvisoryRequest>,
    pub report: Arc<AdvisoryReport>,
    pub report_hash: String,
    pub observations: Arc<Vec<StageObservation>>,
    pub reasoning_trace: Arc<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub report: AdvisoryReport,
    pub report_hash: String,
    pub audit_id: uuid::Uuid,
    pub reasoning_trace: Vec<String>,
}

impl fmt::Display for ToleranceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToleranceLevel::Low => "low",
            ToleranceLevel::Medium => "medium",
            ToleranceLevel::High => "high",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTolerance::Level(level) => write!(f, "{}", level),
            RiskTolerance::Scalar(value) => write!(f, "{}", value),
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_tolerance_accepts_level_or_scalar() {
        let level: RiskTolerance = serde_json::from_str("\"high\"").unwrap();
        let scalar: RiskTolerance = serde_json::from_str("3.5").unwrap();

        assert_eq!(level, RiskTolerance::Level(ToleranceLevel::High));
        assert_eq!(level.risk_aversion().unwrap(), 0.5);
        assert_eq!(scalar.risk_aversion().unwrap(), 3.5);
        assert!(RiskTolerance::Scalar(-1.0).risk_aversion().is_err());
    }

    #[test]
    fn test_profile_rejects_negative_amount() {
        let mut profile = UserProfile::demo();
        assert!(profile.validate().is_ok());

        profile.investment_amount = -10.0;
        assert!(matches!(
            profile.validate(),
            Err(OrchestrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_trade_action_serializes_uppercase() {
        let json = serde_json::to_string(&TradeAction::Sell).unwrap();
        assert_eq!(json, "\"SELL\"");
    }
}
