//! Report aggregation
//!
//! Pure assembly of stage outputs into the final report. Never computes;
//! a missing or malformed upstream output means the engine handed over an
//! incomplete run.

use crate::error::OrchestrationError;
use crate::models::{AdvisoryReport, Allocation, RiskMetrics, TradeInstruction};
use crate::pipeline::ReportLayout;
use crate::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

pub struct ReportAggregator;

impl ReportAggregator {
    pub fn assemble(layout: &ReportLayout, outputs: &BTreeMap<String, Value>) -> Result<AdvisoryReport> {
        Ok(AdvisoryReport {
            advice: text(outputs, &layout.advice, "advice")?,
            strategy: text(outputs, &layout.strategy, "strategy")?,
            allocation: typed::<Allocation>(outputs, &layout.allocation, "allocation")?,
            risk: typed::<RiskMetrics>(outputs, &layout.risk, "risk")?,
            trades: typed::<Vec<TradeInstruction>>(outputs, &layout.trades, "trades")?,
        })
    }
}

fn output<'a>(outputs: &'a BTreeMap<String, Value>, stage: &str, field: &str) -> Result<&'a Value> {
    match outputs.get(stage) {
        Some(Value::Null) | None => Err(OrchestrationError::IncompleteReport(format!(
            "{} missing: stage '{}' produced no output",
            field, stage
        ))),
        Some(value) => Ok(value),
    }
}

/// Accepts a bare string or an object carrying a `text` field
fn text(outputs: &BTreeMap<String, Value>, stage: &str, field: &str) -> Result<String> {
    let value = output(outputs, stage, field)?;
    value
        .as_str()
        .or_else(|| value.get("text").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| {
            OrchestrationError::IncompleteReport(format!(
                "{} from stage '{}' is not text",
                field, stage
            ))
        })
}

fn typed<T: DeserializeOwned>(outputs: &BTreeMap<String, Value>, stage: &str, field: &str) -> Result<T> {
    let value = output(outputs, stage, field)?;
    serde_json::from_value(value.clone()).map_err(|e| {
        OrchestrationError::IncompleteReport(format!(
            "{} from stage '{}' is malformed: {}",
            field, stage, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout() -> ReportLayout {
        ReportLayout {
            advice: "advice".to_string(),
            strategy: "strategy".to_string(),
            allocation: "allocation".to_string(),
            risk: "risk".to_string(),
            trades: "trade_plan".to_string(),
        }
    }

    fn outputs() -> BTreeMap<String, Value> {
        [
            ("advice", json!("Stay diversified.")),
            ("strategy", json!({ "text": "Balanced core." })),
            (
                "allocation",
                json!({
                    "assets": [{"ticker": "AAPL", "weight": 1.0}],
                    "expected_return": 0.1,
                    "variance": 0.04,
                    "objective": 0.02,
                    "risk_aversion": 2.0,
                    "iterations": 3
                }),
            ),
            (
                "risk",
                json!({
                    "periods_per_year": 252.0,
                    "assets": [{"ticker": "AAPL", "annualized_volatility": 0.2, "observations": 250}]
                }),
            ),
            ("trade_plan", json!([{"ticker": "AAPL", "action": "BUY", "quantity": 100.0}])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_assembles_all_sections() {
        let report = ReportAggregator::assemble(&layout(), &outputs()).unwrap();
        assert_eq!(report.advice, "Stay diversified.");
        assert_eq!(report.strategy, "Balanced core.");
        assert_eq!(report.allocation.assets[0].ticker, "AAPL");
        assert_eq!(report.risk.assets.len(), 1);
        assert_eq!(report.trades.len(), 1);
    }

    #[test]
    fn test_missing_output_is_incomplete() {
        let mut outputs = outputs();
        outputs.remove("risk");

        match ReportAggregator::assemble(&layout(), &outputs) {
            Err(OrchestrationError::IncompleteReport(reason)) => assert!(reason.contains("risk")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_output_is_incomplete() {
        let mut outputs = outputs();
        outputs.insert("allocation".to_string(), json!({ "weights": [1.0] }));

        assert!(matches!(
            ReportAggregator::assemble(&layout(), &outputs),
            Err(OrchestrationError::IncompleteReport(_))
        ));
    }
}
