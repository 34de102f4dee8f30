//! Planner trait and the advisory workflow plan
//!
//! A planner turns a request into a stage graph plus the run's initial
//! inputs. The graph only declares data dependencies; the engine derives
//! which stages run together.

use crate::capability::names;
use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::models::AdvisoryRequest;
use crate::pipeline::{ArgSource, ReportLayout, RunInputs, StageGraph, StageNode};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;

/// Stage names of the advisory graph
pub mod stages {
    pub const PROFILE: &str = "profile";
    pub const MARKET_DATA: &str = "market_data";
    pub const NEWS: &str = "news";
    pub const REPORTS: &str = "reports";
    pub const SENTIMENT: &str = "sentiment";
    pub const STRATEGY: &str = "strategy";
    pub const MARKET_ANALYSIS: &str = "market_analysis";
    pub const INDUSTRY_TRENDS: &str = "industry_trends";
    pub const FINANCIAL_RATIOS: &str = "financial_ratios";
    pub const PORTFOLIO_MANAGEMENT: &str = "portfolio_management";
    pub const ADVICE: &str = "advice";
    pub const ALLOCATION: &str = "allocation";
    pub const RISK: &str = "risk";
    pub const TRADE_PLAN: &str = "trade_plan";
    pub const TRADE_EXECUTION: &str = "trade_execution";
}

/// A graph ready to execute with the inputs its bindings read
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub graph: StageGraph,
    pub inputs: RunInputs,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &AdvisoryRequest) -> Result<PlannedRun>;
}

/// Plans the full advisory workflow, filling request gaps from configuration
pub struct AdvisoryPlanner {
    config: OrchestratorConfig,
}

impl AdvisoryPlanner {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn inputs(&self, request: &AdvisoryRequest) -> Result<RunInputs> {
        request.profile.validate()?;

        let tickers = request
            .tickers
            .clone()
            .unwrap_or_else(|| self.config.tickers.clone());
        if tickers.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "at least one ticker is required".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for ticker in &tickers {
            if ticker.trim().is_empty() {
                return Err(OrchestrationError::InvalidInput("ticker must not be blank".to_string()));
            }
            if !seen.insert(ticker.as_str()) {
                return Err(OrchestrationError::InvalidInput(format!(
                    "ticker {} listed twice",
                    ticker
                )));
            }
        }

        let start = request.start_date.unwrap_or(self.config.start_date);
        let end = request.end_date.unwrap_or(self.config.end_date);
        if end < start {
            return Err(OrchestrationError::InvalidInput(format!(
                "end date {} precedes start date {}",
                end, start
            )));
        }

        let mut inputs = RunInputs::new();
        inputs.insert("profile".to_string(), serde_json::to_value(&request.profile)?);
        inputs.insert("tickers".to_string(), json!(tickers));
        inputs.insert("start_date".to_string(), json!(start.format("%Y-%m-%d").to_string()));
        inputs.insert("end_date".to_string(), json!(end.format("%Y-%m-%d").to_string()));
        inputs.insert(
            "news_dir".to_string(),
            json!(request.news_dir.as_deref().unwrap_or(&self.config.news_dir)),
        );
        inputs.insert(
            "reports_dir".to_string(),
            json!(request.reports_dir.as_deref().unwrap_or(&self.config.reports_dir)),
        );
        Ok(inputs)
    }
}

#[async_trait]
impl Planner for AdvisoryPlanner {
    async fn plan(&self, request: &AdvisoryRequest) -> Result<PlannedRun> {
        Ok(PlannedRun {
            graph: advisory_graph(),
            inputs: self.inputs(request)?,
        })
    }
}

/// The advisory workflow:
/// profile → {prices, news, reports} → sentiment → strategy,
/// prices → {analytics, allocation, risk} → advice / trades.
pub fn advisory_graph() -> StageGraph {
    use stages::*;

    let risk_tolerance = || ArgSource::stage_field(PROFILE, "/risk_tolerance");

    StageGraph::new()
        .stage(StageNode::new(PROFILE, names::USER_PROFILE).arg("profile", ArgSource::input("profile")))
        // Data collection
        .stage(
            StageNode::new(MARKET_DATA, names::HISTORICAL_PRICES)
                .depends_on(&[PROFILE])
                .for_each(ArgSource::input("tickers"))
                .arg("ticker", ArgSource::item())
                .arg("start_date", ArgSource::input("start_date"))
                .arg("end_date", ArgSource::input("end_date")),
        )
        .stage(
            StageNode::new(NEWS, names::NEWS_DOCUMENTS)
                .depends_on(&[PROFILE])
                .arg("directory", ArgSource::input("news_dir")),
        )
        .stage(
            StageNode::new(REPORTS, names::REPORT_DOCUMENTS)
                .depends_on(&[PROFILE])
                .arg("directory", ArgSource::input("reports_dir")),
        )
        // Sentiment and strategy consume merged upstream output
        .stage(
            StageNode::new(SENTIMENT, names::SENTIMENT_SCORING)
                .depends_on(&[NEWS])
                .arg("texts", ArgSource::pluck(NEWS, "text"))
                .sequential(),
        )
        .stage(
            StageNode::new(STRATEGY, names::STRATEGY_GENERATION)
                .depends_on(&[MARKET_DATA, SENTIMENT, PROFILE])
                .arg("price_series", ArgSource::stage(MARKET_DATA))
                .arg("sentiment", ArgSource::stage(SENTIMENT))
                .arg("risk_tolerance", risk_tolerance())
                .sequential(),
        )
        // Analytics
        .stage(
            StageNode::new(MARKET_ANALYSIS, names::MARKET_ANALYSIS)
                .depends_on(&[MARKET_DATA])
                .arg("price_series", ArgSource::stage(MARKET_DATA)),
        )
        .stage(
            StageNode::new(INDUSTRY_TRENDS, names::INDUSTRY_TRENDS)
                .depends_on(&[MARKET_DATA])
                .for_each(ArgSource::input("tickers"))
                .arg("ticker", ArgSource::item()),
        )
        .stage(
            StageNode::new(FINANCIAL_RATIOS, names::FINANCIAL_RATIOS)
                .depends_on(&[MARKET_DATA])
                .arg("price_series", ArgSource::stage(MARKET_DATA)),
        )
        .stage(
            StageNode::new(PORTFOLIO_MANAGEMENT, names::PORTFOLIO_MANAGEMENT)
                .depends_on(&[PROFILE])
                .arg("risk_tolerance", risk_tolerance()),
        )
        .stage(
            StageNode::new(ADVICE, names::ADVICE_SYNTHESIS)
                .depends_on(&[
                    PROFILE,
                    STRATEGY,
                    MARKET_ANALYSIS,
                    INDUSTRY_TRENDS,
                    FINANCIAL_RATIOS,
                    PORTFOLIO_MANAGEMENT,
                ])
                .arg("profile", ArgSource::stage(PROFILE))
                .arg("strategy", ArgSource::stage(STRATEGY))
                .arg("market_analysis", ArgSource::stage(MARKET_ANALYSIS))
                .arg("industry_trends", ArgSource::stage(INDUSTRY_TRENDS))
                .arg("financial_ratios", ArgSource::stage(FINANCIAL_RATIOS))
                .arg("portfolio_management", ArgSource::stage(PORTFOLIO_MANAGEMENT)),
        )
        // Allocation, risk and trading
        .stage(
            StageNode::new(ALLOCATION, names::PORTFOLIO_OPTIMIZATION)
                .depends_on(&[MARKET_DATA, PROFILE])
                .arg("price_series", ArgSource::stage(MARKET_DATA))
                .arg("risk_tolerance", risk_tolerance()),
        )
        .stage(
            StageNode::new(RISK, names::RISK_ASSESSMENT)
                .depends_on(&[MARKET_DATA])
                .arg("price_series", ArgSource::stage(MARKET_DATA)),
        )
        .stage(
            StageNode::new(TRADE_PLAN, names::TRADE_INSTRUCTIONS)
                .depends_on(&[ALLOCATION, PROFILE])
                .arg("allocation", ArgSource::stage(ALLOCATION))
                .arg("investment_amount", ArgSource::stage_field(PROFILE, "/investment_amount"))
                .arg("holdings", ArgSource::stage_field(PROFILE, "/current_holdings")),
        )
        .stage(
            StageNode::new(TRADE_EXECUTION, names::TRADE_EXECUTION)
                .depends_on(&[TRADE_PLAN])
                .for_each(ArgSource::stage(TRADE_PLAN))
                .arg("ticker", ArgSource::item_field("/ticker"))
                .arg("action", ArgSource::item_field("/action"))
                .arg("quantity", ArgSource::item_field("/quantity")),
        )
        .with_report(ReportLayout {
            advice: ADVICE.to_string(),
            strategy: STRATEGY.to_string(),
            allocation: ALLOCATION.to_string(),
            risk: RISK.to_string(),
            trades: TRADE_PLAN.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::create_default_registry;
    use crate::models::UserProfile;
    use chrono::NaiveDate;

    #[test]
    fn test_advisory_graph_is_valid() {
        let registry = create_default_registry(&OrchestratorConfig::default()).unwrap();
        let graph = advisory_graph();

        graph.validate(&registry).unwrap();
        assert_eq!(graph.stages.len(), 15);
        assert_eq!(graph.index_of(stages::PROFILE), Some(0));
    }

    #[test]
    fn test_market_data_fan_is_widest() {
        let graph = advisory_graph();
        // analytics, allocation and risk all hang off the market data
        assert_eq!(graph.widest_fan(), 5);
    }

    #[tokio::test]
    async fn test_request_overrides_configuration() {
        let planner = AdvisoryPlanner::new(OrchestratorConfig::default());
        let mut request = AdvisoryRequest::new(UserProfile::demo());
        request.tickers = Some(vec!["XOM".to_string()]);
        request.start_date = NaiveDate::from_ymd_opt(2023, 3, 1);
        request.end_date = NaiveDate::from_ymd_opt(2023, 9, 29);

        let planned = planner.plan(&request).await.unwrap();
        assert_eq!(planned.inputs["tickers"], json!(["XOM"]));
        assert_eq!(planned.inputs["start_date"], json!("2023-03-01"));
        assert_eq!(planned.inputs["end_date"], json!("2023-09-29"));
        assert_eq!(planned.inputs["news_dir"], json!("demos/news_data"));
    }

    #[tokio::test]
    async fn test_start_override_keeps_configured_end() {
        let planner = AdvisoryPlanner::new(OrchestratorConfig::default());
        let mut request = AdvisoryRequest::new(UserProfile::demo());
        request.start_date = NaiveDate::from_ymd_opt(2022, 7, 1);

        let planned = planner.plan(&request).await.unwrap();
        assert_eq!(planned.inputs["start_date"], json!("2022-07-01"));
        assert_eq!(planned.inputs["end_date"], json!("2022-12-31"));
    }

    #[tokio::test]
    async fn test_inverted_window_rejected() {
        let planner = AdvisoryPlanner::new(OrchestratorConfig::default());
        let mut request = AdvisoryRequest::new(UserProfile::demo());
        request.start_date = NaiveDate::from_ymd_opt(2024, 1, 1);

        assert!(matches!(
            planner.plan(&request).await,
            Err(OrchestrationError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_tickers_rejected() {
        let planner = AdvisoryPlanner::new(OrchestratorConfig::default());
        let mut request = AdvisoryRequest::new(UserProfile::demo());
        request.tickers = Some(vec!["AAPL".to_string(), "AAPL".to_string()]);

        assert!(planner.plan(&request).await.is_err());
    }
}
