//! Offline capability providers
//!
//! Deterministic stand-ins for the external collaborators so a run works
//! without network access. Same inputs always produce the same outputs.

use super::{names, Capability, CapabilityRequest};
use crate::error::OrchestrationError;
use crate::models::{Document, PriceSeries, RiskTolerance, ToleranceLevel, TradeAction, UserProfile};
use crate::Result;
use chrono::{Datelike, NaiveDate, Weekday};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// All offline providers keyed by the capability they serve
pub fn offline_providers() -> Vec<(&'static str, Arc<dyn Capability>)> {
    vec![
        (names::USER_PROFILE, provider(UserProfileFixture)),
        (names::HISTORICAL_PRICES, provider(PriceWalkFixture)),
        (names::NEWS_DOCUMENTS, provider(DirectoryReader)),
        (names::REPORT_DOCUMENTS, provider(DirectoryReader)),
        (names::SENTIMENT_SCORING, provider(LexiconSentiment)),
        (names::STRATEGY_GENERATION, provider(StrategyTemplate)),
        (names::MARKET_ANALYSIS, provider(MarketAnalysisFixture)),
        (names::INDUSTRY_TRENDS, provider(IndustryTrendsFixture)),
        (names::FINANCIAL_RATIOS, provider(FinancialRatiosFixture)),
        (names::PORTFOLIO_MANAGEMENT, provider(PortfolioManagementFixture)),
        (names::ADVICE_SYNTHESIS, provider(AdviceTemplate)),
        (names::TRADE_EXECUTION, provider(SimulatedExecution)),
    ]
}

fn provider<C: Capability + 'static>(capability: C) -> Arc<dyn Capability> {
    Arc::new(capability)
}

fn sha256(input: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().into()
}

//
// ================= Profile =================
//

/// Validates and normalizes the submitted profile
pub struct UserProfileFixture;

#[async_trait::async_trait]
impl Capability for UserProfileFixture {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let profile: UserProfile = request.require("profile")?;
        profile.validate()?;
        Ok(serde_json::to_value(profile)?)
    }
}

//
// ================= Market Data =================
//

/// Synthetic daily closes, one per weekday in the window. The walk is a
/// ChaCha stream keyed by the ticker's SHA-256, so it is stable across runs.
pub struct PriceWalkFixture;

impl PriceWalkFixture {
    pub fn generate(ticker: &str, start: NaiveDate, end: NaiveDate) -> PriceSeries {
        let mut rng = ChaCha8Rng::from_seed(sha256(ticker));

        let mut price: f64 = rng.gen_range(50.0..250.0);
        let drift: f64 = rng.gen_range(-0.00024..0.00056);
        let volatility: f64 = rng.gen_range(0.008..0.025);

        let prices = start
            .iter_days()
            .take_while(|day| *day <= end)
            .filter(|day| !matches!(day.weekday(), Weekday::Sat | Weekday::Sun))
            .map(|_| {
                let current = price;
                let shock: f64 = rng.sample(StandardNormal);
                // Daily move floored at -50% so the walk stays positive
                price *= (1.0 + drift + volatility * shock).max(0.5);
                (current * 100.0).round() / 100.0
            })
            .collect();

        PriceSeries {
            ticker: ticker.to_string(),
            prices,
        }
    }
}

#[async_trait::async_trait]
impl Capability for PriceWalkFixture {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let ticker: String = request.require("ticker")?;
        let start = parse_date(request, "start_date")?;
        let end = parse_date(request, "end_date")?;
        if end < start {
            return Err(OrchestrationError::InvalidInput(format!(
                "end_date {} precedes start_date {}",
                end, start
            )));
        }

        Ok(serde_json::to_value(Self::generate(&ticker, start, end))?)
    }
}

fn parse_date(request: &CapabilityRequest, name: &str) -> Result<NaiveDate> {
    let raw: String = request.require(name)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| OrchestrationError::ArgumentMismatch {
        capability: request.capability.clone(),
        reason: format!("'{}' is not a YYYY-MM-DD date: {}", name, e),
    })
}

//
// ================= Documents =================
//

/// Reads `.txt` and `.md` files from a directory, sorted by file name
pub struct DirectoryReader;

#[async_trait::async_trait]
impl Capability for DirectoryReader {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let directory: String = request.require("directory")?;

        let mut entries = tokio::fs::read_dir(&directory).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let readable = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("txt") || e.eq_ignore_ascii_case("md"));
            if readable && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            documents.push(Document {
                name: file_name(&path),
                text: tokio::fs::read_to_string(&path).await?,
            });
        }

        Ok(serde_json::to_value(documents)?)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

//
// ================= Sentiment & Strategy =================
//

const POSITIVE_TERMS: &[&str] = &[
    "beat", "beats", "growth", "gain", "gains", "strong", "record", "upgrade", "surge", "rally",
    "profit", "outperform", "bullish", "expansion", "robust", "raised",
];
const NEGATIVE_TERMS: &[&str] = &[
    "miss", "misses", "decline", "loss", "losses", "weak", "downgrade", "plunge", "selloff",
    "lawsuit", "recall", "bearish", "slowdown", "inflation", "cut", "risk",
];

/// Counts lexicon hits per text; score is `(pos - neg) / (pos + neg)`
pub struct LexiconSentiment;

impl LexiconSentiment {
    pub fn score(text: &str) -> f64 {
        let (mut positive, mut negative) = (0usize, 0usize);
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
        {
            if POSITIVE_TERMS.contains(&word.as_str()) {
                positive += 1;
            } else if NEGATIVE_TERMS.contains(&word.as_str()) {
                negative += 1;
            }
        }

        if positive + negative == 0 {
            0.0
        } else {
            (positive as f64 - negative as f64) / (positive + negative) as f64
        }
    }
}

fn sentiment_label(score: f64) -> &'static str {
    if score > 0.2 {
        "positive"
    } else if score < -0.2 {
        "negative"
    } else {
        "neutral"
    }
}

#[async_trait::async_trait]
impl Capability for LexiconSentiment {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let texts: Vec<String> = request.require("texts")?;
        let scores: Vec<f64> = texts.iter().map(|t| Self::score(t)).collect();
        let average = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        Ok(json!({
            "documents": scores.len(),
            "scores": scores,
            "average": average,
            "label": sentiment_label(average),
        }))
    }
}

fn period_return(series: &PriceSeries) -> Option<f64> {
    match (series.prices.first(), series.prices.last()) {
        (Some(first), Some(last)) if *first > 0.0 => Some(last / first - 1.0),
        _ => None,
    }
}

fn tolerance_label(tolerance: &RiskTolerance) -> String {
    match tolerance {
        RiskTolerance::Level(level) => level.to_string(),
        RiskTolerance::Scalar(value) => format!("risk aversion {:.2}", value),
    }
}

pub struct StrategyTemplate;

#[async_trait::async_trait]
impl Capability for StrategyTemplate {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let series: Vec<PriceSeries> = request.require("price_series")?;
        let sentiment: Value = request.require("sentiment")?;
        let tolerance: RiskTolerance = request.require("risk_tolerance")?;

        let label = sentiment["label"].as_str().unwrap_or("neutral");
        let mut leaders: Vec<(String, f64)> = series
            .iter()
            .filter_map(|s| period_return(s).map(|r| (s.ticker.clone(), r)))
            .collect();
        leaders.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let momentum = leaders
            .iter()
            .map(|(t, r)| format!("{} {:+.1}%", t, r * 100.0))
            .collect::<Vec<_>>()
            .join(", ");

        let stance = match (label, tolerance) {
            ("negative", _) | (_, RiskTolerance::Level(ToleranceLevel::Low)) => {
                "favor defensive names and keep position sizes small"
            }
            ("positive", RiskTolerance::Level(ToleranceLevel::High)) => {
                "lean into momentum leaders with a growth tilt"
            }
            _ => "hold a balanced, diversified core and rebalance periodically",
        };

        Ok(Value::String(format!(
            "News sentiment is {} and the risk profile is {}. Period performance: {}. Strategy: {}.",
            label,
            tolerance_label(&tolerance),
            if momentum.is_empty() { "n/a".to_string() } else { momentum },
            stance
        )))
    }
}

//
// ================= Analytics =================
//

pub struct MarketAnalysisFixture;

#[async_trait::async_trait]
impl Capability for MarketAnalysisFixture {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let series: Vec<PriceSeries> = request.require("price_series")?;
        let assets: Vec<Value> = series
            .iter()
            .map(|s| {
                let change = period_return(s).unwrap_or(0.0);
                let trend = if change > 0.05 {
                    "uptrend"
                } else if change < -0.05 {
                    "downtrend"
                } else {
                    "sideways"
                };
                json!({
                    "ticker": s.ticker,
                    "observations": s.prices.len(),
                    "period_return": change,
                    "trend": trend,
                })
            })
            .collect();

        Ok(json!({ "assets": assets }))
    }
}

const SECTORS: &[(&str, &str, &str)] = &[
    ("AAPL", "Technology", "consumer hardware demand stabilizing; services growing"),
    ("MSFT", "Technology", "cloud and enterprise software spending resilient"),
    ("GOOGL", "Communication Services", "digital advertising recovering"),
    ("AMZN", "Consumer Discretionary", "e-commerce margins improving"),
    ("JNJ", "Health Care", "defensive demand; pharma pipeline steady"),
    ("JPM", "Financials", "net interest income supported by higher rates"),
    ("XOM", "Energy", "commodity prices volatile; strong cash generation"),
];

pub struct IndustryTrendsFixture;

#[async_trait::async_trait]
impl Capability for IndustryTrendsFixture {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let ticker: String = request.require("ticker")?;
        let (sector, outlook) = SECTORS
            .iter()
            .find(|(t, _, _)| t.eq_ignore_ascii_case(&ticker))
            .map(|(_, sector, outlook)| (*sector, *outlook))
            .unwrap_or(("Diversified", "no sector-specific outlook available"));

        Ok(json!({
            "ticker": ticker,
            "sector": sector,
            "outlook": outlook,
        }))
    }
}

pub struct FinancialRatiosFixture;

#[async_trait::async_trait]
impl Capability for FinancialRatiosFixture {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let series: Vec<PriceSeries> = request.require("price_series")?;
        let assets: Vec<Value> = series
            .iter()
            .map(|s| {
                let mut peak = f64::MIN;
                let mut max_drawdown: f64 = 0.0;
                for price in &s.prices {
                    peak = peak.max(*price);
                    if peak > 0.0 {
                        max_drawdown = max_drawdown.max(1.0 - price / peak);
                    }
                }
                let high = s.prices.iter().copied().fold(f64::MIN, f64::max);
                let last = s.prices.last().copied().unwrap_or(0.0);
                json!({
                    "ticker": s.ticker,
                    "max_drawdown": max_drawdown,
                    "price_to_period_high": if high > 0.0 { last / high } else { 0.0 },
                })
            })
            .collect();

        Ok(json!({ "assets": assets }))
    }
}

pub struct PortfolioManagementFixture;

#[async_trait::async_trait]
impl Capability for PortfolioManagementFixture {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let tolerance: RiskTolerance = request.require("risk_tolerance")?;
        let aversion = tolerance.risk_aversion()?;
        // 0.5 → 90% equities, 5.0 → 40%
        let equity_share = (0.95 - 0.11 * aversion).clamp(0.2, 0.95);

        Ok(json!({
            "risk_tolerance": tolerance,
            "equity_share": equity_share,
            "fixed_income_share": 1.0 - equity_share,
            "rebalance_frequency": if aversion >= 2.0 { "quarterly" } else { "semi-annual" },
        }))
    }
}

pub struct AdviceTemplate;

#[async_trait::async_trait]
impl Capability for AdviceTemplate {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let profile: UserProfile = request.require("profile")?;
        let strategy: String = request.require("strategy")?;
        let market: Value = request.require("market_analysis")?;
        let trends = match request.require::<Value>("industry_trends")? {
            Value::Array(items) => items,
            single => vec![single],
        };
        let management: Value = request.require("portfolio_management")?;
        // Accepted for contract completeness; the template does not quote it.
        let _ratios: Value = request.require("financial_ratios")?;

        let uptrends = market["assets"]
            .as_array()
            .map(|a| a.iter().filter(|x| x["trend"] == "uptrend").count())
            .unwrap_or(0);
        let sectors = trends
            .iter()
            .filter_map(|t| t["sector"].as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(", ");
        let equity = management["equity_share"].as_f64().unwrap_or(0.6);

        Ok(Value::String(format!(
            "{}, with {:.2} to invest and goals of {}: target roughly {:.0}% equities across {} \
             ({} of {} assets in an uptrend). {}",
            profile.name,
            profile.investment_amount,
            if profile.investment_goals.is_empty() {
                "general wealth building".to_string()
            } else {
                profile.investment_goals.join(", ")
            },
            equity * 100.0,
            if sectors.is_empty() { "diversified sectors".to_string() } else { sectors },
            uptrends,
            trends.len(),
            strategy
        )))
    }
}

//
// ================= Trading =================
//

/// Acknowledges trades without placing them
pub struct SimulatedExecution;

#[async_trait::async_trait]
impl Capability for SimulatedExecution {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let ticker: String = request.require("ticker")?;
        let action: TradeAction = request.require("action")?;
        let quantity: f64 = request.require("quantity")?;
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(OrchestrationError::InvalidInput(format!(
                "trade quantity must be non-negative, got {}",
                quantity
            )));
        }

        let status = match action {
            TradeAction::Hold => "NO_ACTION",
            _ => "SIMULATED",
        };
        let confirmation = hex::encode(&sha256(&format!("{}|{}|{:.2}", ticker, action, quantity))[..6]);

        Ok(json!({
            "ticker": ticker,
            "action": action,
            "quantity": quantity,
            "status": status,
            "confirmation": confirmation,
        }))
    }
}
