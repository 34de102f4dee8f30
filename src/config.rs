//! Runtime configuration
//!
//! Read from the environment (a `.env` file is loaded by the binaries).
//! Passed explicitly into the registry and engine constructors.

use crate::error::OrchestrationError;
use crate::Result;
use chrono::NaiveDate;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TRADING_PERIODS_PER_YEAR: f64 = 252.0;
pub const DEFAULT_SOLVER_MAX_ITERATIONS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Scales volatility and return annualization
    pub trading_periods_per_year: f64,
    /// Bounds concurrent capability invocations; `None` sizes the pool to the widest fan
    pub worker_pool_size: Option<usize>,
    /// Deadline applied to every capability invocation
    pub per_call_timeout: Option<Duration>,
    /// Allocation feasibility floor
    pub min_target_return: f64,
    pub solver_max_iterations: usize,
    /// Remote capability endpoint; offline providers are used when absent
    pub capability_api_base_url: Option<String>,
    pub tickers: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub news_dir: String,
    pub reports_dir: String,
    pub api_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            trading_periods_per_year: DEFAULT_TRADING_PERIODS_PER_YEAR,
            worker_pool_size: None,
            per_call_timeout: None,
            min_target_return: 0.0,
            solver_max_iterations: DEFAULT_SOLVER_MAX_ITERATIONS,
            capability_api_base_url: None,
            tickers: vec!["AAPL".to_string(), "MSFT".to_string(), "JNJ".to_string()],
            start_date: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2022, 12, 31).unwrap_or_default(),
            news_dir: "demos/news_data".to_string(),
            reports_dir: "demos/reports_data".to_string(),
            api_port: 8080,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment in production, maps in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let trading_periods_per_year = match read("ADVISORY_TRADING_PERIODS_PER_YEAR") {
            Some(raw) => parse::<f64>("ADVISORY_TRADING_PERIODS_PER_YEAR", &raw)?,
            None => defaults.trading_periods_per_year,
        };
        if !trading_periods_per_year.is_finite() || trading_periods_per_year <= 0.0 {
            return Err(OrchestrationError::Configuration(format!(
                "ADVISORY_TRADING_PERIODS_PER_YEAR must be positive, got {}",
                trading_periods_per_year
            )));
        }

        let worker_pool_size = read("ADVISORY_WORKER_POOL_SIZE")
            .map(|raw| parse::<usize>("ADVISORY_WORKER_POOL_SIZE", &raw))
            .transpose()?;
        if worker_pool_size == Some(0) {
            return Err(OrchestrationError::Configuration(
                "ADVISORY_WORKER_POOL_SIZE must be at least 1".to_string(),
            ));
        }

        let per_call_timeout = read("ADVISORY_CALL_TIMEOUT_MS")
            .map(|raw| parse::<u64>("ADVISORY_CALL_TIMEOUT_MS", &raw))
            .transpose()?
            .map(Duration::from_millis);

        let min_target_return = match read("ADVISORY_MIN_TARGET_RETURN") {
            Some(raw) => parse::<f64>("ADVISORY_MIN_TARGET_RETURN", &raw)?,
            None => defaults.min_target_return,
        };

        let solver_max_iterations = match read("ADVISORY_SOLVER_MAX_ITERATIONS") {
            Some(raw) => parse::<usize>("ADVISORY_SOLVER_MAX_ITERATIONS", &raw)?,
            None => defaults.solver_max_iterations,
        };

        let tickers = match read("ADVISORY_TICKERS") {
            Some(raw) => raw
                .split(',')
                .map(|t| t.trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect(),
            None => defaults.tickers,
        };
        if tickers.is_empty() {
            return Err(OrchestrationError::Configuration(
                "ADVISORY_TICKERS must name at least one ticker".to_string(),
            ));
        }

        let start_date = match read("ADVISORY_START_DATE") {
            Some(raw) => parse::<NaiveDate>("ADVISORY_START_DATE", &raw)?,
            None => defaults.start_date,
        };
        let end_date = match read("ADVISORY_END_DATE") {
            Some(raw) => parse::<NaiveDate>("ADVISORY_END_DATE", &raw)?,
            None => defaults.end_date,
        };
        if end_date < start_date {
            return Err(OrchestrationError::Configuration(format!(
                "date window is inverted: {} > {}",
                start_date, end_date
            )));
        }

        let api_port = match read("PORT").or_else(|| read("API_PORT")) {
            Some(raw) => parse::<u16>("PORT", &raw)?,
            None => defaults.api_port,
        };

        Ok(Self {
            trading_periods_per_year,
            worker_pool_size,
            per_call_timeout,
            min_target_return,
            solver_max_iterations,
            capability_api_base_url: read("ADVISORY_CAPABILITY_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            tickers,
            start_date,
            end_date,
            news_dir: read("ADVISORY_NEWS_DIR").unwrap_or(defaults.news_dir),
            reports_dir: read("ADVISORY_REPORTS_DIR").unwrap_or(defaults.reports_dir),
            api_port,
        })
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| {
        OrchestrationError::Configuration(format!("{} has invalid value '{}': {}", key, raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<OrchestratorConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.trading_periods_per_year, 252.0);
        assert_eq!(config.worker_pool_size, None);
        assert_eq!(config.min_target_return, 0.0);
        assert!(config.capability_api_base_url.is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = config_from(&[
            ("ADVISORY_TRADING_PERIODS_PER_YEAR", "52"),
            ("ADVISORY_WORKER_POOL_SIZE", "3"),
            ("ADVISORY_CALL_TIMEOUT_MS", "1500"),
            ("ADVISORY_TICKERS", "spy, qqq"),
            ("ADVISORY_CAPABILITY_API_BASE_URL", "http://localhost:9000/"),
        ])
        .unwrap();

        assert_eq!(config.trading_periods_per_year, 52.0);
        assert_eq!(config.worker_pool_size, Some(3));
        assert_eq!(config.per_call_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.tickers, vec!["SPY", "QQQ"]);
        assert_eq!(
            config.capability_api_base_url.as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[test]
    fn test_malformed_values_are_configuration_errors() {
        for pairs in [
            vec![("ADVISORY_WORKER_POOL_SIZE", "0")],
            vec![("ADVISORY_TRADING_PERIODS_PER_YEAR", "-1")],
            vec![("ADVISORY_CALL_TIMEOUT_MS", "soon")],
            vec![("ADVISORY_START_DATE", "2023-01-01"), ("ADVISORY_END_DATE", "2022-01-01")],
        ] {
            let result = config_from(&pairs);
            assert!(
                matches!(result, Err(OrchestrationError::Configuration(_))),
                "expected configuration error for {:?}",
                pairs
            );
        }
    }
}
