//! Risk evaluation and return statistics
//!
//! Returns are consecutive percentage changes of a price series.
//! Annualization multiplies by the configured number of trading periods.

use crate::error::OrchestrationError;
use crate::models::{AssetRisk, PriceSeries, RiskMetrics};
use crate::Result;

/// Per-period returns for one asset; always one shorter than its price series
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSeries {
    pub ticker: String,
    pub returns: Vec<f64>,
}

impl ReturnSeries {
    pub fn from_prices(series: &PriceSeries) -> Result<Self> {
        Ok(Self {
            ticker: series.ticker.clone(),
            returns: percentage_changes(&series.prices)?,
        })
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }
}

pub fn percentage_changes(prices: &[f64]) -> Result<Vec<f64>> {
    if prices.len() < 2 {
        return Err(OrchestrationError::InsufficientData(format!(
            "need at least 2 prices to compute a return, got {}",
            prices.len()
        )));
    }
    if let Some(bad) = prices.iter().find(|p| !p.is_finite() || **p <= 0.0) {
        return Err(OrchestrationError::InvalidInput(format!(
            "prices must be positive, got {}",
            bad
        )));
    }

    Ok(prices.windows(2).map(|w| w[1] / w[0] - 1.0).collect())
}

/// Sample standard deviation of per-period returns scaled by `sqrt(periods_per_year)`.
/// A single return carries no dispersion and yields zero.
pub fn annualized_volatility(prices: &[f64], periods_per_year: f64) -> Result<f64> {
    let returns = percentage_changes(prices)?;
    Ok(sample_std(&returns) * periods_per_year.sqrt())
}

pub fn assess(series: &[PriceSeries], periods_per_year: f64) -> Result<RiskMetrics> {
    let assets = series
        .iter()
        .map(|s| {
            let returns = percentage_changes(&s.prices).map_err(|e| match e {
                OrchestrationError::InsufficientData(reason) => {
                    OrchestrationError::InsufficientData(format!("{}: {}", s.ticker, reason))
                }
                other => other,
            })?;
            Ok(AssetRisk {
                ticker: s.ticker.clone(),
                annualized_volatility: sample_std(&returns) * periods_per_year.sqrt(),
                observations: returns.len(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RiskMetrics {
        periods_per_year,
        assets,
    })
}

/// Annualized mean returns and sample covariance across assets
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStatistics {
    pub tickers: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub covariances: Vec<Vec<f64>>,
    pub observations: usize,
}

impl ReturnStatistics {
    /// Series of unequal length are aligned on their most recent common window.
    pub fn estimate(series: &[PriceSeries], periods_per_year: f64) -> Result<Self> {
        if series.is_empty() {
            return Err(OrchestrationError::InsufficientData(
                "no price series supplied".to_string(),
            ));
        }

        let returns = series
            .iter()
            .map(ReturnSeries::from_prices)
            .collect::<Result<Vec<_>>>()?;
        let window = returns.iter().map(ReturnSeries::len).min().unwrap_or(0);
        let aligned: Vec<&[f64]> = returns
            .iter()
            .map(|r| &r.returns[r.len() - window..])
            .collect();

        let means: Vec<f64> = aligned.iter().map(|r| mean(r)).collect();
        let n = aligned.len();
        let mut covariances = vec![vec![0.0; n]; n];
        if window > 1 {
            for i in 0..n {
                for j in i..n {
                    let cov = aligned[i]
                        .iter()
                        .zip(aligned[j].iter())
                        .map(|(a, b)| (a - means[i]) * (b - means[j]))
                        .sum::<f64>()
                        / (window - 1) as f64
                        * periods_per_year;
                    covariances[i][j] = cov;
                    covariances[j][i] = cov;
                }
            }
        }

        Ok(Self {
            tickers: returns.iter().map(|r| r.ticker.clone()).collect(),
            expected_returns: means.iter().map(|m| m * periods_per_year).collect(),
            covariances,
            observations: window,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(ticker: &str, prices: &[f64]) -> PriceSeries {
        PriceSeries {
            ticker: ticker.to_string(),
            prices: prices.to_vec(),
        }
    }

    #[test]
    fn test_constant_prices_have_zero_volatility() {
        let vol = annualized_volatility(&[100.0; 30], 252.0).unwrap();
        assert_eq!(vol, 0.0);
    }

    #[test]
    fn test_too_few_prices_is_insufficient_data() {
        for prices in [vec![], vec![101.0]] {
            assert!(matches!(
                annualized_volatility(&prices, 252.0),
                Err(OrchestrationError::InsufficientData(_))
            ));
        }
    }

    #[test]
    fn test_return_series_is_one_shorter() {
        let returns = ReturnSeries::from_prices(&series("X", &[100.0, 110.0, 99.0, 99.0])).unwrap();
        assert_eq!(returns.len(), 3);
        assert!((returns.returns[0] - 0.10).abs() < 1e-12);
        assert!((returns.returns[1] + 0.10).abs() < 1e-12);
        assert_eq!(returns.returns[2], 0.0);
    }

    #[test]
    fn test_volatility_matches_hand_computation() {
        // returns: +10%, -10%  → mean 0, sample std = sqrt(0.02) ≈ 0.141421
        let vol = annualized_volatility(&[100.0, 110.0, 99.0], 4.0).unwrap();
        assert!((vol - 0.02_f64.sqrt() * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_periods_per_year_scales_volatility() {
        let prices = [100.0, 102.0, 101.0, 104.0, 103.0];
        let daily = annualized_volatility(&prices, 252.0).unwrap();
        let weekly = annualized_volatility(&prices, 52.0).unwrap();
        assert!((daily / weekly - (252.0_f64 / 52.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_non_positive_price_rejected() {
        assert!(matches!(
            annualized_volatility(&[100.0, 0.0, 100.0], 252.0),
            Err(OrchestrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_statistics_align_and_annualize() {
        let stats = ReturnStatistics::estimate(
            &[
                series("A", &[50.0, 100.0, 110.0, 99.0]),
                series("B", &[200.0, 220.0, 198.0]),
            ],
            2.0,
        )
        .unwrap();

        assert_eq!(stats.observations, 2);
        assert_eq!(stats.tickers, vec!["A", "B"]);
        // Aligned returns for A are +10%, -10% (the first +100% falls outside the window).
        assert!(stats.expected_returns[0].abs() < 1e-12);
        assert!((stats.covariances[0][0] - 0.04).abs() < 1e-12);
        assert!((stats.covariances[0][1] - stats.covariances[1][0]).abs() < 1e-15);
    }

    #[test]
    fn test_assess_names_the_short_series() {
        let result = assess(&[series("A", &[1.0, 2.0]), series("B", &[3.0])], 252.0);
        match result {
            Err(OrchestrationError::InsufficientData(reason)) => assert!(reason.starts_with("B:")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
