use crate::config::{SHARPE_PRECISION, TRADING_DAYS, VALUE_PRECISION};
use crate::data::PriceSource;
use crate::error::{AnalyticsError, Result};
use crate::normalizer::{MarketDataNormalizer, PriceTable};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Inputs
// ──────────────────────────────────────────────────────────────────────────────

/// One requested position. The identifier is matched case-insensitively.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PortfolioItem {
    pub identifier: String,
    /// Any finite real; the sign is the direction of exposure.
    pub weight: f64,
}

impl PortfolioItem {
    pub fn new(identifier: &str, weight: f64) -> Self {
        Self {
            identifier: identifier.to_string(),
            weight,
        }
    }
}

/// Raw weights divided by their sum, parallel to the item list.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedWeights(Vec<f64>);

impl NormalizedWeights {
    pub fn normalize(raw: &[f64]) -> Result<Self> {
        if raw.is_empty() {
            return Err(AnalyticsError::InvalidPortfolio("portfolio is empty".to_string()));
        }
        if let Some(pos) = raw.iter().position(|w| !w.is_finite()) {
            return Err(AnalyticsError::InvalidPortfolio(format!(
                "weight #{} is not a finite number",
                pos + 1
            )));
        }

        let sum: f64 = raw.iter().sum();
        if sum == 0.0 {
            return Err(AnalyticsError::InvalidWeights);
        }
        Ok(Self(raw.iter().map(|w| w / sum).collect()))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Trims and uppercases identifiers, keeping input order.
pub fn canonicalize(items: &[PortfolioItem]) -> Result<Vec<String>> {
    let mut seen = HashSet::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let id = item.identifier.trim().to_uppercase();
        if id.is_empty() {
            return Err(AnalyticsError::InvalidPortfolio(format!(
                "identifier #{} is blank",
                i + 1
            )));
        }
        if !seen.insert(id.clone()) {
            return Err(AnalyticsError::InvalidPortfolio(format!(
                "{} appears more than once",
                id
            )));
        }
        out.push(id);
    }
    Ok(out)
}

// ──────────────────────────────────────────────────────────────────────────────
// Returns & Covariance
// ──────────────────────────────────────────────────────────────────────────────

/// Row-over-row fractional changes of a `PriceTable`.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnTable {
    rows: Vec<Vec<f64>>,
    width: usize,
}

impl ReturnTable {
    pub fn from_prices(prices: &PriceTable) -> Self {
        let rows = prices
            .rows()
            .windows(2)
            .map(|w| {
                w[1].iter()
                    .zip(w[0].iter())
                    .map(|(cur, prev)| cur / prev - 1.0)
                    .collect()
            })
            .collect();
        Self {
            rows,
            width: prices.instruments().len(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Per-column arithmetic means.
    pub fn means(&self) -> Vec<f64> {
        let n = self.rows.len() as f64;
        (0..self.width)
            .map(|j| self.rows.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect()
    }

    /// Sample covariance (N-1). A single return row has no dispersion
    /// estimate; the matrix is then all zeros.
    pub fn covariance(&self) -> CovarianceMatrix {
        let n = self.width;
        let samples = self.rows.len();
        let mut cov = vec![vec![0.0; n]; n];
        if samples < 2 {
            return CovarianceMatrix(cov);
        }

        let means = self.means();
        for i in 0..n {
            for j in i..n {
                let mut sum = 0.0;
                for row in &self.rows {
                    sum += (row[i] - means[i]) * (row[j] - means[j]);
                }
                let covariance = sum / (samples as f64 - 1.0);
                cov[i][j] = covariance;
                cov[j][i] = covariance;
            }
        }
        CovarianceMatrix(cov)
    }
}

/// Symmetric instrument × instrument covariance of daily returns.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceMatrix(Vec<Vec<f64>>);

impl CovarianceMatrix {
    #[cfg(test)]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.0[i][j]
    }

    #[cfg(test)]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// wᵀ · Σ · w
    pub fn quadratic_form(&self, weights: &[f64]) -> f64 {
        let n = weights.len();
        let mut var = 0.0;
        for i in 0..n {
            for j in 0..n {
                var += weights[i] * weights[j] * self.0[i][j];
            }
        }
        var
    }
}

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

// ──────────────────────────────────────────────────────────────────────────────
// Statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Annualized portfolio figures at full precision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortfolioStatistics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

pub fn portfolio_statistics(returns: &ReturnTable, weights: &NormalizedWeights) -> PortfolioStatistics {
    let w = weights.as_slice();
    let means = returns.means();
    let cov = returns.covariance();

    let expected_return = TRADING_DAYS * portfolio_return(w, &means);
    let variance = (TRADING_DAYS * cov.quadratic_form(w)).max(0.0);
    let volatility = variance.sqrt();
    let sharpe_ratio = if volatility != 0.0 {
        expected_return / volatility
    } else {
        0.0
    };

    PortfolioStatistics {
        expected_return,
        volatility,
        sharpe_ratio,
    }
}

/// Half-away-from-zero rounding; never yields `-0.0`.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 { 0.0 } else { rounded }
}

// ──────────────────────────────────────────────────────────────────────────────
// Result
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisResult {
    #[serde(rename = "tickers")]
    pub instruments: Vec<String>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// Last common close per instrument, in instrument order.
    #[serde(serialize_with = "serialize_ordered_map")]
    pub latest_prices: Vec<(String, f64)>,
}

impl AnalysisResult {
    /// Applies presentation rounding; nothing computed afterwards reads these.
    pub fn present(instruments: Vec<String>, stats: PortfolioStatistics, latest: &[f64]) -> Self {
        let latest_prices = instruments
            .iter()
            .zip(latest.iter())
            .map(|(id, p)| (id.clone(), round_to(*p, VALUE_PRECISION)))
            .collect();

        Self {
            instruments,
            expected_return: round_to(stats.expected_return, VALUE_PRECISION),
            volatility: round_to(stats.volatility, VALUE_PRECISION),
            sharpe_ratio: round_to(stats.sharpe_ratio, SHARPE_PRECISION),
            latest_prices,
        }
    }

    #[cfg(test)]
    pub fn latest_price(&self, identifier: &str) -> Option<f64> {
        self.latest_prices
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, p)| *p)
    }
}

fn serialize_ordered_map<S: Serializer>(
    entries: &[(String, f64)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for (k, v) in entries {
        map.serialize_entry(k, v)?;
    }
    map.end()
}

/// Pure half of `analyze`: statistics from an already normalized table whose
/// columns are in `instruments` order.
pub fn analyze_prices(
    instruments: Vec<String>,
    weights: &NormalizedWeights,
    prices: &PriceTable,
) -> Result<AnalysisResult> {
    let Some(latest) = prices.latest() else {
        return Err(AnalyticsError::NoPriceData(instruments));
    };

    let returns = ReturnTable::from_prices(prices);
    if returns.is_empty() {
        return Err(AnalyticsError::InsufficientHistory { rows: prices.len() });
    }

    let stats = portfolio_statistics(&returns, weights);
    Ok(AnalysisResult::present(instruments, stats, latest))
}

// ──────────────────────────────────────────────────────────────────────────────
// Engine
// ──────────────────────────────────────────────────────────────────────────────

pub struct PortfolioAnalyzer<S> {
    normalizer: MarketDataNormalizer<S>,
}

impl<S: PriceSource> PortfolioAnalyzer<S> {
    pub fn new(source: S) -> Self {
        Self::with_normalizer(MarketDataNormalizer::new(source))
    }

    pub fn with_normalizer(normalizer: MarketDataNormalizer<S>) -> Self {
        Self { normalizer }
    }

    #[cfg(test)]
    pub fn normalizer(&self) -> &MarketDataNormalizer<S> {
        &self.normalizer
    }

    /// Full pipeline: validate → normalize weights → fetch closes → statistics.
    pub async fn analyze(&self, items: &[PortfolioItem], period: &str) -> Result<AnalysisResult> {
        let raw: Vec<f64> = items.iter().map(|i| i.weight).collect();
        let weights = NormalizedWeights::normalize(&raw)?;
        let instruments = canonicalize(items)?;

        info!("Analyzing {:?} over {}", instruments, period);

        let prices = self.normalizer.fetch(&instruments, period).await?;
        let result = analyze_prices(instruments, &weights, &prices)?;

        info!(
            "E[r]={:.4}, σ={:.4}, Sharpe={:.2} from {} price rows",
            result.expected_return,
            result.volatility,
            result.sharpe_ratio,
            prices.len()
        );
        Ok(result)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Predictor Features
// ──────────────────────────────────────────────────────────────────────────────

/// `(last_return, last_volatility)` from a close series: the latest daily
/// return and the sample stdev of the trailing `window` returns.
pub fn volatility_features(closes: &[f64], window: usize) -> Result<(f64, f64)> {
    if closes.len() < 2 {
        return Err(AnalyticsError::InsufficientHistory { rows: closes.len() });
    }

    let returns: Vec<f64> = closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    let last_return = returns[returns.len() - 1];

    let tail = &returns[returns.len().saturating_sub(window.max(1))..];
    let n = tail.len() as f64;
    let volatility = if tail.len() < 2 {
        0.0
    } else {
        let mean = tail.iter().sum::<f64>() / n;
        (tail.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };

    Ok((last_return, volatility))
}
