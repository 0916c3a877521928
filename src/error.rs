use thiserror::Error;

/// Failures surfaced by the analytics core and the volatility predictor.
///
/// Every variant is terminal for the call that produced it. Nothing is retried
/// internally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyticsError {
    #[error("Invalid portfolio: {0}")]
    InvalidPortfolio(String),

    #[error("Weights sum to zero")]
    InvalidWeights,

    #[error("No price data available: {0}")]
    DataUnavailable(String),

    #[error("No price data retrieved: trading calendars of {0:?} have no common date")]
    NoPriceData(Vec<String>),

    #[error("Insufficient history: need at least 2 price rows, got {rows}")]
    InsufficientHistory { rows: usize },

    #[error("Volatility model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Upstream price source failed: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;

impl From<reqwest::Error> for AnalyticsError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
