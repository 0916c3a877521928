use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use futures_util::future::join_all;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Label of one upstream column: either a plain field name (`Close`) or a
/// multi-level key such as `("AAPL", "Close")`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnLabel {
    Flat(String),
    Hierarchical(Vec<String>),
}

impl ColumnLabel {
    pub fn flat(name: &str) -> Self {
        Self::Flat(name.to_string())
    }

    pub fn pair(outer: &str, inner: &str) -> Self {
        Self::Hierarchical(vec![outer.to_string(), inner.to_string()])
    }

    pub fn is_flat_field(&self, field: &str) -> bool {
        matches!(self, Self::Flat(name) if name == field)
    }

    pub fn is_pair(&self, outer: &str, inner: &str) -> bool {
        match self {
            Self::Hierarchical(levels) => {
                levels.len() == 2 && levels[0] == outer && levels[1] == inner
            }
            Self::Flat(_) => false,
        }
    }
}

impl fmt::Display for ColumnLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat(name) => write!(f, "{}", name),
            Self::Hierarchical(levels) => write!(f, "({})", levels.join(", ")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawColumn {
    pub label: ColumnLabel,
    /// One slot per entry of the owning frame's index.
    pub values: Vec<Option<f64>>,
}

/// Upstream response before normalization: a shared date index and labelled
/// columns that may contain gaps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawFrame {
    pub index: Vec<NaiveDate>,
    pub columns: Vec<RawColumn>,
}

impl RawFrame {
    /// Outer-joins independently dated series on a sorted union index.
    /// A date repeated within one series keeps the last value.
    pub fn from_series(series: Vec<(ColumnLabel, Vec<(NaiveDate, Option<f64>)>)>) -> Self {
        let index: Vec<NaiveDate> = series
            .iter()
            .flat_map(|(_, points)| points.iter().map(|(d, _)| *d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let columns = series
            .into_iter()
            .map(|(label, points)| {
                let by_date: BTreeMap<NaiveDate, Option<f64>> = points.into_iter().collect();
                let values = index
                    .iter()
                    .map(|d| by_date.get(d).copied().flatten())
                    .collect();
                RawColumn { label, values }
            })
            .collect();

        Self { index, columns }
    }

    #[cfg(test)]
    pub fn is_hierarchical(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c.label, ColumnLabel::Hierarchical(_)))
    }

    pub fn labels(&self) -> impl Iterator<Item = &ColumnLabel> {
        self.columns.iter().map(|c| &c.label)
    }

    /// Dated, usable prices of one column: finite and strictly positive.
    pub fn usable_prices(&self, column: usize) -> Vec<(NaiveDate, f64)> {
        let Some(col) = self.columns.get(column) else {
            return Vec::new();
        };
        self.index
            .iter()
            .zip(col.values.iter())
            .filter_map(|(d, v)| match v {
                Some(p) if p.is_finite() && *p > 0.0 => Some((*d, *p)),
                _ => None,
            })
            .collect()
    }

    pub fn has_usable_prices(&self, column: usize) -> bool {
        self.columns
            .get(column)
            .is_some_and(|c| c.values.iter().flatten().any(|p| p.is_finite() && *p > 0.0))
    }
}

/// Upstream market-data provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Downloads daily history for every instrument over `period` in one call.
    async fn download(&self, instruments: &[String], period: &str) -> Result<RawFrame>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: PriceSource + ?Sized> PriceSource for Box<T> {
    async fn download(&self, instruments: &[String], period: &str) -> Result<RawFrame> {
        (**self).download(instruments, period).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance chart API
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Debug)]
struct YahooChart {
    #[serde(default)]
    result: Option<Vec<YahooResult>>,
    #[serde(default)]
    error: Option<YahooChartError>,
}

#[derive(Deserialize, Debug)]
struct YahooChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct YahooResult {
    #[serde(default)]
    meta: Option<YahooMeta>,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Debug)]
struct YahooMeta {
    gmtoffset: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct YahooIndicators {
    #[serde(default)]
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Deserialize, Debug, Default)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize, Debug, Default)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

type FieldSeries = Vec<(&'static str, Vec<(NaiveDate, Option<f64>)>)>;

/// Converts one chart response into per-field dated series. `Close` is the
/// adjusted close when Yahoo supplies one. A chart-level error or an empty
/// result means the symbol has no data and yields `None`.
fn chart_to_fields(symbol: &str, response: YahooChartResponse) -> Option<FieldSeries> {
    if let Some(err) = response.chart.error {
        info!(
            "{}: no data ({} {})",
            symbol,
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        );
        return None;
    }

    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        info!("{}: empty chart result", symbol);
        return None;
    };

    let offset = result.meta.and_then(|m| m.gmtoffset).unwrap_or(0);
    let dates: Vec<Option<NaiveDate>> = result
        .timestamp
        .iter()
        .map(|&ts| DateTime::from_timestamp(ts + offset, 0).map(|dt| dt.date_naive()))
        .collect();

    let mut indicators = result.indicators;
    let quote = if indicators.quote.is_empty() {
        YahooQuote::default()
    } else {
        indicators.quote.swap_remove(0)
    };
    let adjusted = indicators
        .adjclose
        .into_iter()
        .next()
        .map(|a| a.adjclose)
        .filter(|a| !a.is_empty());

    let align = |values: &[Option<f64>]| -> Vec<(NaiveDate, Option<f64>)> {
        dates
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.map(|d| (d, values.get(i).copied().flatten())))
            .collect()
    };

    let close = adjusted.as_deref().unwrap_or(quote.close.as_slice());
    Some(vec![
        ("Open", align(&quote.open)),
        ("High", align(&quote.high)),
        ("Low", align(&quote.low)),
        ("Close", align(close)),
        ("Volume", align(&quote.volume)),
    ])
}

/// Lays out per-symbol fields the way a batched downloader does: flat field
/// labels for a single symbol, `(symbol, field)` pairs otherwise.
fn assemble_frame(requested: usize, per_symbol: Vec<(String, FieldSeries)>) -> RawFrame {
    let series = per_symbol
        .into_iter()
        .flat_map(|(symbol, fields)| {
            fields.into_iter().map(move |(field, points)| {
                let label = if requested == 1 {
                    ColumnLabel::flat(field)
                } else {
                    ColumnLabel::pair(&symbol, field)
                };
                (label, points)
            })
        })
        .collect();
    RawFrame::from_series(series)
}

/// Yahoo Finance daily history over the v8 chart endpoint.
pub struct YahooPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl YahooPriceSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_chart(&self, symbol: &str, period: &str) -> Result<YahooChartResponse> {
        let url = format!(
            "{}/v8/finance/chart/{}?range={}&interval=1d",
            self.base_url, symbol, period
        );
        debug!("GET {}", url);

        // Unknown symbols come back as 404 with a chart.error body, which
        // still parses; only transport and decode failures are errors here.
        let response = self.client.get(&url).send().await?;
        let parsed = response.json::<YahooChartResponse>().await?;
        Ok(parsed)
    }
}

#[async_trait]
impl PriceSource for YahooPriceSource {
    async fn download(&self, instruments: &[String], period: &str) -> Result<RawFrame> {
        info!(
            "Downloading {} symbol(s) from Yahoo, range={}",
            instruments.len(),
            period
        );

        let fetches = instruments.iter().map(|symbol| async move {
            let fields = self
                .fetch_chart(symbol, period)
                .await
                .map(|resp| chart_to_fields(symbol, resp));
            (symbol.clone(), fields)
        });

        let mut per_symbol = Vec::with_capacity(instruments.len());
        let mut answered = 0;
        let mut last_err = None;
        for (symbol, outcome) in join_all(fetches).await {
            match outcome {
                Ok(Some(fields)) => {
                    answered += 1;
                    per_symbol.push((symbol, fields));
                }
                Ok(None) => answered += 1,
                Err(e) => {
                    warn!("Yahoo history fetch failed for {}: {}", symbol, e);
                    last_err = Some(e);
                }
            }
        }

        // Only a transport failure on every symbol is an error; symbols with
        // no data are left out and the normalizer decides.
        if answered == 0 {
            if let Some(err) = last_err {
                return Err(err);
            }
        }

        Ok(assemble_frame(instruments.len(), per_symbol))
    }

    fn name(&self) -> &str {
        "yahoo"
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalyticsError;
    use crate::normalizer::MarketDataNormalizer;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    const CHART_JSON: &str = r#"{
        "chart": {
            "result": [{
                "meta": {"gmtoffset": -14400},
                "timestamp": [1709303400, 1709562600, 1709649000],
                "indicators": {
                    "quote": [{
                        "open": [10.0, 11.0, 12.0],
                        "high": [10.5, 11.5, 12.5],
                        "low": [9.5, 10.5, 11.5],
                        "close": [10.2, null, 12.2],
                        "volume": [100.0, 200.0, 300.0]
                    }],
                    "adjclose": [{"adjclose": [10.1, null, 12.1]}]
                }
            }],
            "error": null
        }
    }"#;

    #[test]
    fn test_chart_uses_adjusted_close() {
        let resp: YahooChartResponse = serde_json::from_str(CHART_JSON).unwrap();
        let fields = chart_to_fields("AAA", resp).unwrap();
        let (name, close) = &fields[3];
        assert_eq!(*name, "Close");
        assert_eq!(close.len(), 3);
        assert_eq!(close[0], (date(1), Some(10.1)));
        assert_eq!(close[1], (date(4), None));
        assert_eq!(close[2], (date(5), Some(12.1)));
    }

    #[test]
    fn test_chart_falls_back_to_raw_close() {
        let json = CHART_JSON.replace(r#""adjclose": [{"adjclose": [10.1, null, 12.1]}]"#, r#""adjclose": []"#);
        let resp: YahooChartResponse = serde_json::from_str(&json).unwrap();
        let fields = chart_to_fields("AAA", resp).unwrap();
        assert_eq!(fields[3].1[0].1, Some(10.2));
    }

    const UNKNOWN_SYMBOL_JSON: &str = r#"{"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}}}"#;

    #[test]
    fn test_chart_error_means_no_data() {
        let resp: YahooChartResponse = serde_json::from_str(UNKNOWN_SYMBOL_JSON).unwrap();
        assert!(chart_to_fields("ZZZZ", resp).is_none());

        let empty: YahooChartResponse =
            serde_json::from_str(r#"{"chart": {"result": [], "error": null}}"#).unwrap();
        assert!(chart_to_fields("ZZZZ", empty).is_none());
    }

    async fn stub_chart(Path(symbol): Path<String>) -> (StatusCode, String) {
        match symbol.as_str() {
            "AAA" => (StatusCode::OK, CHART_JSON.to_string()),
            "BROKEN" => (StatusCode::BAD_GATEWAY, "<html>bad gateway</html>".to_string()),
            _ => (StatusCode::NOT_FOUND, UNKNOWN_SYMBOL_JSON.to_string()),
        }
    }

    /// Local stand-in for the chart endpoint; returns its base URL.
    async fn spawn_chart_stub() -> String {
        let app = Router::new().route("/v8/finance/chart/:symbol", get(stub_chart));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_download_omits_failed_symbols() {
        let base = spawn_chart_stub().await;
        let source = YahooPriceSource::new(&base).unwrap();

        let frame = source
            .download(&["AAA".to_string(), "BROKEN".to_string()], "1mo")
            .await
            .unwrap();
        assert!(frame.is_hierarchical());
        assert!(frame.labels().all(|l| l.to_string().contains("AAA")));
        assert_eq!(frame.index, vec![date(1), date(4), date(5)]);
    }

    #[tokio::test]
    async fn test_download_transport_failure_on_every_symbol_is_upstream() {
        let base = spawn_chart_stub().await;
        let source = YahooPriceSource::new(&base).unwrap();

        let err = source.download(&["BROKEN".to_string()], "1mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_data_unavailable() {
        let base = spawn_chart_stub().await;
        let normalizer = MarketDataNormalizer::new(YahooPriceSource::new(&base).unwrap());

        let frame = normalizer
            .source()
            .download(&["ZZZZ".to_string()], "1mo")
            .await
            .unwrap();
        assert!(frame.columns.is_empty());

        let err = normalizer.fetch(&["ZZZZ".to_string()], "1mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::DataUnavailable(_)));

        let err = normalizer
            .fetch(&["YYYY".to_string(), "ZZZZ".to_string()], "1mo")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_known_and_unknown_symbol_names_the_missing_one() {
        let base = spawn_chart_stub().await;
        let normalizer = MarketDataNormalizer::new(YahooPriceSource::new(&base).unwrap());

        let err = normalizer
            .fetch(&["AAA".to_string(), "ZZZZ".to_string()], "1mo")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::DataUnavailable(msg) if msg.contains("ZZZZ") && !msg.contains("AAA")));
    }

    #[test]
    fn test_assemble_single_symbol_is_flat() {
        let fields: FieldSeries = vec![("Close", vec![(date(1), Some(1.0))])];
        let frame = assemble_frame(1, vec![("AAA".to_string(), fields)]);
        assert!(!frame.is_hierarchical());
        assert!(frame.columns[0].label.is_flat_field("Close"));
    }

    #[test]
    fn test_assemble_many_symbols_is_hierarchical() {
        let a: FieldSeries = vec![("Close", vec![(date(1), Some(1.0)), (date(4), Some(2.0))])];
        let b: FieldSeries = vec![("Close", vec![(date(4), Some(3.0)), (date(5), Some(4.0))])];
        let frame = assemble_frame(2, vec![("AAA".into(), a), ("BBB".into(), b)]);

        assert!(frame.is_hierarchical());
        assert_eq!(frame.index, vec![date(1), date(4), date(5)]);
        assert!(frame.columns[1].label.is_pair("BBB", "Close"));
        assert_eq!(frame.columns[0].values, vec![Some(1.0), Some(2.0), None]);
        assert_eq!(frame.columns[1].values, vec![None, Some(3.0), Some(4.0)]);
    }

    #[test]
    fn test_usable_prices_skip_gaps_and_bad_values() {
        let frame = RawFrame::from_series(vec![(
            ColumnLabel::flat("Close"),
            vec![
                (date(1), Some(1.0)),
                (date(2), None),
                (date(3), Some(f64::NAN)),
                (date(4), Some(0.0)),
                (date(5), Some(2.0)),
            ],
        )]);
        assert_eq!(frame.usable_prices(0), vec![(date(1), 1.0), (date(5), 2.0)]);
        assert!(frame.has_usable_prices(0));
        assert!(!frame.has_usable_prices(7));
    }

    #[test]
    fn test_label_display() {
        assert_eq!(ColumnLabel::pair("AAPL", "Close").to_string(), "(AAPL, Close)");
        assert_eq!(ColumnLabel::flat("Close").to_string(), "Close");
    }
}
