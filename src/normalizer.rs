use crate::config::MAX_INDIVIDUAL_REFETCH;
use crate::data::{ColumnLabel, PriceSource, RawFrame};
use crate::error::{AnalyticsError, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Price Table
// ──────────────────────────────────────────────────────────────────────────────

/// Rectangular close-price matrix: ascending dates × instruments, no gaps.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceTable {
    instruments: Vec<String>,
    dates: Vec<NaiveDate>,
    rows: Vec<Vec<f64>>,
}

impl PriceTable {
    pub fn new(instruments: Vec<String>, dates: Vec<NaiveDate>, rows: Vec<Vec<f64>>) -> Self {
        debug_assert_eq!(dates.len(), rows.len());
        debug_assert!(rows.iter().all(|r| r.len() == instruments.len()));
        Self {
            instruments,
            dates,
            rows,
        }
    }

    /// Keeps only the dates on which every column has a price.
    pub fn intersect(instruments: Vec<String>, columns: Vec<Vec<(NaiveDate, f64)>>) -> Self {
        let width = columns.len();
        let mut by_date: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
        for (j, column) in columns.into_iter().enumerate() {
            for (date, price) in column {
                by_date.entry(date).or_insert_with(|| vec![None; width])[j] = Some(price);
            }
        }

        let (dates, rows): (Vec<NaiveDate>, Vec<Vec<f64>>) = by_date
            .into_iter()
            .filter_map(|(date, row)| {
                let complete: Option<Vec<f64>> = row.into_iter().collect();
                complete.map(|r| (date, r))
            })
            .unzip();

        Self::new(instruments, dates, rows)
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn latest(&self) -> Option<&[f64]> {
        self.rows.last().map(Vec::as_slice)
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[j]).collect()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Close-Column Strategies
// ──────────────────────────────────────────────────────────────────────────────

/// One rule for finding an instrument's close column in an upstream frame.
pub trait CloseColumnStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the matching column, if any. `requested` is how many
    /// instruments the call that produced `frame` asked for.
    fn locate(&self, frame: &RawFrame, instrument: &str, requested: usize) -> Option<usize>;
}

/// `(instrument, "Close")`.
pub struct HierarchicalKey;

impl CloseColumnStrategy for HierarchicalKey {
    fn name(&self) -> &'static str {
        "hierarchical-key"
    }

    fn locate(&self, frame: &RawFrame, instrument: &str, _requested: usize) -> Option<usize> {
        frame.labels().position(|l| l.is_pair(instrument, "Close"))
    }
}

/// Any label whose text mentions both `Close` and the instrument.
pub struct LabelSubstring;

impl CloseColumnStrategy for LabelSubstring {
    fn name(&self) -> &'static str {
        "label-substring"
    }

    fn locate(&self, frame: &RawFrame, instrument: &str, _requested: usize) -> Option<usize> {
        frame.labels().position(|l| {
            let text = l.to_string();
            text.contains("Close") && text.contains(instrument)
        })
    }
}

/// A lone flat `Close` column, attributable only to a single-instrument call.
pub struct FlatClose;

impl CloseColumnStrategy for FlatClose {
    fn name(&self) -> &'static str {
        "flat-close"
    }

    fn locate(&self, frame: &RawFrame, _instrument: &str, requested: usize) -> Option<usize> {
        if requested != 1 {
            return None;
        }
        frame.labels().position(|l| l.is_flat_field("Close"))
    }
}

/// Strategies in the order they are tried.
pub const CASCADE: &[&dyn CloseColumnStrategy] = &[&HierarchicalKey, &LabelSubstring, &FlatClose];

/// Runs the cascade for one instrument. A matching column without a single
/// usable price does not count as found.
pub fn resolve_close(
    frame: &RawFrame,
    instrument: &str,
    requested: usize,
) -> Option<Vec<(NaiveDate, f64)>> {
    for strategy in CASCADE {
        let Some(idx) = strategy.locate(frame, instrument, requested) else {
            continue;
        };
        if !frame.has_usable_prices(idx) {
            debug!(
                "{}: column {} matched by {} holds no usable prices",
                instrument, frame.columns[idx].label, strategy.name()
            );
            continue;
        }
        debug!(
            "{}: close column {} via {}",
            instrument, frame.columns[idx].label, strategy.name()
        );
        return Some(frame.usable_prices(idx));
    }
    None
}

// ──────────────────────────────────────────────────────────────────────────────
// Normalizer
// ──────────────────────────────────────────────────────────────────────────────

/// Turns whatever shape the upstream source returns into a `PriceTable`.
pub struct MarketDataNormalizer<S> {
    source: S,
    refetch_cap: usize,
}

impl<S: PriceSource> MarketDataNormalizer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            refetch_cap: MAX_INDIVIDUAL_REFETCH,
        }
    }

    #[cfg(test)]
    pub fn with_refetch_cap(mut self, cap: usize) -> Self {
        self.refetch_cap = cap;
        self
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches closes for `instruments` over `period`. Columns of the result
    /// follow the order of `instruments`.
    pub async fn fetch(&self, instruments: &[String], period: &str) -> Result<PriceTable> {
        if instruments.is_empty() {
            return Err(AnalyticsError::InvalidPortfolio(
                "no instruments requested".to_string(),
            ));
        }
        if let Some(blank) = instruments.iter().position(|i| i.trim().is_empty()) {
            return Err(AnalyticsError::InvalidPortfolio(format!(
                "instrument #{} is blank",
                blank + 1
            )));
        }

        let frame = self.source.download(instruments, period).await?;
        let mut columns: Vec<Option<Vec<(NaiveDate, f64)>>> = instruments
            .iter()
            .map(|inst| resolve_close(&frame, inst, instruments.len()))
            .collect();

        if columns.iter().all(Option::is_none) {
            columns = self.refetch_individually(instruments, period, &frame).await?;
        }

        if columns.iter().all(Option::is_none) {
            return Err(AnalyticsError::DataUnavailable(format!(
                "no price columns found for {:?} from {}",
                instruments,
                self.source.name()
            )));
        }

        let missing: Vec<&str> = instruments
            .iter()
            .zip(columns.iter())
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(AnalyticsError::DataUnavailable(format!(
                "no price column for {:?}",
                missing
            )));
        }

        let columns: Vec<Vec<(NaiveDate, f64)>> = columns.into_iter().flatten().collect();
        let table = PriceTable::intersect(instruments.to_vec(), columns);
        if table.is_empty() {
            return Err(AnalyticsError::NoPriceData(instruments.to_vec()));
        }

        if let (Some(first), Some(last)) = (table.dates().first(), table.dates().last()) {
            info!(
                "Normalized {} instrument(s) over {}: {} common trading days, {} to {}",
                instruments.len(),
                period,
                table.len(),
                first,
                last
            );
        }
        Ok(table)
    }

    /// Last resort: one download per instrument.
    async fn refetch_individually(
        &self,
        instruments: &[String],
        period: &str,
        batched: &RawFrame,
    ) -> Result<Vec<Option<Vec<(NaiveDate, f64)>>>> {
        let labels: Vec<String> = batched.labels().map(ColumnLabel::to_string).collect();
        if instruments.len() > self.refetch_cap {
            return Err(AnalyticsError::DataUnavailable(format!(
                "batched response had no usable close column (labels: {:?}) and {} instruments exceed the individual re-fetch cap of {}",
                labels,
                instruments.len(),
                self.refetch_cap
            )));
        }

        info!(
            "No close column resolved from batched response (labels: {:?}); re-fetching {} instrument(s) individually",
            labels,
            instruments.len()
        );

        let mut columns = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let single = std::slice::from_ref(instrument);
            let column = match self.source.download(single, period).await {
                Ok(frame) => resolve_close(&frame, instrument, 1),
                Err(e) => {
                    warn!("Individual re-fetch failed for {}: {}", instrument, e);
                    None
                }
            };
            columns.push(column);
        }
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::{batched_closes, day, frame, ScriptedSource};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_intersection_drops_incomplete_rows() {
        let a = vec![(day(0), 1.0), (day(1), 2.0), (day(3), 4.0)];
        let b = vec![(day(3), 40.0), (day(0), 10.0), (day(2), 30.0)];
        let table = PriceTable::intersect(names(&["A", "B"]), vec![a, b]);

        assert_eq!(table.dates(), &[day(0), day(3)]);
        assert_eq!(table.rows(), &[vec![1.0, 10.0], vec![4.0, 40.0]]);
        assert_eq!(table.latest(), Some(&[4.0, 40.0][..]));
        assert_eq!(table.column(1), vec![10.0, 40.0]);
    }

    #[test]
    fn test_hierarchical_key_wins() {
        let f = frame(vec![
            (ColumnLabel::pair("AAA", "Open"), vec![Some(9.0)]),
            (ColumnLabel::pair("AAA", "Close"), vec![Some(10.0)]),
        ]);
        assert_eq!(HierarchicalKey.locate(&f, "AAA", 2), Some(1));
        assert_eq!(HierarchicalKey.locate(&f, "BBB", 2), None);
    }

    #[test]
    fn test_label_substring_handles_other_layouts() {
        let f = frame(vec![
            (ColumnLabel::Hierarchical(names(&["Price", "Close", "BBB"])), vec![Some(1.0)]),
            (ColumnLabel::flat("AAA_Close"), vec![Some(2.0)]),
        ]);
        assert_eq!(HierarchicalKey.locate(&f, "AAA", 2), None);
        assert_eq!(LabelSubstring.locate(&f, "AAA", 2), Some(1));
        assert_eq!(LabelSubstring.locate(&f, "BBB", 2), Some(0));
    }

    #[test]
    fn test_flat_close_only_for_single_requests() {
        let f = frame(vec![
            (ColumnLabel::flat("Open"), vec![Some(1.0)]),
            (ColumnLabel::flat("Close"), vec![Some(2.0)]),
        ]);
        assert_eq!(FlatClose.locate(&f, "AAA", 1), Some(1));
        assert_eq!(FlatClose.locate(&f, "AAA", 2), None);
    }

    #[test]
    fn test_empty_match_falls_through_to_next_strategy() {
        let f = frame(vec![
            (ColumnLabel::pair("AAA", "Close"), vec![None, None]),
            (ColumnLabel::flat("Close"), vec![Some(5.0), Some(6.0)]),
        ]);
        let column = resolve_close(&f, "AAA", 1).unwrap();
        assert_eq!(column, vec![(day(0), 5.0), (day(1), 6.0)]);
    }

    #[tokio::test]
    async fn test_columns_follow_request_order() {
        let source = ScriptedSource::new(batched_closes(&[
            ("BBB", &[20.0, 21.0, 22.0]),
            ("AAA", &[10.0, 11.0, 12.0]),
        ]));
        let normalizer = MarketDataNormalizer::new(source);
        let table = normalizer.fetch(&names(&["AAA", "BBB"]), "6mo").await.unwrap();

        assert_eq!(table.instruments(), &names(&["AAA", "BBB"])[..]);
        assert_eq!(table.latest(), Some(&[12.0, 22.0][..]));
        assert_eq!(normalizer.source().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_single_instrument_flat_frame() {
        let source = ScriptedSource::new(frame(vec![
            (ColumnLabel::flat("Open"), vec![Some(1.0), Some(1.0)]),
            (ColumnLabel::flat("Close"), vec![Some(1.5), Some(1.6)]),
        ]));
        let normalizer = MarketDataNormalizer::new(source);
        let table = normalizer.fetch(&names(&["AAA"]), "1mo").await.unwrap();
        assert_eq!(table.column(0), vec![1.5, 1.6]);
    }

    #[tokio::test]
    async fn test_individual_refetch_when_nothing_resolves() {
        let batched = frame(vec![(ColumnLabel::flat("Close"), vec![Some(1.0), Some(2.0)])]);
        let single = |closes: Vec<Option<f64>>| frame(vec![(ColumnLabel::flat("Close"), closes)]);
        let source = ScriptedSource::new(batched)
            .with_single("AAA", single(vec![Some(10.0), Some(11.0)]))
            .with_single("BBB", single(vec![Some(20.0), Some(22.0)]));
        let normalizer = MarketDataNormalizer::new(source);

        let table = normalizer.fetch(&names(&["AAA", "BBB"]), "6mo").await.unwrap();
        assert_eq!(table.rows(), &[vec![10.0, 20.0], vec![11.0, 22.0]]);
        assert_eq!(
            normalizer.source().calls(),
            vec![names(&["AAA", "BBB"]), names(&["AAA"]), names(&["BBB"])]
        );
    }

    #[tokio::test]
    async fn test_failed_individual_refetch_counts_as_missing() {
        let batched = frame(vec![(ColumnLabel::flat("Close"), vec![Some(1.0), Some(2.0)])]);
        let source = ScriptedSource::new(batched)
            .with_single("AAA", frame(vec![(ColumnLabel::flat("Close"), vec![Some(10.0), Some(11.0)])]))
            .with_failing_single("BBB");
        let normalizer = MarketDataNormalizer::new(source);

        let err = normalizer.fetch(&names(&["AAA", "BBB"]), "6mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::DataUnavailable(msg) if msg.contains("BBB") && !msg.contains("AAA")));
        assert_eq!(normalizer.source().calls().len(), 3);
    }

    #[tokio::test]
    async fn test_refetch_cap_blocks_fan_out() {
        let source = ScriptedSource::new(RawFrame::default());
        let normalizer = MarketDataNormalizer::new(source).with_refetch_cap(1);
        let err = normalizer.fetch(&names(&["AAA", "BBB"]), "6mo").await.unwrap_err();

        assert!(matches!(err, AnalyticsError::DataUnavailable(msg) if msg.contains("cap")));
        assert_eq!(normalizer.source().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_anywhere_is_data_unavailable() {
        let normalizer = MarketDataNormalizer::new(ScriptedSource::new(RawFrame::default()));
        let err = normalizer.fetch(&names(&["AAA"]), "6mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_partial_resolution_names_missing_instruments() {
        let source = ScriptedSource::new(batched_closes(&[("AAA", &[1.0, 2.0])]));
        let normalizer = MarketDataNormalizer::new(source);
        let err = normalizer.fetch(&names(&["AAA", "ZZZ"]), "6mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::DataUnavailable(msg) if msg.contains("ZZZ")));
    }

    #[tokio::test]
    async fn test_disjoint_calendars_are_no_price_data() {
        let source = ScriptedSource::new(frame(vec![
            (ColumnLabel::pair("AAA", "Close"), vec![Some(1.0), None]),
            (ColumnLabel::pair("BBB", "Close"), vec![None, Some(2.0)]),
        ]));
        let normalizer = MarketDataNormalizer::new(source);
        let err = normalizer.fetch(&names(&["AAA", "BBB"]), "6mo").await.unwrap_err();
        assert_eq!(err, AnalyticsError::NoPriceData(names(&["AAA", "BBB"])));
    }

    #[tokio::test]
    async fn test_batched_transport_error_propagates() {
        let source = ScriptedSource {
            fail_batched: true,
            ..ScriptedSource::default()
        };
        let normalizer = MarketDataNormalizer::new(source);
        let err = normalizer.fetch(&names(&["AAA", "BBB"]), "6mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_blank_instrument_rejected() {
        let normalizer = MarketDataNormalizer::new(ScriptedSource::default());
        let err = normalizer.fetch(&names(&["AAA", " "]), "6mo").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidPortfolio(_)));
        assert!(normalizer.source().calls().is_empty());
    }
}
