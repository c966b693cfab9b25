//! Stateful query engine over one [`RecordSet`].
//!
//! The aggregator keeps a filter view next to the full record set. Filter
//! calls always start from the full set and replace the view wholesale, so
//! filtering by `Error` and then by `Warning` leaves only `Warning` rows and
//! never the (empty) intersection. This is easy to trip over; use
//! [`LogAggregator::clear_filter`] to go back to the unfiltered view.
//!
//! Trend, averages, summary statistics and the first/last timestamp always
//! use the full set. Distribution and export use the view.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;

use crate::catalog;
use crate::error::{AnalyzerError, Result};
use crate::record::{Column, ColumnRef, Record, RecordSet};
use crate::stats::{self, ColumnSummary};

pub const DEFAULT_EXPORT_PATH: &str = "filtered_log_data.json";

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    ColumnEquals { column: String, value: String },
    MessageMatches(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterState { Unfiltered, Filtered(Predicate) }

#[derive(Clone, Debug)]
struct ViewEntry {
    index: usize,
    event_description: Option<&'static str>,
}

/// One row of the filter view. `event_description` is present once
/// [`LogAggregator::map_event_descriptions`] has run on the current view.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ViewRow<'a> {
    #[serde(flatten)]
    pub record: &'a Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_description: Option<&'static str>,
}

/// Records per calendar date, ascending.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Trend {
    pub buckets: Vec<(NaiveDate, usize)>,
}

impl Trend {
    pub fn total(&self) -> usize { self.buckets.iter().map(|(_, c)| c).sum() }
    pub fn len(&self) -> usize { self.buckets.len() }
    pub fn is_empty(&self) -> bool { self.buckets.is_empty() }
}

/// Value counts of one column, most frequent first; ties keep first-seen order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Distribution {
    pub column: String,
    pub counts: Vec<(String, usize)>,
}

impl Distribution {
    pub fn total(&self) -> usize { self.counts.iter().map(|(_, c)| c).sum() }
    pub fn get(&self, key: &str) -> Option<usize> { self.counts.iter().find(|(k, _)| k == key).map(|(_, c)| *c) }
}

pub struct LogAggregator {
    records: RecordSet,
    state: FilterState,
    view: Vec<ViewEntry>,
}

impl LogAggregator {
    pub fn new(records: RecordSet) -> Self {
        let view = full_view(&records);
        LogAggregator { records, state: FilterState::Unfiltered, view }
    }

    pub fn record_set(&self) -> &RecordSet { &self.records }
    pub fn state(&self) -> &FilterState { &self.state }
    pub fn view_len(&self) -> usize { self.view.len() }
    pub fn view_is_empty(&self) -> bool { self.view.is_empty() }

    pub fn view(&self) -> impl Iterator<Item = ViewRow<'_>> + '_ {
        self.view.iter().map(|e| ViewRow { record: &self.records.records()[e.index], event_description: e.event_description })
    }

    /// Replaces the view with the records of the full set where `column`
    /// equals `value`. Returns the new view size.
    pub fn filter_by_column_value(&mut self, column: &str, value: &str) -> Result<usize> {
        let col = self.records.resolve(column)?;
        let view = self.select(|r| col.value_of(r).matches(value));
        log::debug!("Filter {} == {:?}: {} of {} records", col.name(), value, view.len(), self.records.len());
        self.replace_view(view, Predicate::ColumnEquals { column: col.name().to_string(), value: value.to_string() });
        Ok(self.view.len())
    }

    pub fn filter_by_level(&mut self, level_display_name: &str) -> Result<usize> {
        self.filter_by_column_value(Column::LevelDisplayName.name(), level_display_name)
    }

    /// Replaces the view with the records whose message matches `pattern`.
    pub fn filter_by_message(&mut self, pattern: &str) -> Result<usize> {
        let re = Regex::new(pattern)?;
        let view = self.select(|r| re.is_match(&r.message));
        log::debug!("Filter message ~ {:?}: {} of {} records", pattern, view.len(), self.records.len());
        self.replace_view(view, Predicate::MessageMatches(pattern.to_string()));
        Ok(self.view.len())
    }

    pub fn clear_filter(&mut self) {
        self.view = full_view(&self.records);
        self.state = FilterState::Unfiltered;
    }

    /// Records of the full set with `start <= timestamp <= end`. Does not touch the view.
    pub fn filter_by_date_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<&Record>> {
        if start > end { return Err(AnalyzerError::InvalidRange { start, end }); }
        Ok(self.records.records().iter().filter(|r| r.timestamp >= start && r.timestamp <= end).collect())
    }

    pub fn level_distribution(&self) -> Distribution {
        count_values(Column::LevelDisplayName.name(), self.view().map(|v| v.record.level_display_name.clone()))
    }

    pub fn value_counts(&self, column: &str) -> Result<Distribution> {
        let col = self.records.resolve(column)?;
        Ok(count_values(col.name(), self.view().map(|v| col.value_of(v.record).to_string())))
    }

    pub fn trend_by_date(&self) -> Trend {
        let mut buckets: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for r in self.records.records() { *buckets.entry(r.timestamp.date()).or_insert(0) += 1; }
        Trend { buckets: buckets.into_iter().collect() }
    }

    pub fn mean_daily_count(&self) -> Result<f64> {
        let trend = self.trend_by_date();
        if trend.is_empty() { return Err(AnalyzerError::EmptyDataset); }
        Ok(trend.total() as f64 / trend.len() as f64)
    }

    /// Mean records per distinct date, rounded half to even (2.5 becomes 2).
    pub fn average_daily_count(&self) -> Result<u64> {
        Ok(stats::round_half_even(self.mean_daily_count()?) as u64)
    }

    /// Statistics for `level` and every extra column whose non-empty values
    /// are all numeric.
    pub fn summary_statistics(&self) -> Result<Vec<ColumnSummary>> {
        if self.records.is_empty() { return Err(AnalyzerError::EmptyDataset); }
        let mut cols = vec![ColumnRef::Known(Column::Level)];
        cols.extend(self.records.extra_columns().iter().map(|c| ColumnRef::Extra(c.clone())));
        let mut out = Vec::new();
        for col in cols {
            let mut values = Vec::with_capacity(self.records.len());
            let mut numeric = true;
            for r in self.records.records() {
                let v = col.value_of(r);
                if v.to_string().trim().is_empty() { continue; }
                match v.as_f64() { Some(f) => values.push(f), None => { numeric = false; break; } }
            }
            if !numeric { continue; }
            if let Some(s) = stats::summarize(col.name(), &values) { out.push(s); }
        }
        Ok(out)
    }

    pub fn first_and_last_timestamp(&self) -> Result<(NaiveDateTime, NaiveDateTime)> {
        let mut it = self.records.records().iter().map(|r| r.timestamp);
        let first = it.next().ok_or(AnalyzerError::EmptyDataset)?;
        Ok(it.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }

    /// Attaches `event_description` (looked up by `level`) to every view row.
    /// The next filter call drops it along with the rest of the old view.
    pub fn map_event_descriptions(&mut self) {
        let records = self.records.records();
        for e in self.view.iter_mut() { e.event_description = Some(catalog::describe(records[e.index].level)); }
    }

    /// Writes the view as one JSON object per line. Returns the number of rows written.
    pub fn export_filtered_view<W: Write>(&self, mut out: W) -> Result<usize> {
        let mut n = 0usize;
        for row in self.view() {
            serde_json::to_writer(&mut out, &row)?;
            out.write_all(b"\n")?;
            n += 1;
        }
        out.flush()?;
        Ok(n)
    }

    pub fn export_filtered_view_to_path(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::create(path)?;
        let n = self.export_filtered_view(std::io::BufWriter::new(file))?;
        log::info!("Exported {} rows to {}", n, path.to_string_lossy());
        Ok(n)
    }

    fn select<F: Fn(&Record) -> bool>(&self, pred: F) -> Vec<ViewEntry> {
        self.records.records().iter().enumerate().filter(|(_, r)| pred(r)).map(|(index, _)| ViewEntry { index, event_description: None }).collect()
    }

    fn replace_view(&mut self, view: Vec<ViewEntry>, pred: Predicate) {
        self.view = view;
        self.state = FilterState::Filtered(pred);
    }
}

fn full_view(records: &RecordSet) -> Vec<ViewEntry> {
    (0..records.len()).map(|index| ViewEntry { index, event_description: None }).collect()
}

fn count_values<I: Iterator<Item = String>>(column: &str, values: I) -> Distribution {
    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut pos: HashMap<String, usize> = HashMap::new();
    for v in values {
        match pos.get(&v) {
            Some(&i) => counts[i].1 += 1,
            None => { pos.insert(v.clone(), counts.len()); counts.push((v, 1)); }
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    Distribution { column: column.to_string(), counts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::read_ndjson;
    use crate::record::tests::table;

    const COLS: [&str; 6] = ["TimeCreated", "Level", "LevelDisplayName", "Message", "LogName", "ProviderName"];

    fn scenario() -> LogAggregator {
        let t = table(&COLS, &[
            &["01.03.2024 08:00:00", "4625", "Error", "logon failed for bob", "Security", "Microsoft-Windows-Security-Auditing"],
            &["01.03.2024 09:30:00", "41", "Error", "kernel power", "System", "Microsoft-Windows-Kernel-Power"],
            &["01.03.2024 12:00:00", "7045", "Warning", "service installed", "System", "Service Control Manager"],
            &["02.03.2024 07:00:00", "4625", "Error", "logon failed for eve", "Security", "Microsoft-Windows-Security-Auditing"],
            &["02.03.2024 18:45:00", "4624", "Info", "logon ok", "Security", "Microsoft-Windows-Security-Auditing"],
        ]);
        LogAggregator::new(RecordSet::load(&t).unwrap())
    }

    fn ts(s: &str) -> NaiveDateTime { crate::record::parse_timestamp(s).unwrap() }

    #[test]
    fn five_record_scenario() {
        let agg = scenario();
        let d = agg.level_distribution();
        assert_eq!(d.counts, vec![("Error".to_string(), 3), ("Warning".to_string(), 1), ("Info".to_string(), 1)]);
        let trend = agg.trend_by_date();
        assert_eq!(trend.buckets.iter().map(|(_, c)| *c).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(agg.mean_daily_count().unwrap(), 2.5);
        assert_eq!(agg.average_daily_count().unwrap(), 2);
    }

    #[test]
    fn average_rounds_three_and_a_half_up() {
        let t = table(&COLS, &[
            &["01.03.2024 08:00:00", "1", "Error", "", "", ""],
            &["01.03.2024 08:00:00", "1", "Error", "", "", ""],
            &["01.03.2024 08:00:00", "1", "Error", "", "", ""],
            &["02.03.2024 08:00:00", "1", "Error", "", "", ""],
            &["02.03.2024 08:00:00", "1", "Error", "", "", ""],
            &["02.03.2024 08:00:00", "1", "Error", "", "", ""],
            &["02.03.2024 08:00:00", "1", "Error", "", "", ""],
        ]);
        let agg = LogAggregator::new(RecordSet::load(&t).unwrap());
        assert_eq!(agg.average_daily_count().unwrap(), 4);
    }

    #[test]
    fn filter_then_distribution_matches_subset() {
        let mut agg = scenario();
        let n = agg.filter_by_column_value("log_name", "Security").unwrap();
        assert_eq!(n, 3);
        assert_eq!(agg.level_distribution().total(), n);
        assert!(agg.view().all(|r| r.record.log_name == "Security"));
        assert_eq!(agg.state(), &FilterState::Filtered(Predicate::ColumnEquals { column: "log_name".into(), value: "Security".into() }));
    }

    #[test]
    fn filters_are_not_cumulative() {
        let mut agg = scenario();
        agg.filter_by_level("Error").unwrap();
        agg.filter_by_level("Warning").unwrap();
        let d = agg.level_distribution();
        assert_eq!(d.get("Warning"), Some(1));
        assert_eq!(d.get("Error"), None);
        // second predicate alone, not intersected with the first
        agg.filter_by_level("Error").unwrap();
        agg.filter_by_column_value("log_name", "System").unwrap();
        assert_eq!(agg.view_len(), 2);
        assert_eq!(agg.level_distribution().get("Warning"), Some(1));
    }

    #[test]
    fn numeric_filter_and_clear() {
        let mut agg = scenario();
        assert_eq!(agg.filter_by_column_value("Level", "4625").unwrap(), 2);
        agg.clear_filter();
        assert_eq!(agg.state(), &FilterState::Unfiltered);
        assert_eq!(agg.view_len(), 5);
    }

    #[test]
    fn failed_filters_leave_view_unchanged() {
        let mut agg = scenario();
        agg.filter_by_level("Error").unwrap();
        assert!(matches!(agg.filter_by_column_value("nope", "x"), Err(AnalyzerError::UnknownColumn(_))));
        assert!(matches!(agg.filter_by_message("(unclosed"), Err(AnalyzerError::InvalidPattern(_))));
        assert_eq!(agg.view_len(), 3);
        assert!(matches!(agg.state(), FilterState::Filtered(Predicate::ColumnEquals { .. })));
    }

    #[test]
    fn message_filter() {
        let mut agg = scenario();
        assert_eq!(agg.filter_by_message("(?i)LOGON FAILED").unwrap(), 2);
    }

    #[test]
    fn date_range_is_inclusive_and_ignores_view() {
        let mut agg = scenario();
        agg.filter_by_level("Warning").unwrap();
        let got = agg.filter_by_date_range(ts("01.03.2024 09:30:00"), ts("02.03.2024 07:00:00")).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(agg.view_len(), 1);
        let same = agg.filter_by_date_range(ts("01.03.2024 09:30:00"), ts("01.03.2024 09:30:00")).unwrap();
        assert_eq!(same.len(), 1);
        assert!(matches!(agg.filter_by_date_range(ts("02.03.2024 00:00:00"), ts("01.03.2024 00:00:00")), Err(AnalyzerError::InvalidRange { .. })));
    }

    #[test]
    fn trend_is_global_and_sums_to_row_count() {
        let mut agg = scenario();
        agg.filter_by_level("Info").unwrap();
        let trend = agg.trend_by_date();
        assert_eq!(trend.total(), agg.record_set().len());
        assert_eq!(trend.buckets[0].0, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn first_and_last_match_linear_scan() {
        let agg = scenario();
        let (lo, hi) = agg.first_and_last_timestamp().unwrap();
        assert_eq!(lo, ts("01.03.2024 08:00:00"));
        assert_eq!(hi, ts("02.03.2024 18:45:00"));
        let empty = LogAggregator::new(RecordSet::load(&table(&COLS, &[])).unwrap());
        assert!(matches!(empty.first_and_last_timestamp(), Err(AnalyzerError::EmptyDataset)));
        assert!(matches!(empty.average_daily_count(), Err(AnalyzerError::EmptyDataset)));
        assert!(empty.view_is_empty());
    }

    #[test]
    fn summary_covers_numeric_columns_only() {
        let t = table(&["timestamp", "level", "level_display_name", "ProcessId", "Keywords"], &[
            &["2024-01-01 00:00:00", "2", "Error", "100", "Audit"],
            &["2024-01-01 01:00:00", "4", "Information", "", "Audit"],
            &["2024-01-02 00:00:00", "3", "Warning", "300", "Classic"],
        ]);
        let agg = LogAggregator::new(RecordSet::load(&t).unwrap());
        let s = agg.summary_statistics().unwrap();
        assert_eq!(s.iter().map(|c| c.column.as_str()).collect::<Vec<_>>(), vec!["level", "processid"]);
        assert_eq!(s[0].mean, 3.0);
        assert_eq!(s[1].count, 2);
        assert_eq!(s[1].q50, 200.0);
    }

    #[test]
    fn descriptions_attach_to_view_and_reset_on_filter() {
        let mut agg = scenario();
        agg.filter_by_level("Error").unwrap();
        agg.map_event_descriptions();
        let descs: Vec<_> = agg.view().map(|r| r.event_description).collect();
        assert_eq!(descs, vec![Some("Failed logon attempt"), Some("System rebooted or shut down unexpectedly"), Some("Failed logon attempt")]);
        agg.filter_by_level("Info").unwrap();
        assert!(agg.view().all(|r| r.event_description.is_none()));
    }

    #[test]
    fn export_and_reload_round_trip() {
        let mut agg = scenario();
        agg.filter_by_level("Error").unwrap();
        agg.map_event_descriptions();
        let p = std::env::temp_dir().join("evtlens_roundtrip.json");
        assert_eq!(agg.export_filtered_view_to_path(&p).unwrap(), 3);
        let text = std::fs::read_to_string(&p).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().next().unwrap().contains("\"event_description\":\"Failed logon attempt\""));
        let reloaded = RecordSet::load(&read_ndjson(&p).unwrap()).unwrap();
        let original: Vec<&Record> = agg.view().map(|r| r.record).collect();
        assert_eq!(reloaded.len(), original.len());
        for (a, b) in reloaded.records().iter().zip(original) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.level, b.level);
            assert_eq!(a.level_display_name, b.level_display_name);
            assert_eq!(a.message, b.message);
            assert_eq!(a.log_name, b.log_name);
            assert_eq!(a.provider_name, b.provider_name);
        }
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn empty_view_export_reloads_as_empty_set() {
        let mut agg = scenario();
        assert_eq!(agg.filter_by_level("Critical").unwrap(), 0);
        let p = std::env::temp_dir().join("evtlens_empty_view.json");
        assert_eq!(agg.export_filtered_view_to_path(&p).unwrap(), 0);
        let reloaded = RecordSet::load(&read_ndjson(&p).unwrap()).unwrap();
        assert!(reloaded.is_empty());
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn reexported_rows_carry_one_description_key() {
        let mut agg = scenario();
        agg.filter_by_level("Error").unwrap();
        agg.map_event_descriptions();
        let p = std::env::temp_dir().join("evtlens_reexport.json");
        agg.export_filtered_view_to_path(&p).unwrap();
        let mut again = LogAggregator::new(RecordSet::load(&read_ndjson(&p).unwrap()).unwrap());
        again.map_event_descriptions();
        let mut buf = Vec::new();
        assert_eq!(again.export_filtered_view(&mut buf).unwrap(), 3);
        let text = String::from_utf8(buf).unwrap();
        for line in text.lines() { assert_eq!(line.matches("\"event_description\"").count(), 1, "{}", line); }
        assert!(text.lines().next().unwrap().contains("\"event_description\":\"Failed logon attempt\""));
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn value_counts_on_other_columns() {
        let agg = scenario();
        let d = agg.value_counts("provider_name").unwrap();
        assert_eq!(d.counts[0], ("Microsoft-Windows-Security-Auditing".to_string(), 3));
        assert!(agg.value_counts("bogus").is_err());
    }
}
