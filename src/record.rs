//! Typed in-memory table of log records.
//!
//! A [`RecordSet`] is built once from a cleaned [`Table`] (or from records that
//! were already typed by the EVTX reader) and is read-only afterwards. The six
//! known columns are typed; any other source column is carried through as
//! text and can still be looked up by name.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::error::{AnalyzerError, Result};
use crate::ingest::Table;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Column { Timestamp, Level, LevelDisplayName, Message, LogName, ProviderName }

pub const REQUIRED_COLUMNS: [Column; 3] = [Column::Timestamp, Column::LevelDisplayName, Column::Level];

/// Derived by the aggregator; a source column of this name is not kept as an extra.
pub const EVENT_DESCRIPTION: &str = "event_description";

impl Column {
    pub const ALL: [Column; 6] = [Column::Timestamp, Column::Level, Column::LevelDisplayName, Column::Message, Column::LogName, Column::ProviderName];

    pub fn name(self) -> &'static str {
        match self {
            Column::Timestamp => "timestamp",
            Column::Level => "level",
            Column::LevelDisplayName => "level_display_name",
            Column::Message => "message",
            Column::LogName => "log_name",
            Column::ProviderName => "provider_name",
        }
    }

    /// Matches a header against the known columns. `TimeCreated` is the
    /// PowerShell export name for the timestamp.
    pub fn parse(header: &str) -> Option<Column> {
        let key: String = header.trim().chars().filter(|c| *c != '_' && *c != ' ').collect::<String>().to_lowercase();
        match key.as_str() {
            "timestamp" | "timecreated" | "time" => Some(Column::Timestamp),
            "level" => Some(Column::Level),
            "leveldisplayname" => Some(Column::LevelDisplayName),
            "message" => Some(Column::Message),
            "logname" => Some(Column::LogName),
            "providername" => Some(Column::ProviderName),
            _ => None,
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Lowercase, trimmed, spaces replaced by underscores.
pub fn normalize_header(h: &str) -> String { h.trim().to_lowercase().replace(' ', "_") }

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Value { Time(NaiveDateTime), Int(u32), Text(String) }

impl Value {
    /// Typed equality against a raw filter value: integers and timestamps are
    /// parsed before comparing, text compares exactly.
    pub fn matches(&self, raw: &str) -> bool {
        match self {
            Value::Int(n) => raw.trim().parse::<u32>().map(|v| v == *n).unwrap_or(false),
            Value::Time(t) => parse_timestamp(raw).map(|v| v == *t).unwrap_or(false),
            Value::Text(s) => s == raw,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Text(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Time(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
            Value::Int(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub level: u32,
    pub level_display_name: String,
    pub message: String,
    pub log_name: String,
    pub provider_name: String,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Record {
    pub fn value(&self, col: Column) -> Value {
        match col {
            Column::Timestamp => Value::Time(self.timestamp),
            Column::Level => Value::Int(self.level),
            Column::LevelDisplayName => Value::Text(self.level_display_name.clone()),
            Column::Message => Value::Text(self.message.clone()),
            Column::LogName => Value::Text(self.log_name.clone()),
            Column::ProviderName => Value::Text(self.provider_name.clone()),
        }
    }
}

/// A resolved column name: one of the typed columns or an extra source column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnRef { Known(Column), Extra(String) }

impl ColumnRef {
    pub fn value_of(&self, r: &Record) -> Value {
        match self {
            ColumnRef::Known(c) => r.value(*c),
            ColumnRef::Extra(name) => Value::Text(r.extra.get(name).cloned().unwrap_or_default()),
        }
    }

    pub fn name(&self) -> &str {
        match self { ColumnRef::Known(c) => c.name(), ColumnRef::Extra(n) => n }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    extra_columns: Vec<String>,
    rejected: usize,
}

impl RecordSet {
    pub fn load(table: &Table) -> Result<RecordSet> {
        let mut known: Vec<(Column, usize)> = Vec::new();
        let mut extra: Vec<(String, usize)> = Vec::new();
        for (i, h) in table.columns.iter().enumerate() {
            match Column::parse(h) {
                Some(c) => { if !known.iter().any(|(k, _)| *k == c) { known.push((c, i)); } }
                None => {
                    let name = normalize_header(h);
                    if name == EVENT_DESCRIPTION { log::debug!("Ignoring derived column {:?}", h); continue; }
                    if !name.is_empty() && !extra.iter().any(|(n, _)| *n == name) { extra.push((name, i)); }
                }
            }
        }
        let missing: Vec<String> = REQUIRED_COLUMNS.iter().filter(|c| !known.iter().any(|(k, _)| k == *c)).map(|c| c.name().to_string()).collect();
        if !missing.is_empty() { return Err(AnalyzerError::Schema(missing)); }
        let idx = |c: Column| known.iter().find(|(k, _)| *k == c).map(|(_, i)| *i);
        let cell = |row: &Vec<String>, i: Option<usize>| i.and_then(|i| row.get(i)).cloned().unwrap_or_default();
        let (ts_i, lvl_i, name_i) = (idx(Column::Timestamp), idx(Column::Level), idx(Column::LevelDisplayName));
        let (msg_i, log_i, prov_i) = (idx(Column::Message), idx(Column::LogName), idx(Column::ProviderName));
        let mut records = Vec::with_capacity(table.rows.len());
        let mut rejected = 0usize;
        for (n, row) in table.rows.iter().enumerate() {
            let raw_ts = cell(row, ts_i);
            let Some(timestamp) = parse_timestamp(&raw_ts) else {
                log::warn!("Rejected row {}: unparseable timestamp {:?}", n + 1, raw_ts);
                rejected += 1;
                continue;
            };
            let raw_level = cell(row, lvl_i);
            let Some(level) = parse_level(&raw_level) else {
                log::warn!("Rejected row {}: unparseable level {:?}", n + 1, raw_level);
                rejected += 1;
                continue;
            };
            let mut ex = BTreeMap::new();
            for (name, i) in &extra { ex.insert(name.clone(), row.get(*i).cloned().unwrap_or_default()); }
            records.push(Record {
                timestamp,
                level,
                level_display_name: cell(row, name_i),
                message: cell(row, msg_i),
                log_name: cell(row, log_i),
                provider_name: cell(row, prov_i),
                extra: ex,
            });
        }
        log::debug!("Loaded {} records ({} rejected, {} extra columns)", records.len(), rejected, extra.len());
        Ok(RecordSet { records, extra_columns: extra.into_iter().map(|(n, _)| n).collect(), rejected })
    }

    pub fn from_records(records: Vec<Record>) -> RecordSet {
        let mut extra_columns: Vec<String> = Vec::new();
        for r in &records {
            for k in r.extra.keys() { if !extra_columns.contains(k) { extra_columns.push(k.clone()); } }
        }
        RecordSet { records, extra_columns, rejected: 0 }
    }

    /// Joins sets loaded from several inputs, keeping input order.
    pub fn concat(parts: Vec<RecordSet>) -> RecordSet {
        let mut out = RecordSet::default();
        for p in parts {
            for c in p.extra_columns { if !out.extra_columns.contains(&c) { out.extra_columns.push(c); } }
            out.records.extend(p.records);
            out.rejected += p.rejected;
        }
        out
    }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn records(&self) -> &[Record] { &self.records }
    pub fn get(&self, i: usize) -> Option<&Record> { self.records.get(i) }
    pub fn extra_columns(&self) -> &[String] { &self.extra_columns }
    pub fn rejected(&self) -> usize { self.rejected }

    pub fn resolve(&self, name: &str) -> Result<ColumnRef> {
        if let Some(c) = Column::parse(name) { return Ok(ColumnRef::Known(c)); }
        let n = normalize_header(name);
        if self.extra_columns.contains(&n) { return Ok(ColumnRef::Extra(n)); }
        Err(AnalyzerError::UnknownColumn(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool { self.resolve(name).is_ok() }

    pub fn column_values(&self, name: &str) -> Result<Vec<Value>> {
        let col = self.resolve(name)?;
        Ok(self.records.iter().map(|r| col.value_of(r)).collect())
    }
}

fn parse_level(s: &str) -> Option<u32> {
    let t = s.trim();
    if let Ok(n) = t.parse::<u32>() { return Some(n); }
    // float-typed exports write whole numbers as "2.0"
    let f = t.parse::<f64>().ok()?;
    if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 { Some(f as u32) } else { None }
}

const DATETIME_FORMATS: [&str; 12] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y %I:%M:%S %p",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %I:%M:%S %p",
    "%d-%m-%Y %I:%M:%S %p",
];

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%d-%m-%Y"];

// US-locale exports; only reached when no day-first reading is possible
const MONTH_FIRST_FORMATS: [&str; 3] = ["%m/%d/%Y %I:%M:%S %p", "%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"];

/// Parses a timestamp with day-first ordering for ambiguous numeric dates.
/// ISO dates keep their year-month-day order. Offsets are dropped after
/// conversion to UTC.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() { return None; }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) { return Some(dt.naive_utc()); }
    for f in DATETIME_FORMATS { if let Ok(dt) = NaiveDateTime::parse_from_str(s, f) { return Some(dt); } }
    for f in DATE_FORMATS { if let Ok(d) = NaiveDate::parse_from_str(s, f) { return Some(d.and_time(NaiveTime::MIN)); } }
    for f in MONTH_FIRST_FORMATS { if let Ok(dt) = NaiveDateTime::parse_from_str(s, f) { return Some(dt); } }
    NaiveDate::parse_from_str(s, "%m/%d/%Y").ok().map(|d| d.and_time(NaiveTime::MIN))
}
