//! Input adapters: turn CSV exports, previously exported NDJSON and `.evtx`
//! files into a [`RecordSet`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use evtx::EvtxParser;
use globset::{GlobBuilder, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{AnalyzerError, Result};
use crate::event_xml::{parse_event, severity_name};
use crate::record::{Column, Record, RecordSet};

/// Header plus string rows, as handed to [`RecordSet::load`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Trims every cell and header and drops columns that are empty in every row.
    /// A header-only table keeps all of its columns.
    pub fn clean(mut self) -> Table {
        for c in self.columns.iter_mut() { *c = c.trim().trim_start_matches('\u{feff}').to_string(); }
        for row in self.rows.iter_mut() { for v in row.iter_mut() { *v = v.trim().to_string(); } }
        if self.rows.is_empty() { return self; }
        let keep: Vec<bool> = (0..self.columns.len())
            .map(|i| self.rows.iter().any(|r| r.get(i).map(|v| !v.is_empty()).unwrap_or(false)))
            .collect();
        if keep.iter().all(|k| *k) { return self; }
        let dropped: Vec<&str> = self.columns.iter().zip(&keep).filter(|(_, k)| !**k).map(|(c, _)| c.as_str()).collect();
        log::debug!("Dropping empty columns: {}", dropped.join(", "));
        let pick = |v: Vec<String>| v.into_iter().enumerate().filter(|(i, _)| keep.get(*i).copied().unwrap_or(false)).map(|(_, s)| s).collect::<Vec<_>>();
        Table { columns: pick(self.columns), rows: self.rows.into_iter().map(pick).collect() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind { Csv, Ndjson, Evtx }

pub fn input_kind(p: &Path) -> Option<InputKind> {
    let ext = p.extension().and_then(|e| e.to_str())?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" => Some(InputKind::Csv),
        "json" | "ndjson" | "jsonl" => Some(InputKind::Ndjson),
        "evtx" => Some(InputKind::Evtx),
        _ => None,
    }
}

/// Reads a CSV export. A leading `#TYPE` line from PowerShell `Export-Csv` is skipped.
pub fn read_csv(path: &Path) -> Result<Table> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_path(path)?;
    let mut rows: Vec<Vec<String>> = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        rows.push(rec.iter().map(|s| s.to_string()).collect());
    }
    if rows.first().and_then(|r| r.first()).map(|c| c.trim_start_matches('\u{feff}').starts_with("#TYPE")).unwrap_or(false) { rows.remove(0); }
    if rows.is_empty() { return Ok(Table::default()); }
    let columns = rows.remove(0);
    Ok(Table { columns, rows }.clean())
}

/// Reads newline-delimited JSON objects; keys become columns in first-seen order.
/// A file without objects (an export of an empty view) yields the known columns
/// and no rows.
pub fn read_ndjson(path: &Path) -> Result<Table> {
    let data = std::fs::read_to_string(path)?;
    let mut columns: Vec<String> = Vec::new();
    let mut objs: Vec<serde_json::Map<String, serde_json::Value>> = Vec::new();
    for (n, line) in data.lines().enumerate() {
        if line.trim().is_empty() { continue; }
        let v: serde_json::Value = serde_json::from_str(line)?;
        let serde_json::Value::Object(map) = v else {
            log::warn!("{}:{}: not a JSON object, skipped", path.to_string_lossy(), n + 1);
            continue;
        };
        for k in map.keys() { if !columns.contains(k) { columns.push(k.clone()); } }
        objs.push(map);
    }
    if objs.is_empty() { return Ok(Table { columns: Column::ALL.iter().map(|c| c.name().to_string()).collect(), rows: Vec::new() }); }
    let rows = objs.iter().map(|m| columns.iter().map(|c| match m.get(c) {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }).collect()).collect();
    Ok(Table { columns, rows })
}

/// Reads a `.evtx` file. The event id becomes `level`, the numeric severity is
/// kept as the extra column `severity`.
pub fn read_evtx(path: &Path, progress: bool) -> Result<Vec<Record>> {
    let mut parser = EvtxParser::from_path(path).map_err(|e| AnalyzerError::Evtx(format!("{}: {}", path.to_string_lossy(), e)))?;
    let ch = path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string();
    let pb = if progress { Some(indicatif::ProgressBar::new_spinner()) } else { None };
    if let Some(ref pb) = pb { pb.set_message(format!("Reading {}", ch)); }
    let mut out = Vec::new();
    let mut scanned = 0usize;
    for r in parser.records() {
        scanned += 1;
        if let Some(ref pb) = pb && scanned % 500 == 0 { pb.tick(); pb.set_message(format!("Read {} records", scanned)); }
        let r = match r { Ok(r) => r, Err(e) => { log::debug!("Skipping unreadable record in {}: {}", ch, e); continue } };
        let Some(ev) = parse_event(&r.data, &ch) else { continue };
        let mut extra = BTreeMap::new();
        extra.insert("severity".to_string(), ev.severity.to_string());
        out.push(Record {
            timestamp: ev.time.naive_utc(),
            level: ev.event_id,
            level_display_name: severity_name(ev.severity).to_string(),
            message: ev.message(),
            log_name: ev.channel.clone(),
            provider_name: ev.provider.clone(),
            extra,
        });
    }
    if let Some(pb) = pb { pb.finish_and_clear(); }
    log::info!("{}: {} of {} records parsed", path.to_string_lossy(), out.len(), scanned);
    Ok(out)
}

/// Expands files and directories into the list of readable inputs.
pub fn collect_inputs(paths: &[String], glob: Option<&str>, recursive: bool) -> Result<Vec<PathBuf>> {
    let set = match glob {
        Some(g) => {
            let mut gb = GlobSetBuilder::new();
            gb.add(GlobBuilder::new(g).case_insensitive(true).build().map_err(|e| AnalyzerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?);
            Some(gb.build().map_err(|e| AnalyzerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?)
        }
        None => None,
    };
    let mut out = Vec::new();
    for p in paths {
        let p = PathBuf::from(p);
        if p.is_file() { out.push(p); continue; }
        if !p.is_dir() { log::warn!("Missing input: {}", p.to_string_lossy()); continue; }
        let wd = if recursive { WalkDir::new(&p) } else { WalkDir::new(&p).max_depth(1) };
        let mut found: Vec<PathBuf> = wd.into_iter().filter_map(|r| r.ok()).map(|de| de.into_path())
            .filter(|fp| fp.is_file() && input_kind(fp).is_some())
            .filter(|fp| set.as_ref().map(|s| s.is_match(fp.file_name().unwrap_or_default())).unwrap_or(true))
            .collect();
        found.sort();
        out.extend(found);
    }
    Ok(out)
}

pub fn load_path(path: &Path, progress: bool) -> Result<RecordSet> {
    match input_kind(path) {
        Some(InputKind::Csv) => RecordSet::load(&read_csv(path)?),
        Some(InputKind::Ndjson) => RecordSet::load(&read_ndjson(path)?),
        Some(InputKind::Evtx) => Ok(RecordSet::from_records(read_evtx(path, progress)?)),
        // unknown extensions are treated as CSV, the usual export shape
        None => RecordSet::load(&read_csv(path)?),
    }
}

pub fn load_all(paths: &[PathBuf], progress: bool) -> Result<RecordSet> {
    let mut parts = Vec::with_capacity(paths.len());
    for p in paths {
        let rs = load_path(p, progress)?;
        log::info!("Loaded {} records from {}", rs.len(), p.to_string_lossy());
        parts.push(rs);
    }
    Ok(RecordSet::concat(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_skips_type_line_trims_and_drops_empty_columns() {
        let p = std::env::temp_dir().join("evtlens_ingest_clean.csv");
        let body = "#TYPE System.Diagnostics.Eventing.Reader.EventLogRecord\n\"TimeCreated\",\"Level\",\"LevelDisplayName\",\"Message\",\"Unused\"\n\"01.02.2024 10:00:00\",\"2\",\" Error \",\" disk  \",\"\"\n";
        std::fs::write(&p, body).unwrap();
        let t = read_csv(&p).unwrap();
        assert_eq!(t.columns, vec!["TimeCreated", "Level", "LevelDisplayName", "Message"]);
        assert_eq!(t.rows[0][2], "Error");
        assert_eq!(t.rows[0][3], "disk");
        let rs = load_path(&p, false).unwrap();
        assert_eq!(rs.len(), 1);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn ndjson_keys_become_columns() {
        let p = std::env::temp_dir().join("evtlens_ingest.ndjson");
        std::fs::write(&p, "{\"timestamp\":\"2024-01-01T10:00:00\",\"level\":41,\"level_display_name\":\"Critical\"}\n\n{\"timestamp\":\"2024-01-02T10:00:00\",\"level\":7,\"level_display_name\":\"Error\",\"event_description\":\"Unknown event\"}\n").unwrap();
        let t = read_ndjson(&p).unwrap();
        assert_eq!(t.columns, vec!["timestamp", "level", "level_display_name", "event_description"]);
        assert_eq!(t.rows[0], vec!["2024-01-01T10:00:00", "41", "Critical", ""]);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn header_only_csv_loads_as_empty_set() {
        let p = std::env::temp_dir().join("evtlens_ingest_header_only.csv");
        std::fs::write(&p, "TimeCreated,Level,LevelDisplayName,Message,LogName,ProviderName\n").unwrap();
        let t = read_csv(&p).unwrap();
        assert_eq!(t.columns.len(), 6);
        let rs = load_path(&p, false).unwrap();
        assert!(rs.is_empty());
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn empty_ndjson_yields_known_columns() {
        let p = std::env::temp_dir().join("evtlens_ingest_empty.ndjson");
        std::fs::write(&p, "").unwrap();
        let t = read_ndjson(&p).unwrap();
        assert_eq!(t.columns, vec!["timestamp", "level", "level_display_name", "message", "log_name", "provider_name"]);
        assert!(RecordSet::load(&t).unwrap().is_empty());
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn collect_inputs_filters_directory_by_glob() {
        let dir = std::env::temp_dir().join("evtlens_collect");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(dir.join("Security.csv"), "a\n").unwrap();
        std::fs::write(dir.join("System.csv"), "a\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "a\n").unwrap();
        let found = collect_inputs(&[dir.to_string_lossy().to_string()], Some("sec*"), false).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("Security.csv"));
        let all = collect_inputs(&[dir.to_string_lossy().to_string()], None, false).unwrap();
        assert_eq!(all.len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
